//! SQLite persistence: download records and the per-owner concurrency guard

pub mod guard;
pub mod migrations;
pub mod records;

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use std::time::Duration;

use crate::core::error::{AppError, AppResult};

pub type DbPool = Pool<SqliteConnectionManager>;
pub type DbConnection = PooledConnection<SqliteConnectionManager>;

pub use guard::{Admission, ConcurrencyGuard, QuotaDecision, SlotGuard};
pub use records::{DeliveryRef, DownloadRecord, DownloadStatus};

/// Create a new database connection pool and bring the schema up to date.
///
/// Every pooled connection gets a busy timeout so concurrent admissions
/// wait for the write lock instead of failing.
///
/// ```no_run
/// let pool = mediadrop::storage::create_pool("mediadrop.sqlite")?;
/// # Ok::<(), mediadrop::core::AppError>(())
/// ```
pub fn create_pool(database_path: &str) -> AppResult<DbPool> {
    let manager =
        SqliteConnectionManager::file(database_path).with_init(|conn| conn.busy_timeout(Duration::from_secs(10)));
    let pool = Pool::builder().max_size(10).build(manager)?;

    let mut conn = pool.get()?;
    migrations::run_migrations(&mut conn).map_err(|e| AppError::Validation(format!("{:#}", e)))?;

    Ok(pool)
}

/// Get a connection from the pool
pub fn get_connection(pool: &DbPool) -> Result<DbConnection, r2d2::Error> {
    pool.get()
}

#[cfg(test)]
pub(crate) fn open_test_connection() -> (tempfile::TempDir, rusqlite::Connection) {
    let dir = tempfile::tempdir().unwrap();
    let mut conn = rusqlite::Connection::open(dir.path().join("test.sqlite")).unwrap();
    migrations::run_migrations(&mut conn).unwrap();
    (dir, conn)
}
