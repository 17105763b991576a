//! Per-owner single-flight admission and daily quota.
//!
//! `user_quota.in_progress` is the only cross-request shared state. It is
//! flipped with a conditional `UPDATE ... WHERE in_progress = 0` inside an
//! `IMMEDIATE` transaction, and the pending record is created in the same
//! transaction, so two concurrent submissions from one owner can never both
//! be admitted.

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::sync::Arc;

use super::records::{self, SESSION_EXPIRED};
use super::DbPool;
use crate::core::config;
use crate::core::error::AppResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// A pending record was created and the slot is held for it
    Admitted { download_id: i64 },
    /// The owner already has a download in flight
    Rejected { existing: Option<i64> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaDecision {
    Allowed { used: i64, limit: i64 },
    Exceeded { used: i64, limit: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserQuotaState {
    pub owner: i64,
    pub daily_limit: i64,
    pub used: i64,
    pub reset_date: String,
    pub in_progress: bool,
    pub active_download_id: Option<i64>,
}

#[derive(Clone)]
pub struct ConcurrencyGuard {
    pool: Arc<DbPool>,
    daily_limit: i64,
    lease_secs: i64,
}

fn date_key(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

fn ensure_row(conn: &Connection, owner: i64, daily_limit: i64, today: NaiveDate) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO user_quota (owner, daily_limit, used, reset_date) VALUES (?1, ?2, 0, ?3)",
        params![owner, daily_limit, date_key(today)],
    )?;
    Ok(())
}

fn reset_if_new_day(conn: &Connection, owner: i64, today: NaiveDate) -> rusqlite::Result<()> {
    let changed = conn.execute(
        "UPDATE user_quota SET used = 0, reset_date = ?2 WHERE owner = ?1 AND reset_date < ?2",
        params![owner, date_key(today)],
    )?;
    if changed > 0 {
        log::debug!("🔄 Daily quota reset for owner {}", owner);
    }
    Ok(())
}

impl ConcurrencyGuard {
    pub fn new(pool: Arc<DbPool>) -> Self {
        Self::with_limits(pool, *config::DAILY_QUOTA, config::guard::LEASE_SECS)
    }

    pub fn with_limits(pool: Arc<DbPool>, daily_limit: i64, lease_secs: i64) -> Self {
        Self {
            pool,
            daily_limit,
            lease_secs,
        }
    }

    /// Admits a new download for `owner`, creating its pending record.
    pub fn admit(&self, owner: i64, url: &str, platform: &str) -> AppResult<Admission> {
        self.admit_at(owner, url, platform, Utc::now())
    }

    pub fn admit_at(&self, owner: i64, url: &str, platform: &str, now: DateTime<Utc>) -> AppResult<Admission> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        ensure_row(&tx, owner, self.daily_limit, now.date_naive())?;

        let (in_progress, active, since): (bool, Option<i64>, Option<i64>) = tx.query_row(
            "SELECT in_progress, active_download_id, in_progress_since FROM user_quota WHERE owner = ?1",
            params![owner],
            |row| Ok((row.get::<_, i64>(0)? != 0, row.get(1)?, row.get(2)?)),
        )?;

        let now_ts = now.timestamp();
        let cutoff = now_ts - self.lease_secs;
        if in_progress {
            let stale = since.map_or(true, |s| s <= cutoff);
            if !stale {
                log::info!("⛔ Owner {} rejected: download {:?} in progress", owner, active);
                return Ok(Admission::Rejected { existing: active });
            }
            log::warn!("♻️ Owner {} lease on download {:?} expired, taking over", owner, active);
            if let Some(old) = active {
                records::mark_failed(&tx, old, SESSION_EXPIRED)?;
            }
        }

        let changed = tx.execute(
            "UPDATE user_quota SET in_progress = 1, in_progress_since = ?2, active_download_id = NULL \
             WHERE owner = ?1 AND (in_progress = 0 OR in_progress_since IS NULL OR in_progress_since <= ?3)",
            params![owner, now_ts, cutoff],
        )?;
        if changed != 1 {
            return Ok(Admission::Rejected { existing: active });
        }

        let download_id = records::create_record(&tx, owner, url, platform)?;
        tx.execute(
            "UPDATE user_quota SET active_download_id = ?2 WHERE owner = ?1",
            params![owner, download_id],
        )?;
        tx.commit()?;

        log::info!("✅ Owner {} admitted, download {}", owner, download_id);
        Ok(Admission::Admitted { download_id })
    }

    /// Clears the owner's slot if it is still held for `download_id`.
    ///
    /// Scoped to the admitting download so a late-finishing cancelled worker
    /// cannot release a newer admission. Returns whether the slot was cleared.
    pub fn release(&self, owner: i64, download_id: i64) -> AppResult<bool> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE user_quota SET in_progress = 0, active_download_id = NULL, in_progress_since = NULL \
             WHERE owner = ?1 AND in_progress = 1 AND active_download_id = ?2",
            params![owner, download_id],
        )?;
        if changed == 1 {
            log::info!("🔓 Owner {} released (download {})", owner, download_id);
        } else {
            log::debug!("Owner {} slot not held for download {}, nothing to release", owner, download_id);
        }
        Ok(changed == 1)
    }

    /// Restamps the lease of a running download so it is not taken over.
    /// Returns whether the slot is still held for `download_id`.
    pub fn renew(&self, owner: i64, download_id: i64) -> AppResult<bool> {
        self.renew_at(owner, download_id, Utc::now())
    }

    pub fn renew_at(&self, owner: i64, download_id: i64, now: DateTime<Utc>) -> AppResult<bool> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE user_quota SET in_progress_since = ?3 \
             WHERE owner = ?1 AND in_progress = 1 AND active_download_id = ?2",
            params![owner, download_id, now.timestamp()],
        )?;
        log::debug!("Owner {} lease renewed for download {}: {}", owner, download_id, changed == 1);
        Ok(changed == 1)
    }

    /// Age after which an unrenewed slot may be taken over
    pub fn lease(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.lease_secs.max(1) as u64)
    }

    /// Resets the counter on a new UTC day, then compares used against the ceiling.
    pub fn check_quota(&self, owner: i64) -> AppResult<QuotaDecision> {
        self.check_quota_on(owner, Utc::now().date_naive())
    }

    pub fn check_quota_on(&self, owner: i64, today: NaiveDate) -> AppResult<QuotaDecision> {
        let conn = self.pool.get()?;
        ensure_row(&conn, owner, self.daily_limit, today)?;
        reset_if_new_day(&conn, owner, today)?;
        let (used, limit): (i64, i64) = conn.query_row(
            "SELECT used, daily_limit FROM user_quota WHERE owner = ?1",
            params![owner],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        if used >= limit {
            log::info!("🚫 Owner {} quota exceeded ({}/{})", owner, used, limit);
            Ok(QuotaDecision::Exceeded { used, limit })
        } else {
            Ok(QuotaDecision::Allowed { used, limit })
        }
    }

    /// Counts one successful delivery against today's quota.
    pub fn consume(&self, owner: i64) -> AppResult<()> {
        self.consume_on(owner, Utc::now().date_naive())
    }

    pub fn consume_on(&self, owner: i64, today: NaiveDate) -> AppResult<()> {
        let conn = self.pool.get()?;
        ensure_row(&conn, owner, self.daily_limit, today)?;
        reset_if_new_day(&conn, owner, today)?;
        conn.execute("UPDATE user_quota SET used = used + 1 WHERE owner = ?1", params![owner])?;
        Ok(())
    }

    pub fn state(&self, owner: i64) -> AppResult<Option<UserQuotaState>> {
        let conn = self.pool.get()?;
        let state = conn
            .query_row(
                "SELECT owner, daily_limit, used, reset_date, in_progress, active_download_id \
                 FROM user_quota WHERE owner = ?1",
                params![owner],
                |row| {
                    Ok(UserQuotaState {
                        owner: row.get(0)?,
                        daily_limit: row.get(1)?,
                        used: row.get(2)?,
                        reset_date: row.get(3)?,
                        in_progress: row.get::<_, i64>(4)? != 0,
                        active_download_id: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(state)
    }

    /// Releases the slot when the returned guard is dropped, on every exit
    /// path including unwinding.
    pub fn scope(&self, owner: i64, download_id: i64) -> SlotGuard {
        SlotGuard {
            guard: self.clone(),
            owner,
            download_id,
            armed: true,
        }
    }
}

/// Drop-time release of an admitted slot.
pub struct SlotGuard {
    guard: ConcurrencyGuard,
    owner: i64,
    download_id: i64,
    armed: bool,
}

impl SlotGuard {
    /// Keeps the slot held past this scope (the selection keyboard is still open).
    pub fn keep(mut self) {
        self.armed = false;
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(e) = self.guard.release(self.owner, self.download_id) {
            log::error!(
                "Failed to release owner {} (download {}): {}",
                self.owner,
                self.download_id,
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::records::{get_status, mark_processing, DownloadStatus};
    use chrono::{Duration, TimeZone};
    use std::sync::Barrier;

    fn test_guard(limit: i64) -> (tempfile::TempDir, ConcurrencyGuard) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("guard.sqlite");
        let pool = crate::storage::create_pool(path.to_str().unwrap()).unwrap();
        (dir, ConcurrencyGuard::with_limits(Arc::new(pool), limit, 60))
    }

    #[test]
    fn second_admission_is_rejected_with_existing_id() {
        let (_dir, guard) = test_guard(10);
        let first = guard.admit(1, "https://a", "generic").unwrap();
        let Admission::Admitted { download_id } = first else {
            panic!("expected admission, got {:?}", first);
        };
        assert_eq!(
            guard.admit(1, "https://b", "generic").unwrap(),
            Admission::Rejected {
                existing: Some(download_id)
            }
        );
        // Other owners are independent.
        assert!(matches!(guard.admit(2, "https://c", "generic").unwrap(), Admission::Admitted { .. }));
    }

    #[test]
    fn release_is_scoped_to_the_admitted_download() {
        let (_dir, guard) = test_guard(10);
        let Admission::Admitted { download_id } = guard.admit(1, "https://a", "generic").unwrap() else {
            panic!("not admitted");
        };
        assert!(!guard.release(1, download_id + 100).unwrap());
        assert!(guard.state(1).unwrap().unwrap().in_progress);
        assert!(guard.release(1, download_id).unwrap());
        assert!(!guard.release(1, download_id).unwrap());
        assert!(matches!(guard.admit(1, "https://b", "generic").unwrap(), Admission::Admitted { .. }));
    }

    #[test]
    fn slot_guard_releases_on_drop_unless_kept() {
        let (_dir, guard) = test_guard(10);
        let Admission::Admitted { download_id } = guard.admit(1, "https://a", "generic").unwrap() else {
            panic!("not admitted");
        };
        guard.scope(1, download_id).keep();
        assert!(guard.state(1).unwrap().unwrap().in_progress);
        {
            let _slot = guard.scope(1, download_id);
        }
        assert!(!guard.state(1).unwrap().unwrap().in_progress);
    }

    #[test]
    fn stale_lease_is_taken_over_and_old_record_failed() {
        let (_dir, guard) = test_guard(10);
        let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let Admission::Admitted { download_id: old } = guard.admit_at(1, "https://a", "generic", t0).unwrap() else {
            panic!("not admitted");
        };
        {
            let conn = guard.pool.get().unwrap();
            mark_processing(&conn, old).unwrap();
        }

        let soon = t0 + Duration::seconds(30);
        assert!(matches!(
            guard.admit_at(1, "https://b", "generic", soon).unwrap(),
            Admission::Rejected { .. }
        ));

        let later = t0 + Duration::seconds(61);
        let Admission::Admitted { download_id: new } = guard.admit_at(1, "https://b", "generic", later).unwrap() else {
            panic!("stale lease not taken over");
        };
        assert_ne!(old, new);
        let conn = guard.pool.get().unwrap();
        assert_eq!(get_status(&conn, old).unwrap(), Some(DownloadStatus::Failed));
        assert!(mark_processing(&conn, new).unwrap());
    }

    #[test]
    fn renewed_lease_is_not_taken_over() {
        let (_dir, guard) = test_guard(10);
        let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let Admission::Admitted { download_id } = guard.admit_at(1, "https://a", "generic", t0).unwrap() else {
            panic!("not admitted");
        };

        // Still running 50 s in; a submission at 90 s is within the renewed lease.
        assert!(guard.renew_at(1, download_id, t0 + Duration::seconds(50)).unwrap());
        assert_eq!(
            guard.admit_at(1, "https://b", "generic", t0 + Duration::seconds(90)).unwrap(),
            Admission::Rejected {
                existing: Some(download_id)
            }
        );
        let conn = guard.pool.get().unwrap();
        assert_eq!(get_status(&conn, download_id).unwrap(), Some(DownloadStatus::Pending));

        assert!(!guard.renew_at(1, download_id + 1, t0).unwrap());
        assert!(guard.release(1, download_id).unwrap());
        assert!(!guard.renew_at(1, download_id, t0).unwrap());
    }

    #[test]
    fn quota_resets_on_new_utc_day() {
        let (_dir, guard) = test_guard(2);
        let day1 = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        let day2 = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();

        assert_eq!(
            guard.check_quota_on(7, day1).unwrap(),
            QuotaDecision::Allowed { used: 0, limit: 2 }
        );
        guard.consume_on(7, day1).unwrap();
        guard.consume_on(7, day1).unwrap();
        assert_eq!(
            guard.check_quota_on(7, day1).unwrap(),
            QuotaDecision::Exceeded { used: 2, limit: 2 }
        );
        assert_eq!(
            guard.check_quota_on(7, day2).unwrap(),
            QuotaDecision::Allowed { used: 0, limit: 2 }
        );
    }

    #[test]
    fn concurrent_submissions_admit_exactly_one() {
        let (_dir, guard) = test_guard(10);
        let threads = 8;
        let barrier = Arc::new(Barrier::new(threads));
        let handles: Vec<_> = (0..threads)
            .map(|i| {
                let guard = guard.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    guard.admit(42, &format!("https://x/{}", i), "generic").unwrap()
                })
            })
            .collect();

        let results: Vec<Admission> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let admitted: Vec<i64> = results
            .iter()
            .filter_map(|a| match a {
                Admission::Admitted { download_id } => Some(*download_id),
                Admission::Rejected { .. } => None,
            })
            .collect();
        assert_eq!(admitted.len(), 1);
        for result in &results {
            if let Admission::Rejected { existing } = result {
                assert_eq!(*existing, Some(admitted[0]));
            }
        }
    }
}
