//! Persisted download records and their status state machine.
//!
//! Status only moves forward: `pending → processing → {completed, failed}`
//! (plus `pending → failed`). Every write goes through a conditional
//! `UPDATE ... WHERE status IN (<allowed predecessors>)`, so a stale writer
//! can never regress a record; the return value tells whether the transition
//! was applied.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Result, Row};
use strum::{AsRefStr, Display, EnumString};

use crate::download::catalog::MediaKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum DownloadStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl DownloadStatus {
    /// States from which `self` may be entered.
    pub fn predecessors(self) -> &'static [DownloadStatus] {
        use DownloadStatus::*;
        match self {
            Pending => &[],
            Processing => &[Pending],
            Completed => &[Processing],
            Failed => &[Pending, Processing],
        }
    }

    pub fn can_transition_to(self, next: DownloadStatus) -> bool {
        next.predecessors().contains(&self)
    }
}

/// Reason stored when the owner cancels a running download
pub const CANCELLED_BY_USER: &str = "cancelled by user";

/// Reason stored when an abandoned selection is taken over
pub const SESSION_EXPIRED: &str = "session expired";

#[derive(Debug, Clone)]
pub struct DownloadRecord {
    pub id: i64,
    pub owner: i64,
    pub url: String,
    pub platform: String,
    pub title: Option<String>,
    pub uploader: Option<String>,
    pub duration: Option<u64>,
    pub status: DownloadStatus,
    pub kind: Option<MediaKind>,
    pub quality: Option<String>,
    pub format_id: Option<String>,
    pub file_size: Option<u64>,
    /// Chat-transport file id of the delivered media
    pub file_id: Option<String>,
    /// Message id of the delivered media in the owner's chat
    pub message_id: Option<i32>,
    /// Message id in the relay storage channel, if the relay path was used
    pub relay_message_id: Option<i32>,
    pub error_message: Option<String>,
    pub created_at: String,
    pub completed_at: Option<String>,
}

/// Delivery outcome written when a record completes
#[derive(Debug, Clone, Default)]
pub struct DeliveryRef {
    pub file_size: u64,
    pub file_id: Option<String>,
    pub message_id: Option<i32>,
    pub relay_message_id: Option<i32>,
}

const SELECT_COLUMNS: &str = "id, owner, url, platform, title, uploader, duration, status, kind, quality, \
     format_id, file_size, file_id, message_id, relay_message_id, error_message, created_at, completed_at";

fn row_to_record(row: &Row<'_>) -> Result<DownloadRecord> {
    let status: String = row.get(7)?;
    let kind: Option<String> = row.get(8)?;
    Ok(DownloadRecord {
        id: row.get(0)?,
        owner: row.get(1)?,
        url: row.get(2)?,
        platform: row.get(3)?,
        title: row.get(4)?,
        uploader: row.get(5)?,
        duration: row.get::<_, Option<i64>>(6)?.map(|d| d.max(0) as u64),
        status: status.parse().unwrap_or(DownloadStatus::Failed),
        kind: kind.and_then(|k| k.parse().ok()),
        quality: row.get(9)?,
        format_id: row.get(10)?,
        file_size: row.get::<_, Option<i64>>(11)?.map(|s| s.max(0) as u64),
        file_id: row.get(12)?,
        message_id: row.get(13)?,
        relay_message_id: row.get(14)?,
        error_message: row.get(15)?,
        created_at: row.get(16)?,
        completed_at: row.get(17)?,
    })
}

fn now_timestamp() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Creates a pending record and returns its id.
pub fn create_record(conn: &Connection, owner: i64, url: &str, platform: &str) -> Result<i64> {
    conn.execute(
        "INSERT INTO downloads (owner, url, platform, status, created_at) VALUES (?1, ?2, ?3, 'pending', ?4)",
        params![owner, url, platform, now_timestamp()],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn get_record(conn: &Connection, id: i64) -> Result<Option<DownloadRecord>> {
    conn.query_row(
        &format!("SELECT {} FROM downloads WHERE id = ?1", SELECT_COLUMNS),
        params![id],
        row_to_record,
    )
    .optional()
}

/// Current status only, without loading the whole row.
pub fn get_status(conn: &Connection, id: i64) -> Result<Option<DownloadStatus>> {
    let status: Option<String> = conn
        .query_row("SELECT status FROM downloads WHERE id = ?1", params![id], |row| row.get(0))
        .optional()?;
    Ok(status.and_then(|s| s.parse().ok()))
}

/// Moves a record to `next` if its current status allows it.
///
/// Returns `Ok(false)` when the record is missing or already past `next`.
fn transition(conn: &Connection, id: i64, next: DownloadStatus, extra_set: &str, extra: &[&dyn rusqlite::ToSql]) -> Result<bool> {
    let preds = next.predecessors();
    if preds.is_empty() {
        return Ok(false);
    }
    let allowed = preds
        .iter()
        .map(|s| format!("'{}'", s.as_ref()))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "UPDATE downloads SET status = '{}'{} WHERE id = ? AND status IN ({})",
        next.as_ref(),
        extra_set,
        allowed
    );
    let mut values: Vec<&dyn rusqlite::ToSql> = extra.to_vec();
    values.push(&id);
    let changed = conn.execute(&sql, values.as_slice())?;
    if changed == 1 {
        log::debug!("📝 Download {} → {}", id, next);
    }
    Ok(changed == 1)
}

/// pending → processing. Fails with a constraint error if the owner already
/// has a processing record.
pub fn mark_processing(conn: &Connection, id: i64) -> Result<bool> {
    transition(conn, id, DownloadStatus::Processing, "", &[])
}

/// {pending, processing} → failed with a reason.
pub fn mark_failed(conn: &Connection, id: i64, reason: &str) -> Result<bool> {
    let completed_at = now_timestamp();
    transition(
        conn,
        id,
        DownloadStatus::Failed,
        ", error_message = ?, completed_at = ?",
        &[&reason, &completed_at],
    )
}

/// processing → completed with the delivery reference.
pub fn mark_completed(conn: &Connection, id: i64, delivery: &DeliveryRef) -> Result<bool> {
    let completed_at = now_timestamp();
    let size = delivery.file_size as i64;
    transition(
        conn,
        id,
        DownloadStatus::Completed,
        ", file_size = ?, file_id = ?, message_id = ?, relay_message_id = ?, completed_at = ?",
        &[
            &size,
            &delivery.file_id,
            &delivery.message_id,
            &delivery.relay_message_id,
            &completed_at,
        ],
    )
}

/// Stores extracted source metadata on the record.
pub fn set_source_metadata(
    conn: &Connection,
    id: i64,
    title: &str,
    uploader: Option<&str>,
    duration: Option<u64>,
) -> Result<()> {
    conn.execute(
        "UPDATE downloads SET title = ?1, uploader = ?2, duration = ?3 WHERE id = ?4",
        params![title, uploader, duration.map(|d| d as i64), id],
    )?;
    Ok(())
}

/// Stores the owner's chosen rendition on the record.
pub fn set_selection(conn: &Connection, id: i64, kind: MediaKind, quality: &str, format_id: Option<&str>) -> Result<()> {
    conn.execute(
        "UPDATE downloads SET kind = ?1, quality = ?2, format_id = ?3 WHERE id = ?4",
        params![kind.as_ref(), quality, format_id, id],
    )?;
    Ok(())
}

/// Id of the owner's processing record, if any.
pub fn find_processing(conn: &Connection, owner: i64) -> Result<Option<i64>> {
    conn.query_row(
        "SELECT id FROM downloads WHERE owner = ?1 AND status = 'processing' LIMIT 1",
        params![owner],
        |row| row.get(0),
    )
    .optional()
}

/// Most recent completed records, newest first.
pub fn list_completed(conn: &Connection, owner: i64, limit: usize) -> Result<Vec<DownloadRecord>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM downloads WHERE owner = ?1 AND status = 'completed' \
         ORDER BY completed_at DESC, id DESC LIMIT ?2",
        SELECT_COLUMNS
    ))?;
    let rows = stmt.query_map(params![owner, limit as i64], row_to_record)?;
    rows.collect()
}
