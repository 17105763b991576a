//! Best-effort thumbnail fetch. Every failure yields `None`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::config;

/// Downloads `url` into `dir/thumb.jpg` when it fits the chat thumbnail limit.
pub async fn fetch_thumbnail(client: &reqwest::Client, url: &str, dir: &Path) -> Option<PathBuf> {
    let response = match client.get(url).timeout(Duration::from_secs(15)).send().await {
        Ok(response) => response,
        Err(e) => {
            log::warn!("[THUMBNAIL] Request failed for {}: {}", url, e);
            return None;
        }
    };
    if !response.status().is_success() {
        log::warn!("[THUMBNAIL] {} returned {}", url, response.status());
        return None;
    }
    let bytes = match response.bytes().await {
        Ok(bytes) => bytes,
        Err(e) => {
            log::warn!("[THUMBNAIL] Failed to read body of {}: {}", url, e);
            return None;
        }
    };
    if bytes.is_empty() || bytes.len() as u64 > config::upload::THUMBNAIL_MAX_BYTES {
        log::info!("[THUMBNAIL] Skipping thumbnail of {} bytes", bytes.len());
        return None;
    }

    let path = dir.join("thumb.jpg");
    match tokio::fs::write(&path, &bytes).await {
        Ok(()) => Some(path),
        Err(e) => {
            log::warn!("[THUMBNAIL] Failed to write {}: {}", path.display(), e);
            None
        }
    }
}
