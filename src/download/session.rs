//! Short-lived catalog sessions.
//!
//! A selection keyboard only carries `(kind, quality, format_id, download_id)`;
//! the extracted source and catalog it refers to live here until the owner
//! picks an option or the session expires.

use moka::future::Cache;
use std::sync::Arc;

use super::catalog::Extraction;
use crate::core::config;

/// Sessions are keyed by `(owner, download_id)` so one owner can never resolve
/// another owner's tokens.
#[derive(Clone)]
pub struct CatalogSessions {
    cache: Cache<(i64, i64), Arc<Extraction>>,
}

impl Default for CatalogSessions {
    fn default() -> Self {
        Self::new(config::catalog::session_ttl())
    }
}

impl CatalogSessions {
    pub fn new(ttl: std::time::Duration) -> Self {
        Self {
            cache: Cache::builder()
                .max_capacity(config::catalog::MAX_SESSIONS)
                .time_to_live(ttl)
                .build(),
        }
    }

    pub async fn store(&self, owner: i64, download_id: i64, extraction: Extraction) -> Arc<Extraction> {
        let extraction = Arc::new(extraction);
        self.cache.insert((owner, download_id), Arc::clone(&extraction)).await;
        extraction
    }

    pub async fn get(&self, owner: i64, download_id: i64) -> Option<Arc<Extraction>> {
        self.cache.get(&(owner, download_id)).await
    }

    /// Removes and returns the session in one step, so only one caller can
    /// act on a given selection.
    pub async fn take(&self, owner: i64, download_id: i64) -> Option<Arc<Extraction>> {
        self.cache.remove(&(owner, download_id)).await
    }

    pub async fn remove(&self, owner: i64, download_id: i64) {
        self.cache.invalidate(&(owner, download_id)).await;
    }
}
