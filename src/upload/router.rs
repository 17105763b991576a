//! Size-based delivery: direct upload, relay copy, or refusal.
//!
//! | size                         | route  |
//! |------------------------------|--------|
//! | `<= DIRECT_LIMIT_BYTES`      | direct |
//! | `<= RELAY_LIMIT_BYTES`       | relay  |
//! | larger                       | `UploadTooLarge` |
//!
//! The download's workspace is purged after every delivery attempt, whatever
//! its outcome.

use std::sync::Arc;
use teloxide::types::InlineKeyboardMarkup;

use super::relay::RelayTransport;
use super::thumbnail::fetch_thumbnail;
use super::transport::{ChatTransport, OutgoingMedia, SentMedia};
use crate::core::config;
use crate::core::error::{AppError, AppResult};
use crate::core::utils::{format_duration, format_file_size, format_views, truncate_chars};
use crate::download::catalog::{MediaKind, MediaSource};
use crate::download::executor::FetchedFile;
use crate::storage::records::DeliveryRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Route {
    Direct,
    Relay,
}

/// Picks the route for a file of `size` bytes.
pub fn route_for(size: u64, direct_limit: u64, relay_limit: u64) -> AppResult<Route> {
    if size <= direct_limit {
        Ok(Route::Direct)
    } else if size <= relay_limit {
        Ok(Route::Relay)
    } else {
        Err(AppError::UploadTooLarge {
            size,
            limit: relay_limit,
        })
    }
}

/// Caption of delivered media: title, uploader, then duration, views and size.
pub fn caption(source: &MediaSource, size: u64) -> String {
    let mut lines = vec![truncate_chars(&source.title, 200)];
    if let Some(uploader) = source.uploader.as_deref().filter(|u| !u.is_empty()) {
        lines.push(format!("👤 {}", truncate_chars(uploader, 100)));
    }
    let mut details = Vec::new();
    if let Some(duration) = source.duration {
        details.push(format!("⏱ {}", format_duration(duration)));
    }
    if let Some(views) = source.view_count {
        details.push(format!("👁 {}", format_views(views)));
    }
    details.push(format!("💾 {}", format_file_size(size)));
    lines.push(details.join(" · "));
    lines.join("\n")
}

/// Everything needed to deliver one fetched file
#[derive(Debug, Clone)]
pub struct DeliveryRequest {
    pub chat: i64,
    pub file: FetchedFile,
    pub kind: MediaKind,
    pub source: MediaSource,
    pub keyboard: Option<InlineKeyboardMarkup>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivered {
    pub route: Route,
    pub size: u64,
    pub sent: SentMedia,
    pub relay_message_id: Option<i32>,
}

impl Delivered {
    pub fn delivery_ref(&self) -> DeliveryRef {
        DeliveryRef {
            file_size: self.size,
            file_id: self.sent.file_id.clone(),
            message_id: Some(self.sent.message_id),
            relay_message_id: self.relay_message_id,
        }
    }
}

#[derive(Clone)]
pub struct UploadRouter {
    chat: Arc<dyn ChatTransport>,
    relay: Option<Arc<dyn RelayTransport>>,
    http: reqwest::Client,
    direct_limit: u64,
    relay_limit: u64,
}

impl UploadRouter {
    pub fn new(chat: Arc<dyn ChatTransport>, relay: Option<Arc<dyn RelayTransport>>) -> Self {
        Self {
            chat,
            relay,
            http: reqwest::Client::new(),
            direct_limit: config::upload::DIRECT_LIMIT_BYTES,
            relay_limit: config::upload::RELAY_LIMIT_BYTES,
        }
    }

    pub fn with_limits(mut self, direct_limit: u64, relay_limit: u64) -> Self {
        self.direct_limit = direct_limit;
        self.relay_limit = relay_limit;
        self
    }

    pub fn has_relay(&self) -> bool {
        self.relay.is_some()
    }

    /// Delivers the file, then purges its workspace unconditionally.
    pub async fn deliver(&self, request: DeliveryRequest) -> AppResult<Delivered> {
        let result = self.route_and_send(&request).await;
        if let Err(e) = request.file.workspace.purge() {
            log::warn!("Failed to purge {}: {}", request.file.workspace.path().display(), e);
        }
        match &result {
            Ok(delivered) => log::info!(
                "📤 Delivered {} bytes to {} via {}",
                delivered.size,
                request.chat,
                delivered.route
            ),
            Err(e) => log::error!("❌ Delivery to {} failed: {}", request.chat, e),
        }
        result
    }

    async fn route_and_send(&self, request: &DeliveryRequest) -> AppResult<Delivered> {
        let size = std::fs::metadata(&request.file.path)?.len();
        let route = route_for(size, self.direct_limit, self.relay_limit)?;
        log::info!("🧭 {} ({} bytes) routed {}", request.file.path.display(), size, route);

        let caption = caption(&request.source, size);
        match route {
            Route::Direct => {
                let thumbnail = match (&request.source.thumbnail, request.kind) {
                    (Some(url), MediaKind::Video | MediaKind::Audio) => {
                        fetch_thumbnail(&self.http, url, request.file.workspace.path()).await
                    }
                    _ => None,
                };
                let mut media = OutgoingMedia {
                    path: request.file.path.clone(),
                    kind: request.kind,
                    caption,
                    thumbnail,
                    duration: request.source.duration,
                    title: Some(request.source.title.clone()),
                    performer: request.source.uploader.clone(),
                    keyboard: request.keyboard.clone(),
                };
                let sent = match self.chat.send_media(request.chat, &media).await {
                    Ok(sent) => sent,
                    Err(e) if media.thumbnail.is_some() => {
                        log::warn!("[THUMBNAIL] Send with thumbnail failed ({}), retrying without", e);
                        media.thumbnail = None;
                        self.chat.send_media(request.chat, &media).await.map_err(upload_failed)?
                    }
                    Err(e) => return Err(upload_failed(e)),
                };
                Ok(Delivered {
                    route,
                    size,
                    sent,
                    relay_message_id: None,
                })
            }
            Route::Relay => {
                let relay = self.relay.as_ref().ok_or_else(|| {
                    AppError::UploadFailed("file exceeds the direct limit and no relay is configured".to_string())
                })?;
                let relay_message_id = relay.upload(&request.file.path, &caption).await?;
                let sent = self
                    .chat
                    .copy_from_relay(request.chat, relay_message_id, &caption, request.keyboard.clone())
                    .await
                    .map_err(upload_failed)?;
                Ok(Delivered {
                    route,
                    size,
                    sent,
                    relay_message_id: Some(relay_message_id),
                })
            }
        }
    }
}

fn upload_failed(err: AppError) -> AppError {
    match err {
        AppError::UploadFailed(_) | AppError::UploadTooLarge { .. } => err,
        other => AppError::UploadFailed(other.to_string()),
    }
}
