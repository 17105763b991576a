//! Status surface backed by one edited chat message.

use async_trait::async_trait;
use std::sync::Arc;
use teloxide::types::InlineKeyboardMarkup;

use crate::download::progress::{ProgressUpdate, StatusSurface};
use crate::storage::records::{self, DownloadStatus};
use crate::storage::{get_connection, DbPool};
use crate::upload::transport::ChatTransport;

pub struct MessageStatus {
    chat: Arc<dyn ChatTransport>,
    chat_id: i64,
    message_id: i32,
    keyboard: Option<InlineKeyboardMarkup>,
    watched: Option<(Arc<DbPool>, i64)>,
}

impl MessageStatus {
    pub fn new(
        chat: Arc<dyn ChatTransport>,
        chat_id: i64,
        message_id: i32,
        keyboard: Option<InlineKeyboardMarkup>,
    ) -> Self {
        Self {
            chat,
            chat_id,
            message_id,
            keyboard,
            watched: None,
        }
    }

    /// Stops rendering once the record leaves `processing` (e.g. cancelled),
    /// so progress never overwrites the cancellation notice.
    pub fn watching(mut self, pool: Arc<DbPool>, download_id: i64) -> Self {
        self.watched = Some((pool, download_id));
        self
    }

    fn is_live(&self) -> bool {
        let Some((pool, download_id)) = &self.watched else {
            return true;
        };
        match get_connection(pool).map(|conn| records::get_status(&conn, *download_id)) {
            Ok(Ok(status)) => status == Some(DownloadStatus::Processing),
            _ => true,
        }
    }
}

#[async_trait]
impl StatusSurface for MessageStatus {
    async fn show(&self, update: &ProgressUpdate) {
        if !self.is_live() {
            log::debug!("Status message {} is no longer live, skipping update", self.message_id);
            return;
        }
        if let Err(e) = self
            .chat
            .edit_text(self.chat_id, self.message_id, &update.text, self.keyboard.clone())
            .await
        {
            log::warn!(
                "Failed to update status message {} in chat {}: {}",
                self.message_id,
                self.chat_id,
                e
            );
        }
    }
}
