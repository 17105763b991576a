//! Outbound chat operations used by the selection flow and the upload router.

use async_trait::async_trait;
use std::path::PathBuf;
use teloxide::prelude::*;
use teloxide::types::{CallbackQueryId, InlineKeyboardMarkup, InputFile, MessageId, Recipient};

use crate::core::error::AppResult;
use crate::core::utils::escape_filename;
use crate::download::catalog::MediaKind;
use crate::telegram::Bot;

/// A fetched file ready to be sent
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMedia {
    pub path: PathBuf,
    pub kind: MediaKind,
    pub caption: String,
    pub thumbnail: Option<PathBuf>,
    pub duration: Option<u64>,
    pub title: Option<String>,
    pub performer: Option<String>,
    pub keyboard: Option<InlineKeyboardMarkup>,
}

/// Reference to a delivered message, kept for re-delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMedia {
    pub message_id: i32,
    /// Bot API file id; absent for reference copies
    pub file_id: Option<String>,
}

#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send_text(&self, chat: i64, text: &str, keyboard: Option<InlineKeyboardMarkup>) -> AppResult<i32>;

    /// Edits a message; "not modified" is not an error.
    async fn edit_text(
        &self,
        chat: i64,
        message_id: i32,
        text: &str,
        keyboard: Option<InlineKeyboardMarkup>,
    ) -> AppResult<()>;

    async fn delete_message(&self, chat: i64, message_id: i32) -> AppResult<()>;

    async fn answer_callback(&self, callback_id: &str, text: Option<&str>) -> AppResult<()>;

    /// Uploads the file bytes directly.
    async fn send_media(&self, chat: i64, media: &OutgoingMedia) -> AppResult<SentMedia>;

    /// Re-sends a previously delivered file by its file id.
    async fn send_cached(&self, chat: i64, kind: MediaKind, file_id: &str, caption: &str) -> AppResult<SentMedia>;

    /// Copies a message of the relay channel into `chat` without re-uploading.
    async fn copy_from_relay(
        &self,
        chat: i64,
        relay_message_id: i32,
        caption: &str,
        keyboard: Option<InlineKeyboardMarkup>,
    ) -> AppResult<SentMedia>;
}

/// Bot API implementation
#[derive(Clone)]
pub struct TelegramTransport {
    bot: Bot,
    relay_chat: Option<Recipient>,
}

impl TelegramTransport {
    pub fn new(bot: Bot, relay_chat: Option<Recipient>) -> Self {
        Self { bot, relay_chat }
    }
}

fn file_id_of(message: &Message) -> Option<String> {
    message
        .video()
        .map(|v| v.file.id.0.clone())
        .or_else(|| message.audio().map(|a| a.file.id.0.clone()))
        .or_else(|| message.document().map(|d| d.file.id.0.clone()))
        .or_else(|| message.photo().and_then(|p| p.last()).map(|p| p.file.id.0.clone()))
}

/// File name shown in the chat: the source title with the fetched extension.
fn upload_name(media: &OutgoingMedia) -> Option<String> {
    let title = media.title.as_deref()?;
    let ext = media.path.extension()?.to_str()?;
    Some(format!("{}.{}", escape_filename(title), ext))
}

fn sent(message: &Message) -> SentMedia {
    SentMedia {
        message_id: message.id.0,
        file_id: file_id_of(message),
    }
}

#[async_trait]
impl ChatTransport for TelegramTransport {
    async fn send_text(&self, chat: i64, text: &str, keyboard: Option<InlineKeyboardMarkup>) -> AppResult<i32> {
        let mut request = self.bot.send_message(ChatId(chat), text);
        if let Some(keyboard) = keyboard {
            request = request.reply_markup(keyboard);
        }
        Ok(request.await?.id.0)
    }

    async fn edit_text(
        &self,
        chat: i64,
        message_id: i32,
        text: &str,
        keyboard: Option<InlineKeyboardMarkup>,
    ) -> AppResult<()> {
        let mut request = self.bot.edit_message_text(ChatId(chat), MessageId(message_id), text);
        if let Some(keyboard) = keyboard {
            request = request.reply_markup(keyboard);
        }
        match request.await {
            Ok(_) => Ok(()),
            Err(e) if e.to_string().contains("message is not modified") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_message(&self, chat: i64, message_id: i32) -> AppResult<()> {
        self.bot.delete_message(ChatId(chat), MessageId(message_id)).await?;
        Ok(())
    }

    async fn answer_callback(&self, callback_id: &str, text: Option<&str>) -> AppResult<()> {
        let mut request = self.bot.answer_callback_query(CallbackQueryId(callback_id.to_string()));
        if let Some(text) = text {
            request = request.text(text);
        }
        request.await?;
        Ok(())
    }

    async fn send_media(&self, chat: i64, media: &OutgoingMedia) -> AppResult<SentMedia> {
        let chat_id = ChatId(chat);
        let mut file = InputFile::file(media.path.clone());
        if let Some(name) = upload_name(media) {
            file = file.file_name(name);
        }
        let duration = media.duration.and_then(|d| u32::try_from(d).ok());

        let message = match media.kind {
            MediaKind::Video => {
                let mut request = self
                    .bot
                    .send_video(chat_id, file)
                    .caption(media.caption.clone())
                    .supports_streaming(true);
                if let Some(duration) = duration {
                    request = request.duration(duration);
                }
                if let Some(thumb) = &media.thumbnail {
                    request = request.thumbnail(InputFile::file(thumb.clone()));
                }
                if let Some(keyboard) = media.keyboard.clone() {
                    request = request.reply_markup(keyboard);
                }
                request.await?
            }
            MediaKind::Audio => {
                let mut request = self.bot.send_audio(chat_id, file).caption(media.caption.clone());
                if let Some(duration) = duration {
                    request = request.duration(duration);
                }
                if let Some(title) = &media.title {
                    request = request.title(title.clone());
                }
                if let Some(performer) = &media.performer {
                    request = request.performer(performer.clone());
                }
                if let Some(thumb) = &media.thumbnail {
                    request = request.thumbnail(InputFile::file(thumb.clone()));
                }
                if let Some(keyboard) = media.keyboard.clone() {
                    request = request.reply_markup(keyboard);
                }
                request.await?
            }
            MediaKind::Image => {
                let mut request = self.bot.send_photo(chat_id, file).caption(media.caption.clone());
                if let Some(keyboard) = media.keyboard.clone() {
                    request = request.reply_markup(keyboard);
                }
                request.await?
            }
        };
        Ok(sent(&message))
    }

    async fn send_cached(&self, chat: i64, kind: MediaKind, file_id: &str, caption: &str) -> AppResult<SentMedia> {
        let chat_id = ChatId(chat);
        let file = InputFile::file_id(teloxide::types::FileId(file_id.to_string()));
        let message = match kind {
            MediaKind::Video => self.bot.send_video(chat_id, file).caption(caption).await?,
            MediaKind::Audio => self.bot.send_audio(chat_id, file).caption(caption).await?,
            MediaKind::Image => self.bot.send_photo(chat_id, file).caption(caption).await?,
        };
        Ok(sent(&message))
    }

    async fn copy_from_relay(
        &self,
        chat: i64,
        relay_message_id: i32,
        caption: &str,
        keyboard: Option<InlineKeyboardMarkup>,
    ) -> AppResult<SentMedia> {
        let Some(relay_chat) = self.relay_chat.clone() else {
            return Err(crate::core::error::AppError::UploadFailed(
                "relay channel is not configured".to_string(),
            ));
        };
        let mut request = self
            .bot
            .copy_message(ChatId(chat), relay_chat, MessageId(relay_message_id))
            .caption(caption);
        if let Some(keyboard) = keyboard {
            request = request.reply_markup(keyboard);
        }
        let copied = request.await?;
        Ok(SentMedia {
            message_id: copied.0,
            file_id: None,
        })
    }
}
