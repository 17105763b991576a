//! Relay transport for files above the Bot API upload ceiling.
//!
//! The bot signs in over MTProto (which accepts uploads up to 2000 MiB),
//! uploads the file once into a storage channel, and the Bot API then copies
//! that channel message into the destination chat.

use async_trait::async_trait;
use grammers_client::types::InputMessage;
use grammers_client::{Client, Config, InitParams};
use grammers_session::{PackedChat, PackedType, Session};
use std::path::Path;
use teloxide::types::{ChatId, Recipient};
use thiserror::Error;

use crate::core::error::AppError;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Session error: {0}")]
    Session(String),

    #[error("Sign-in failed: {0}")]
    SignIn(String),

    #[error("MTProto client error: {0}")]
    Invocation(String),

    #[error("Storage channel not found: {0}")]
    ChannelNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<RelayError> for AppError {
    fn from(err: RelayError) -> Self {
        AppError::UploadFailed(err.to_string())
    }
}

/// Storage channel reference as configured
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayChannel {
    /// `@username`
    Username(String),
    /// Bot API id of the form `-100…`
    Id(i64),
}

impl RelayChannel {
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        if let Some(name) = value.strip_prefix('@') {
            return (!name.is_empty()).then(|| RelayChannel::Username(name.to_string()));
        }
        value
            .parse::<i64>()
            .ok()
            .filter(|id| value.starts_with("-100") && *id < 0)
            .map(RelayChannel::Id)
    }

    /// Channel id without the Bot API `-100` prefix
    pub fn bare_id(&self) -> Option<i64> {
        match self {
            RelayChannel::Id(id) => Some(-id - 1_000_000_000_000),
            RelayChannel::Username(_) => None,
        }
    }

    /// Bot API view of the same channel, for `copyMessage`
    pub fn recipient(&self) -> Recipient {
        match self {
            RelayChannel::Username(name) => Recipient::ChannelUsername(format!("@{}", name)),
            RelayChannel::Id(id) => Recipient::Id(ChatId(*id)),
        }
    }
}

#[async_trait]
pub trait RelayTransport: Send + Sync {
    /// Uploads `path` to the storage channel; returns the channel message id.
    async fn upload(&self, path: &Path, caption: &str) -> Result<i32, RelayError>;
}

/// grammers-backed relay signed in as the bot itself
pub struct MtProtoRelay {
    client: Client,
    channel: PackedChat,
}

impl MtProtoRelay {
    pub async fn connect(
        api_id: i32,
        api_hash: &str,
        bot_token: &str,
        session_path: &Path,
        channel: &RelayChannel,
    ) -> Result<Self, RelayError> {
        log::info!("Initializing relay client...");

        let session = if session_path.exists() {
            log::info!("Loading relay session from {:?}", session_path);
            Session::load_file(session_path).map_err(|e| RelayError::Session(format!("Failed to load session: {}", e)))?
        } else {
            log::info!("Creating new relay session");
            Session::new()
        };

        let client = Client::connect(Config {
            session,
            api_id,
            api_hash: api_hash.to_string(),
            params: InitParams {
                device_model: "mediadrop relay".to_string(),
                app_version: env!("CARGO_PKG_VERSION").to_string(),
                ..Default::default()
            },
        })
        .await
        .map_err(|e| RelayError::Session(format!("Failed to connect: {}", e)))?;

        let authorized = client
            .is_authorized()
            .await
            .map_err(|e| RelayError::Invocation(e.to_string()))?;
        if !authorized {
            log::info!("Relay not authorized, signing in as bot...");
            client
                .bot_sign_in(bot_token)
                .await
                .map_err(|e| RelayError::SignIn(e.to_string()))?;

            if let Some(parent) = session_path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            // grammers-session 0.5 writes into an existing file
            if !session_path.exists() {
                std::fs::File::create(session_path)?;
            }
            client
                .session()
                .save_to_file(session_path)
                .map_err(|e| RelayError::Session(format!("Failed to save session: {}", e)))?;
            log::info!("Relay session saved to {:?}", session_path);
        }

        let channel = match channel {
            RelayChannel::Username(name) => client
                .resolve_username(name)
                .await
                .map_err(|e| RelayError::Invocation(e.to_string()))?
                .map(|chat| chat.pack())
                .ok_or_else(|| RelayError::ChannelNotFound(format!("@{}", name)))?,
            RelayChannel::Id(id) => PackedChat {
                ty: PackedType::Broadcast,
                id: channel.bare_id().ok_or_else(|| RelayError::ChannelNotFound(id.to_string()))?,
                access_hash: None,
            },
        };

        log::info!("✅ Relay ready (storage channel {})", channel.id);
        Ok(Self { client, channel })
    }
}

#[async_trait]
impl RelayTransport for MtProtoRelay {
    async fn upload(&self, path: &Path, caption: &str) -> Result<i32, RelayError> {
        let size = std::fs::metadata(path)?.len();
        log::info!("📡 Relay upload of {} ({} bytes)", path.display(), size);

        let uploaded = self.client.upload_file(path).await?;
        let message = self
            .client
            .send_message(self.channel, InputMessage::text(caption).document(uploaded))
            .await
            .map_err(|e| RelayError::Invocation(e.to_string()))?;

        log::info!("📡 Relay message {} stored", message.id());
        Ok(message.id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_channel_references() {
        assert_eq!(
            RelayChannel::parse("@media_store"),
            Some(RelayChannel::Username("media_store".into()))
        );
        assert_eq!(
            RelayChannel::parse(" -1001234567890 "),
            Some(RelayChannel::Id(-1001234567890))
        );
        assert_eq!(RelayChannel::parse("@"), None);
        assert_eq!(RelayChannel::parse("12345"), None);
        assert_eq!(RelayChannel::parse("-12345"), None);
    }

    #[test]
    fn bare_id_strips_bot_api_prefix() {
        assert_eq!(RelayChannel::Id(-1001234567890).bare_id(), Some(1234567890));
        assert_eq!(RelayChannel::Username("x".into()).bare_id(), None);
    }

    #[test]
    fn recipient_matches_bot_api_form() {
        assert_eq!(
            RelayChannel::Username("store".into()).recipient(),
            Recipient::ChannelUsername("@store".into())
        );
        assert_eq!(
            RelayChannel::Id(-1001).recipient(),
            Recipient::Id(ChatId(-1001))
        );
    }

    #[test]
    fn relay_errors_become_upload_failures() {
        let err: AppError = RelayError::ChannelNotFound("@x".into()).into();
        assert!(matches!(err, AppError::UploadFailed(_)));
    }
}
