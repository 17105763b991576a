//! Telegram bot integration: selection flow, keyboards and update handlers

pub mod commands;
pub mod flow;
pub mod handlers;
pub mod keyboard;
pub mod status;
pub mod token;

use teloxide::types::InlineKeyboardButton;

pub use commands::{setup_bot_commands, Command};
pub use flow::DownloadFlow;
pub use handlers::{schema, HandlerDeps, HandlerError};
pub use status::MessageStatus;
pub use token::{SelectionToken, TokenError};

pub type Bot = teloxide::Bot;

/// Inline button carrying `data` as its callback payload.
pub fn cb(text: impl Into<String>, data: impl Into<String>) -> InlineKeyboardButton {
    InlineKeyboardButton::callback(text, data)
}

/// Creates the bot from `BOT_TOKEN` with the configured request timeout.
pub fn create_bot() -> anyhow::Result<Bot> {
    let client = teloxide::net::default_reqwest_settings()
        .timeout(crate::core::config::network::timeout())
        .build()?;
    Ok(Bot::with_client(crate::core::config::BOT_TOKEN.as_str(), client))
}
