//! Mediadrop - Telegram bot that turns a shared media link into a delivered file
//!
//! # Module Structure
//!
//! - `core`: configuration, errors, logging and formatting helpers
//! - `storage`: download records and the per-owner concurrency guard
//! - `download`: extraction, format catalog, progress and the blocking executor
//! - `upload`: size-based delivery, directly or through the relay channel
//! - `telegram`: selection tokens, keyboards, the selection flow and handlers

pub mod cli;
pub mod core;
pub mod download;
pub mod storage;
pub mod telegram;
pub mod upload;

// Re-export commonly used types for convenience
pub use core::{config, AppError, AppResult};
pub use storage::{create_pool, get_connection, DbConnection, DbPool};
pub use telegram::{schema, DownloadFlow, HandlerDeps};
