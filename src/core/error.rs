use thiserror::Error;

use crate::download::platform::RetryRef;

/// Centralized error types for the application
///
/// The first block of variants is the user-facing taxonomy of the download
/// flow; each maps to exactly one short message via [`AppError::user_message`].
/// The second block wraps infrastructure failures via `#[from]`.
#[derive(Error, Debug)]
pub enum AppError {
    /// The extraction oracle returned nothing usable for the URL
    #[error("Extraction failed: {reason}")]
    ExtractionFailed { reason: String, retry: Option<RetryRef> },

    /// Selection session missing at quality-select time
    #[error("Selection session expired")]
    SelectionExpired,

    /// A selection was already made and its download is running
    #[error("Download {0} is already running")]
    AlreadyDownloading(i64),

    #[error("Malformed selection token: {0}")]
    MalformedToken(String),

    #[error("Unknown selection action: {0}")]
    UnknownAction(String),

    /// The blocking fetch failed; carries a short human-readable reason
    #[error("Download failed: {0}")]
    DownloadFailed(String),

    #[error("File too large: {size} bytes (limit {limit})")]
    UploadTooLarge { size: u64, limit: u64 },

    #[error("Upload failed: {0}")]
    UploadFailed(String),

    /// Owner already has a download in flight
    #[error("Another download is in progress (record {existing:?})")]
    ConcurrencyRejected { existing: Option<i64> },

    #[error("Daily quota exceeded: {used}/{limit}")]
    QuotaExceeded { used: i64, limit: i64 },

    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Database connection pool errors
    #[error("Database pool error: {0}")]
    DatabasePool(#[from] r2d2::Error),

    /// Telegram API errors
    #[error("Telegram error: {0}")]
    Telegram(#[from] teloxide::RequestError),

    /// HTTP/Fetch errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// URL parsing errors
    #[error("URL parsing error: {0}")]
    Url(#[from] url::ParseError),

    /// yt-dlp JSON parsing errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Type alias for Result with AppError
pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    /// One short, actionable message per failure kind.
    pub fn user_message(&self) -> String {
        match self {
            AppError::ExtractionFailed { reason, .. } => {
                format!("❌ Could not read this link.\n\n{}", reason)
            }
            AppError::SelectionExpired => "⌛ Session expired. Please send the link again.".to_string(),
            AppError::AlreadyDownloading(_) => "⏳ Already downloading, hang on.".to_string(),
            AppError::MalformedToken(_) | AppError::UnknownAction(_) => {
                "⚠️ This button is no longer valid. Please send the link again.".to_string()
            }
            AppError::DownloadFailed(reason) => format!("❌ Download failed.\n\n{}", reason),
            AppError::UploadTooLarge { size, limit } => format!(
                "❌ File is too large to send ({}). The limit is {}.",
                crate::core::utils::format_file_size(*size),
                crate::core::utils::format_file_size(*limit)
            ),
            AppError::UploadFailed(_) => "❌ Could not send the file. Please try again later.".to_string(),
            AppError::ConcurrencyRejected { .. } => {
                "⏳ You already have a download in progress. Wait for it to finish or cancel it.".to_string()
            }
            AppError::QuotaExceeded { used, limit } => {
                format!("🚫 Daily limit reached ({}/{}). Try again tomorrow.", used, limit)
            }
            _ => "❌ Something went wrong. Please try again.".to_string(),
        }
    }

    /// Retry reference captured when extraction failed
    pub fn retry_ref(&self) -> Option<&RetryRef> {
        match self {
            AppError::ExtractionFailed { retry, .. } => retry.as_ref(),
            _ => None,
        }
    }
}
