use once_cell::sync::Lazy;
use std::env;
use std::time::Duration;

/// yt-dlp binary path
/// Read once at startup from YTDL_BIN environment variable or defaults to "yt-dlp"
pub static YTDL_BIN: Lazy<String> = Lazy::new(|| env::var("YTDL_BIN").unwrap_or_else(|_| "yt-dlp".to_string()));

/// Root folder for per-download workspaces
/// Read from DOWNLOAD_FOLDER environment variable
/// Default: ./downloads
pub static DOWNLOAD_FOLDER: Lazy<String> =
    Lazy::new(|| env::var("DOWNLOAD_FOLDER").unwrap_or_else(|_| "./downloads".to_string()));

/// Database file path
/// Read from DATABASE_PATH environment variable
/// Default: mediadrop.sqlite
pub static DATABASE_PATH: Lazy<String> =
    Lazy::new(|| env::var("DATABASE_PATH").unwrap_or_else(|_| "mediadrop.sqlite".to_string()));

/// Log file path
/// Read from LOG_FILE_PATH environment variable
/// Default: app.log
pub static LOG_FILE_PATH: Lazy<String> =
    Lazy::new(|| env::var("LOG_FILE_PATH").unwrap_or_else(|_| "app.log".to_string()));

/// Bot token
/// Read from BOT_TOKEN or TELOXIDE_TOKEN environment variable
pub static BOT_TOKEN: Lazy<String> = Lazy::new(|| {
    env::var("BOT_TOKEN")
        .or_else(|_| env::var("TELOXIDE_TOKEN"))
        .unwrap_or_else(|_| String::new())
});

/// Number of blocking download jobs allowed to run at once
pub static MAX_CONCURRENT_DOWNLOADS: Lazy<usize> = Lazy::new(|| parse_env("MAX_CONCURRENT_DOWNLOADS", 5));

/// Daily download ceiling for a new owner
pub static DAILY_QUOTA: Lazy<i64> = Lazy::new(|| parse_env("DAILY_QUOTA", 10));

/// Hard timeout for a single yt-dlp invocation (in seconds)
pub static DOWNLOAD_TIMEOUT_SECS: Lazy<u64> = Lazy::new(|| parse_env("DOWNLOAD_TIMEOUT_SECS", 300));

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

/// Bot API network configuration
pub mod network {
    use std::time::Duration;

    /// Request timeout; large enough for a 50 MB upload
    pub const TIMEOUT_SECS: u64 = 300;

    pub fn timeout() -> Duration {
        Duration::from_secs(TIMEOUT_SECS)
    }
}

/// Relay (MTProto) configuration
///
/// The relay is only enabled when every value is present.
pub mod relay {
    use super::*;

    /// API ID from my.telegram.org
    pub static API_ID: Lazy<Option<i32>> = Lazy::new(|| env::var("TELEGRAM_API_ID").ok().and_then(|v| v.parse().ok()));

    /// API hash from my.telegram.org
    pub static API_HASH: Lazy<Option<String>> =
        Lazy::new(|| env::var("TELEGRAM_API_HASH").ok().filter(|v| !v.is_empty()));

    /// Storage channel: either "@username" or a Bot API id like -1001234567890
    pub static STORAGE_CHANNEL: Lazy<Option<String>> =
        Lazy::new(|| env::var("STORAGE_CHANNEL_ID").ok().filter(|v| !v.is_empty()));

    /// Session file for the MTProto client
    pub static SESSION_PATH: Lazy<String> =
        Lazy::new(|| env::var("MTPROTO_SESSION_PATH").unwrap_or_else(|_| "relay.session".to_string()));

    pub fn is_configured() -> bool {
        API_ID.is_some() && API_HASH.is_some() && STORAGE_CHANNEL.is_some()
    }
}

/// Upload size limits
pub mod upload {
    /// Bot API direct upload ceiling (50 MiB)
    pub const DIRECT_LIMIT_BYTES: u64 = 50 * 1024 * 1024;

    /// MTProto upload ceiling (2000 MiB)
    pub const RELAY_LIMIT_BYTES: u64 = 2000 * 1024 * 1024;

    /// Telegram rejects thumbnails above 200 KiB
    pub const THUMBNAIL_MAX_BYTES: u64 = 200 * 1024;
}

/// Format catalog configuration
pub mod catalog {
    use super::Duration;

    /// Maximum quality buttons shown per kind
    pub const MAX_OPTIONS: usize = 8;

    /// Maximum image options shown
    pub const MAX_IMAGES: usize = 5;

    /// Lifetime of a selection session (in seconds)
    pub const SESSION_TTL_SECS: u64 = 15 * 60;

    /// Maximum number of live selection sessions
    pub const MAX_SESSIONS: u64 = 10_000;

    pub fn session_ttl() -> Duration {
        Duration::from_secs(SESSION_TTL_SECS)
    }
}

/// Progress reporting configuration
pub mod progress {
    use super::Duration;

    /// Minimum interval between two progress reports (in milliseconds)
    pub const MIN_INTERVAL_MS: u64 = 1000;

    /// Number of cells in the progress bar
    pub const BAR_WIDTH: usize = 10;

    pub fn min_interval() -> Duration {
        Duration::from_millis(MIN_INTERVAL_MS)
    }
}

/// Concurrency guard configuration
pub mod guard {
    /// An in_progress marker older than this may be taken over (in seconds)
    pub const LEASE_SECS: i64 = 30 * 60;
}

/// Selection token configuration
pub mod token {
    /// Telegram callback data limit (in bytes)
    pub const MAX_LEN: usize = 64;
}

/// Download configuration
pub mod download {
    use super::Duration;

    /// Timeout for the metadata dump (in seconds)
    pub const EXTRACT_TIMEOUT_SECS: u64 = 120;

    /// Poll interval while waiting for a child process
    pub const POLL_INTERVAL_MS: u64 = 200;

    pub fn extract_timeout() -> Duration {
        Duration::from_secs(EXTRACT_TIMEOUT_SECS)
    }

    pub fn fetch_timeout() -> Duration {
        Duration::from_secs(*super::DOWNLOAD_TIMEOUT_SECS)
    }
}
