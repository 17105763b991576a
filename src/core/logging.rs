//! Logger initialization (console + file)

use anyhow::Result;
use simplelog::*;
use std::fs::File;

/// Initialize logger for both console and file output
///
/// The terminal gets `Info` and above, the file keeps `Debug` so state
/// transitions and fallback attempts can be reconstructed after the fact.
///
/// # Arguments
/// * `log_file_path` - Path to the log file
pub fn init_logger(log_file_path: &str) -> Result<()> {
    let log_file = File::create(log_file_path).map_err(|e| anyhow::anyhow!("Failed to create log file: {}", e))?;

    let config = ConfigBuilder::new()
        .add_filter_ignore_str("hyper")
        .add_filter_ignore_str("reqwest")
        .add_filter_ignore_str("grammers")
        .build();

    CombinedLogger::init(vec![
        TermLogger::new(
            LevelFilter::Info,
            config.clone(),
            TerminalMode::Mixed,
            ColorChoice::Auto,
        ),
        WriteLogger::new(LevelFilter::Debug, config, log_file),
    ])
    .map_err(|e| anyhow::anyhow!("Failed to initialize logger: {}", e))?;

    Ok(())
}

/// Logs the effective configuration at startup
pub fn log_startup_configuration() {
    use crate::core::config;

    log::info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    log::info!("⚙️  yt-dlp binary: {}", *config::YTDL_BIN);
    log::info!("📁 Download folder: {}", *config::DOWNLOAD_FOLDER);
    log::info!("🗄️  Database: {}", *config::DATABASE_PATH);
    log::info!("👷 Max concurrent downloads: {}", *config::MAX_CONCURRENT_DOWNLOADS);
    log::info!("📊 Default daily quota: {}", *config::DAILY_QUOTA);
    if config::relay::is_configured() {
        log::info!("✅ Relay upload enabled (files up to 2000 MB)");
    } else {
        log::warn!("⚠️  Relay upload disabled: files above 50 MB will be rejected");
    }
    log::info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::NamedTempFile;

    #[test]
    fn test_init_logger_creates_log_file() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().to_str().unwrap();

        // A global logger may already be installed by another test;
        // the file must exist either way.
        let _ = init_logger(path);
        assert!(temp_file.path().exists());
    }
}
