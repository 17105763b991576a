use anyhow::Result;
use dotenvy::dotenv;
use std::path::Path;
use std::sync::Arc;
use teloxide::prelude::*;
use url::Url;

use mediadrop::cli::{Cli, Commands};
use mediadrop::core::config;
use mediadrop::core::logging::{init_logger, log_startup_configuration};
use mediadrop::core::utils::{format_duration, format_file_size};
use mediadrop::download::{extract, CatalogSessions, DownloadExecutor, ExtractionOracle, YtDlpOracle};
use mediadrop::storage::{create_pool, get_connection, records, ConcurrencyGuard};
use mediadrop::telegram::keyboard::option_label;
use mediadrop::telegram::{create_bot, schema, setup_bot_commands, DownloadFlow, HandlerDeps};
use mediadrop::upload::{ChatTransport, MtProtoRelay, RelayChannel, RelayTransport, TelegramTransport, UploadRouter};

/// Main entry point
///
/// Parses CLI arguments and dispatches to the matching subcommand; without
/// one the bot runs.
#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();

    // Log panics from dispatcher tasks instead of losing them on stderr
    std::panic::set_hook(Box::new(|panic_info| {
        log::error!("Panic caught: {:?}", panic_info);
        if let Some(location) = panic_info.location() {
            log::error!("Panic at {}:{}:{}", location.file(), location.line(), location.column());
        }
    }));

    let _ = dotenv();
    init_logger(&config::LOG_FILE_PATH)?;

    match cli.command {
        Some(Commands::Run) | None => run_bot().await,
        Some(Commands::Info { url }) => run_cli_info(&url).await,
        Some(Commands::History { owner, limit }) => run_cli_history(owner, limit),
    }
}

async fn run_bot() -> Result<()> {
    log_startup_configuration();

    let db_pool = Arc::new(
        create_pool(&config::DATABASE_PATH).map_err(|e| anyhow::anyhow!("Failed to create database pool: {}", e))?,
    );
    std::fs::create_dir_all(config::DOWNLOAD_FOLDER.as_str())?;

    let bot = create_bot()?;
    if let Err(e) = setup_bot_commands(&bot).await {
        log::warn!("Failed to register bot commands: {}", e);
    }

    let relay_channel = config::relay::STORAGE_CHANNEL.as_deref().and_then(RelayChannel::parse);
    let relay = connect_relay(relay_channel.as_ref()).await;
    let chat: Arc<dyn ChatTransport> = Arc::new(TelegramTransport::new(
        bot.clone(),
        relay.as_ref().and(relay_channel.as_ref()).map(RelayChannel::recipient),
    ));

    let router = UploadRouter::new(Arc::clone(&chat), relay);
    if !router.has_relay() {
        log::warn!(
            "⚠️ No relay configured: files over {} will not be delivered",
            format_file_size(config::upload::DIRECT_LIMIT_BYTES)
        );
    }

    let oracle: Arc<dyn ExtractionOracle> = Arc::new(YtDlpOracle::default());
    let flow = Arc::new(DownloadFlow::new(
        Arc::clone(&db_pool),
        ConcurrencyGuard::new(Arc::clone(&db_pool)),
        CatalogSessions::default(),
        DownloadExecutor::new(oracle, config::DOWNLOAD_FOLDER.as_str()),
        router,
        chat,
    ));

    log::info!("🚀 Bot started, polling for updates");
    let listener = teloxide::update_listeners::Polling::builder(bot.clone())
        .drop_pending_updates()
        .build();
    Dispatcher::builder(bot, schema(HandlerDeps::new(Arc::clone(&flow))))
        .enable_ctrlc_handler()
        .build()
        .dispatch_with_listener(
            listener,
            LoggingErrorHandler::with_custom_text("An error from the update listener"),
        )
        .await;

    log::info!("Dispatcher stopped, waiting for running downloads");
    flow.wait_idle().await;
    log::info!("Dispatcher shutdown gracefully");
    Ok(())
}

/// Signs the relay client in; any failure leaves the relay disabled.
async fn connect_relay(channel: Option<&RelayChannel>) -> Option<Arc<dyn RelayTransport>> {
    let (Some(api_id), Some(api_hash), Some(channel)) =
        (*config::relay::API_ID, config::relay::API_HASH.as_deref(), channel)
    else {
        return None;
    };
    let session_path = Path::new(config::relay::SESSION_PATH.as_str());
    match MtProtoRelay::connect(api_id, api_hash, &config::BOT_TOKEN, session_path, channel).await {
        Ok(relay) => {
            log::info!("✅ Relay connected to {:?}", channel);
            Some(Arc::new(relay))
        }
        Err(e) => {
            log::error!("❌ Relay unavailable, large files will be rejected: {}", e);
            None
        }
    }
}

/// Prints the format catalog for a URL
async fn run_cli_info(url: &str) -> Result<()> {
    let url = Url::parse(url)?;
    let oracle: Arc<dyn ExtractionOracle> = Arc::new(YtDlpOracle::default());
    let extraction = extract(oracle, &url).await.map_err(|e| anyhow::anyhow!("{}", e))?;

    let source = &extraction.source;
    println!("Title: {}", source.title);
    println!("Uploader: {}", source.uploader.as_deref().unwrap_or("-"));
    println!("Platform: {}", source.platform);
    if let Some(duration) = source.duration {
        println!("Duration: {}", format_duration(duration));
    }
    for kind in extraction.catalog.kinds() {
        println!("\n{} {}", kind.icon(), kind.title());
        for option in extraction.catalog.options(kind) {
            println!("  [{}] {}", option.format_id, option_label(option));
        }
    }
    Ok(())
}

/// Prints an owner's completed downloads
fn run_cli_history(owner: i64, limit: usize) -> Result<()> {
    let db_pool = create_pool(&config::DATABASE_PATH).map_err(|e| anyhow::anyhow!("Failed to open database: {}", e))?;
    let conn = get_connection(&db_pool)?;
    let entries = records::list_completed(&conn, owner, limit)?;
    if entries.is_empty() {
        println!("No completed downloads for {}", owner);
        return Ok(());
    }
    for record in entries {
        println!(
            "#{} {} [{} {}] {} {}",
            record.id,
            record.title.as_deref().unwrap_or("Unknown"),
            record.kind.map(|k| k.to_string()).unwrap_or_default(),
            record.quality.as_deref().unwrap_or("-"),
            format_file_size(record.file_size.unwrap_or(0)),
            record.completed_at.as_deref().unwrap_or("")
        );
    }
    Ok(())
}
