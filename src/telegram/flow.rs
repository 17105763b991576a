//! The selection flow, from a submitted URL to a delivered file.
//!
//! ```text
//! URL → admit → extract → [type] → [quality] → fetch → deliver → completed
//!                  │          ↑ back  │
//!                  └──────────┴───────┴──→ failed (error, cancel, expiry)
//! ```
//!
//! The owner's guard slot is held from admission until the download reaches a
//! terminal state. While the selection keyboard is open nothing owns the slot
//! in memory; it is released by the download, by a cancel, by session expiry,
//! or taken over once its lease runs out. A running download renews its lease.
//!
//! Fetch and delivery run on a detached task: teloxide handles one chat's
//! updates in order, and the owner's Cancel press must not queue behind them.

use std::str::FromStr;
use std::sync::Arc;
use teloxide::types::InlineKeyboardMarkup;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use url::Url;

use super::keyboard::{cancel_keyboard, convert_audio_keyboard, quality_keyboard, retry_keyboard, type_keyboard, AUTO_QUALITY};
use super::status::MessageStatus;
use super::token::SelectionToken;
use crate::core::error::{AppError, AppResult};
use crate::core::utils::{format_duration, truncate_chars};
use crate::download::catalog::{extract, Extraction, MediaKind, MediaSource};
use crate::download::executor::{DownloadExecutor, FetchedFile};
use crate::download::oracle::FetchRequest;
use crate::download::platform::{find_url, Platform, RetryRef};
use crate::download::session::CatalogSessions;
use crate::storage::guard::{Admission, ConcurrencyGuard, QuotaDecision, SlotGuard};
use crate::storage::records::{self, DownloadRecord, DownloadStatus, CANCELLED_BY_USER, SESSION_EXPIRED};
use crate::storage::{get_connection, DbPool};
use crate::upload::router::{caption, DeliveryRequest, UploadRouter};
use crate::upload::transport::ChatTransport;

/// Entries shown by `/history`
pub const HISTORY_LIMIT: usize = 20;

/// Prefix of the restore command, followed by a record id
pub const RESTORE_PREFIX: &str = "/restore_";

const NO_LINK: &str = "🔗 Send me a link to a video, track or image.";
const NOT_IN_HISTORY: &str = "This download is not in your history.";

/// One chosen rendition on its way to the owner
struct Job {
    owner: i64,
    download_id: i64,
    message_id: i32,
    source: MediaSource,
    kind: MediaKind,
    quality: String,
    format_id: Option<String>,
    direct_url: Option<String>,
}

#[derive(Clone)]
pub struct DownloadFlow {
    pool: Arc<DbPool>,
    guard: ConcurrencyGuard,
    sessions: CatalogSessions,
    executor: DownloadExecutor,
    router: UploadRouter,
    chat: Arc<dyn ChatTransport>,
    downloads: TaskTracker,
}

fn source_summary(source: &MediaSource) -> String {
    let mut text = format!("🎬 {}", truncate_chars(&source.title, 100));
    let mut details = Vec::new();
    if let Some(uploader) = source.uploader.as_deref().filter(|u| !u.is_empty()) {
        details.push(format!("👤 {}", truncate_chars(uploader, 60)));
    }
    if let Some(duration) = source.duration {
        details.push(format!("⏱ {}", format_duration(duration)));
    }
    if !details.is_empty() {
        text.push('\n');
        text.push_str(&details.join(" · "));
    }
    text
}

fn source_from_record(record: &DownloadRecord) -> MediaSource {
    MediaSource {
        url: record.url.clone(),
        platform: Platform::from_str(&record.platform).unwrap_or(Platform::Generic),
        title: record.title.clone().unwrap_or_else(|| "Unknown".to_string()),
        uploader: record.uploader.clone(),
        duration: record.duration,
        view_count: None,
        thumbnail: None,
    }
}

impl DownloadFlow {
    pub fn new(
        pool: Arc<DbPool>,
        guard: ConcurrencyGuard,
        sessions: CatalogSessions,
        executor: DownloadExecutor,
        router: UploadRouter,
        chat: Arc<dyn ChatTransport>,
    ) -> Self {
        Self {
            pool,
            guard,
            sessions,
            executor,
            router,
            chat,
            downloads: TaskTracker::new(),
        }
    }

    /// Waits until every detached download has finished.
    pub async fn wait_idle(&self) {
        self.downloads.close();
        self.downloads.wait().await;
        self.downloads.reopen();
    }

    /// Free text from the owner: a restore command or a message containing a link.
    pub async fn handle_text(&self, owner: i64, text: &str) -> AppResult<()> {
        if let Some(id) = text.trim().strip_prefix(RESTORE_PREFIX) {
            return match id.parse::<i64>() {
                Ok(id) => self.restore(owner, id).await,
                Err(_) => {
                    self.chat.send_text(owner, NOT_IN_HISTORY, None).await?;
                    Ok(())
                }
            };
        }
        match find_url(text) {
            Some(url) => self.submit(owner, url, None).await,
            None => {
                self.chat.send_text(owner, NO_LINK, None).await?;
                Ok(())
            }
        }
    }

    /// Admits `url` and shows the type keyboard, reusing `reuse_message` when given.
    pub async fn submit(&self, owner: i64, url: Url, reuse_message: Option<i32>) -> AppResult<()> {
        let Some((download_id, slot)) = self.admit(owner, &url, reuse_message).await? else {
            return Ok(());
        };

        let message_id = match self.show(owner, reuse_message, "🔍 Reading the link…", None).await {
            Ok(id) => id,
            Err(e) => {
                self.fail_record(download_id, &e);
                return Err(e);
            }
        };

        match self.prepare_selection(owner, download_id, &url, message_id).await {
            Ok(()) => {
                slot.keep();
                Ok(())
            }
            Err(e) => {
                self.fail_record(download_id, &e);
                drop(slot);
                let keyboard = matches!(e, AppError::ExtractionFailed { .. }).then(|| {
                    retry_keyboard(&e.retry_ref().cloned().unwrap_or(RetryRef::Record(download_id)))
                });
                self.show_error(owner, Some(message_id), &e, keyboard).await
            }
        }
    }

    /// Quota check then admission. `None` means the owner was told why not.
    async fn admit(&self, owner: i64, url: &Url, reuse_message: Option<i32>) -> AppResult<Option<(i64, SlotGuard)>> {
        if let QuotaDecision::Exceeded { used, limit } = self.guard.check_quota(owner)? {
            log::info!("🚫 Owner {} over quota ({}/{})", owner, used, limit);
            self.show_error(owner, reuse_message, &AppError::QuotaExceeded { used, limit }, None)
                .await?;
            return Ok(None);
        }

        let platform = Platform::detect(url);
        match self.guard.admit(owner, url.as_str(), platform.as_ref())? {
            Admission::Admitted { download_id } => Ok(Some((download_id, self.guard.scope(owner, download_id)))),
            Admission::Rejected { existing } => {
                let keyboard = existing.map(cancel_keyboard);
                self.show_error(owner, reuse_message, &AppError::ConcurrencyRejected { existing }, keyboard)
                    .await?;
                Ok(None)
            }
        }
    }

    async fn prepare_selection(&self, owner: i64, download_id: i64, url: &Url, message_id: i32) -> AppResult<()> {
        {
            let conn = get_connection(&self.pool)?;
            records::mark_processing(&conn, download_id)?;
        }

        let extraction = extract(self.executor.oracle(), url).await?;
        {
            let conn = get_connection(&self.pool)?;
            records::set_source_metadata(
                &conn,
                download_id,
                &extraction.source.title,
                extraction.source.uploader.as_deref(),
                extraction.source.duration,
            )?;
        }

        let text = format!("{}\n\nWhat would you like to download?", source_summary(&extraction.source));
        let keyboard = type_keyboard(download_id, &extraction.catalog);
        self.sessions.store(owner, download_id, extraction).await;
        self.chat.edit_text(owner, message_id, &text, Some(keyboard)).await?;
        log::info!("📋 Download {} (owner {}) awaiting selection", download_id, owner);
        Ok(())
    }

    /// Button press on one of the flow's keyboards.
    pub async fn handle_callback(&self, owner: i64, callback_id: &str, message_id: i32, data: &str) -> AppResult<()> {
        let token = match SelectionToken::decode(data) {
            Ok(token) => token,
            Err(e) => {
                let err = AppError::from(e);
                log::warn!("Rejected callback from {}: {}", owner, err);
                self.chat.answer_callback(callback_id, Some(&err.user_message())).await?;
                return Ok(());
            }
        };
        log::debug!("Callback from {}: {:?}", owner, token);

        // Retry extracts before returning; everything else answers once it is done.
        let answer_first = matches!(token, SelectionToken::Retry(_));
        if answer_first {
            self.chat.answer_callback(callback_id, None).await?;
        }

        let result = match token {
            SelectionToken::TypeSelect { kind, download_id } => {
                self.select_type(owner, download_id, kind, message_id).await
            }
            SelectionToken::Back { download_id } => self.back(owner, download_id, message_id).await,
            SelectionToken::QualitySelect {
                kind,
                quality,
                format_id,
                download_id,
            } => {
                self.select_quality(owner, download_id, kind, quality, format_id, message_id)
                    .await
            }
            SelectionToken::Cancel { download_id } => self.cancel(owner, download_id, message_id).await,
            SelectionToken::Retry(retry) => self.retry(owner, retry, message_id).await,
            SelectionToken::ConvertAudio { download_id } => self.convert_audio(owner, download_id).await,
        };

        if !answer_first {
            let toast = match &result {
                Err(e @ AppError::AlreadyDownloading(_)) => Some(e.user_message()),
                _ => None,
            };
            if let Err(e) = self.chat.answer_callback(callback_id, toast.as_deref()).await {
                log::debug!("Could not answer callback {}: {}", callback_id, e);
            }
        }

        match result {
            Err(AppError::AlreadyDownloading(id)) => {
                log::debug!("Ignoring repeated selection for running download {}", id);
                Ok(())
            }
            Err(e) => self.show_error(owner, Some(message_id), &e, None).await,
            ok => ok,
        }
    }

    /// Live catalog session; an expired one also ends the download.
    async fn session(&self, owner: i64, download_id: i64) -> AppResult<Arc<Extraction>> {
        match self.sessions.get(owner, download_id).await {
            Some(extraction) => Ok(extraction),
            None => Err(self.session_lost(owner, download_id)?),
        }
    }

    /// Error for a selection without a session. A download whose rendition
    /// was already chosen is running and is left alone; otherwise the
    /// selection expired and the record is failed and released.
    fn session_lost(&self, owner: i64, download_id: i64) -> AppResult<AppError> {
        let conn = get_connection(&self.pool)?;
        let Some(record) = records::get_record(&conn, download_id)?.filter(|r| r.owner == owner) else {
            return Ok(AppError::SelectionExpired);
        };
        if record.status == DownloadStatus::Processing && record.kind.is_some() {
            return Ok(AppError::AlreadyDownloading(download_id));
        }
        log::info!("⌛ Selection for download {} (owner {}) expired", download_id, owner);
        if records::mark_failed(&conn, record.id, SESSION_EXPIRED)? {
            self.guard.release(owner, download_id)?;
        }
        Ok(AppError::SelectionExpired)
    }

    async fn select_type(&self, owner: i64, download_id: i64, kind: MediaKind, message_id: i32) -> AppResult<()> {
        let extraction = self.session(owner, download_id).await?;
        let text = format!(
            "{}\n\n{} Choose the {} quality:",
            source_summary(&extraction.source),
            kind.icon(),
            kind
        );
        let keyboard = quality_keyboard(download_id, kind, extraction.catalog.options(kind));
        self.chat.edit_text(owner, message_id, &text, Some(keyboard)).await
    }

    async fn back(&self, owner: i64, download_id: i64, message_id: i32) -> AppResult<()> {
        let extraction = self.session(owner, download_id).await?;
        let text = format!("{}\n\nWhat would you like to download?", source_summary(&extraction.source));
        let keyboard = type_keyboard(download_id, &extraction.catalog);
        self.chat.edit_text(owner, message_id, &text, Some(keyboard)).await
    }

    async fn select_quality(
        &self,
        owner: i64,
        download_id: i64,
        kind: MediaKind,
        quality: String,
        format_id: Option<String>,
        message_id: i32,
    ) -> AppResult<()> {
        let Some(extraction) = self.sessions.take(owner, download_id).await else {
            return Err(self.session_lost(owner, download_id)?);
        };

        let option = match &format_id {
            Some(id) => extraction.catalog.find(kind, id).cloned(),
            None if kind == MediaKind::Image => extraction.catalog.image.first().cloned(),
            None => None,
        };
        log::info!(
            "🎯 Download {} (owner {}): {} {} [{}]",
            download_id,
            owner,
            kind,
            quality,
            format_id.as_deref().unwrap_or("auto")
        );

        let job = Job {
            owner,
            download_id,
            message_id,
            source: extraction.source.clone(),
            kind,
            quality,
            format_id,
            direct_url: option.and_then(|o| o.direct_url),
        };
        let slot = self.guard.scope(owner, download_id);
        if let Err(e) = self.record_selection(&job) {
            self.fail_record(download_id, &e);
            return Err(e);
        }
        self.spawn_download(job, slot);
        Ok(())
    }

    /// Stores the chosen rendition and restarts the lease for the fetch.
    fn record_selection(&self, job: &Job) -> AppResult<()> {
        let conn = get_connection(&self.pool)?;
        records::set_selection(&conn, job.download_id, job.kind, &job.quality, job.format_id.as_deref())?;
        self.guard.renew(job.owner, job.download_id)?;
        Ok(())
    }

    fn spawn_download(&self, job: Job, slot: SlotGuard) {
        let flow = self.clone();
        self.downloads.spawn(async move {
            let (owner, download_id) = (job.owner, job.download_id);
            if let Err(e) = flow.run_download(job, slot).await {
                log::error!("Download {} (owner {}) could not report its outcome: {}", download_id, owner, e);
            }
        });
    }

    /// Renews the owner's lease every third of its length until the returned
    /// token is cancelled or the slot is gone.
    fn keep_lease(&self, owner: i64, download_id: i64) -> CancellationToken {
        let stop = CancellationToken::new();
        let cancelled = stop.clone();
        let guard = self.guard.clone();
        let period = guard.lease() / 3;
        tokio::spawn(async move {
            let mut ticks = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = ticks.tick() => match guard.renew(owner, download_id) {
                        Ok(true) => {}
                        Ok(false) => break,
                        Err(e) => log::warn!("Failed to renew lease of download {}: {}", download_id, e),
                    },
                }
            }
        });
        stop
    }

    /// Fetches and delivers `job`. The slot is released when this returns,
    /// after the record reached its terminal state.
    async fn run_download(&self, job: Job, _slot: SlotGuard) -> AppResult<()> {
        let _lease = self.keep_lease(job.owner, job.download_id).drop_guard();
        let Err(e) = self.download_and_deliver(&job).await else {
            return Ok(());
        };
        if !self.fail_record(job.download_id, &e) {
            // Already cancelled; the owner has seen the cancellation.
            return Ok(());
        }
        let keyboard = match &e {
            AppError::UploadTooLarge { .. } => None,
            _ => Some(retry_keyboard(&RetryRef::for_source(&job.source.url, job.download_id))),
        };
        self.show_error(job.owner, Some(job.message_id), &e, keyboard).await
    }

    async fn download_and_deliver(&self, job: &Job) -> AppResult<()> {
        let cancel = cancel_keyboard(job.download_id);
        self.chat
            .edit_text(
                job.owner,
                job.message_id,
                &format!("⏳ Starting download: {} {}", job.kind.icon(), job.quality),
                Some(cancel.clone()),
            )
            .await?;

        let surface = Arc::new(
            MessageStatus::new(Arc::clone(&self.chat), job.owner, job.message_id, Some(cancel))
                .watching(Arc::clone(&self.pool), job.download_id),
        );
        let request = FetchRequest {
            url: job.source.url.clone(),
            platform: job.source.platform,
            kind: job.kind,
            format_id: job.format_id.clone(),
            direct_url: job.direct_url.clone(),
        };
        let fetched = self.executor.run(job.owner, job.download_id, request, surface).await?;

        let workspace = fetched.workspace.clone();
        let outcome = self.deliver_fetched(job, fetched).await;
        if outcome.is_err() {
            if let Err(e) = workspace.purge() {
                log::warn!("Failed to purge download {} after a failure: {}", job.download_id, e);
            }
        }
        outcome
    }

    async fn deliver_fetched(&self, job: &Job, fetched: FetchedFile) -> AppResult<()> {
        if !self.still_processing(job.download_id)? {
            log::info!(
                "🗑️ Download {} (owner {}) was cancelled; discarding {}",
                job.download_id,
                job.owner,
                fetched.path.display()
            );
            if let Err(e) = fetched.workspace.purge() {
                log::warn!("Failed to purge cancelled download {}: {}", job.download_id, e);
            }
            return Ok(());
        }

        self.chat.edit_text(job.owner, job.message_id, "📤 Sending…", None).await?;
        let keyboard = (job.kind == MediaKind::Video).then(|| convert_audio_keyboard(job.download_id));
        let delivered = self
            .router
            .deliver(DeliveryRequest {
                chat: job.owner,
                file: fetched,
                kind: job.kind,
                source: job.source.clone(),
                keyboard,
            })
            .await?;

        let completed = {
            let conn = get_connection(&self.pool)?;
            records::mark_completed(&conn, job.download_id, &delivered.delivery_ref())?
        };
        if completed {
            self.guard.consume(job.owner)?;
        } else {
            log::warn!("Download {} delivered but no longer processing", job.download_id);
        }

        if let Err(e) = self.chat.delete_message(job.owner, job.message_id).await {
            log::debug!("Could not delete status message {}: {}", job.message_id, e);
        }
        log::info!(
            "✅ Download {} (owner {}) completed via {}",
            job.download_id,
            job.owner,
            delivered.route
        );
        Ok(())
    }

    async fn cancel(&self, owner: i64, download_id: i64, message_id: i32) -> AppResult<()> {
        let record = self.owned_record(owner, download_id)?;
        let cancelled = {
            let conn = get_connection(&self.pool)?;
            records::mark_failed(&conn, record.id, CANCELLED_BY_USER)?
        };
        self.guard.release(owner, download_id)?;
        self.sessions.remove(owner, download_id).await;

        let text = if cancelled {
            log::info!("🛑 Download {} cancelled by owner {}", download_id, owner);
            "❌ Download cancelled."
        } else {
            "This download has already finished."
        };
        self.chat.edit_text(owner, message_id, text, None).await
    }

    async fn retry(&self, owner: i64, retry: RetryRef, message_id: i32) -> AppResult<()> {
        let url = match &retry {
            RetryRef::Platform { .. } => retry.to_url().ok_or(AppError::SelectionExpired)?,
            RetryRef::Record(id) => self.owned_record(owner, *id)?.url,
        };
        log::info!("🔄 Owner {} retrying {}", owner, url);
        self.submit(owner, Url::parse(&url)?, Some(message_id)).await
    }

    /// Fresh audio download of a delivered video's source, without re-extracting.
    async fn convert_audio(&self, owner: i64, download_id: i64) -> AppResult<()> {
        let record = self.owned_record(owner, download_id)?;
        if record.status != DownloadStatus::Completed || record.kind != Some(MediaKind::Video) {
            return Err(AppError::SelectionExpired);
        }
        let url = Url::parse(&record.url)?;
        let Some((new_id, slot)) = self.admit(owner, &url, None).await? else {
            return Ok(());
        };

        let source = source_from_record(&record);
        let prepared = async {
            let message_id = self.chat.send_text(owner, "🎵 Converting to audio…", None).await?;
            {
                let conn = get_connection(&self.pool)?;
                records::mark_processing(&conn, new_id)?;
                records::set_source_metadata(&conn, new_id, &source.title, source.uploader.as_deref(), source.duration)?;
            }
            let job = Job {
                owner,
                download_id: new_id,
                message_id,
                source: source.clone(),
                kind: MediaKind::Audio,
                quality: AUTO_QUALITY.to_string(),
                format_id: None,
                direct_url: None,
            };
            self.record_selection(&job)?;
            Ok::<Job, AppError>(job)
        }
        .await;
        match prepared {
            Ok(job) => {
                self.spawn_download(job, slot);
                Ok(())
            }
            Err(e) => {
                self.fail_record(new_id, &e);
                Err(e)
            }
        }
    }

    /// Lists the owner's recent completed downloads.
    pub async fn history(&self, owner: i64) -> AppResult<()> {
        let entries = {
            let conn = get_connection(&self.pool)?;
            records::list_completed(&conn, owner, HISTORY_LIMIT)?
        };
        if entries.is_empty() {
            self.chat.send_text(owner, "📭 No downloads yet. Send me a link!", None).await?;
            return Ok(());
        }

        let mut text = String::from("📚 Recent downloads\n");
        for (i, record) in entries.iter().enumerate() {
            let icon = record.kind.map(MediaKind::icon).unwrap_or("📁");
            let title = truncate_chars(record.title.as_deref().unwrap_or("Unknown"), 50);
            let quality = record.quality.as_deref().unwrap_or("-");
            text.push_str(&format!(
                "\n{}. {} {} · {}\n{}{}",
                i + 1,
                icon,
                title,
                quality,
                RESTORE_PREFIX,
                record.id
            ));
        }
        self.chat.send_text(owner, &text, None).await?;
        Ok(())
    }

    /// Re-delivers a completed download from its stored reference.
    pub async fn restore(&self, owner: i64, download_id: i64) -> AppResult<()> {
        let record = match self.owned_record(owner, download_id) {
            Ok(record) if record.status == DownloadStatus::Completed => record,
            _ => {
                self.chat.send_text(owner, NOT_IN_HISTORY, None).await?;
                return Ok(());
            }
        };

        let caption = caption(&source_from_record(&record), record.file_size.unwrap_or(0));
        let sent = match (record.kind, record.file_id.as_deref(), record.relay_message_id) {
            (Some(kind), Some(file_id), _) => self.chat.send_cached(owner, kind, file_id, &caption).await?,
            (_, _, Some(relay_id)) => self.chat.copy_from_relay(owner, relay_id, &caption, None).await?,
            _ => {
                self.chat
                    .send_text(owner, "This file is no longer available. Send the link again.", None)
                    .await?;
                return Ok(());
            }
        };
        log::info!("♻️ Restored download {} for owner {} (message {})", download_id, owner, sent.message_id);
        Ok(())
    }

    fn owned_record(&self, owner: i64, download_id: i64) -> AppResult<DownloadRecord> {
        let conn = get_connection(&self.pool)?;
        records::get_record(&conn, download_id)?
            .filter(|r| r.owner == owner)
            .ok_or(AppError::SelectionExpired)
    }

    fn still_processing(&self, download_id: i64) -> AppResult<bool> {
        let conn = get_connection(&self.pool)?;
        Ok(records::get_status(&conn, download_id)? == Some(DownloadStatus::Processing))
    }

    /// Marks the record failed with the error; returns whether it was still open.
    fn fail_record(&self, download_id: i64, err: &AppError) -> bool {
        let reason = match err {
            AppError::ExtractionFailed { reason, .. } => reason.clone(),
            AppError::DownloadFailed(reason) => reason.clone(),
            other => other.to_string(),
        };
        let marked = get_connection(&self.pool)
            .map_err(AppError::from)
            .and_then(|conn| records::mark_failed(&conn, download_id, &reason).map_err(AppError::from));
        match marked {
            Ok(marked) => {
                if marked {
                    log::warn!("❌ Download {} failed: {}", download_id, reason);
                }
                marked
            }
            Err(e) => {
                log::error!("Failed to mark download {} failed: {}", download_id, e);
                false
            }
        }
    }

    async fn show(
        &self,
        owner: i64,
        reuse_message: Option<i32>,
        text: &str,
        keyboard: Option<InlineKeyboardMarkup>,
    ) -> AppResult<i32> {
        match reuse_message {
            Some(message_id) => {
                self.chat.edit_text(owner, message_id, text, keyboard).await?;
                Ok(message_id)
            }
            None => self.chat.send_text(owner, text, keyboard).await,
        }
    }

    async fn show_error(
        &self,
        owner: i64,
        reuse_message: Option<i32>,
        err: &AppError,
        keyboard: Option<InlineKeyboardMarkup>,
    ) -> AppResult<()> {
        self.show(owner, reuse_message, &err.user_message(), keyboard).await?;
        Ok(())
    }
}
