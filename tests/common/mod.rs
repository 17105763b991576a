//! Common test utilities
//!
//! In-memory stand-ins for the extraction oracle, the chat and the relay,
//! plus a `TestEnv` that wires them into a real `DownloadFlow` backed by a
//! temporary SQLite database.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use teloxide::types::InlineKeyboardMarkup;

use mediadrop::core::error::{AppError, AppResult};
use mediadrop::download::oracle::{FetchRequest, OracleError, RawFormat, RawMetadata};
use mediadrop::download::ytdlp_errors::YtDlpErrorType;
use mediadrop::download::{CatalogSessions, DownloadExecutor, ExtractionOracle, MediaKind, ProgressSink};
use mediadrop::storage::{create_pool, ConcurrencyGuard, DbPool};
use mediadrop::telegram::keyboard::callback_payloads;
use mediadrop::telegram::DownloadFlow;
use mediadrop::upload::{ChatTransport, OutgoingMedia, RelayError, RelayTransport, SentMedia, UploadRouter};

pub const OWNER: i64 = 4242;
pub const YOUTUBE_URL: &str = "https://www.youtube.com/watch?v=dQw4w9WgXcQ";
pub const VIMEO_URL: &str = "https://vimeo.com/76979871";

pub fn video_format(id: &str, height: u32, filesize: f64) -> RawFormat {
    RawFormat {
        format_id: id.into(),
        ext: Some("mp4".into()),
        vcodec: Some("avc1.64001F".into()),
        acodec: Some("mp4a.40.2".into()),
        width: Some(height * 16 / 9),
        height: Some(height),
        filesize: Some(filesize),
        ..Default::default()
    }
}

pub fn audio_format(id: &str, abr: f64) -> RawFormat {
    RawFormat {
        format_id: id.into(),
        ext: Some("m4a".into()),
        vcodec: Some("none".into()),
        acodec: Some("mp4a.40.2".into()),
        abr: Some(abr),
        ..Default::default()
    }
}

/// A clip with 1080p and 720p video plus one 128 kbps audio rendition
pub fn sample_metadata() -> RawMetadata {
    RawMetadata {
        title: Some("Never Gonna Give You Up".into()),
        uploader: Some("Rick Astley".into()),
        duration: Some(213.0),
        view_count: Some(1_500_000_000),
        formats: vec![
            video_format("137", 1080, 40_000_000.0),
            video_format("22", 720, 20_000_000.0),
            audio_format("140", 128.0),
        ],
        ..Default::default()
    }
}

/// Scripted extraction oracle
///
/// Extraction results are consumed in order; once the script runs out every
/// call returns `sample_metadata()`. Fetches write a sparse file of
/// `fetch_size` bytes.
pub struct MockOracle {
    extractions: Mutex<VecDeque<Result<RawMetadata, YtDlpErrorType>>>,
    pub fetch_size: Mutex<u64>,
    pub fetch_delay: Mutex<Duration>,
    pub fetch_fails: Mutex<bool>,
    pub fetches: Mutex<Vec<FetchRequest>>,
    pub extract_calls: AtomicUsize,
}

impl Default for MockOracle {
    fn default() -> Self {
        Self {
            extractions: Mutex::new(VecDeque::new()),
            fetch_size: Mutex::new(1024 * 1024),
            fetch_delay: Mutex::new(Duration::ZERO),
            fetch_fails: Mutex::new(false),
            fetches: Mutex::new(Vec::new()),
            extract_calls: AtomicUsize::new(0),
        }
    }
}

impl MockOracle {
    pub fn push_extraction(&self, result: Result<RawMetadata, YtDlpErrorType>) {
        self.extractions.lock().unwrap().push_back(result);
    }

    pub fn set_fetch_size(&self, size: u64) {
        *self.fetch_size.lock().unwrap() = size;
    }

    pub fn set_fetch_delay(&self, delay: Duration) {
        *self.fetch_delay.lock().unwrap() = delay;
    }

    pub fn set_fetch_fails(&self, fails: bool) {
        *self.fetch_fails.lock().unwrap() = fails;
    }

    pub fn fetched(&self) -> Vec<FetchRequest> {
        self.fetches.lock().unwrap().clone()
    }
}

impl ExtractionOracle for MockOracle {
    fn extract_metadata(&self, _url: &str) -> Result<RawMetadata, OracleError> {
        self.extract_calls.fetch_add(1, Ordering::SeqCst);
        match self.extractions.lock().unwrap().pop_front() {
            Some(Ok(raw)) => Ok(raw),
            Some(Err(kind)) => Err(OracleError::Failed {
                kind,
                reason: "ERROR: scripted failure".into(),
            }),
            None => Ok(sample_metadata()),
        }
    }

    fn fetch(&self, request: &FetchRequest, dest_dir: &Path, sink: &dyn ProgressSink) -> Result<PathBuf, OracleError> {
        self.fetches.lock().unwrap().push(request.clone());
        sink.report(10.0, "downloading");
        let delay = *self.fetch_delay.lock().unwrap();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        if *self.fetch_fails.lock().unwrap() {
            return Err(OracleError::Failed {
                kind: YtDlpErrorType::VideoUnavailable,
                reason: "ERROR: Video unavailable".into(),
            });
        }
        let path = dest_dir.join(format!("media.{}", request.expected_ext()));
        let file = std::fs::File::create(&path)?;
        file.set_len(*self.fetch_size.lock().unwrap())?;
        sink.report(100.0, "done");
        Ok(path)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    Text {
        chat: i64,
        message_id: i32,
        text: String,
        keyboard: Option<InlineKeyboardMarkup>,
    },
    Edit {
        chat: i64,
        message_id: i32,
        text: String,
        keyboard: Option<InlineKeyboardMarkup>,
    },
    Delete {
        chat: i64,
        message_id: i32,
    },
    Answer {
        callback_id: String,
        text: Option<String>,
    },
    Media {
        chat: i64,
        message_id: i32,
        kind: MediaKind,
        size: u64,
        caption: String,
        thumbnail: bool,
        keyboard: Option<InlineKeyboardMarkup>,
    },
    Cached {
        chat: i64,
        kind: MediaKind,
        file_id: String,
    },
    Copy {
        chat: i64,
        relay_message_id: i32,
        caption: String,
    },
}

/// Chat transport that records every call and hands out increasing ids
///
/// Can be told to fail edits whose text contains a marker, and to refuse
/// media sent with a thumbnail.
pub struct MockChat {
    next_id: AtomicI32,
    events: Mutex<Vec<ChatEvent>>,
    failing_edit: Mutex<Option<String>>,
    reject_thumbnails: AtomicBool,
    pub thumbnail_rejections: AtomicUsize,
}

impl Default for MockChat {
    fn default() -> Self {
        Self {
            next_id: AtomicI32::new(100),
            events: Mutex::new(Vec::new()),
            failing_edit: Mutex::new(None),
            reject_thumbnails: AtomicBool::new(false),
            thumbnail_rejections: AtomicUsize::new(0),
        }
    }
}

impl MockChat {
    pub fn fail_edits_containing(&self, marker: &str) {
        *self.failing_edit.lock().unwrap() = Some(marker.to_string());
    }

    pub fn reject_thumbnails(&self) {
        self.reject_thumbnails.store(true, Ordering::SeqCst);
    }

    /// Text of every callback answer, in order
    pub fn answers(&self) -> Vec<Option<String>> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ChatEvent::Answer { text, .. } => Some(text),
                _ => None,
            })
            .collect()
    }

    fn next(&self) -> i32 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn push(&self, event: ChatEvent) {
        self.events.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<ChatEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }

    /// Text and keyboard of the most recent send or edit
    pub fn last_screen(&self) -> Option<(String, Option<InlineKeyboardMarkup>)> {
        self.events().into_iter().rev().find_map(|e| match e {
            ChatEvent::Text { text, keyboard, .. } | ChatEvent::Edit { text, keyboard, .. } => Some((text, keyboard)),
            _ => None,
        })
    }

    pub fn last_text(&self) -> String {
        self.last_screen().map(|(text, _)| text).unwrap_or_default()
    }

    /// Callback payloads of the most recent keyboard shown
    pub fn last_payloads(&self) -> Vec<String> {
        self.last_screen()
            .and_then(|(_, keyboard)| keyboard)
            .map(|kb| callback_payloads(&kb))
            .unwrap_or_default()
    }

    /// Id of the first message sent, i.e. the selection message
    pub fn first_message_id(&self) -> Option<i32> {
        self.events().into_iter().find_map(|e| match e {
            ChatEvent::Text { message_id, .. } => Some(message_id),
            _ => None,
        })
    }

    pub fn media(&self) -> Vec<ChatEvent> {
        self.events()
            .into_iter()
            .filter(|e| matches!(e, ChatEvent::Media { .. } | ChatEvent::Copy { .. } | ChatEvent::Cached { .. }))
            .collect()
    }
}

#[async_trait]
impl ChatTransport for MockChat {
    async fn send_text(&self, chat: i64, text: &str, keyboard: Option<InlineKeyboardMarkup>) -> AppResult<i32> {
        let message_id = self.next();
        self.push(ChatEvent::Text {
            chat,
            message_id,
            text: text.to_string(),
            keyboard,
        });
        Ok(message_id)
    }

    async fn edit_text(
        &self,
        chat: i64,
        message_id: i32,
        text: &str,
        keyboard: Option<InlineKeyboardMarkup>,
    ) -> AppResult<()> {
        let failing = self.failing_edit.lock().unwrap().clone();
        if failing.is_some_and(|marker| text.contains(&marker)) {
            return Err(AppError::Validation("Bad Request: message to edit not found".into()));
        }
        self.push(ChatEvent::Edit {
            chat,
            message_id,
            text: text.to_string(),
            keyboard,
        });
        Ok(())
    }

    async fn delete_message(&self, chat: i64, message_id: i32) -> AppResult<()> {
        self.push(ChatEvent::Delete { chat, message_id });
        Ok(())
    }

    async fn answer_callback(&self, callback_id: &str, text: Option<&str>) -> AppResult<()> {
        self.push(ChatEvent::Answer {
            callback_id: callback_id.to_string(),
            text: text.map(str::to_string),
        });
        Ok(())
    }

    async fn send_media(&self, chat: i64, media: &OutgoingMedia) -> AppResult<SentMedia> {
        if media.thumbnail.is_some() && self.reject_thumbnails.load(Ordering::SeqCst) {
            self.thumbnail_rejections.fetch_add(1, Ordering::SeqCst);
            return Err(AppError::Validation("Bad Request: wrong thumbnail".into()));
        }
        let message_id = self.next();
        let size = std::fs::metadata(&media.path)?.len();
        self.push(ChatEvent::Media {
            chat,
            message_id,
            kind: media.kind,
            size,
            caption: media.caption.clone(),
            thumbnail: media.thumbnail.is_some(),
            keyboard: media.keyboard.clone(),
        });
        Ok(SentMedia {
            message_id,
            file_id: Some(format!("file-{}", message_id)),
        })
    }

    async fn send_cached(&self, chat: i64, kind: MediaKind, file_id: &str, _caption: &str) -> AppResult<SentMedia> {
        let message_id = self.next();
        self.push(ChatEvent::Cached {
            chat,
            kind,
            file_id: file_id.to_string(),
        });
        Ok(SentMedia {
            message_id,
            file_id: Some(file_id.to_string()),
        })
    }

    async fn copy_from_relay(
        &self,
        chat: i64,
        relay_message_id: i32,
        caption: &str,
        _keyboard: Option<InlineKeyboardMarkup>,
    ) -> AppResult<SentMedia> {
        let message_id = self.next();
        self.push(ChatEvent::Copy {
            chat,
            relay_message_id,
            caption: caption.to_string(),
        });
        Ok(SentMedia {
            message_id,
            file_id: None,
        })
    }
}

/// Relay that accepts every upload and numbers channel posts from 900
#[derive(Default)]
pub struct MockRelay {
    pub uploads: Mutex<Vec<(PathBuf, u64)>>,
}

#[async_trait]
impl RelayTransport for MockRelay {
    async fn upload(&self, path: &Path, _caption: &str) -> Result<i32, RelayError> {
        let size = std::fs::metadata(path)?.len();
        let mut uploads = self.uploads.lock().unwrap();
        uploads.push((path.to_path_buf(), size));
        Ok(900 + uploads.len() as i32)
    }
}

/// A `DownloadFlow` over mocks and a throwaway database
pub struct TestEnv {
    pub dir: tempfile::TempDir,
    pub pool: Arc<DbPool>,
    pub guard: ConcurrencyGuard,
    pub oracle: Arc<MockOracle>,
    pub chat: Arc<MockChat>,
    pub relay: Arc<MockRelay>,
    pub flow: DownloadFlow,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_quota(10)
    }

    pub fn with_quota(daily_limit: i64) -> Self {
        Self::build(daily_limit, CatalogSessions::default())
    }

    pub fn with_session_ttl(ttl: Duration) -> Self {
        Self::build(10, CatalogSessions::new(ttl))
    }

    fn build(daily_limit: i64, sessions: CatalogSessions) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let pool = Arc::new(create_pool(dir.path().join("test.sqlite").to_str().unwrap()).unwrap());
        let guard = ConcurrencyGuard::with_limits(Arc::clone(&pool), daily_limit, 30 * 60);
        let oracle = Arc::new(MockOracle::default());
        let chat = Arc::new(MockChat::default());
        let relay = Arc::new(MockRelay::default());

        let executor = DownloadExecutor::with_capacity(oracle.clone(), dir.path().join("downloads"), 2);
        let router = UploadRouter::new(chat.clone(), Some(relay.clone() as Arc<dyn RelayTransport>));
        let flow = DownloadFlow::new(
            Arc::clone(&pool),
            guard.clone(),
            sessions,
            executor,
            router,
            chat.clone(),
        );

        Self {
            dir,
            pool,
            guard,
            oracle,
            chat,
            relay,
            flow,
        }
    }

    pub fn downloads_dir(&self) -> PathBuf {
        self.dir.path().join("downloads")
    }

    /// Presses the button whose payload starts with `prefix` on the last
    /// keyboard, then waits for any download it started.
    pub async fn press(&self, prefix: &str) -> String {
        let payload = self
            .chat
            .last_payloads()
            .into_iter()
            .find(|p| p.starts_with(prefix))
            .unwrap_or_else(|| panic!("no button starting with {:?} in {:?}", prefix, self.chat.last_payloads()));
        let message_id = self.chat.first_message_id().unwrap();
        self.flow
            .handle_callback(OWNER, "cb-1", message_id, &payload)
            .await
            .unwrap();
        self.flow.wait_idle().await;
        payload
    }
}
