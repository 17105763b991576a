//! Runs the blocking fetch on the worker pool and bridges its progress back.
//!
//! One call of [`DownloadExecutor::run`] owns exactly one progress consumer;
//! the consumer is shut down and awaited before `run` returns on every path,
//! so a finished download can never edit a status message that has since been
//! reused.

use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;

use super::oracle::{ExtractionOracle, FetchRequest};
use super::progress::{ConsumerHandle, ProgressSlot, StatusSurface, ThrottledSink};
use super::workspace::Workspace;
use crate::core::config;
use crate::core::error::{AppError, AppResult};

/// A file produced by a successful fetch, still inside its workspace.
#[derive(Debug, Clone)]
pub struct FetchedFile {
    pub path: PathBuf,
    pub size: u64,
    pub workspace: Workspace,
}

#[derive(Clone)]
pub struct DownloadExecutor {
    oracle: Arc<dyn ExtractionOracle>,
    permits: Arc<Semaphore>,
    base_dir: PathBuf,
}

impl DownloadExecutor {
    pub fn new(oracle: Arc<dyn ExtractionOracle>, base_dir: impl Into<PathBuf>) -> Self {
        Self::with_capacity(oracle, base_dir, *config::MAX_CONCURRENT_DOWNLOADS)
    }

    /// `capacity` bounds how many blocking fetches run at once.
    pub fn with_capacity(oracle: Arc<dyn ExtractionOracle>, base_dir: impl Into<PathBuf>, capacity: usize) -> Self {
        Self {
            oracle,
            permits: Arc::new(Semaphore::new(capacity.max(1))),
            base_dir: base_dir.into(),
        }
    }

    pub fn oracle(&self) -> Arc<dyn ExtractionOracle> {
        Arc::clone(&self.oracle)
    }

    pub fn workspace(&self, owner: i64, download_id: i64) -> Workspace {
        Workspace::for_download(&self.base_dir, owner, download_id)
    }

    /// Fetches `request` into the download's workspace.
    ///
    /// No internal retry: a failure is reported once as `DownloadFailed` with a
    /// short reason, and the workspace is purged.
    pub async fn run(
        &self,
        owner: i64,
        download_id: i64,
        request: FetchRequest,
        surface: Arc<dyn StatusSurface>,
    ) -> AppResult<FetchedFile> {
        let workspace = self.workspace(owner, download_id);
        workspace.create()?;

        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| AppError::DownloadFailed("The download service is shutting down.".to_string()))?;

        log::info!(
            "⬇️ Download {} (owner {}): fetching {} as {} [{}]",
            download_id,
            owner,
            request.url,
            request.kind,
            request.selector()
        );

        let slot = ProgressSlot::new();
        let consumer = ConsumerHandle::spawn(slot.clone(), surface);

        let oracle = Arc::clone(&self.oracle);
        let dir = workspace.path().to_path_buf();
        let outcome = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let sink = ThrottledSink::new(slot);
            oracle.fetch(&request, &dir, &sink)
        })
        .await;

        consumer.shutdown().await;

        let failure = match outcome {
            Ok(Ok(path)) => match std::fs::metadata(&path) {
                Ok(meta) => {
                    log::info!(
                        "✅ Download {} (owner {}): {} ({} bytes)",
                        download_id,
                        owner,
                        path.display(),
                        meta.len()
                    );
                    return Ok(FetchedFile {
                        path,
                        size: meta.len(),
                        workspace,
                    });
                }
                Err(e) => {
                    log::error!("Download {}: produced file is unreadable: {}", download_id, e);
                    "The downloaded file could not be read.".to_string()
                }
            },
            Ok(Err(e)) => {
                log::error!("❌ Download {} (owner {}) failed: {}", download_id, owner, e);
                e.short_reason()
            }
            Err(e) => {
                log::error!("❌ Download {} worker did not finish: {}", download_id, e);
                "The download stopped unexpectedly.".to_string()
            }
        };

        if let Err(e) = workspace.purge() {
            log::warn!("Failed to purge workspace of download {}: {}", download_id, e);
        }
        Err(AppError::DownloadFailed(failure))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::catalog::MediaKind;
    use crate::download::oracle::{OracleError, RawMetadata};
    use crate::download::platform::Platform;
    use crate::download::progress::{ProgressSink, ProgressUpdate};
    use crate::download::ytdlp_errors::YtDlpErrorType;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Mutex as AsyncMutex;

    struct FileOracle {
        fail: bool,
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    impl FileOracle {
        fn new(fail: bool) -> Self {
            Self {
                fail,
                running: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }
    }

    impl ExtractionOracle for FileOracle {
        fn extract_metadata(&self, _url: &str) -> Result<RawMetadata, OracleError> {
            Ok(RawMetadata::default())
        }

        fn fetch(&self, _request: &FetchRequest, dest_dir: &Path, sink: &dyn ProgressSink) -> Result<PathBuf, OracleError> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            sink.report(50.0, "half");
            std::thread::sleep(Duration::from_millis(30));
            sink.report(100.0, "done");
            self.running.fetch_sub(1, Ordering::SeqCst);
            if self.fail {
                return Err(OracleError::Failed {
                    kind: YtDlpErrorType::VideoUnavailable,
                    reason: "ERROR: gone".into(),
                });
            }
            let path = dest_dir.join("clip.mp4");
            std::fs::write(&path, b"0123456789")?;
            Ok(path)
        }
    }

    #[derive(Default)]
    struct Recorder {
        seen: AsyncMutex<Vec<ProgressUpdate>>,
    }

    #[async_trait]
    impl StatusSurface for Recorder {
        async fn show(&self, update: &ProgressUpdate) {
            self.seen.lock().await.push(update.clone());
        }
    }

    fn request() -> FetchRequest {
        FetchRequest {
            url: "https://example.com/v".into(),
            platform: Platform::Generic,
            kind: MediaKind::Video,
            format_id: Some("22".into()),
            direct_url: None,
        }
    }

    #[tokio::test]
    async fn run_returns_file_and_stops_consumer() {
        let base = tempfile::tempdir().unwrap();
        let executor = DownloadExecutor::with_capacity(Arc::new(FileOracle::new(false)), base.path(), 2);
        let surface = Arc::new(Recorder::default());

        let fetched = executor.run(7, 1, request(), surface.clone()).await.unwrap();
        assert_eq!(fetched.size, 10);
        assert!(fetched.path.starts_with(base.path().join("7").join("1")));

        let rendered = surface.seen.lock().await.len();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(surface.seen.lock().await.len(), rendered);
    }

    #[tokio::test]
    async fn failure_is_short_and_purges_workspace() {
        let base = tempfile::tempdir().unwrap();
        let executor = DownloadExecutor::with_capacity(Arc::new(FileOracle::new(true)), base.path(), 2);

        let err = executor.run(7, 2, request(), Arc::new(Recorder::default())).await.unwrap_err();
        match err {
            AppError::DownloadFailed(reason) => assert!(reason.contains("unavailable"), "{}", reason),
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(!base.path().join("7").join("2").exists());
    }

    #[tokio::test]
    async fn worker_pool_is_bounded() {
        let base = tempfile::tempdir().unwrap();
        let oracle = Arc::new(FileOracle::new(false));
        let executor = DownloadExecutor::with_capacity(oracle.clone(), base.path(), 1);

        let a = executor.run(1, 1, request(), Arc::new(Recorder::default()));
        let b = executor.run(2, 2, request(), Arc::new(Recorder::default()));
        let (a, b) = tokio::join!(a, b);
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(oracle.peak.load(Ordering::SeqCst), 1);
    }
}
