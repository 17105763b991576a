//! Extraction/fetch oracle: the seam between the download flow and yt-dlp.
//!
//! Both operations are blocking and must only be called from the worker
//! pool (`tokio::task::spawn_blocking`).

use serde::Deserialize;
use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;

use super::catalog::MediaKind;
use super::platform::Platform;
use super::progress::{parse_progress, ProgressSink};
use super::strategy::{run_chain, Strategy, StrategyError};
use super::workspace::find_output;
use super::ytdlp_errors::{analyze_ytdlp_error, YtDlpErrorType};
use crate::core::config;

/// Raw yt-dlp `--dump-single-json` output, reduced to what classification needs.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawMetadata {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub uploader: Option<String>,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub view_count: Option<u64>,
    #[serde(default)]
    pub thumbnail: Option<String>,
    #[serde(default)]
    pub extractor_key: Option<String>,
    /// Direct media URL for single-file sources
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub ext: Option<String>,
    #[serde(default)]
    pub vcodec: Option<String>,
    #[serde(default)]
    pub acodec: Option<String>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub formats: Vec<RawFormat>,
}

/// One rendition as reported by yt-dlp
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawFormat {
    pub format_id: String,
    #[serde(default)]
    pub ext: Option<String>,
    #[serde(default)]
    pub vcodec: Option<String>,
    #[serde(default)]
    pub acodec: Option<String>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub abr: Option<f64>,
    #[serde(default)]
    pub tbr: Option<f64>,
    #[serde(default)]
    pub filesize: Option<f64>,
    #[serde(default)]
    pub filesize_approx: Option<f64>,
    #[serde(default)]
    pub format_note: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

/// What to fetch and how
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: String,
    pub platform: Platform,
    pub kind: MediaKind,
    /// `None` selects the best available rendition for `kind`
    pub format_id: Option<String>,
    /// Direct asset URL for still images
    pub direct_url: Option<String>,
}

impl FetchRequest {
    /// yt-dlp format selector for this request
    pub fn selector(&self) -> String {
        let explicit = self.format_id.as_deref().filter(|id| !matches!(*id, "best" | "bestaudio"));
        match (self.kind, explicit) {
            (MediaKind::Audio, Some(id)) => format!("{}/bestaudio/best", id),
            (MediaKind::Audio, None) => "bestaudio/best".to_string(),
            // Merging separate streams breaks on Instagram
            (MediaKind::Video, _) if self.platform == Platform::Instagram => "best".to_string(),
            (MediaKind::Video, Some(id)) => format!("{}+bestaudio/{}/best", id, id),
            (MediaKind::Video, None) => "bestvideo+bestaudio/best".to_string(),
            (MediaKind::Image, _) => "best".to_string(),
        }
    }

    /// Extension the produced file is expected to have
    pub fn expected_ext(&self) -> &'static str {
        match self.kind {
            MediaKind::Video => "mp4",
            MediaKind::Audio => "m4a",
            MediaKind::Image => "jpg",
        }
    }
}

#[derive(Debug, Error)]
pub enum OracleError {
    #[error("{reason}")]
    Failed { kind: YtDlpErrorType, reason: String },

    #[error("timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("invalid metadata: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("no output file was produced")]
    NoOutput,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl OracleError {
    fn from_stderr(stderr: &str) -> Self {
        let kind = analyze_ytdlp_error(stderr);
        let last_line = stderr
            .lines()
            .rev()
            .find(|l| l.contains("ERROR"))
            .unwrap_or("yt-dlp exited with an error");
        OracleError::Failed {
            kind,
            reason: last_line.trim().to_string(),
        }
    }

    /// Short reason suitable for the owner
    pub fn short_reason(&self) -> String {
        match self {
            OracleError::Failed { kind, .. } => kind.short_reason().to_string(),
            OracleError::Timeout(_) => "The download took too long and was stopped.".to_string(),
            OracleError::Metadata(_) | OracleError::NoOutput => {
                YtDlpErrorType::Unknown.short_reason().to_string()
            }
            OracleError::Io(_) | OracleError::Http(_) => YtDlpErrorType::NetworkError.short_reason().to_string(),
        }
    }
}

impl StrategyError for OracleError {
    fn worth_fallback(&self) -> bool {
        match self {
            OracleError::Failed { kind, .. } => kind.worth_fallback(),
            OracleError::Timeout(_) | OracleError::NoOutput => true,
            OracleError::Metadata(_) | OracleError::Io(_) | OracleError::Http(_) => false,
        }
    }
}

/// Resolves URLs into metadata and media files.
pub trait ExtractionOracle: Send + Sync {
    /// Blocking metadata extraction
    fn extract_metadata(&self, url: &str) -> Result<RawMetadata, OracleError>;

    /// Blocking fetch into `dest_dir`; returns the produced file
    fn fetch(&self, request: &FetchRequest, dest_dir: &Path, sink: &dyn ProgressSink) -> Result<PathBuf, OracleError>;
}

/// yt-dlp subprocess oracle
pub struct YtDlpOracle {
    bin: String,
    extract_strategies: Vec<Strategy>,
    fetch_strategies: Vec<Strategy>,
}

impl Default for YtDlpOracle {
    fn default() -> Self {
        Self::new(config::YTDL_BIN.as_str())
    }
}

impl YtDlpOracle {
    pub fn new(bin: &str) -> Self {
        Self {
            bin: bin.to_string(),
            extract_strategies: vec![
                Strategy::new("default", &[]),
                Strategy::new("ios-client", &["--extractor-args", "youtube:player_client=ios"]),
            ],
            fetch_strategies: vec![Strategy::new("selected", &[]), Strategy::new("simplified", &["-f", "best"])],
        }
    }

    fn extract_once(&self, url: &str, strategy: &Strategy) -> Result<RawMetadata, OracleError> {
        let mut args: Vec<String> = vec![
            "--dump-single-json".into(),
            "--no-playlist".into(),
            "--no-warnings".into(),
            "--skip-download".into(),
            "--socket-timeout".into(),
            "30".into(),
        ];
        args.extend(strategy.extra_args.iter().cloned());
        args.push(url.to_string());

        let (stdout, _) = run_ytdlp(&self.bin, &args, config::download::extract_timeout(), |_| {})?;
        let metadata: RawMetadata = serde_json::from_str(&stdout)?;
        Ok(metadata)
    }

    fn fetch_once(
        &self,
        request: &FetchRequest,
        dest_dir: &Path,
        sink: &dyn ProgressSink,
        strategy: &Strategy,
    ) -> Result<PathBuf, OracleError> {
        let template = dest_dir.join("%(title).100s.%(ext)s");
        let mut args: Vec<String> = vec![
            "-o".into(),
            template.to_string_lossy().into_owned(),
            "--newline".into(),
            "--force-overwrites".into(),
            "--no-playlist".into(),
            "--restrict-filenames".into(),
            "--socket-timeout".into(),
            "30".into(),
            "--retries".into(),
            "5".into(),
            "--fragment-retries".into(),
            "5".into(),
        ];
        match request.kind {
            MediaKind::Audio => {
                args.extend(["-x", "--audio-format", "m4a"].map(String::from));
            }
            MediaKind::Video if request.platform != Platform::Instagram => {
                args.extend(["--merge-output-format", "mp4"].map(String::from));
            }
            _ => {}
        }
        // A strategy that brings its own selector replaces the requested one.
        if !strategy.extra_args.iter().any(|a| a == "-f") {
            args.push("-f".into());
            args.push(request.selector());
        }
        args.extend(strategy.extra_args.iter().cloned());
        args.push(request.url.clone());

        run_ytdlp(&self.bin, &args, config::download::fetch_timeout(), |line| {
            if let Some(progress) = parse_progress(line) {
                sink.report(progress.percent as f32, &progress.render());
            }
        })?;

        find_output(dest_dir, request.expected_ext()).ok_or(OracleError::NoOutput)
    }
}

impl ExtractionOracle for YtDlpOracle {
    fn extract_metadata(&self, url: &str) -> Result<RawMetadata, OracleError> {
        run_chain("extract", &self.extract_strategies, |s| self.extract_once(url, s))
            .map_err(|failure| failure.last.unwrap_or(OracleError::NoOutput))
    }

    fn fetch(&self, request: &FetchRequest, dest_dir: &Path, sink: &dyn ProgressSink) -> Result<PathBuf, OracleError> {
        if request.kind == MediaKind::Image {
            if let Some(image_url) = &request.direct_url {
                return fetch_image(image_url, dest_dir, sink);
            }
        }
        run_chain("fetch", &self.fetch_strategies, |s| self.fetch_once(request, dest_dir, sink, s))
            .map_err(|failure| failure.last.unwrap_or(OracleError::NoOutput))
    }
}

/// Runs yt-dlp, feeding every stdout line to `on_line`; kills it on timeout.
///
/// Returns collected stdout and stderr on success.
fn run_ytdlp<F>(bin: &str, args: &[String], timeout: Duration, on_line: F) -> Result<(String, String), OracleError>
where
    F: Fn(&str) + Sync,
{
    log::debug!("Running {} {}", bin, args.join(" "));
    let mut child = Command::new(bin)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let stdout_buf = Mutex::new(String::new());
    let stderr_lines = Mutex::new(VecDeque::<String>::new());

    let status = std::thread::scope(|scope| {
        if let Some(stream) = stdout {
            let stdout_buf = &stdout_buf;
            let on_line = &on_line;
            scope.spawn(move || {
                for line in BufReader::new(stream).lines().map_while(Result::ok) {
                    on_line(&line);
                    if let Ok(mut buf) = stdout_buf.lock() {
                        buf.push_str(&line);
                        buf.push('\n');
                    }
                }
            });
        }
        if let Some(mut stream) = stderr {
            let stderr_lines = &stderr_lines;
            scope.spawn(move || {
                let mut raw = String::new();
                let _ = stream.read_to_string(&mut raw);
                if let Ok(mut lines) = stderr_lines.lock() {
                    for line in raw.lines() {
                        log::debug!("yt-dlp stderr: {}", line);
                        lines.push_back(line.to_string());
                        if lines.len() > 200 {
                            lines.pop_front();
                        }
                    }
                }
            });
        }

        let deadline = Instant::now() + timeout;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => break Ok(status),
                Ok(None) if Instant::now() >= deadline => {
                    log::error!("yt-dlp process timed out after {}s, killing", timeout.as_secs());
                    let _ = child.kill();
                    let _ = child.wait();
                    break Err(OracleError::Timeout(timeout));
                }
                Ok(None) => std::thread::sleep(Duration::from_millis(config::download::POLL_INTERVAL_MS)),
                Err(e) => break Err(OracleError::Io(e)),
            }
        }
    })?;

    let stdout_text = stdout_buf.into_inner().unwrap_or_default();
    let stderr_text = stderr_lines
        .into_inner()
        .map(|mut lines| lines.make_contiguous().join("\n"))
        .unwrap_or_default();

    if status.success() {
        Ok((stdout_text, stderr_text))
    } else {
        Err(OracleError::from_stderr(&stderr_text))
    }
}

/// Streams a still image to `dest_dir`, reporting progress from content-length.
fn fetch_image(image_url: &str, dest_dir: &Path, sink: &dyn ProgressSink) -> Result<PathBuf, OracleError> {
    let ext = image_extension(image_url);
    let client = reqwest::blocking::Client::builder()
        .timeout(config::download::fetch_timeout())
        .build()?;
    let mut response = client.get(image_url).send()?.error_for_status()?;
    let total = response.content_length();

    let path = dest_dir.join(format!("image.{}", ext));
    let mut file = std::fs::File::create(&path)?;
    let mut written: u64 = 0;
    let mut chunk = [0u8; 64 * 1024];
    loop {
        let n = response.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        std::io::Write::write_all(&mut file, &chunk[..n])?;
        written += n as u64;
        if let Some(total) = total.filter(|t| *t > 0) {
            let percent = (written as f64 / total as f64 * 100.0).min(100.0) as f32;
            sink.report(percent, &format!("Downloading image… {:.0}%", percent));
        }
    }
    sink.report(100.0, "Downloading image… 100%");
    log::info!("🖼️ Image saved to {} ({} bytes)", path.display(), written);
    Ok(path)
}

fn image_extension(image_url: &str) -> &'static str {
    let path = image_url.split(['?', '#']).next().unwrap_or_default().to_lowercase();
    ["png", "webp", "gif", "jpeg"]
        .into_iter()
        .find(|ext| path.ends_with(&format!(".{}", ext)))
        .unwrap_or("jpg")
}
