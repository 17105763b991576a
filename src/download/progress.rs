//! Progress bridge between the blocking worker and the status message.
//!
//! The worker writes into a [`ProgressSlot`] through a [`ThrottledSink`]; a
//! consumer task owned by the executor takes the latest value and renders it
//! on a [`StatusSurface`]. The slot holds one value: a write overwrites any
//! unread one, so the consumer never renders a backlog.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::config;

/// Progress callback invoked from worker-thread context only.
pub trait ProgressSink: Send + Sync {
    fn report(&self, percent: f32, text: &str);
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub percent: f32,
    pub text: String,
}

/// Something that can display the current progress, e.g. an edited chat message.
#[async_trait]
pub trait StatusSurface: Send + Sync {
    async fn show(&self, update: &ProgressUpdate);
}

#[derive(Default)]
struct SlotState {
    pending: Option<ProgressUpdate>,
    high_water: f32,
}

/// Single-slot, latest-value-wins handoff.
#[derive(Clone, Default)]
pub struct ProgressSlot {
    state: Arc<Mutex<SlotState>>,
    notify: Arc<Notify>,
}

impl ProgressSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrites the unread value. Values below the last accepted percentage
    /// are dropped so the consumer never goes backwards.
    pub fn put(&self, update: ProgressUpdate) {
        {
            let mut state = match self.state.lock() {
                Ok(state) => state,
                Err(poisoned) => poisoned.into_inner(),
            };
            if update.percent < state.high_water {
                log::trace!("Dropping out-of-order progress {} < {}", update.percent, state.high_water);
                return;
            }
            state.high_water = update.percent;
            state.pending = Some(update);
        }
        self.notify.notify_one();
    }

    pub fn take(&self) -> Option<ProgressUpdate> {
        match self.state.lock() {
            Ok(mut state) => state.pending.take(),
            Err(poisoned) => poisoned.into_inner().pending.take(),
        }
    }

    /// Resolves once a value has been written since the last wakeup.
    pub async fn changed(&self) {
        self.notify.notified().await;
    }
}

/// Worker-side sink: at most one write per interval, except the final 100%.
pub struct ThrottledSink {
    slot: ProgressSlot,
    min_interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl ThrottledSink {
    pub fn new(slot: ProgressSlot) -> Self {
        Self::with_interval(slot, config::progress::min_interval())
    }

    pub fn with_interval(slot: ProgressSlot, min_interval: Duration) -> Self {
        Self {
            slot,
            min_interval,
            last: Mutex::new(None),
        }
    }
}

impl ProgressSink for ThrottledSink {
    fn report(&self, percent: f32, text: &str) {
        let percent = percent.clamp(0.0, 100.0);
        let now = Instant::now();
        {
            let Ok(mut last) = self.last.lock() else {
                return;
            };
            let due = last.map_or(true, |t| now.duration_since(t) >= self.min_interval);
            if !due && percent < 100.0 {
                return;
            }
            *last = Some(now);
        }
        self.slot.put(ProgressUpdate {
            percent,
            text: text.to_string(),
        });
    }
}

/// Consumer task whose lifetime is bound to one executor call.
///
/// [`ConsumerHandle::shutdown`] cancels and awaits the task; dropping the
/// handle without shutdown still cancels and aborts it.
pub struct ConsumerHandle {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl ConsumerHandle {
    pub fn spawn(slot: ProgressSlot, surface: Arc<dyn StatusSurface>) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = slot.changed() => {}
                }
                let Some(update) = slot.take() else {
                    continue;
                };
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = surface.show(&update) => {}
                }
            }
        });
        Self {
            cancel,
            handle: Some(handle),
        }
    }

    /// Stops the consumer and waits until it can no longer touch the surface.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    log::error!("Progress consumer panicked: {}", e);
                }
            }
        }
    }
}

impl Drop for ConsumerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// Parsed yt-dlp progress line
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressInfo {
    pub percent: u8,
    pub speed_bytes: Option<u64>,
    pub eta_seconds: Option<u64>,
    pub total_size: Option<u64>,
}

impl ProgressInfo {
    /// Status text: percentage, bar, then speed and ETA when known.
    pub fn render(&self) -> String {
        let mut text = format!(
            "📥 Downloading… {}%\n{}",
            self.percent,
            render_bar(self.percent as f32)
        );
        let mut details = Vec::new();
        if let Some(speed) = self.speed_bytes {
            details.push(format!("⚡ {}/s", crate::core::utils::format_file_size(speed)));
        }
        if let Some(eta) = self.eta_seconds {
            details.push(format!("⏱ {}", crate::core::utils::format_duration(eta)));
        }
        if !details.is_empty() {
            text.push('\n');
            text.push_str(&details.join(" · "));
        }
        text
    }
}

/// Ten-cell bar of `▰`/`▱`
pub fn render_bar(percent: f32) -> String {
    let width = config::progress::BAR_WIDTH;
    let filled = ((percent.clamp(0.0, 100.0) / 100.0) * width as f32).round() as usize;
    format!("{}{}", "▰".repeat(filled), "▱".repeat(width - filled))
}

/// Parses progress from a yt-dlp output line
/// Example: "[download]  45.2% of 10.00MiB at 500.00KiB/s ETA 00:10"
pub fn parse_progress(line: &str) -> Option<ProgressInfo> {
    if !line.contains("[download]") || !line.contains('%') {
        return None;
    }

    let mut percent = None;
    let mut speed_bytes = None;
    let mut eta_seconds = None;
    let mut total_size = None;

    let parts: Vec<&str> = line.split_whitespace().collect();
    for (i, part) in parts.iter().enumerate() {
        let next = parts.get(i + 1).copied();
        if part.ends_with('%') {
            if let Ok(p) = part.trim_end_matches('%').parse::<f32>() {
                // Clamp so garbage never jumps straight to 100%.
                percent = Some(p.clamp(0.0, 100.0) as u8);
            }
        }
        match (*part, next) {
            ("of", Some(size)) => total_size = parse_size(size.trim_start_matches('~')),
            ("at", Some(speed)) => speed_bytes = parse_size(speed),
            ("ETA", Some(eta)) => eta_seconds = parse_eta(eta),
            _ => {}
        }
    }

    percent.map(|percent| ProgressInfo {
        percent,
        speed_bytes,
        eta_seconds,
        total_size,
    })
}

/// Parses sizes like "10.00MiB", "500.00KiB/s"
fn parse_size(size_str: &str) -> Option<u64> {
    let size_str = size_str.trim_end_matches("/s");
    let (number, multiplier) = if let Some(n) = size_str.strip_suffix("GiB") {
        (n, 1024.0 * 1024.0 * 1024.0)
    } else if let Some(n) = size_str.strip_suffix("MiB") {
        (n, 1024.0 * 1024.0)
    } else if let Some(n) = size_str.strip_suffix("KiB") {
        (n, 1024.0)
    } else if let Some(n) = size_str.strip_suffix('B') {
        (n, 1.0)
    } else {
        return None;
    };
    number.parse::<f64>().ok().map(|v| (v * multiplier) as u64)
}

/// Parses ETA like "00:10", "1:23" or "1:02:03"
fn parse_eta(eta_str: &str) -> Option<u64> {
    eta_str
        .split(':')
        .try_fold(0u64, |acc, part| part.parse::<u64>().ok().map(|v| acc * 60 + v))
        .filter(|_| eta_str.contains(':'))
}
