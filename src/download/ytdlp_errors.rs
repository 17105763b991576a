/// Classification of yt-dlp failures
///
/// Maps stderr text to a coarse error type, which decides whether the next
/// fallback strategy is worth trying and which short reason the owner sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum YtDlpErrorType {
    /// Video is private, removed or region-blocked
    VideoUnavailable,
    /// The platform asked us to prove we're not a bot
    BotDetection,
    /// The requested format or client is not available
    FormatUnavailable,
    /// yt-dlp has no extractor for this URL
    UnsupportedUrl,
    /// Timeouts, connection resets, DNS
    NetworkError,
    Unknown,
}

/// Analyzes yt-dlp stderr and determines the error type
pub fn analyze_ytdlp_error(stderr: &str) -> YtDlpErrorType {
    let stderr_lower = stderr.to_lowercase();

    if stderr_lower.contains("private video")
        || stderr_lower.contains("video unavailable")
        || stderr_lower.contains("this video is not available")
        || stderr_lower.contains("video is private")
        || stderr_lower.contains("video has been removed")
        || stderr_lower.contains("this video does not exist")
        || stderr_lower.contains("not available in your country")
    {
        return YtDlpErrorType::VideoUnavailable;
    }

    if stderr_lower.contains("sign in to confirm you're not a bot")
        || stderr_lower.contains("bot detection")
        || stderr_lower.contains("http error 403")
        || stderr_lower.contains("signature extraction failed")
    {
        return YtDlpErrorType::BotDetection;
    }

    if stderr_lower.contains("requested format is not available") || stderr_lower.contains("no video formats found") {
        return YtDlpErrorType::FormatUnavailable;
    }

    if stderr_lower.contains("unsupported url") {
        return YtDlpErrorType::UnsupportedUrl;
    }

    if stderr_lower.contains("timed out")
        || stderr_lower.contains("timeout")
        || stderr_lower.contains("connection")
        || stderr_lower.contains("network")
        || stderr_lower.contains("dns")
    {
        return YtDlpErrorType::NetworkError;
    }

    YtDlpErrorType::Unknown
}

impl YtDlpErrorType {
    /// Short human-readable reason shown to the owner
    pub fn short_reason(self) -> &'static str {
        match self {
            YtDlpErrorType::VideoUnavailable => "The video is unavailable: it may be private, removed or region-locked.",
            YtDlpErrorType::BotDetection => "The platform blocked the request. Try again later.",
            YtDlpErrorType::FormatUnavailable => "The selected quality is not available anymore.",
            YtDlpErrorType::UnsupportedUrl => "This link is not supported.",
            YtDlpErrorType::NetworkError => "Network problem. Try again in a minute.",
            YtDlpErrorType::Unknown => "Could not process this link. Check that it is correct.",
        }
    }

    /// Whether another strategy may succeed where this one failed
    pub fn worth_fallback(self) -> bool {
        !matches!(self, YtDlpErrorType::VideoUnavailable | YtDlpErrorType::UnsupportedUrl)
    }
}
