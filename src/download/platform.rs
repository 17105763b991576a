//! Source platform detection and compact retry references.

use once_cell::sync::Lazy;
use regex::Regex;
use strum::{AsRefStr, Display, EnumString};
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum Platform {
    YouTube,
    Instagram,
    TikTok,
    Twitter,
    Facebook,
    Reddit,
    Vimeo,
    SoundCloud,
    Generic,
}

impl Platform {
    pub fn detect(url: &Url) -> Self {
        let host = url.host_str().unwrap_or_default().trim_start_matches("www.").trim_start_matches("m.");
        let matches = |domain: &str| host == domain || host.ends_with(&format!(".{}", domain));
        if matches("youtube.com") || matches("youtu.be") {
            Platform::YouTube
        } else if matches("instagram.com") {
            Platform::Instagram
        } else if matches("tiktok.com") {
            Platform::TikTok
        } else if matches("twitter.com") || matches("x.com") {
            Platform::Twitter
        } else if matches("facebook.com") || matches("fb.watch") {
            Platform::Facebook
        } else if matches("reddit.com") || matches("redd.it") {
            Platform::Reddit
        } else if matches("vimeo.com") {
            Platform::Vimeo
        } else if matches("soundcloud.com") {
            Platform::SoundCloud
        } else {
            Platform::Generic
        }
    }

    /// Platforms whose thumbnails and storyboards are never the content itself
    pub fn never_image(self) -> bool {
        matches!(self, Platform::YouTube)
    }
}

static YOUTUBE_ID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:youtube\.com/(?:watch\?(?:.*&)?v=|shorts/|embed/|live/)|youtu\.be/)([A-Za-z0-9_-]{11})")
        .expect("Failed to compile YouTube id regex")
});

static URL_IN_TEXT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"https?://[^\s<>]+").expect("Failed to compile URL regex"));

/// Extracts the 11-character YouTube video id from any common URL form.
pub fn youtube_id(url: &str) -> Option<String> {
    YOUTUBE_ID
        .captures(url)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// First http(s) URL found in free text.
pub fn find_url(text: &str) -> Option<Url> {
    URL_IN_TEXT.find_iter(text).find_map(|m| {
        let candidate = m.as_str().trim_end_matches(|c: char| matches!(c, ')' | ']' | '.' | ',' | '!' | '?'));
        Url::parse(candidate).ok()
    })
}

/// Compact reference used to rebuild a retry without carrying the raw URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryRef {
    /// Short platform code plus the platform's media id, e.g. `yt` + `dQw4w9WgXcQ`
    Platform { platform: String, media_id: String },
    /// Reload the URL from a stored record
    Record(i64),
}

impl RetryRef {
    /// Prefers a platform reference; falls back to the record id.
    pub fn for_source(url: &str, record_id: i64) -> Self {
        match youtube_id(url) {
            Some(media_id) => RetryRef::Platform {
                platform: "yt".to_string(),
                media_id,
            },
            None => RetryRef::Record(record_id),
        }
    }

    /// Canonical URL for platform references.
    pub fn to_url(&self) -> Option<String> {
        match self {
            RetryRef::Platform { platform, media_id } if platform == "yt" => {
                Some(format!("https://www.youtube.com/watch?v={}", media_id))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn detects_platforms_by_host() {
        let cases = [
            ("https://www.youtube.com/watch?v=dQw4w9WgXcQ", Platform::YouTube),
            ("https://youtu.be/dQw4w9WgXcQ", Platform::YouTube),
            ("https://m.youtube.com/shorts/abcdefghijk", Platform::YouTube),
            ("https://www.instagram.com/p/Cxyz/", Platform::Instagram),
            ("https://vm.tiktok.com/ZM123/", Platform::TikTok),
            ("https://x.com/user/status/1", Platform::Twitter),
            ("https://example.com/video.mp4", Platform::Generic),
        ];
        for (url, expected) in cases {
            assert_eq!(Platform::detect(&Url::parse(url).unwrap()), expected, "{}", url);
        }
    }

    #[test]
    fn extracts_youtube_ids() {
        assert_eq!(youtube_id("https://www.youtube.com/watch?v=dQw4w9WgXcQ&t=1").as_deref(), Some("dQw4w9WgXcQ"));
        assert_eq!(youtube_id("https://www.youtube.com/watch?list=x&v=a_b-c1234_Z").as_deref(), Some("a_b-c1234_Z"));
        assert_eq!(youtube_id("https://youtu.be/dQw4w9WgXcQ").as_deref(), Some("dQw4w9WgXcQ"));
        assert_eq!(youtube_id("https://www.youtube.com/shorts/abcdefghijk").as_deref(), Some("abcdefghijk"));
        assert_eq!(youtube_id("https://www.youtube.com/embed/dQw4w9WgXcQ?rel=0").as_deref(), Some("dQw4w9WgXcQ"));
        assert_eq!(youtube_id("https://www.youtube.com/live/abcdefghijk").as_deref(), Some("abcdefghijk"));
        assert_eq!(youtube_id("https://www.youtube.com/watch?v=short"), None);
        assert_eq!(youtube_id("https://vimeo.com/123"), None);
    }

    #[test]
    fn retry_ref_prefers_platform_id_over_record() {
        let yt = RetryRef::for_source("https://youtu.be/dQw4w9WgXcQ", 9);
        assert_eq!(
            yt,
            RetryRef::Platform {
                platform: "yt".into(),
                media_id: "dQw4w9WgXcQ".into()
            }
        );
        assert_eq!(yt.to_url().as_deref(), Some("https://www.youtube.com/watch?v=dQw4w9WgXcQ"));

        let other = RetryRef::for_source("https://vimeo.com/123", 9);
        assert_eq!(other, RetryRef::Record(9));
        assert_eq!(other.to_url(), None);
    }

    #[test]
    fn finds_url_in_free_text() {
        let url = find_url("look at this (https://youtu.be/dQw4w9WgXcQ).").unwrap();
        assert_eq!(url.as_str(), "https://youtu.be/dQw4w9WgXcQ");
        assert!(find_url("no links here").is_none());
    }
}
