//! Format catalog: classification of the renditions a URL offers.
//!
//! The raw rendition list from the oracle is filtered (storyboards and
//! thumbnails dropped), bucketed (video by resolution tier, audio by bitrate
//! tier), sorted best-first and deduplicated so each bucket keeps only its
//! best entry. When a source clearly has video or audio but no discrete
//! rendition survives, a single "Best" option is synthesized so the
//! selection keyboard is never empty.

use std::collections::HashSet;
use std::sync::Arc;
use strum::{AsRefStr, Display, EnumString};
use url::Url;

use super::oracle::{ExtractionOracle, RawFormat, RawMetadata};
use super::platform::{youtube_id, Platform, RetryRef};
use crate::core::config;
use crate::core::error::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum MediaKind {
    Video,
    Audio,
    Image,
}

impl MediaKind {
    pub fn icon(self) -> &'static str {
        match self {
            MediaKind::Video => "🎬",
            MediaKind::Audio => "🎵",
            MediaKind::Image => "🖼",
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            MediaKind::Video => "Video",
            MediaKind::Audio => "Audio",
            MediaKind::Image => "Image",
        }
    }
}

/// Immutable description of the source, rebuilt on retry
#[derive(Debug, Clone, PartialEq)]
pub struct MediaSource {
    pub url: String,
    pub platform: Platform,
    pub title: String,
    pub uploader: Option<String>,
    pub duration: Option<u64>,
    pub view_count: Option<u64>,
    pub thumbnail: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FormatOption {
    pub kind: MediaKind,
    /// Opaque id handed back to the oracle
    pub format_id: String,
    /// Human quality label, e.g. "HD (720p)"
    pub quality: String,
    pub ext: String,
    pub size: Option<u64>,
    /// `size` is a bitrate × duration estimate
    pub size_estimated: bool,
    pub codecs: Vec<String>,
    /// Direct asset URL (images only)
    pub direct_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FormatCatalog {
    pub video: Vec<FormatOption>,
    pub audio: Vec<FormatOption>,
    pub image: Vec<FormatOption>,
}

impl FormatCatalog {
    pub fn options(&self, kind: MediaKind) -> &[FormatOption] {
        match kind {
            MediaKind::Video => &self.video,
            MediaKind::Audio => &self.audio,
            MediaKind::Image => &self.image,
        }
    }

    pub fn find(&self, kind: MediaKind, format_id: &str) -> Option<&FormatOption> {
        self.options(kind).iter().find(|o| o.format_id == format_id)
    }

    /// Kinds with at least one option, in display order
    pub fn kinds(&self) -> Vec<MediaKind> {
        [MediaKind::Video, MediaKind::Audio, MediaKind::Image]
            .into_iter()
            .filter(|k| !self.options(*k).is_empty())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.video.is_empty() && self.audio.is_empty() && self.image.is_empty()
    }
}

/// Result of a successful extraction
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub source: MediaSource,
    pub catalog: FormatCatalog,
}

/// Extracts and classifies the renditions available for `url`.
///
/// The oracle call runs on the blocking pool. Fails with
/// `ExtractionFailed` when nothing usable comes back; the error carries a
/// compact platform retry reference when the URL has one.
pub async fn extract(oracle: Arc<dyn ExtractionOracle>, url: &Url) -> AppResult<Extraction> {
    let platform = Platform::detect(url);
    let retry = youtube_id(url.as_str()).map(|media_id| RetryRef::Platform {
        platform: "yt".to_string(),
        media_id,
    });

    let target = url.to_string();
    let raw = tokio::task::spawn_blocking(move || oracle.extract_metadata(&target))
        .await
        .map_err(|e| AppError::ExtractionFailed {
            reason: format!("extraction worker failed: {}", e),
            retry: retry.clone(),
        })?
        .map_err(|e| {
            log::warn!("❌ Extraction failed for {}: {}", url, e);
            AppError::ExtractionFailed {
                reason: e.short_reason(),
                retry: retry.clone(),
            }
        })?;

    let extraction = classify(url.as_str(), platform, &raw);
    if extraction.catalog.is_empty() {
        log::warn!("❌ No usable renditions for {}", url);
        return Err(AppError::ExtractionFailed {
            reason: "No downloadable media was found at this link.".to_string(),
            retry,
        });
    }

    log::info!(
        "📋 Catalog for {}: {} video, {} audio, {} image",
        url,
        extraction.catalog.video.len(),
        extraction.catalog.audio.len(),
        extraction.catalog.image.len()
    );
    Ok(extraction)
}

fn codec_present(codec: Option<&str>) -> bool {
    matches!(codec, Some(c) if !c.is_empty() && c != "none")
}

fn is_decorative(format: &RawFormat) -> bool {
    let note = format.format_note.as_deref().unwrap_or_default().to_lowercase();
    note.contains("storyboard") || note.contains("thumbnail") || format.ext.as_deref() == Some("mhtml")
}

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp", "gif"];
const VIDEO_CONTAINERS: &[&str] = &["mp4", "webm", "mkv", "mov", "m3u8"];

fn is_image_ext(ext: Option<&str>) -> bool {
    ext.map(|e| IMAGE_EXTENSIONS.contains(&e.to_lowercase().as_str()))
        .unwrap_or(false)
}

fn url_image_ext(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next()?.to_lowercase();
    let ext = path.rsplit('.').next()?;
    IMAGE_EXTENSIONS.contains(&ext).then(|| ext.to_string())
}

/// Named resolution tier for the short side of a frame
pub fn video_tier(short_side: u32) -> &'static str {
    match short_side {
        h if h >= 2160 => "4K (2160p)",
        h if h >= 1440 => "2K (1440p)",
        h if h >= 1080 => "Full HD (1080p)",
        h if h >= 720 => "HD (720p)",
        h if h >= 480 => "SD (480p)",
        h if h >= 360 => "360p",
        h if h >= 240 => "240p",
        _ => "144p",
    }
}

/// Bitrate tier name for an audio rendition (kbit/s)
pub fn audio_tier(abr: f64) -> &'static str {
    if abr >= 256.0 {
        "High"
    } else if abr >= 192.0 {
        "Medium"
    } else {
        "Low"
    }
}

fn short_side(format: &RawFormat) -> Option<u32> {
    match (format.width, format.height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => Some(w.min(h)),
        (_, Some(h)) if h > 0 => Some(h),
        _ => None,
    }
}

/// Real size when known, else `tbr × 1024 × duration / 8`.
fn size_of(format: &RawFormat, duration: Option<f64>) -> (Option<u64>, bool) {
    if let Some(size) = format.filesize.or(format.filesize_approx).filter(|s| *s > 0.0) {
        return (Some(size as u64), false);
    }
    match (format.tbr.or(format.abr), duration) {
        (Some(tbr), Some(duration)) if tbr > 0.0 && duration > 0.0 => {
            (Some((tbr * 1024.0 * duration / 8.0) as u64), true)
        }
        _ => (None, false),
    }
}

fn codec_tags(format: &RawFormat) -> Vec<String> {
    [format.vcodec.as_deref(), format.acodec.as_deref()]
        .into_iter()
        .filter(|c| codec_present(*c))
        .flatten()
        .map(|c| c.split('.').next().unwrap_or(c).to_string())
        .collect()
}

fn synthesized_best(kind: MediaKind) -> FormatOption {
    let (format_id, ext) = match kind {
        MediaKind::Audio => ("bestaudio", "m4a"),
        _ => ("best", "mp4"),
    };
    FormatOption {
        kind,
        format_id: format_id.to_string(),
        quality: "Best".to_string(),
        ext: ext.to_string(),
        size: None,
        size_estimated: false,
        codecs: Vec::new(),
        direct_url: None,
    }
}

/// Pure classification of raw oracle output.
pub fn classify(url: &str, platform: Platform, raw: &RawMetadata) -> Extraction {
    let source = MediaSource {
        url: url.to_string(),
        platform,
        title: raw
            .title
            .clone()
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| "Unknown".to_string()),
        uploader: raw.uploader.clone().or_else(|| raw.channel.clone()),
        duration: raw.duration.filter(|d| *d > 0.0).map(|d| d.round() as u64),
        view_count: raw.view_count,
        thumbnail: raw.thumbnail.clone().filter(|t| !t.is_empty()),
    };

    let renditions: Vec<&RawFormat> = raw.formats.iter().filter(|f| !is_decorative(f)).collect();

    let container_is_video = |ext: Option<&str>| ext.map(|e| VIDEO_CONTAINERS.contains(&e)).unwrap_or(false);
    let has_video = codec_present(raw.vcodec.as_deref())
        || renditions.iter().any(|f| codec_present(f.vcodec.as_deref()))
        || (raw.vcodec.is_none() && raw.formats.is_empty() && container_is_video(raw.ext.as_deref()));
    let has_audio = codec_present(raw.acodec.as_deref()) || renditions.iter().any(|f| codec_present(f.acodec.as_deref()));

    let mut catalog = FormatCatalog::default();

    if has_video {
        catalog.video = classify_video(&renditions, raw.duration);
        if catalog.video.is_empty() {
            catalog.video.push(synthesized_best(MediaKind::Video));
        }
    }
    if has_audio {
        catalog.audio = classify_audio(&renditions, raw.duration);
        if catalog.audio.is_empty() {
            catalog.audio.push(synthesized_best(MediaKind::Audio));
        }
    }
    if !has_video && !has_audio && !platform.never_image() {
        catalog.image = classify_images(raw, &renditions);
    }

    Extraction { source, catalog }
}

fn classify_video(renditions: &[&RawFormat], duration: Option<f64>) -> Vec<FormatOption> {
    let mut candidates: Vec<(&RawFormat, u32)> = renditions
        .iter()
        .filter(|f| codec_present(f.vcodec.as_deref()) && !is_image_ext(f.ext.as_deref()))
        .filter_map(|f| short_side(f).map(|side| (*f, side)))
        .collect();

    // Best first: resolution, then mp4 container, then bitrate.
    candidates.sort_by(|(a, side_a), (b, side_b)| {
        side_b
            .cmp(side_a)
            .then_with(|| (b.ext.as_deref() == Some("mp4")).cmp(&(a.ext.as_deref() == Some("mp4"))))
            .then_with(|| b.tbr.unwrap_or(0.0).total_cmp(&a.tbr.unwrap_or(0.0)))
    });

    let mut seen = HashSet::new();
    candidates
        .into_iter()
        .filter(|(_, side)| seen.insert(video_tier(*side)))
        .take(config::catalog::MAX_OPTIONS)
        .map(|(f, side)| {
            let (size, size_estimated) = size_of(f, duration);
            FormatOption {
                kind: MediaKind::Video,
                format_id: f.format_id.clone(),
                quality: video_tier(side).to_string(),
                ext: f.ext.clone().unwrap_or_else(|| "mp4".to_string()),
                size,
                size_estimated,
                codecs: codec_tags(f),
                direct_url: None,
            }
        })
        .collect()
}

fn classify_audio(renditions: &[&RawFormat], duration: Option<f64>) -> Vec<FormatOption> {
    let mut candidates: Vec<(&RawFormat, f64)> = renditions
        .iter()
        .filter(|f| !codec_present(f.vcodec.as_deref()) && codec_present(f.acodec.as_deref()))
        .filter_map(|f| f.abr.or(f.tbr).filter(|b| *b > 0.0).map(|b| (*f, b)))
        .collect();
    candidates.sort_by(|(_, a), (_, b)| b.total_cmp(a));

    let mut seen = HashSet::new();
    candidates
        .into_iter()
        .filter(|(_, abr)| seen.insert(audio_tier(*abr)))
        .take(config::catalog::MAX_OPTIONS)
        .map(|(f, abr)| {
            let (size, size_estimated) = size_of(f, duration);
            FormatOption {
                kind: MediaKind::Audio,
                format_id: f.format_id.clone(),
                quality: format!("{} ({}kbps)", audio_tier(abr), abr.round() as u64),
                ext: f.ext.clone().unwrap_or_else(|| "m4a".to_string()),
                size,
                size_estimated,
                codecs: codec_tags(f),
                direct_url: None,
            }
        })
        .collect()
}

fn classify_images(raw: &RawMetadata, renditions: &[&RawFormat]) -> Vec<FormatOption> {
    // (url, ext, width, height)
    let mut found: Vec<(String, String, u32, u32)> = renditions
        .iter()
        .filter(|f| is_image_ext(f.ext.as_deref()))
        .filter_map(|f| {
            let url = f.url.clone()?;
            let ext = f.ext.clone()?.to_lowercase();
            Some((url, ext, f.width.unwrap_or(0), f.height.unwrap_or(0)))
        })
        .collect();

    if let Some(direct) = &raw.url {
        if let Some(ext) = url_image_ext(direct) {
            found.push((direct.clone(), ext, raw.width.unwrap_or(0), raw.height.unwrap_or(0)));
        }
    }
    if found.is_empty() {
        if let Some(thumb) = raw.thumbnail.as_ref().filter(|t| !t.is_empty()) {
            let ext = url_image_ext(thumb).unwrap_or_else(|| "jpg".to_string());
            found.push((thumb.clone(), ext, 0, 0));
        }
    }

    found.sort_by(|a, b| (u64::from(b.2) * u64::from(b.3)).cmp(&(u64::from(a.2) * u64::from(a.3))));
    let mut seen = HashSet::new();
    found
        .into_iter()
        .filter(|(url, ..)| seen.insert(url.clone()))
        .take(config::catalog::MAX_IMAGES)
        .enumerate()
        .map(|(i, (url, ext, w, h))| FormatOption {
            kind: MediaKind::Image,
            format_id: format!("img{}", i),
            quality: if w > 0 && h > 0 {
                format!("{}x{}", w, h)
            } else {
                "Original".to_string()
            },
            ext,
            size: None,
            size_estimated: false,
            codecs: Vec::new(),
            direct_url: Some(url),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn video(id: &str, height: u32, ext: &str, tbr: f64) -> RawFormat {
        RawFormat {
            format_id: id.into(),
            ext: Some(ext.into()),
            vcodec: Some("avc1.640028".into()),
            acodec: Some("none".into()),
            width: Some(height * 16 / 9),
            height: Some(height),
            tbr: Some(tbr),
            ..Default::default()
        }
    }

    fn audio(id: &str, abr: f64) -> RawFormat {
        RawFormat {
            format_id: id.into(),
            ext: Some("m4a".into()),
            vcodec: Some("none".into()),
            acodec: Some("mp4a.40.2".into()),
            abr: Some(abr),
            ..Default::default()
        }
    }

    fn youtube_meta(formats: Vec<RawFormat>) -> RawMetadata {
        RawMetadata {
            title: Some("Clip".into()),
            uploader: Some("Chan".into()),
            duration: Some(100.0),
            view_count: Some(1234),
            thumbnail: Some("https://i.ytimg.com/vi/x/hq.jpg".into()),
            formats,
            ..Default::default()
        }
    }

    #[test]
    fn buckets_and_dedupes_best_first() {
        let mut storyboard = video("sb0", 1080, "mhtml", 1.0);
        storyboard.format_note = Some("storyboard".into());
        let raw = youtube_meta(vec![
            storyboard,
            video("136", 720, "mp4", 1500.0),
            video("247", 720, "webm", 1600.0),
            video("137", 1080, "mp4", 3000.0),
            video("248", 1080, "webm", 2800.0),
            audio("140", 129.5),
            audio("139", 48.0),
        ]);
        let out = classify("https://youtu.be/x", Platform::YouTube, &raw);

        let video_ids: Vec<_> = out.catalog.video.iter().map(|o| o.format_id.as_str()).collect();
        assert_eq!(video_ids, vec!["137", "136"]);
        let labels: Vec<_> = out.catalog.video.iter().map(|o| o.quality.as_str()).collect();
        assert_eq!(labels, vec!["Full HD (1080p)", "HD (720p)"]);

        // Both audio renditions land in the Low bucket; the better one wins.
        assert_eq!(out.catalog.audio.len(), 1);
        assert_eq!(out.catalog.audio[0].format_id, "140");
        assert_eq!(out.catalog.audio[0].quality, "Low (130kbps)");
        assert!(out.catalog.image.is_empty());
        assert_eq!(out.source.title, "Clip");
    }

    #[test]
    fn estimates_missing_size_from_bitrate() {
        let raw = youtube_meta(vec![video("22", 720, "mp4", 800.0)]);
        let out = classify("https://youtu.be/x", Platform::YouTube, &raw);
        let option = &out.catalog.video[0];
        assert!(option.size_estimated);
        assert_eq!(option.size, Some((800.0 * 1024.0 * 100.0 / 8.0) as u64));
    }

    #[test]
    fn real_size_wins_over_estimate() {
        let mut f = video("22", 720, "mp4", 800.0);
        f.filesize_approx = Some(5000.0);
        let out = classify("https://youtu.be/x", Platform::YouTube, &youtube_meta(vec![f]));
        assert_eq!(out.catalog.video[0].size, Some(5000));
        assert!(!out.catalog.video[0].size_estimated);
    }

    #[test]
    fn portrait_video_uses_short_side() {
        let mut f = video("v", 1920, "mp4", 100.0);
        f.width = Some(1080);
        let out = classify("https://www.tiktok.com/@a/video/1", Platform::TikTok, &youtube_meta(vec![f]));
        assert_eq!(out.catalog.video[0].quality, "Full HD (1080p)");
    }

    #[test]
    fn synthesizes_best_when_no_discrete_renditions_survive() {
        let raw = RawMetadata {
            title: Some("Reel".into()),
            vcodec: Some("h264".into()),
            acodec: Some("aac".into()),
            url: Some("https://cdn.example/reel.mp4".into()),
            ..Default::default()
        };
        let out = classify("https://www.instagram.com/reel/x", Platform::Instagram, &raw);
        assert_eq!(out.catalog.video.len(), 1);
        assert_eq!(out.catalog.video[0].format_id, "best");
        assert_eq!(out.catalog.video[0].quality, "Best");
        assert_eq!(out.catalog.audio[0].format_id, "bestaudio");
        assert!(out.catalog.image.is_empty());
    }

    #[test]
    fn image_only_source_fills_image_bucket() {
        let raw = RawMetadata {
            title: Some("Post".into()),
            formats: vec![
                RawFormat {
                    format_id: "0".into(),
                    ext: Some("jpg".into()),
                    vcodec: Some("none".into()),
                    acodec: Some("none".into()),
                    width: Some(640),
                    height: Some(640),
                    url: Some("https://cdn/small.jpg".into()),
                    ..Default::default()
                },
                RawFormat {
                    format_id: "1".into(),
                    ext: Some("jpg".into()),
                    vcodec: Some("none".into()),
                    acodec: Some("none".into()),
                    width: Some(1080),
                    height: Some(1080),
                    url: Some("https://cdn/large.jpg".into()),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        let out = classify("https://www.instagram.com/p/x", Platform::Instagram, &raw);
        assert!(out.catalog.video.is_empty());
        assert!(out.catalog.audio.is_empty());
        assert_eq!(out.catalog.kinds(), vec![MediaKind::Image]);
        assert_eq!(out.catalog.image[0].quality, "1080x1080");
        assert_eq!(out.catalog.image[0].direct_url.as_deref(), Some("https://cdn/large.jpg"));
        assert_eq!(out.catalog.image[0].format_id, "img0");
    }

    #[test]
    fn youtube_thumbnails_are_never_images() {
        let raw = RawMetadata {
            thumbnail: Some("https://i.ytimg.com/vi/x/hq.jpg".into()),
            ..Default::default()
        };
        let out = classify("https://youtu.be/x", Platform::YouTube, &raw);
        assert!(out.catalog.is_empty());
    }

    #[test]
    fn options_are_capped() {
        let formats = (1..=12).map(|i| audio(&format!("a{}", i), 40.0 * i as f64)).collect();
        let out = classify("https://youtu.be/x", Platform::YouTube, &youtube_meta(formats));
        assert!(out.catalog.audio.len() <= config::catalog::MAX_OPTIONS);
        let tiers: Vec<_> = out.catalog.audio.iter().map(|o| o.quality.split(' ').next().unwrap()).collect();
        assert_eq!(tiers, vec!["High", "Medium", "Low"]);
    }

    #[test]
    fn tiers() {
        assert_eq!(video_tier(2160), "4K (2160p)");
        assert_eq!(video_tier(1088), "Full HD (1080p)");
        assert_eq!(video_tier(100), "144p");
        assert_eq!(audio_tier(320.0), "High");
        assert_eq!(audio_tier(192.0), "Medium");
        assert_eq!(audio_tier(128.0), "Low");
    }
}
