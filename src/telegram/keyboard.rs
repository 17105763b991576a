//! Inline keyboards of the selection flow.
//!
//! Every button carries an encoded [`SelectionToken`]; a button whose token
//! cannot be encoded is left out rather than sent with unreadable data.

use teloxide::types::{InlineKeyboardButton, InlineKeyboardButtonKind, InlineKeyboardMarkup};

use super::token::SelectionToken;
use crate::core::utils::format_file_size;
use crate::download::catalog::{FormatCatalog, FormatOption, MediaKind};
use crate::download::platform::RetryRef;

pub const AUTO_LABEL: &str = "⭐ Auto (Recommended)";
pub const BACK_LABEL: &str = "⬅️ Back";
pub const CANCEL_LABEL: &str = "❌ Cancel";
pub const RETRY_LABEL: &str = "🔄 Retry";
pub const CONVERT_AUDIO_LABEL: &str = "🎵 Convert to audio";

/// Quality label carried by the Auto option's token
pub const AUTO_QUALITY: &str = "Auto";

fn button(text: impl Into<String>, token: &SelectionToken) -> Option<InlineKeyboardButton> {
    match token.encode() {
        Ok(data) => Some(super::cb(text, data)),
        Err(e) => {
            log::warn!("Skipping button with unencodable token {:?}: {}", token, e);
            None
        }
    }
}

/// Button text for one rendition: label, container and size (`~` when estimated).
pub fn option_label(option: &FormatOption) -> String {
    let mut label = format!("{} · {}", option.quality, option.ext);
    if let Some(size) = option.size {
        let prefix = if option.size_estimated { "~" } else { "" };
        label.push_str(&format!(" · {}{}", prefix, format_file_size(size)));
    }
    label
}

/// First step: one button per media kind the catalog offers.
pub fn type_keyboard(download_id: i64, catalog: &FormatCatalog) -> InlineKeyboardMarkup {
    let mut rows: Vec<Vec<InlineKeyboardButton>> = catalog
        .kinds()
        .into_iter()
        .filter_map(|kind| {
            let text = format!("{} {} ({})", kind.icon(), kind.title(), catalog.options(kind).len());
            button(text, &SelectionToken::TypeSelect { kind, download_id })
        })
        .map(|b| vec![b])
        .collect();
    rows.extend(button(CANCEL_LABEL, &SelectionToken::Cancel { download_id }).map(|b| vec![b]));
    InlineKeyboardMarkup::new(rows)
}

/// Second step: the renditions of one kind, then Auto and Back.
pub fn quality_keyboard(download_id: i64, kind: MediaKind, options: &[FormatOption]) -> InlineKeyboardMarkup {
    log::debug!(
        "Creating quality keyboard (download={}, kind={}, options={})",
        download_id,
        kind,
        options.len()
    );
    let mut rows: Vec<Vec<InlineKeyboardButton>> = options
        .iter()
        .filter_map(|option| {
            button(
                option_label(option),
                &SelectionToken::QualitySelect {
                    kind,
                    quality: option.quality.clone(),
                    format_id: Some(option.format_id.clone()),
                    download_id,
                },
            )
        })
        .map(|b| vec![b])
        .collect();

    let auto = SelectionToken::QualitySelect {
        kind,
        quality: AUTO_QUALITY.to_string(),
        format_id: None,
        download_id,
    };
    rows.extend(button(AUTO_LABEL, &auto).map(|b| vec![b]));
    rows.extend(button(BACK_LABEL, &SelectionToken::Back { download_id }).map(|b| vec![b]));
    InlineKeyboardMarkup::new(rows)
}

/// Shown on the status message while the fetch runs, and on a rejected admission.
pub fn cancel_keyboard(download_id: i64) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(button(CANCEL_LABEL, &SelectionToken::Cancel { download_id }).map(|b| vec![b]))
}

pub fn retry_keyboard(retry: &RetryRef) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(button(RETRY_LABEL, &SelectionToken::Retry(retry.clone())).map(|b| vec![b]))
}

/// Offered under a delivered video.
pub fn convert_audio_keyboard(download_id: i64) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(
        button(CONVERT_AUDIO_LABEL, &SelectionToken::ConvertAudio { download_id }).map(|b| vec![b]),
    )
}

/// Callback payloads of every button, row by row.
pub fn callback_payloads(keyboard: &InlineKeyboardMarkup) -> Vec<String> {
    keyboard
        .inline_keyboard
        .iter()
        .flatten()
        .filter_map(|b| match &b.kind {
            InlineKeyboardButtonKind::CallbackData(data) => Some(data.clone()),
            _ => None,
        })
        .collect()
}

pub fn button_texts(keyboard: &InlineKeyboardMarkup) -> Vec<String> {
    keyboard.inline_keyboard.iter().flatten().map(|b| b.text.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn option(kind: MediaKind, id: &str, quality: &str, size: Option<u64>, estimated: bool) -> FormatOption {
        FormatOption {
            kind,
            format_id: id.into(),
            quality: quality.into(),
            ext: "mp4".into(),
            size,
            size_estimated: estimated,
            codecs: vec![],
            direct_url: None,
        }
    }

    #[test]
    fn quality_keyboard_ends_with_auto_and_back() {
        let options = vec![
            option(MediaKind::Video, "137", "Full HD (1080p)", Some(10 * 1024 * 1024), false),
            option(MediaKind::Video, "136", "HD (720p)", Some(5 * 1024 * 1024), true),
        ];
        let keyboard = quality_keyboard(9, MediaKind::Video, &options);
        assert_eq!(
            button_texts(&keyboard),
            vec![
                "Full HD (1080p) · mp4 · 10.00 MB".to_string(),
                "HD (720p) · mp4 · ~5.00 MB".to_string(),
                AUTO_LABEL.to_string(),
                BACK_LABEL.to_string(),
            ]
        );
        let payloads = callback_payloads(&keyboard);
        assert_eq!(payloads[1], "quality_video_HD (720p)_136_9");
        assert_eq!(payloads[2], "quality_video_Auto_none_9");
        assert_eq!(payloads[3], "back_9");
    }

    #[test]
    fn tiktok_style_format_ids_are_offered() {
        let options = vec![
            option(MediaKind::Video, "bytevc1_1080p_1544286-1", "Full HD (1080p)", None, false),
            option(MediaKind::Video, "h264_540p_1544286-0", "SD (540p)", None, false),
        ];
        let keyboard = quality_keyboard(12, MediaKind::Video, &options);
        let payloads = callback_payloads(&keyboard);
        assert_eq!(payloads.len(), 4);
        assert_eq!(
            SelectionToken::decode(&payloads[0]).unwrap(),
            SelectionToken::QualitySelect {
                kind: MediaKind::Video,
                quality: "Full HD (1080p)".into(),
                format_id: Some("bytevc1_1080p_1544286-1".into()),
                download_id: 12,
            }
        );
    }

    #[test]
    fn unencodable_options_are_skipped() {
        let options = vec![option(MediaKind::Video, "137", &"x".repeat(60), None, false)];
        let keyboard = quality_keyboard(1, MediaKind::Video, &options);
        assert_eq!(button_texts(&keyboard), vec![AUTO_LABEL.to_string(), BACK_LABEL.to_string()]);
    }

    #[test]
    fn type_keyboard_lists_available_kinds() {
        let catalog = FormatCatalog {
            video: vec![option(MediaKind::Video, "22", "HD (720p)", None, false)],
            audio: vec![],
            image: vec![],
        };
        let keyboard = type_keyboard(3, &catalog);
        assert_eq!(callback_payloads(&keyboard), vec!["type_video_3", "cancel_3"]);
        assert_eq!(button_texts(&keyboard)[0], "🎬 Video (1)");
    }

    #[test]
    fn retry_and_cancel_buttons() {
        let retry = retry_keyboard(&RetryRef::Platform {
            platform: "yt".into(),
            media_id: "dQw4w9WgXcQ".into(),
        });
        assert_eq!(callback_payloads(&retry), vec!["retry_yt_dQw4w9WgXcQ"]);
        assert_eq!(callback_payloads(&cancel_keyboard(5)), vec!["cancel_5"]);
        assert_eq!(callback_payloads(&convert_audio_keyboard(5)), vec!["toaudio_5"]);
    }
}
