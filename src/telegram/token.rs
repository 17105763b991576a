//! Selection tokens carried in inline-button callback data.
//!
//! Wire shapes (fields joined with `_`):
//!
//! | action        | wire                                          |
//! |---------------|-----------------------------------------------|
//! | TypeSelect    | `type_{kind}_{download_id}`                   |
//! | QualitySelect | `quality_{kind}_{quality}_{format_id}_{download_id}` |
//! | Back          | `back_{download_id}`                          |
//! | Retry         | `retry_{platform}_{media_id}` or `retry_rec_{download_id}` |
//! | Cancel        | `cancel_{download_id}`                        |
//! | ConvertAudio  | `toaudio_{download_id}`                       |
//!
//! A quality label may itself contain `_`, so `QualitySelect` is decoded by
//! anchoring the last two fields (download id, format id) from the end and
//! taking whatever remains in the middle as the label. `format_id` is the
//! literal `none` for the Auto option. Format ids such as TikTok's
//! `h264_540p_…` contain `_` too, so inside the format field `%` is written
//! as `%25` and `_` as `%5F`. A platform media id may contain `_` as well;
//! it is always the last field of a retry token.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::core::config;
use crate::core::error::AppError;
use crate::download::catalog::MediaKind;
use crate::download::platform::RetryRef;

pub const SEPARATOR: char = '_';

const AUTO_FORMAT: &str = "none";
const RECORD_RETRY: &str = "rec";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectionToken {
    TypeSelect {
        kind: MediaKind,
        download_id: i64,
    },
    QualitySelect {
        kind: MediaKind,
        quality: String,
        /// `None` is the Auto option
        format_id: Option<String>,
        download_id: i64,
    },
    Back {
        download_id: i64,
    },
    Retry(RetryRef),
    Cancel {
        download_id: i64,
    },
    ConvertAudio {
        download_id: i64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("malformed token: {0}")]
    Malformed(String),

    #[error("unknown action: {0}")]
    UnknownAction(String),
}

impl From<TokenError> for AppError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::Malformed(token) => AppError::MalformedToken(token),
            TokenError::UnknownAction(token) => AppError::UnknownAction(token),
        }
    }
}

fn escape_format(format_id: &str) -> String {
    format_id.replace('%', "%25").replace(SEPARATOR, "%5F")
}

fn unescape_format(field: &str) -> Option<String> {
    let mut out = String::with_capacity(field.len());
    let mut rest = field;
    while let Some(at) = rest.find('%') {
        out.push_str(&rest[..at]);
        let code = rest.get(at + 1..at + 3)?;
        match code {
            "25" => out.push('%'),
            "5F" => out.push(SEPARATOR),
            _ => return None,
        }
        rest = &rest[at + 3..];
    }
    out.push_str(rest);
    Some(out)
}

fn plain_field(value: &str, token: &str) -> Result<(), TokenError> {
    if value.is_empty() || value.contains(SEPARATOR) {
        return Err(TokenError::Malformed(token.to_string()));
    }
    Ok(())
}

impl SelectionToken {
    /// Owning download of the action, when it has one
    pub fn download_id(&self) -> Option<i64> {
        match self {
            SelectionToken::TypeSelect { download_id, .. }
            | SelectionToken::QualitySelect { download_id, .. }
            | SelectionToken::Back { download_id }
            | SelectionToken::Cancel { download_id }
            | SelectionToken::ConvertAudio { download_id } => Some(*download_id),
            SelectionToken::Retry(RetryRef::Record(id)) => Some(*id),
            SelectionToken::Retry(RetryRef::Platform { .. }) => None,
        }
    }

    /// Serializes the token, refusing anything the decoder could not read back
    /// or that exceeds the callback-data limit.
    pub fn encode(&self) -> Result<String, TokenError> {
        let wire = match self {
            SelectionToken::TypeSelect { kind, download_id } => format!("type_{}_{}", kind, download_id),
            SelectionToken::QualitySelect {
                kind,
                quality,
                format_id,
                download_id,
            } => {
                let format = match format_id.as_deref() {
                    Some(id) => escape_format(id),
                    None => AUTO_FORMAT.to_string(),
                };
                let wire = format!("quality_{}_{}_{}_{}", kind, quality, format, download_id);
                if quality.is_empty() || format_id.as_deref().is_some_and(|id| id.is_empty() || id == AUTO_FORMAT) {
                    return Err(TokenError::Malformed(wire));
                }
                wire
            }
            SelectionToken::Back { download_id } => format!("back_{}", download_id),
            SelectionToken::Retry(RetryRef::Record(id)) => format!("retry_{}_{}", RECORD_RETRY, id),
            SelectionToken::Retry(RetryRef::Platform { platform, media_id }) => {
                let wire = format!("retry_{}_{}", platform, media_id);
                plain_field(platform, &wire)?;
                if platform == RECORD_RETRY || media_id.is_empty() {
                    return Err(TokenError::Malformed(wire));
                }
                wire
            }
            SelectionToken::Cancel { download_id } => format!("cancel_{}", download_id),
            SelectionToken::ConvertAudio { download_id } => format!("toaudio_{}", download_id),
        };

        if wire.len() > config::token::MAX_LEN {
            log::warn!("Selection token exceeds {} bytes: {}", config::token::MAX_LEN, wire);
            return Err(TokenError::Malformed(wire));
        }
        Ok(wire)
    }

    pub fn decode(token: &str) -> Result<Self, TokenError> {
        let malformed = || TokenError::Malformed(token.to_string());
        let parse_id = |s: &str| s.parse::<i64>().map_err(|_| malformed());
        let parse_kind = |s: &str| MediaKind::from_str(s).map_err(|_| malformed());

        let (action, rest) = token.split_once(SEPARATOR).unwrap_or((token, ""));
        match action {
            "type" => {
                let (kind, id) = rest.split_once(SEPARATOR).ok_or_else(malformed)?;
                Ok(SelectionToken::TypeSelect {
                    kind: parse_kind(kind)?,
                    download_id: parse_id(id)?,
                })
            }
            "quality" => {
                let (kind, tail) = rest.split_once(SEPARATOR).ok_or_else(malformed)?;
                // Anchor id and format id from the end; the label keeps any separators.
                let mut fields = tail.rsplitn(3, SEPARATOR);
                let id = fields.next().ok_or_else(malformed)?;
                let format = fields.next().ok_or_else(malformed)?;
                let quality = fields.next().filter(|q| !q.is_empty()).ok_or_else(malformed)?;
                if format.is_empty() {
                    return Err(malformed());
                }
                let format_id = match format {
                    AUTO_FORMAT => None,
                    escaped => Some(unescape_format(escaped).ok_or_else(malformed)?),
                };
                Ok(SelectionToken::QualitySelect {
                    kind: parse_kind(kind)?,
                    quality: quality.to_string(),
                    format_id,
                    download_id: parse_id(id)?,
                })
            }
            "back" => Ok(SelectionToken::Back {
                download_id: parse_id(rest)?,
            }),
            "retry" => {
                let (platform, id) = rest.split_once(SEPARATOR).ok_or_else(malformed)?;
                if platform.is_empty() || id.is_empty() {
                    return Err(malformed());
                }
                if platform == RECORD_RETRY {
                    Ok(SelectionToken::Retry(RetryRef::Record(parse_id(id)?)))
                } else {
                    Ok(SelectionToken::Retry(RetryRef::Platform {
                        platform: platform.to_string(),
                        media_id: id.to_string(),
                    }))
                }
            }
            "cancel" => Ok(SelectionToken::Cancel {
                download_id: parse_id(rest)?,
            }),
            "toaudio" => Ok(SelectionToken::ConvertAudio {
                download_id: parse_id(rest)?,
            }),
            _ => Err(TokenError::UnknownAction(token.to_string())),
        }
    }
}

impl FromStr for SelectionToken {
    type Err = TokenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::decode(s)
    }
}

impl fmt::Display for SelectionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.encode() {
            Ok(wire) => f.write_str(&wire),
            Err(_) => write!(f, "{:?}", self),
        }
    }
}
