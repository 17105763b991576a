//! Extraction, classification and fetching of media

pub mod catalog;
pub mod executor;
pub mod oracle;
pub mod platform;
pub mod progress;
pub mod session;
pub mod strategy;
pub mod workspace;
pub mod ytdlp_errors;

pub use catalog::{extract, Extraction, FormatCatalog, FormatOption, MediaKind, MediaSource};
pub use executor::{DownloadExecutor, FetchedFile};
pub use oracle::{ExtractionOracle, FetchRequest, YtDlpOracle};
pub use platform::{Platform, RetryRef};
pub use progress::{ProgressSink, ProgressUpdate, StatusSurface};
pub use session::CatalogSessions;
pub use workspace::Workspace;
