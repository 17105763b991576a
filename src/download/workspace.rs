//! Per-download temporary directories.
//!
//! Layout: `<base>/<owner>/<download_id>/`. Each download owns its own
//! directory so purging one never touches files of another download by the
//! same owner.

use std::io;
use std::path::{Path, PathBuf};

const MEDIA_EXTENSIONS: &[&str] = &[
    "mp4", "mkv", "webm", "mov", "mp3", "m4a", "opus", "ogg", "aac", "jpg", "jpeg", "png", "webp", "gif",
];

#[derive(Debug, Clone)]
pub struct Workspace {
    owner_dir: PathBuf,
    dir: PathBuf,
}

impl Workspace {
    pub fn for_download(base: &Path, owner: i64, download_id: i64) -> Self {
        let owner_dir = base.join(owner.to_string());
        let dir = owner_dir.join(download_id.to_string());
        Self { owner_dir, dir }
    }

    pub fn create(&self) -> io::Result<()> {
        std::fs::create_dir_all(&self.dir)
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Removes every artifact of this download. A missing directory is not an error.
    pub fn purge(&self) -> io::Result<()> {
        match std::fs::remove_dir_all(&self.dir) {
            Ok(()) => log::debug!("🧹 Purged {}", self.dir.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        // Only succeeds when no other download of this owner is in flight.
        let _ = std::fs::remove_dir(&self.owner_dir);
        Ok(())
    }
}

/// Locates the file a fetch produced, preferring `preferred_ext`.
///
/// Partial downloads (`.part`, `.ytdl`, `.temp`) are ignored; among equal
/// candidates the largest file wins.
pub fn find_output(dir: &Path, preferred_ext: &str) -> Option<PathBuf> {
    let entries = std::fs::read_dir(dir).ok()?;
    let mut candidates: Vec<(bool, u64, PathBuf)> = entries
        .filter_map(Result::ok)
        .filter_map(|entry| {
            let path = entry.path();
            let meta = entry.metadata().ok()?;
            if !meta.is_file() || meta.len() == 0 {
                return None;
            }
            let ext = path.extension()?.to_str()?.to_lowercase();
            if !MEDIA_EXTENSIONS.contains(&ext.as_str()) {
                return None;
            }
            Some((ext == preferred_ext, meta.len(), path))
        })
        .collect();
    candidates.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.cmp(&a.1)));
    candidates.into_iter().next().map(|(_, _, path)| path)
}
