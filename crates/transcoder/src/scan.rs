use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use walkdir::WalkDir;
use log::{debug, info, warn};

/// Media file extensions to consider for transcoding
pub const MEDIA_EXTENSIONS: &[&str] = &[
    "mp4", "mkv", "avi", "flv", "webm", "mov", "wmv", "mpg", "mpeg", "m4v", "3gp", "3g2",
];

pub fn is_media_file(path: &Path) -> bool {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|ext| MEDIA_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Every media file under `root`, sorted. An unreadable root is an error;
/// unreadable entries below it are logged and skipped.
pub fn scan_media(root: &Path) -> Result<Vec<PathBuf>> {
    let meta = std::fs::metadata(root)
        .with_context(|| format!("Cannot read input directory: {}", root.display()))?;
    if !meta.is_dir() {
        anyhow::bail!("Input path is not a directory: {}", root.display());
    }
    std::fs::read_dir(root)
        .with_context(|| format!("Cannot list input directory: {}", root.display()))?;

    info!("Scanning directory: {}", root.display());

    let mut matches = Vec::new();
    let mut entry_count = 0;
    for entry in WalkDir::new(root).follow_links(false) {
        entry_count += 1;
        if entry_count % 1000 == 0 {
            info!("Scanned {} entries so far in {}...", entry_count, root.display());
        }

        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("Error reading directory entry: {}", e);
                continue;
            }
        };

        if !entry.file_type().is_file() || !is_media_file(entry.path()) {
            continue;
        }
        debug!("Found media file: {}", entry.path().display());
        matches.push(entry.into_path());
    }

    matches.sort();
    info!("Scan complete: {} entries, {} media files", entry_count, matches.len());
    Ok(matches)
}
