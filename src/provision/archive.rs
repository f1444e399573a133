//! Release archive extraction helpers
//!
//! Blocking code; callers run these through `spawn_blocking`.

use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Extract a zip archive into `dest`, preserving unix permission bits.
pub(crate) fn extract_zip(archive: &Path, dest: &Path) -> Result<()> {
    let file = File::open(archive)
        .with_context(|| format!("failed to open archive {}", archive.display()))?;
    let mut zip = zip::ZipArchive::new(file)
        .with_context(|| format!("failed to read archive {}", archive.display()))?;
    zip.extract(dest)
        .with_context(|| format!("failed to extract archive {}", archive.display()))?;
    Ok(())
}

/// Locate a file by name anywhere under `root`.
///
/// Release archives nest binaries under varying prefixes (`build/bin`,
/// plain root), so the search is recursive.
pub(crate) fn find_file(root: &Path, name: &str) -> Option<PathBuf> {
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.file_name().is_some_and(|f| f == name) {
                return Some(path);
            }
        }
    }
    None
}
