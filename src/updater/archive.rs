//! Directory cleanup and archive extraction.

use std::fs::{self, File};
use std::io;
use std::path::Path;

use tracing::{debug, warn};

use super::UpdateError;
use super::source::UpdateSource;

/// Temporary file name for a downloaded archive inside the target directory.
pub const DOWNLOAD_FILE_NAME: &str = "download.zip";

/// Removes everything inside `dir`, creating it if missing.
///
/// Any entry that cannot be removed fails the whole cleanup.
pub fn clean_directory(dir: &Path) -> Result<(), UpdateError> {
    if !dir.exists() {
        fs::create_dir_all(dir)?;
        return Ok(());
    }

    let entries = fs::read_dir(dir).map_err(|source| UpdateError::Cleanup {
        path: dir.to_path_buf(),
        source,
    })?;

    for entry in entries {
        let entry = entry.map_err(|source| UpdateError::Cleanup {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        let is_dir = entry.file_type().is_ok_and(|t| t.is_dir());

        let removed = if is_dir {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        removed.map_err(|source| UpdateError::Cleanup { path, source })?;
    }

    Ok(())
}

/// Extracts a zip archive into `dest`, overwriting existing files.
///
/// Returns the number of files written. Entries escaping `dest` are skipped.
pub fn extract_zip(archive_path: &Path, dest: &Path) -> Result<usize, UpdateError> {
    let file = File::open(archive_path)?;
    let mut archive = zip::ZipArchive::new(file)?;
    let mut written = 0;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;

        let Some(relative) = entry.enclosed_name() else {
            warn!("[UPDATE] Skipping unsafe archive entry {}", entry.name());
            continue;
        };
        let out_path = dest.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&out_path)?;
            continue;
        }

        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut out = File::create(&out_path)?;
        io::copy(&mut entry, &mut out)?;
        written += 1;

        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&out_path, fs::Permissions::from_mode(mode))?;
        }
    }

    Ok(written)
}

/// Replaces the contents of `dir` with the archive published by `source`.
pub fn install_archive(source: &dyn UpdateSource, dir: &Path) -> Result<(), UpdateError> {
    clean_directory(dir)?;

    let download = dir.join(DOWNLOAD_FILE_NAME);
    source.download_archive(&download)?;

    let extracted = extract_zip(&download, dir);
    if let Err(e) = fs::remove_file(&download) {
        warn!("[UPDATE] Could not remove {}: {}", download.display(), e);
    }

    let count = extracted?;
    debug!("[UPDATE] Extracted {} file(s) into {}", count, dir.display());
    Ok(())
}
