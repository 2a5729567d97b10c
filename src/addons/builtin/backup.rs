//! Character settings backup, taken when the game closes.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use crate::addons::{Addon, AddonError, GameProcess, NotifyOnClose};
use crate::config::LauncherSettings;

fn default_keep() -> usize {
    3
}

/// Settings for the backup addon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Character data directory; the game's documents folder by default.
    #[serde(default)]
    pub source_dir: Option<PathBuf>,
    /// Where archives go; `<data_dir>/charDataBackup` by default.
    #[serde(default)]
    pub backup_dir: Option<PathBuf>,
    /// Number of archives kept.
    #[serde(default = "default_keep")]
    pub keep: usize,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            source_dir: None,
            backup_dir: None,
            keep: default_keep(),
        }
    }
}

/// Default character data directory.
#[must_use]
pub fn default_character_dir() -> Option<PathBuf> {
    dirs::document_dir().map(|docs| {
        docs.join("My Games")
            .join("FINAL FANTASY XIV - A Realm Reborn")
    })
}

/// Zips `source` into `dest`, returning the number of files written.
pub fn zip_directory(source: &Path, dest: &Path) -> Result<usize, AddonError> {
    let file = File::create(dest)?;
    let mut writer = ZipWriter::new(file);
    let mut count = 0;

    let mut pending = vec![source.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries = fs::read_dir(&dir)?.collect::<Result<Vec<_>, _>>()?;
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let path = entry.path();
            let Ok(relative) = path.strip_prefix(source) else {
                continue;
            };
            let name = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");

            if entry.file_type()?.is_dir() {
                writer
                    .add_directory(name, SimpleFileOptions::default())
                    .map_err(|e| AddonError::Io(io::Error::other(e)))?;
                pending.push(path);
            } else {
                writer
                    .start_file(name, SimpleFileOptions::default())
                    .map_err(|e| AddonError::Io(io::Error::other(e)))?;
                io::copy(&mut File::open(&path)?, &mut writer)?;
                count += 1;
            }
        }
    }

    writer
        .finish()
        .map_err(|e| AddonError::Io(io::Error::other(e)))?;
    Ok(count)
}

/// Deletes the oldest `.zip` files in `dir` beyond `keep`.
///
/// Returns the number of deleted archives.
pub fn prune_backups(dir: &Path, keep: usize) -> io::Result<usize> {
    let mut archives = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("zip") {
            continue;
        }
        let modified = fs::metadata(&path)
            .and_then(|m| m.modified())
            .unwrap_or(UNIX_EPOCH);
        archives.push((modified, path));
    }

    if archives.len() <= keep {
        return Ok(0);
    }

    // Oldest first; ties broken by name, which carries the timestamp.
    archives.sort();
    let excess = archives.len() - keep;
    for (_, path) in archives.iter().take(excess) {
        info!("[BACKUP] Deleting oldest character backup: {}", path.display());
        fs::remove_file(path)?;
    }
    Ok(excess)
}

/// Backs up character settings after the game exits.
pub struct CharacterBackupAddon {
    config: BackupConfig,
    dirs: Option<(PathBuf, PathBuf)>,
}

impl CharacterBackupAddon {
    /// Creates the addon.
    #[must_use]
    pub fn new(config: BackupConfig) -> Self {
        Self {
            config,
            dirs: None,
        }
    }

    /// Writes one archive and prunes old ones. Returns the archive path.
    pub fn backup_now(&self) -> Result<PathBuf, AddonError> {
        let (source, backup_dir) = self
            .dirs
            .as_ref()
            .ok_or_else(|| AddonError::NotSetUp(self.name()))?;

        if !source.is_dir() {
            return Err(AddonError::InvalidConfig(format!(
                "character directory {} does not exist",
                source.display()
            )));
        }

        fs::create_dir_all(backup_dir)?;
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();

        let mut archive = backup_dir.join(format!("{}.zip", stamp));
        let mut suffix = 1;
        while archive.exists() {
            archive = backup_dir.join(format!("{}-{}.zip", stamp, suffix));
            suffix += 1;
        }

        let files = zip_directory(source, &archive)?;
        info!("[BACKUP] Wrote {} ({} files)", archive.display(), files);

        prune_backups(backup_dir, self.config.keep.max(1))?;
        Ok(archive)
    }
}

impl Addon for CharacterBackupAddon {
    fn name(&self) -> String {
        "Back Up Character Settings".to_string()
    }

    fn setup(
        &mut self,
        _game: &Arc<GameProcess>,
        settings: &LauncherSettings,
    ) -> Result<(), AddonError> {
        let source = self
            .config
            .source_dir
            .clone()
            .or_else(default_character_dir)
            .ok_or_else(|| {
                AddonError::InvalidConfig("no documents directory for backups".to_string())
            })?;
        let backup_dir = self
            .config
            .backup_dir
            .clone()
            .unwrap_or_else(|| settings.data_dir.join("charDataBackup"));

        self.dirs = Some((source, backup_dir));
        Ok(())
    }

    fn as_notify_on_close(&self) -> Option<&dyn NotifyOnClose> {
        Some(self)
    }
}

impl NotifyOnClose for CharacterBackupAddon {
    fn game_closed(&self) -> Result<(), AddonError> {
        match self.backup_now() {
            Ok(_) => Ok(()),
            Err(e) => {
                warn!("[BACKUP] Character backup failed: {}", e);
                Err(e)
            }
        }
    }
}
