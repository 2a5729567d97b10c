//! Character settings sync, run when the game closes.
//!
//! The character folder whose `ADDON.DAT` changed last is treated as the
//! source; its shared UI files are copied into every other character folder.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::backup::default_character_dir;
use crate::addons::{Addon, AddonError, GameProcess, NotifyOnClose};
use crate::config::LauncherSettings;

/// Prefix of per-character folders.
pub const CHARACTER_DIR_PREFIX: &str = "FFXIV_CHR";

/// File whose modification time picks the source folder.
const MARKER_FILE: &str = "ADDON.DAT";

/// Files copied between character folders.
pub const SYNCED_FILES: [&str; 8] = [
    "ADDON.DAT",
    "COMMON.DAT",
    "CONTROL0.DAT",
    "CONTROL1.DAT",
    "HOTBAR.DAT",
    "KEYBIND.DAT",
    "LOGFLTR.DAT",
    "MACRO.DAT",
];

/// Settings for the sync addon.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Folder holding the character folders; the game's documents folder by default.
    pub source_dir: Option<PathBuf>,
}

/// Result of one sync pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOutcome {
    /// Folder the files were copied from.
    pub source: PathBuf,
    /// Folders that received the files.
    pub targets: Vec<PathBuf>,
    /// Number of files written.
    pub copied: usize,
}

fn marker_time(folder: &Path) -> SystemTime {
    fs::metadata(folder.join(MARKER_FILE))
        .and_then(|m| m.modified())
        .unwrap_or(UNIX_EPOCH)
}

/// Lists character folders under `root`, most recently changed first.
///
/// Folders without `ADDON.DAT` sort last; ties are ordered by name.
pub fn character_folders(root: &Path) -> io::Result<Vec<PathBuf>> {
    let mut folders = Vec::new();
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if !entry
            .file_name()
            .to_string_lossy()
            .starts_with(CHARACTER_DIR_PREFIX)
        {
            continue;
        }
        let path = entry.path();
        folders.push((marker_time(&path), path));
    }

    folders.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
    Ok(folders.into_iter().map(|(_, path)| path).collect())
}

/// Copies the synced files from the newest character folder into the rest.
///
/// Returns `None` when `root` holds no character folders.
pub fn sync_characters(root: &Path) -> Result<Option<SyncOutcome>, AddonError> {
    if !root.is_dir() {
        return Err(AddonError::InvalidConfig(format!(
            "character directory {} does not exist",
            root.display()
        )));
    }

    let mut folders = character_folders(root)?.into_iter();
    let Some(source) = folders.next() else {
        info!("[SYNC] No character folders in {}", root.display());
        return Ok(None);
    };
    let targets: Vec<PathBuf> = folders.collect();

    info!(
        "[SYNC] Found {} character folder(s), newest is {}",
        targets.len() + 1,
        source.display()
    );

    let files: Vec<&str> = SYNCED_FILES
        .iter()
        .copied()
        .filter(|name| source.join(name).is_file())
        .collect();

    let mut copied = 0;
    for target in &targets {
        for name in &files {
            let dest = target.join(name);
            fs::copy(source.join(name), &dest)?;
            debug!("[SYNC] Copied {} to {}", name, dest.display());
            copied += 1;
        }
    }

    Ok(Some(SyncOutcome {
        source,
        targets,
        copied,
    }))
}

/// Syncs character settings across characters after the game exits.
pub struct CharacterSyncAddon {
    config: SyncConfig,
    root: Option<PathBuf>,
}

impl CharacterSyncAddon {
    /// Creates the addon.
    #[must_use]
    pub fn new(config: SyncConfig) -> Self {
        Self { config, root: None }
    }

    /// Runs one sync pass now.
    pub fn sync_now(&self) -> Result<Option<SyncOutcome>, AddonError> {
        let root = self
            .root
            .as_ref()
            .ok_or_else(|| AddonError::NotSetUp(self.name()))?;
        sync_characters(root)
    }
}

impl Addon for CharacterSyncAddon {
    fn name(&self) -> String {
        "Sync Character Settings".to_string()
    }

    fn setup(
        &mut self,
        _game: &Arc<GameProcess>,
        _settings: &LauncherSettings,
    ) -> Result<(), AddonError> {
        let root = self
            .config
            .source_dir
            .clone()
            .or_else(default_character_dir)
            .ok_or_else(|| {
                AddonError::InvalidConfig("no documents directory for character sync".to_string())
            })?;
        self.root = Some(root);
        Ok(())
    }

    fn as_notify_on_close(&self) -> Option<&dyn NotifyOnClose> {
        Some(self)
    }
}

impl NotifyOnClose for CharacterSyncAddon {
    fn game_closed(&self) -> Result<(), AddonError> {
        match self.sync_now() {
            Ok(Some(outcome)) => {
                info!(
                    "[SYNC] Copied {} file(s) into {} folder(s)",
                    outcome.copied,
                    outcome.targets.len()
                );
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => {
                warn!("[SYNC] Character sync failed: {}", e);
                Err(e)
            }
        }
    }
}
