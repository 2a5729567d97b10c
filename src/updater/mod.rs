//! Self-update protocol for downloadable companion binaries.
//!
//! A companion lives in its own directory next to a `version.json` (or plain
//! `version`) file shipped inside its release archive. Updating wipes the
//! directory and extracts the new archive in its place, so a stale binary
//! is never mixed with new files.

mod archive;
mod source;

use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub use archive::{DOWNLOAD_FILE_NAME, clean_directory, extract_zip, install_archive};
pub use source::{
    ARCHIVE_NAME, DEFAULT_CONNECT_TIMEOUT, DEFAULT_TOTAL_TIMEOUT, HttpUpdateSource, UpdateSource,
};

/// Local descriptor written by the release archive.
pub const VERSION_JSON_FILE: &str = "version.json";

/// Plain-text version file, used when no `version.json` exists.
pub const VERSION_TEXT_FILE: &str = "version";

/// Marker file recording the version a data directory was synced to.
pub const DATA_MARKER_FILE: &str = ".synced-version";

/// Set to skip all remote update checks.
pub const NO_UPDATE_ENV: &str = "ADDONHOST_NO_UPDATE";

/// Update errors.
#[derive(Debug, Error)]
pub enum UpdateError {
    /// Remote request failed.
    #[error("Network error: {0}")]
    Network(String),

    /// Version descriptor could not be parsed.
    #[error("Invalid version descriptor: {0}")]
    Parse(String),

    /// The target directory could not be emptied.
    #[error("Failed to clean {}: {source}", path.display())]
    Cleanup {
        /// Entry that could not be removed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// The archive is corrupt.
    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    /// The archive did not contain the expected binary.
    #[error("Binary missing after update: {}", .0.display())]
    MissingBinary(PathBuf),

    /// File system error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Version descriptor published next to a companion archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteVersion {
    /// Companion version.
    #[serde(rename = "AssemblyVersion")]
    pub version: String,
    /// Game version the companion supports, if it declares one.
    #[serde(rename = "SupportedGameVer", default)]
    pub supported_game_version: Option<String>,
}

impl RemoteVersion {
    /// Creates a descriptor without a supported game version.
    #[must_use]
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            supported_game_version: None,
        }
    }

    /// Parses a descriptor body: either a JSON object or a bare version string.
    pub fn parse(body: &str) -> Result<Self, UpdateError> {
        let body = body.trim().trim_start_matches('\u{feff}');
        if body.is_empty() {
            return Err(UpdateError::Parse("empty body".to_string()));
        }

        if body.starts_with('{') {
            let parsed: Self =
                serde_json::from_str(body).map_err(|e| UpdateError::Parse(e.to_string()))?;
            if parsed.version.trim().is_empty() {
                return Err(UpdateError::Parse("empty AssemblyVersion".to_string()));
            }
            return Ok(parsed);
        }

        let version = body.trim_matches('"').trim();
        if version.is_empty() || version.contains(char::is_whitespace) {
            return Err(UpdateError::Parse(format!("not a version: {:?}", body)));
        }

        Ok(Self::new(version))
    }

    /// Returns true if the descriptor allows the installed game version.
    ///
    /// A descriptor without a supported game version allows any.
    #[must_use]
    pub fn supports_game(&self, installed: &str) -> bool {
        match self.supported_game_version.as_deref() {
            None => true,
            Some(supported) => supported.trim() == installed.trim(),
        }
    }
}

/// How a local version is compared with the remote one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionMatch {
    /// Current only when both strings are equal.
    #[default]
    Exact,
    /// Current when the remote string starts with the local one.
    Prefix,
}

impl VersionMatch {
    /// Returns true if `local` counts as current against `remote`.
    #[must_use]
    pub fn is_current(self, local: &str, remote: &str) -> bool {
        let local = local.trim();
        let remote = remote.trim();
        if local.is_empty() {
            return false;
        }

        match self {
            Self::Exact => local == remote,
            Self::Prefix => remote.starts_with(local),
        }
    }
}

/// Reads the version descriptor shipped next to a companion binary.
#[must_use]
pub fn read_local_descriptor(dir: &Path) -> Option<RemoteVersion> {
    if let Ok(body) = fs::read_to_string(dir.join(VERSION_JSON_FILE)) {
        match RemoteVersion::parse(&body) {
            Ok(descriptor) => return Some(descriptor),
            Err(e) => warn!("[UPDATE] Ignoring unreadable {}: {}", VERSION_JSON_FILE, e),
        }
    }

    fs::read_to_string(dir.join(VERSION_TEXT_FILE))
        .ok()
        .and_then(|body| RemoteVersion::parse(&body).ok())
}

/// Reads the local companion version.
#[must_use]
pub fn read_local_version(dir: &Path) -> Option<String> {
    read_local_descriptor(dir).map(|d| d.version)
}

/// Decides whether an update is required.
#[must_use]
pub fn needs_update(
    binary_present: bool,
    local: Option<&str>,
    remote: &str,
    strategy: VersionMatch,
) -> bool {
    if !binary_present {
        return true;
    }

    match local {
        Some(local) => !strategy.is_current(local, remote),
        None => true,
    }
}

/// Result of [`CompanionUpdater::ensure_current`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateStatus {
    /// Local copy already matches the remote version.
    UpToDate(RemoteVersion),
    /// A new archive was installed.
    Updated(RemoteVersion),
}

impl UpdateStatus {
    /// Returns the remote descriptor used for the decision.
    #[must_use]
    pub fn remote(&self) -> &RemoteVersion {
        match self {
            Self::UpToDate(v) | Self::Updated(v) => v,
        }
    }
}

/// A companion binary ready to launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedCompanion {
    /// Path to the binary.
    pub binary: PathBuf,
    /// Remote descriptor, absent when the check failed or was skipped.
    pub remote: Option<RemoteVersion>,
    /// True if an archive was installed during preparation.
    pub updated: bool,
}

/// Keeps one companion directory in sync with its remote source.
pub struct CompanionUpdater {
    name: String,
    source: Arc<dyn UpdateSource>,
    target_dir: PathBuf,
    binary_name: String,
    strategy: VersionMatch,
}

impl CompanionUpdater {
    /// Creates an updater for `binary_name` inside `target_dir`.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        source: Arc<dyn UpdateSource>,
        target_dir: impl Into<PathBuf>,
        binary_name: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            source,
            target_dir: target_dir.into(),
            binary_name: binary_name.into(),
            strategy: VersionMatch::default(),
        }
    }

    /// Sets the version comparison strategy.
    #[must_use]
    pub fn with_strategy(mut self, strategy: VersionMatch) -> Self {
        self.strategy = strategy;
        self
    }

    /// Returns the companion directory.
    #[must_use]
    pub fn target_dir(&self) -> &Path {
        &self.target_dir
    }

    /// Returns the path of the companion binary.
    #[must_use]
    pub fn binary_path(&self) -> PathBuf {
        self.target_dir.join(&self.binary_name)
    }

    /// Fetches the remote descriptor and decides whether to update.
    pub fn check(&self) -> Result<(RemoteVersion, bool), UpdateError> {
        let remote = self.source.fetch_version()?;
        let local = read_local_version(&self.target_dir);
        let update = needs_update(
            self.binary_path().is_file(),
            local.as_deref(),
            &remote.version,
            self.strategy,
        );

        debug!(
            "[UPDATE] {}: local {:?}, remote {}, update {}",
            self.name, local, remote.version, update
        );
        Ok((remote, update))
    }

    /// Replaces the companion directory with the remote archive.
    pub fn install(&self) -> Result<(), UpdateError> {
        info!(
            "[UPDATE] Installing {} into {}",
            self.name,
            self.target_dir.display()
        );
        install_archive(self.source.as_ref(), &self.target_dir)?;

        let binary = self.binary_path();
        if !binary.is_file() {
            return Err(UpdateError::MissingBinary(binary));
        }
        Ok(())
    }

    /// Checks and installs if needed.
    pub fn ensure_current(&self) -> Result<UpdateStatus, UpdateError> {
        let (remote, update) = self.check()?;
        if !update {
            return Ok(UpdateStatus::UpToDate(remote));
        }

        self.install()?;
        info!("[UPDATE] {} updated to {}", self.name, remote.version);
        Ok(UpdateStatus::Updated(remote))
    }

    /// Brings the companion up to date without ever failing the caller.
    ///
    /// A failed check falls back to the existing binary; a failed install
    /// yields `None` so a partial directory is never launched.
    #[must_use]
    pub fn prepare(&self) -> Option<PreparedCompanion> {
        let binary = self.binary_path();

        if env::var_os(NO_UPDATE_ENV).is_some() {
            info!("[UPDATE] {} update skipped ({} set)", self.name, NO_UPDATE_ENV);
            return binary.is_file().then(|| PreparedCompanion {
                binary,
                remote: read_local_descriptor(&self.target_dir),
                updated: false,
            });
        }

        match self.ensure_current() {
            Ok(status) => {
                let updated = matches!(status, UpdateStatus::Updated(_));
                Some(PreparedCompanion {
                    binary,
                    remote: Some(status.remote().clone()),
                    updated,
                })
            }
            Err(e @ (UpdateError::Network(_) | UpdateError::Parse(_))) => {
                warn!("[UPDATE] Version check for {} failed: {}", self.name, e);
                if binary.is_file() {
                    info!("[UPDATE] Using existing {}", binary.display());
                    Some(PreparedCompanion {
                        binary,
                        remote: None,
                        updated: false,
                    })
                } else {
                    None
                }
            }
            Err(e) => {
                error!("[UPDATE] Update of {} failed: {}", self.name, e);
                None
            }
        }
    }
}

/// Syncs a secondary data directory keyed on a companion's version.
pub struct DataSync {
    source: Arc<dyn UpdateSource>,
    target_dir: PathBuf,
}

impl DataSync {
    /// Creates a sync for `target_dir`.
    #[must_use]
    pub fn new(source: Arc<dyn UpdateSource>, target_dir: impl Into<PathBuf>) -> Self {
        Self {
            source,
            target_dir: target_dir.into(),
        }
    }

    /// Returns the version the directory was last synced to.
    #[must_use]
    pub fn synced_version(&self) -> Option<String> {
        fs::read_to_string(self.target_dir.join(DATA_MARKER_FILE))
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    /// Installs the data archive unless the directory is already at `version`.
    ///
    /// Returns true if the archive was installed.
    pub fn sync(&self, version: &str) -> Result<bool, UpdateError> {
        if self.synced_version().as_deref() == Some(version.trim()) {
            return Ok(false);
        }

        install_archive(self.source.as_ref(), &self.target_dir)?;
        fs::write(self.target_dir.join(DATA_MARKER_FILE), version.trim())?;
        info!(
            "[UPDATE] Synced {} to {}",
            self.target_dir.display(),
            version
        );
        Ok(true)
    }
}
