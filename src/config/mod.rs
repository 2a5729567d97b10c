//! Configuration module for addonhost.
//!
//! Handles loading and parsing the `addons.toml` configuration file.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::addons::StartPhase;
use crate::addons::builtin::{
    BackupConfig, GenericAddonConfig, InjectorConfig, OtpRelayConfig, PresenceConfig, SyncConfig,
};
use crate::logging::LogConfig;

/// Default configuration file content.
const DEFAULT_CONFIG: &str = r#"# Addonhost Configuration File
# ============================
# This file is read when addonhost starts.

[settings]
# Game install root (contains game/ffxivgame.ver)
# game_path = "C:/Program Files (x86)/SquareEnix/FINAL FANTASY XIV - A Realm Reborn"

# Override the installed game version instead of reading ffxivgame.ver
# game_version = "2024.01.01.0000.0000"

# Client language: japanese, english, german, french
language = "english"

# DirectX 11 mode (the injector only runs with DirectX 11)
dx11 = true

# Delay before starting the injector, in milliseconds
injection_delay_ms = 0

# Timeout for update checks and downloads, in seconds
update_timeout_secs = 60

[logging]
enabled = true
level = "info"
retention_hours = 24

# Addons
# ------
# Each [[addons]] entry has a kind: generic, injector, presence, otp_relay,
# character_sync, character_backup. Common keys: enabled (default true) and start_at
# (launcher_initialized or game_launched).
#
# [[addons]]
# kind = "generic"
# path = "C:/Tools/overlay.exe"
# command_line = "--minimized"
# run_as_admin = false
# run_on_close = false
# kill_after_close = true
#
# [[addons]]
# kind = "injector"
# remote = "https://example.org/injector"
# assets_remote = "https://example.org/injector-assets"
#
# [[addons]]
# kind = "presence"
# remote = "https://example.org/presence"
#
# [[addons]]
# kind = "otp_relay"
# http_port = 4646
#
# [[addons]]
# kind = "character_sync"
#
# [[addons]]
# kind = "character_backup"
# keep = 3
"#;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File could not be read or written.
    #[error("Config IO error at {}: {source}", path.display())]
    Io {
        /// Config file path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// File is not valid configuration.
    #[error("Invalid config {}: {source}", path.display())]
    Parse {
        /// Config file path.
        path: PathBuf,
        /// Parser error.
        #[source]
        source: toml::de::Error,
    },
}

/// Game client language.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientLanguage {
    /// Japanese client.
    Japanese,
    /// English client.
    #[default]
    English,
    /// German client.
    German,
    /// French client.
    French,
}

impl ClientLanguage {
    /// Numeric language id passed to companions.
    #[must_use]
    pub fn id(self) -> u8 {
        match self {
            Self::Japanese => 0,
            Self::English => 1,
            Self::German => 2,
            Self::French => 3,
        }
    }
}

/// Launch-time context handed to every addon's `setup`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LauncherSettings {
    /// Game install root.
    pub game_path: PathBuf,
    /// Installed game version override.
    pub game_version: Option<String>,
    /// Client language.
    pub language: ClientLanguage,
    /// DirectX 11 mode active.
    pub dx11: bool,
    /// Opt out of market board data collection.
    pub opt_out_mb_collection: bool,
    /// Delay before the injector starts, in milliseconds.
    pub injection_delay_ms: u64,
    /// Discord webhook for in-game notifications.
    pub discord_webhook_url: Option<String>,
    /// RMT chat filter.
    pub rmt_filter: bool,
    /// Chat notifications.
    pub chat_notifications: bool,
    /// Duty finder notifications.
    pub cf_notifications: bool,
    /// Root for addon directories and logs.
    pub data_dir: PathBuf,
    /// Total timeout for update requests, in seconds.
    pub update_timeout_secs: u64,
}

impl Default for LauncherSettings {
    fn default() -> Self {
        Self {
            game_path: PathBuf::new(),
            game_version: None,
            language: ClientLanguage::default(),
            dx11: true,
            opt_out_mb_collection: false,
            injection_delay_ms: 0,
            discord_webhook_url: None,
            rmt_filter: false,
            chat_notifications: false,
            cf_notifications: false,
            data_dir: default_data_dir(),
            update_timeout_secs: 60,
        }
    }
}

impl LauncherSettings {
    /// Returns the installed game version.
    ///
    /// Uses the override when set, else reads `game/ffxivgame.ver`.
    #[must_use]
    pub fn installed_game_version(&self) -> Option<String> {
        if let Some(ref version) = self.game_version {
            return Some(version.trim().to_string());
        }

        fs::read_to_string(self.game_path.join("game").join("ffxivgame.ver"))
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    /// Directory for an addon's files.
    #[must_use]
    pub fn addon_dir(&self, name: &str) -> PathBuf {
        self.data_dir.join("addons").join(name)
    }

    /// Total timeout for update requests.
    #[must_use]
    pub fn update_timeout(&self) -> Duration {
        Duration::from_secs(self.update_timeout_secs.max(1))
    }
}

/// Returns the data root (~/.addonhost).
#[must_use]
pub fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".addonhost")
}

fn default_true() -> bool {
    true
}

/// Addon kind with its kind-specific settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AddonKind {
    /// External executable or script.
    Generic(GenericAddonConfig),
    /// Self-updating injection bootstrapper.
    Injector(InjectorConfig),
    /// Self-updating presence reporter.
    Presence(PresenceConfig),
    /// One-time password relay.
    OtpRelay(OtpRelayConfig),
    /// Character settings sync across characters.
    CharacterSync(SyncConfig),
    /// Character settings backup.
    CharacterBackup(BackupConfig),
}

impl AddonKind {
    /// Phase used when the entry does not set `start_at`.
    #[must_use]
    pub fn default_phase(&self) -> StartPhase {
        match self {
            Self::OtpRelay(_) => StartPhase::LauncherInitialized,
            _ => StartPhase::GameLaunched,
        }
    }
}

/// One `[[addons]]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddonSpec {
    /// Disabled entries are skipped.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Start phase override.
    #[serde(default)]
    pub start_at: Option<StartPhase>,
    /// Kind-specific settings.
    #[serde(flatten)]
    pub kind: AddonKind,
}

impl AddonSpec {
    /// Effective start phase.
    #[must_use]
    pub fn phase(&self) -> StartPhase {
        self.start_at.unwrap_or_else(|| self.kind.default_phase())
    }
}

/// Application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Launch-time settings.
    pub settings: LauncherSettings,
    /// Logging configuration.
    pub logging: LogConfig,
    /// Configured addons, in start order.
    pub addons: Vec<AddonSpec>,
    /// Path the configuration was loaded from.
    #[serde(skip)]
    pub config_path: PathBuf,
}

impl Config {
    /// Returns the default config file path (~/.addonhost/addons.toml).
    #[must_use]
    pub fn default_config_path() -> PathBuf {
        default_data_dir().join("addons.toml")
    }

    /// Parses configuration text.
    pub fn parse(content: &str, path: &Path) -> Result<Self, ConfigError> {
        let mut config: Self = toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.logging = config.logging.normalized();
        config.config_path = path.to_path_buf();
        Ok(config)
    }

    /// Loads configuration from a specific path.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content, path)
    }

    /// Loads configuration, writing the documented default file first if
    /// none exists.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            Self::create_default_config(path).map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        }
        Self::load(path)
    }

    fn create_default_config(path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, DEFAULT_CONFIG)
    }
}
