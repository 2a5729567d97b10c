//! Self-updating injection bootstrapper.
//!
//! Keeps the injector binary and its asset set current, then starts it
//! against the game process with the launcher-resolved configuration
//! passed as base64-encoded JSON.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::addons::process::spawn_detached;
use crate::addons::{Addon, AddonError, GameProcess, RunnableAddon};
use crate::config::LauncherSettings;
use crate::updater::{
    CompanionUpdater, DEFAULT_CONNECT_TIMEOUT, DataSync, HttpUpdateSource, UpdateSource,
    VersionMatch, read_local_descriptor,
};

fn default_binary() -> String {
    if cfg!(windows) {
        "Injector.exe".to_string()
    } else {
        "injector".to_string()
    }
}

/// Settings for the injector addon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InjectorConfig {
    /// Base URL serving `version` and `latest.zip`.
    pub remote: String,
    /// Binary name inside the archive.
    #[serde(default = "default_binary")]
    pub binary: String,
    /// Base URL of the asset archive, if any.
    #[serde(default)]
    pub assets_remote: Option<String>,
    /// Version comparison strategy.
    #[serde(default)]
    pub version_match: VersionMatch,
}

/// Configuration handed to the injector on its command line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InjectorStartInfo {
    /// Injector directory.
    pub working_directory: String,
    /// Installed plugins.
    pub plugin_directory: String,
    /// Development plugins.
    pub default_plugin_directory: String,
    /// Asset directory.
    pub asset_directory: String,
    /// Injector configuration file.
    pub configuration_path: String,
    /// Client language id.
    pub language: u8,
    /// Installed game version.
    pub game_version: String,
    /// Market board collection opt-out.
    pub opt_out_mb_collection: bool,
    /// Notification webhook.
    pub discord_webhook_url: Option<String>,
    /// RMT filter.
    pub rmt_filter: bool,
    /// Chat notifications.
    pub chat_notifications: bool,
    /// Duty finder notifications.
    pub cf_notifications: bool,
}

impl InjectorStartInfo {
    /// JSON, then base64, so the value survives any argument quoting.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        Ok(STANDARD.encode(serde_json::to_vec(self)?))
    }
}

/// Values captured by `setup`.
struct Session {
    settings: LauncherSettings,
    updater: CompanionUpdater,
    assets: Option<DataSync>,
}

/// Runnable addon starting the injector.
pub struct InjectorAddon {
    config: InjectorConfig,
    source: Option<Arc<dyn UpdateSource>>,
    assets_source: Option<Arc<dyn UpdateSource>>,
    session: Option<Session>,
}

impl InjectorAddon {
    /// Creates the addon using HTTP sources from the configuration.
    #[must_use]
    pub fn new(config: InjectorConfig) -> Self {
        Self {
            config,
            source: None,
            assets_source: None,
            session: None,
        }
    }

    /// Replaces the remote sources.
    #[must_use]
    pub fn with_sources(
        mut self,
        source: Arc<dyn UpdateSource>,
        assets: Option<Arc<dyn UpdateSource>>,
    ) -> Self {
        self.source = Some(source);
        self.assets_source = assets;
        self
    }

    fn http(url: &str, settings: &LauncherSettings) -> Result<Arc<dyn UpdateSource>, AddonError> {
        Ok(Arc::new(HttpUpdateSource::with_timeouts(
            url,
            DEFAULT_CONNECT_TIMEOUT,
            settings.update_timeout(),
        )?))
    }

    fn plugin_dirs(settings: &LauncherSettings) -> (PathBuf, PathBuf) {
        (
            settings.data_dir.join("installedPlugins"),
            settings.data_dir.join("devPlugins"),
        )
    }
}

impl Addon for InjectorAddon {
    fn name(&self) -> String {
        "Injector".to_string()
    }

    fn setup(
        &mut self,
        _game: &Arc<GameProcess>,
        settings: &LauncherSettings,
    ) -> Result<(), AddonError> {
        if self.config.remote.trim().is_empty() && self.source.is_none() {
            return Err(AddonError::InvalidConfig(
                "injector remote is empty".to_string(),
            ));
        }

        let source = match self.source.clone() {
            Some(source) => source,
            None => Self::http(&self.config.remote, settings)?,
        };
        let updater = CompanionUpdater::new(
            self.name(),
            source,
            settings.addon_dir("Injector"),
            self.config.binary.clone(),
        )
        .with_strategy(self.config.version_match);

        let assets_source = match (
            self.assets_source.clone(),
            self.config.assets_remote.as_deref(),
        ) {
            (Some(source), _) => Some(source),
            (None, Some(url)) => Some(Self::http(url, settings)?),
            (None, None) => None,
        };
        let assets =
            assets_source.map(|source| DataSync::new(source, settings.addon_dir("InjectorAssets")));

        self.session = Some(Session {
            settings: settings.clone(),
            updater,
            assets,
        });
        Ok(())
    }

    fn as_runnable(&self) -> Option<&dyn RunnableAddon> {
        Some(self)
    }
}

impl RunnableAddon for InjectorAddon {
    fn run(&self, game: &GameProcess) -> Result<(), AddonError> {
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| AddonError::NotSetUp(self.name()))?;
        let settings = &session.settings;

        if !settings.dx11 {
            info!("[INJECTOR] DirectX 11 is not active, skipping");
            return Ok(());
        }

        if settings.injection_delay_ms > 0 {
            thread::sleep(Duration::from_millis(settings.injection_delay_ms));
        }

        let Some(prepared) = session.updater.prepare() else {
            warn!("[INJECTOR] No usable injector, skipping");
            return Ok(());
        };

        let injector_dir = session.updater.target_dir().to_path_buf();
        let installed = settings.installed_game_version().unwrap_or_default();
        // The remote descriptor decides; the shipped one only stands in when
        // the check failed or was skipped.
        let descriptor = prepared
            .remote
            .clone()
            .or_else(|| read_local_descriptor(&injector_dir));

        if let Some(ref descriptor) = descriptor {
            if !descriptor.supports_game(&installed) {
                info!(
                    "[INJECTOR] Game version {:?} not supported (needs {:?}), skipping",
                    installed, descriptor.supported_game_version
                );
                return Ok(());
            }
        }

        let asset_dir = match session.assets {
            Some(ref assets) => {
                let version = descriptor
                    .as_ref()
                    .map(|d| d.version.clone())
                    .unwrap_or_default();
                assets.sync(&version)?;
                settings.addon_dir("InjectorAssets")
            }
            None => injector_dir.clone(),
        };

        let (plugins, dev_plugins) = Self::plugin_dirs(settings);
        fs::create_dir_all(&plugins)?;
        fs::create_dir_all(&dev_plugins)?;

        let start_info = InjectorStartInfo {
            working_directory: injector_dir.to_string_lossy().into_owned(),
            plugin_directory: plugins.to_string_lossy().into_owned(),
            default_plugin_directory: dev_plugins.to_string_lossy().into_owned(),
            asset_directory: asset_dir.to_string_lossy().into_owned(),
            configuration_path: settings
                .data_dir
                .join("injectorConfig.json")
                .to_string_lossy()
                .into_owned(),
            language: settings.language.id(),
            game_version: installed,
            opt_out_mb_collection: settings.opt_out_mb_collection,
            discord_webhook_url: settings.discord_webhook_url.clone(),
            rmt_filter: settings.rmt_filter,
            chat_notifications: settings.chat_notifications,
            cf_notifications: settings.cf_notifications,
        };

        let encoded = start_info
            .encode()
            .map_err(|e| AddonError::InvalidConfig(format!("start info: {}", e)))?;

        let args = vec![game.pid().to_string(), encoded];
        spawn_detached(
            &self.name(),
            &prepared.binary,
            &args,
            Some(injector_dir.as_path()),
            true,
        )?;

        info!("[INJECTOR] Started injector for pid {}", game.pid());
        Ok(())
    }
}
