//! Self-updating rich presence reporter.
//!
//! Keeps a companion binary current and supervises it for the lifetime of
//! the game, restarting it after crashes within the configured limits.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::addons::process::{CompanionProcess, RestartPolicy, kill_pid};
use crate::addons::{
    Addon, AddonError, CancellationToken, GameProcess, NotifyOnClose, PersistentAddon,
};
use crate::config::LauncherSettings;
use crate::updater::{
    CompanionUpdater, DEFAULT_CONNECT_TIMEOUT, HttpUpdateSource, UpdateSource, VersionMatch,
};

const SUPERVISE_INTERVAL: Duration = Duration::from_millis(500);

fn default_binary() -> String {
    if cfg!(windows) {
        "Presence.exe".to_string()
    } else {
        "presence".to_string()
    }
}

fn default_max_restarts() -> u32 {
    3
}

/// Settings for the presence addon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceConfig {
    /// Base URL serving `version` and `latest.zip`.
    pub remote: String,
    /// Binary name inside the archive.
    #[serde(default = "default_binary")]
    pub binary: String,
    /// Version comparison strategy.
    #[serde(default)]
    pub version_match: VersionMatch,
    /// Restart the companion when it crashes.
    #[serde(default)]
    pub restart_on_crash: bool,
    /// Restart limit per session.
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
}

struct Session {
    updater: CompanionUpdater,
}

/// Persistent addon supervising the presence companion.
pub struct PresenceAddon {
    config: PresenceConfig,
    source: Option<Arc<dyn UpdateSource>>,
    session: Option<Session>,
    /// Pid of the companion while it runs, for teardown.
    last_pid: Mutex<Option<u32>>,
}

impl PresenceAddon {
    /// Creates the addon using the configured HTTP source.
    #[must_use]
    pub fn new(config: PresenceConfig) -> Self {
        Self {
            config,
            source: None,
            session: None,
            last_pid: Mutex::new(None),
        }
    }

    /// Replaces the remote source.
    #[must_use]
    pub fn with_source(mut self, source: Arc<dyn UpdateSource>) -> Self {
        self.source = Some(source);
        self
    }

    fn record_pid(&self, pid: Option<u32>) {
        if let Ok(mut guard) = self.last_pid.lock() {
            *guard = pid;
        }
    }

    fn policy(&self) -> RestartPolicy {
        RestartPolicy {
            restart_on_crash: self.config.restart_on_crash,
            max_restarts: self.config.max_restarts,
            ..RestartPolicy::default()
        }
    }
}

impl Addon for PresenceAddon {
    fn name(&self) -> String {
        "Rich Presence".to_string()
    }

    fn setup(
        &mut self,
        _game: &Arc<GameProcess>,
        settings: &LauncherSettings,
    ) -> Result<(), AddonError> {
        let source: Arc<dyn UpdateSource> = match self.source.clone() {
            Some(source) => source,
            None if self.config.remote.trim().is_empty() => {
                return Err(AddonError::InvalidConfig(
                    "presence remote is empty".to_string(),
                ));
            }
            None => Arc::new(HttpUpdateSource::with_timeouts(
                self.config.remote.as_str(),
                DEFAULT_CONNECT_TIMEOUT,
                settings.update_timeout(),
            )?),
        };

        let updater = CompanionUpdater::new(
            self.name(),
            source,
            settings.addon_dir("Presence"),
            self.config.binary.clone(),
        )
        .with_strategy(self.config.version_match);

        self.session = Some(Session { updater });
        Ok(())
    }

    fn as_persistent(&self) -> Option<&dyn PersistentAddon> {
        Some(self)
    }

    fn as_notify_on_close(&self) -> Option<&dyn NotifyOnClose> {
        Some(self)
    }
}

impl PersistentAddon for PresenceAddon {
    fn do_work(&self, game: &GameProcess, cancel: &CancellationToken) -> Result<(), AddonError> {
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| AddonError::NotSetUp(self.name()))?;

        let Some(prepared) = session.updater.prepare() else {
            warn!("[PRESENCE] No usable companion, not starting");
            return Ok(());
        };

        if cancel.is_cancelled() {
            return Ok(());
        }

        let mut companion = CompanionProcess::new(self.name(), &prepared.binary)
            .args(vec![game.pid().to_string()])
            .working_dir(session.updater.target_dir())
            .hidden()
            .restart_policy(self.policy());
        companion.start()?;
        self.record_pid(companion.pid());

        while !cancel.wait_timeout(SUPERVISE_INTERVAL) {
            if game.has_exited() {
                info!("[PRESENCE] Game exited, stopping companion");
                break;
            }

            companion.check_status();
            if companion.restart_if_due() {
                self.record_pid(companion.pid());
            }
        }

        companion.stop();
        self.record_pid(None);
        Ok(())
    }
}

impl NotifyOnClose for PresenceAddon {
    fn game_closed(&self) -> Result<(), AddonError> {
        let leftover = self.last_pid.lock().ok().and_then(|mut guard| guard.take());
        if let Some(pid) = leftover {
            if kill_pid(pid) {
                info!("[PRESENCE] Killed leftover companion {}", pid);
            }
        }
        Ok(())
    }
}
