//! One-time password relay addon.
//!
//! Publishes the launcher's OTP channel and starts the `otp-relay`
//! companion, which listens on a loopback HTTP port and forwards codes back
//! through the channel. Teardown goes through the channel as well, so a
//! relay started by an earlier launcher instance is also reached.

use std::env;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::addons::process::{CompanionProcess, kill_pid};
use crate::addons::{Addon, AddonError, GameProcess, NotifyOnClose, RunnableAddon};
use crate::config::LauncherSettings;
use crate::ipc::{ChannelClient, ChannelHandler, ChannelServer, DEFAULT_OTP_CHANNEL};
use crate::otp::{CHANNEL_ENV, DEFAULT_OTP_PORT, normalize_otp};
use crate::updater::{
    CompanionUpdater, DEFAULT_CONNECT_TIMEOUT, HttpUpdateSource, UpdateSource, VersionMatch,
};

/// Receives every accepted code.
pub type OtpCallback = Arc<dyn Fn(String) + Send + Sync>;

fn default_channel() -> String {
    DEFAULT_OTP_CHANNEL.to_string()
}

fn default_port() -> u16 {
    DEFAULT_OTP_PORT
}

fn default_purpose() -> String {
    "Login".to_string()
}

fn companion_file_name() -> String {
    format!("otp-relay{}", env::consts::EXE_SUFFIX)
}

/// Settings for the OTP relay addon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OtpRelayConfig {
    /// Channel published by the launcher.
    #[serde(default = "default_channel")]
    pub channel: String,
    /// Port the companion listens on.
    #[serde(default = "default_port")]
    pub http_port: u16,
    /// Tag passed to the companion.
    #[serde(default = "default_purpose")]
    pub purpose: String,
    /// Companion binary; the `otp-relay` next to this executable by default.
    #[serde(default)]
    pub companion_path: Option<PathBuf>,
    /// Base URL for a self-updated companion.
    #[serde(default)]
    pub remote: Option<String>,
    /// Version comparison strategy for `remote`.
    #[serde(default)]
    pub version_match: VersionMatch,
}

impl Default for OtpRelayConfig {
    fn default() -> Self {
        Self {
            channel: default_channel(),
            http_port: default_port(),
            purpose: default_purpose(),
            companion_path: None,
            remote: None,
            version_match: VersionMatch::default(),
        }
    }
}

/// Path of the `otp-relay` binary installed next to the current executable.
#[must_use]
pub fn default_companion_path() -> PathBuf {
    let name = companion_file_name();
    env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(&name)))
        .unwrap_or_else(|| PathBuf::from(name))
}

/// Launcher side of the OTP channel.
pub struct OtpChannelHandler {
    on_otp: OtpCallback,
    companion: Mutex<Option<CompanionProcess>>,
    registered: Mutex<Option<(u32, String)>>,
}

impl OtpChannelHandler {
    /// Creates a handler delivering codes to `on_otp`.
    #[must_use]
    pub fn new(on_otp: OtpCallback) -> Self {
        Self {
            on_otp,
            companion: Mutex::new(None),
            registered: Mutex::new(None),
        }
    }

    /// Tracks a companion started by this launcher.
    pub fn attach(&self, companion: CompanionProcess) {
        if let Ok(mut guard) = self.companion.lock() {
            *guard = Some(companion);
        }
    }

    /// Purpose announced by the companion, if it registered.
    #[must_use]
    pub fn registered_purpose(&self) -> Option<String> {
        self.registered
            .lock()
            .ok()
            .and_then(|guard| guard.as_ref().map(|(_, purpose)| purpose.clone()))
    }
}

impl ChannelHandler for OtpChannelHandler {
    fn register_callback(&self, pid: u32, purpose: &str) -> Result<(), String> {
        info!("[OTP] Companion {} registered for {}", pid, purpose);
        let mut guard = self.registered.lock().map_err(|e| e.to_string())?;
        *guard = Some((pid, purpose.to_string()));
        Ok(())
    }

    fn handle(&self) -> Option<u32> {
        let tracked = self
            .companion
            .lock()
            .ok()
            .and_then(|guard| guard.as_ref().and_then(CompanionProcess::pid));
        tracked.or_else(|| {
            self.registered
                .lock()
                .ok()
                .and_then(|guard| guard.as_ref().map(|(pid, _)| *pid))
        })
    }

    fn kill(&self) -> bool {
        let registered = self.registered.lock().ok().and_then(|mut g| g.take());

        let owned = self.companion.lock().ok().and_then(|mut g| g.take());
        if let Some(mut companion) = owned {
            companion.stop();
            return true;
        }

        match registered {
            Some((pid, _)) => kill_pid(pid),
            None => false,
        }
    }

    fn submit_otp(&self, code: &str) -> Result<(), String> {
        let code = normalize_otp(code).map_err(|e| e.to_string())?;
        (self.on_otp)(code);
        Ok(())
    }
}

/// Runnable addon owning the OTP channel and its companion.
pub struct OtpRelayAddon {
    config: OtpRelayConfig,
    on_otp: OtpCallback,
    source: Option<Arc<dyn UpdateSource>>,
    updater: Option<CompanionUpdater>,
    server: Mutex<Option<ChannelServer>>,
}

impl OtpRelayAddon {
    /// Creates the addon; accepted codes go to `on_otp`.
    #[must_use]
    pub fn new(config: OtpRelayConfig, on_otp: OtpCallback) -> Self {
        Self {
            config,
            on_otp,
            source: None,
            updater: None,
            server: Mutex::new(None),
        }
    }

    /// Replaces the remote source used for a self-updated companion.
    #[must_use]
    pub fn with_source(mut self, source: Arc<dyn UpdateSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Returns true while the channel is published.
    #[must_use]
    pub fn is_serving(&self) -> bool {
        self.server
            .lock()
            .map(|guard| guard.as_ref().is_some_and(ChannelServer::is_running))
            .unwrap_or(false)
    }

    fn companion_binary(&self) -> Option<PathBuf> {
        match self.updater {
            Some(ref updater) => updater.prepare().map(|prepared| prepared.binary),
            None => Some(
                self.config
                    .companion_path
                    .clone()
                    .unwrap_or_else(default_companion_path),
            ),
        }
    }

    /// Kills the companion through the channel, then withdraws the channel.
    ///
    /// Never fails; a channel that is already gone is not an error.
    pub fn stop(&self) {
        match ChannelClient::connect(&self.config.channel).and_then(|mut client| client.kill()) {
            Ok(killed) => debug!("[OTP] Kill through channel, killed: {}", killed),
            Err(e) => debug!("[OTP] Channel '{}' unreachable: {}", self.config.channel, e),
        }

        let server = self.server.lock().ok().and_then(|mut guard| guard.take());
        if let Some(mut server) = server {
            server.shutdown();
        }
    }
}

impl Addon for OtpRelayAddon {
    fn name(&self) -> String {
        "One-time Password Relay".to_string()
    }

    fn setup(
        &mut self,
        _game: &Arc<GameProcess>,
        settings: &LauncherSettings,
    ) -> Result<(), AddonError> {
        if self.config.channel.trim().is_empty() {
            return Err(AddonError::InvalidConfig("OTP channel is empty".to_string()));
        }

        let source = match (self.source.clone(), self.config.remote.as_deref()) {
            (Some(source), _) => Some(source),
            (None, Some(url)) => Some(Arc::new(HttpUpdateSource::with_timeouts(
                url,
                DEFAULT_CONNECT_TIMEOUT,
                settings.update_timeout(),
            )?) as Arc<dyn UpdateSource>),
            (None, None) => None,
        };

        self.updater = source.map(|source| {
            CompanionUpdater::new(
                self.name(),
                source,
                settings.addon_dir("OtpRelay"),
                companion_file_name(),
            )
            .with_strategy(self.config.version_match)
        });
        Ok(())
    }

    fn as_runnable(&self) -> Option<&dyn RunnableAddon> {
        Some(self)
    }

    fn as_notify_on_close(&self) -> Option<&dyn NotifyOnClose> {
        Some(self)
    }
}

impl RunnableAddon for OtpRelayAddon {
    fn run(&self, _game: &GameProcess) -> Result<(), AddonError> {
        if self.is_serving() {
            return Ok(());
        }

        let Some(binary) = self.companion_binary() else {
            warn!("[OTP] No usable relay companion, skipping");
            return Ok(());
        };

        let handler = Arc::new(OtpChannelHandler::new(Arc::clone(&self.on_otp)));
        let shared: Arc<dyn ChannelHandler> = handler.clone();
        let mut server = ChannelServer::start(&self.config.channel, shared)?;

        let mut companion = CompanionProcess::new(self.name(), &binary)
            .args(vec![
                self.config.http_port.to_string(),
                self.config.purpose.clone(),
            ])
            .env(CHANNEL_ENV, self.config.channel.as_str())
            .hidden();
        if let Some(dir) = binary.parent().filter(|p| !p.as_os_str().is_empty()) {
            companion = companion.working_dir(dir);
        }

        if let Err(e) = companion.start() {
            server.shutdown();
            return Err(e);
        }
        handler.attach(companion);

        info!(
            "[OTP] Relay published on '{}', companion port {}",
            self.config.channel, self.config.http_port
        );
        if let Ok(mut guard) = self.server.lock() {
            *guard = Some(server);
        }
        Ok(())
    }
}

impl NotifyOnClose for OtpRelayAddon {
    fn game_closed(&self) -> Result<(), AddonError> {
        self.stop();
        Ok(())
    }
}

impl Drop for OtpRelayAddon {
    fn drop(&mut self) {
        if self.is_serving() {
            self.stop();
        }
    }
}
