//! Add-on capability definitions.
//!
//! Every addon implements [`Addon`]. The optional capabilities are separate
//! traits reached through the `as_*` accessors, so one instance can combine
//! any of them (a persistent addon that also wants to hear about the game
//! closing, for example).

use std::io;
use std::sync::Arc;

use thiserror::Error;

use super::cancel::CancellationToken;
use super::game::GameProcess;
use crate::config::LauncherSettings;
use crate::ipc::IpcError;
use crate::updater::UpdateError;

/// Base addon interface.
pub trait Addon: Send + Sync {
    /// Display name used in logs and reports.
    fn name(&self) -> String;

    /// Captures launch-time context. Called once per session, before any
    /// capability is exercised.
    fn setup(
        &mut self,
        game: &Arc<GameProcess>,
        settings: &LauncherSettings,
    ) -> Result<(), AddonError>;

    /// Returns the runnable capability, if supported.
    fn as_runnable(&self) -> Option<&dyn RunnableAddon> {
        None
    }

    /// Returns the persistent capability, if supported.
    fn as_persistent(&self) -> Option<&dyn PersistentAddon> {
        None
    }

    /// Returns the notify-on-close capability, if supported.
    fn as_notify_on_close(&self) -> Option<&dyn NotifyOnClose> {
        None
    }
}

/// One synchronous action at session start.
pub trait RunnableAddon {
    /// Runs the addon on the caller's thread.
    fn run(&self, game: &GameProcess) -> Result<(), AddonError>;
}

/// Continuous background work on a dedicated worker thread.
pub trait PersistentAddon {
    /// Work loop. Must poll `cancel` between units of work and return
    /// promptly once it is cancelled.
    fn do_work(&self, game: &GameProcess, cancel: &CancellationToken) -> Result<(), AddonError>;
}

/// Told when the monitored game process has exited.
pub trait NotifyOnClose {
    /// Called once during teardown, after the addon's worker (if any) joined.
    fn game_closed(&self) -> Result<(), AddonError>;
}

/// Lifecycle state of an addon within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddonState {
    /// Setup has not completed (not yet called, or failed).
    Uninitialized,
    /// Setup succeeded.
    Configured,
    /// Started without a worker thread.
    Idle,
    /// Persistent worker thread is live.
    Running,
    /// Torn down.
    Stopped,
}

impl AddonState {
    /// Returns true if the addon has been torn down.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        matches!(self, Self::Stopped)
    }
}

/// Add-on error types.
#[derive(Debug, Error)]
pub enum AddonError {
    /// Addon was used before `setup`.
    #[error("Addon '{0}' was not set up")]
    NotSetUp(String),

    /// Invalid addon configuration.
    #[error("Invalid addon configuration: {0}")]
    InvalidConfig(String),

    /// Companion process failed to start.
    #[error("Failed to start '{name}': {source}")]
    Spawn {
        /// What was being started.
        name: String,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// The user dismissed the elevation prompt.
    #[error("Elevation declined for '{0}'")]
    ElevationDeclined(String),

    /// Companion update failed.
    #[error("Update error: {0}")]
    Update(#[from] UpdateError),

    /// Local channel failure.
    #[error("IPC error: {0}")]
    Ipc(#[from] IpcError),

    /// File system error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Addon code panicked.
    #[error("Addon panicked: {0}")]
    Panicked(String),
}

impl AddonError {
    /// Returns true for failures that must be swallowed rather than reported.
    #[must_use]
    pub fn is_benign(&self) -> bool {
        matches!(self, Self::ElevationDeclined(_))
    }
}
