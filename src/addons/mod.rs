//! Add-ons system for Addonhost.
//!
//! This module provides the capability model for companion addons and the
//! session-scoped manager that starts, supervises and stops them alongside
//! a monitored game process.
//!
//! # Architecture
//!
//! - **types**: Capability traits (`Addon`, `RunnableAddon`, `PersistentAddon`,
//!   `NotifyOnClose`) and `AddonError`
//! - **entry**: Configured entries with their start phase
//! - **cancel**: Cooperative cancellation for persistent workers
//! - **game**: Read-only handle to the monitored game process
//! - **process**: Companion process spawning and inspection
//! - **manager**: Session orchestration (`run_addons` / `stop_addons`)
//! - **builtin**: The concrete addons shipped with addonhost
//!
//! # Usage
//!
//! ```ignore
//! use addonhost::addons::{partition_entries, AddonManager, StartPhase};
//!
//! let (services, session) = partition_entries(entries, StartPhase::LauncherInitialized);
//! let mut manager = AddonManager::new();
//! manager.run_addons(&game, &settings, session)?;
//! // ... wait for the game to exit
//! manager.stop_addons();
//! ```

pub mod builtin;
mod cancel;
mod entry;
mod game;
mod manager;
pub mod process;
mod types;

pub use cancel::CancellationToken;
pub use entry::{AddonEntry, StartPhase, partition_entries};
pub use game::GameProcess;
pub use manager::{AddonFailure, AddonManager, FailureStage, ManagerError, RunReport};
pub use types::{
    Addon, AddonError, AddonState, NotifyOnClose, PersistentAddon, RunnableAddon,
};
