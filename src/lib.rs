//! Addonhost
//!
//! Launches and supervises companion "addons" alongside a monitored game
//! process: helper executables and scripts, self-updating companion
//! binaries, and a one-time-password relay.
//!
//! # Architecture
//!
//! - **Addons Module**: capability traits, session manager, built-in addons
//! - **Updater Module**: shared self-update protocol for companion binaries
//! - **IPC Module**: named local channel with a length-prefixed protocol
//! - **OTP Module**: loopback HTTP listener used by the OTP companion
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use addonhost::addons::{AddonManager, GameProcess};
//! use addonhost::config::LauncherSettings;
//!
//! let game = Arc::new(GameProcess::attach(4242));
//! let mut manager = AddonManager::new();
//! let report = manager
//!     .run_addons(&game, &LauncherSettings::default(), Vec::new())
//!     .expect("no session active");
//! assert!(report.failures.is_empty());
//! manager.stop_addons();
//! ```

// Clippy configuration - allow common patterns
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::struct_excessive_bools)]

pub mod addons;
pub mod config;
pub mod ipc;
pub mod logging;
pub mod otp;
pub mod updater;

// Re-export main types
pub use addons::{Addon, AddonEntry, AddonError, AddonManager, GameProcess, StartPhase};
pub use config::{Config, LauncherSettings};
