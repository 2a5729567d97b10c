//! Configured addon entries.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::types::Addon;

/// When an entry is started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartPhase {
    /// As soon as the launcher is up, before any game exists.
    LauncherInitialized,
    /// Once the game process has been started.
    #[default]
    GameLaunched,
}

/// One configured addon.
pub struct AddonEntry {
    /// Disabled entries are never set up.
    pub is_enabled: bool,
    /// Phase the entry belongs to.
    pub start_at: StartPhase,
    /// The addon instance, owned by the entry.
    pub addon: Box<dyn Addon>,
}

impl AddonEntry {
    /// Creates an enabled game-phase entry.
    #[must_use]
    pub fn new(addon: Box<dyn Addon>) -> Self {
        Self {
            is_enabled: true,
            start_at: StartPhase::GameLaunched,
            addon,
        }
    }

    /// Sets the start phase.
    #[must_use]
    pub fn with_start_at(mut self, phase: StartPhase) -> Self {
        self.start_at = phase;
        self
    }

    /// Marks the entry as disabled.
    #[must_use]
    pub fn disabled(mut self) -> Self {
        self.is_enabled = false;
        self
    }
}

impl fmt::Debug for AddonEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddonEntry")
            .field("is_enabled", &self.is_enabled)
            .field("start_at", &self.start_at)
            .field("addon", &self.addon.name())
            .finish()
    }
}

/// Splits entries into the enabled ones of `phase` and everything else.
///
/// Both halves keep their original order.
#[must_use]
pub fn partition_entries(
    entries: Vec<AddonEntry>,
    phase: StartPhase,
) -> (Vec<AddonEntry>, Vec<AddonEntry>) {
    entries
        .into_iter()
        .partition(|e| e.is_enabled && e.start_at == phase)
}
