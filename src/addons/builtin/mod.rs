//! Built-in addons and their construction from configuration.

mod backup;
mod generic;
mod injector;
mod otp_relay;
mod presence;
mod sync;

use std::sync::Arc;

pub use backup::{BackupConfig, CharacterBackupAddon, default_character_dir, prune_backups};
pub use generic::{GenericAddon, GenericAddonConfig, Interpreters};
pub use injector::{InjectorAddon, InjectorConfig, InjectorStartInfo};
pub use otp_relay::{
    OtpCallback, OtpChannelHandler, OtpRelayAddon, OtpRelayConfig, default_companion_path,
};
pub use presence::{PresenceAddon, PresenceConfig};
pub use sync::{
    CharacterSyncAddon, SyncConfig, SyncOutcome, character_folders, sync_characters,
};

use super::{Addon, AddonEntry};
use crate::config::{AddonKind, AddonSpec};

/// Builds one addon instance from its configuration.
#[must_use]
pub fn build_addon(
    kind: &AddonKind,
    interpreters: &Arc<Interpreters>,
    on_otp: &OtpCallback,
) -> Box<dyn Addon> {
    match kind {
        AddonKind::Generic(config) => {
            Box::new(GenericAddon::new(config.clone(), Arc::clone(interpreters)))
        }
        AddonKind::Injector(config) => Box::new(InjectorAddon::new(config.clone())),
        AddonKind::Presence(config) => Box::new(PresenceAddon::new(config.clone())),
        AddonKind::OtpRelay(config) => {
            Box::new(OtpRelayAddon::new(config.clone(), Arc::clone(on_otp)))
        }
        AddonKind::CharacterBackup(config) => Box::new(CharacterBackupAddon::new(config.clone())),
        AddonKind::CharacterSync(config) => Box::new(CharacterSyncAddon::new(config.clone())),
    }
}

/// Builds entries for every configured addon, in configuration order.
#[must_use]
pub fn build_entries(
    specs: &[AddonSpec],
    interpreters: &Arc<Interpreters>,
    on_otp: &OtpCallback,
) -> Vec<AddonEntry> {
    specs
        .iter()
        .map(|spec| AddonEntry {
            is_enabled: spec.enabled,
            start_at: spec.phase(),
            addon: build_addon(&spec.kind, interpreters, on_otp),
        })
        .collect()
}
