//! Session-scoped addon orchestration.

use std::any::Any;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::cancel::CancellationToken;
use super::entry::AddonEntry;
use super::game::GameProcess;
use super::types::{Addon, AddonError, AddonState};
use crate::config::LauncherSettings;

/// Default bounded wait for each worker during teardown.
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(10);

const JOIN_POLL: Duration = Duration::from_millis(20);

/// Where in the start sequence an addon failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureStage {
    /// `setup` returned an error or panicked.
    Setup,
    /// `run` returned an error or panicked.
    Run,
    /// The worker thread could not be spawned.
    Spawn,
}

impl fmt::Display for FailureStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Setup => "setup",
            Self::Run => "run",
            Self::Spawn => "spawn",
        };
        f.write_str(s)
    }
}

/// A single addon failure collected during `run_addons`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddonFailure {
    /// Addon display name.
    pub addon: String,
    /// Failing step.
    pub stage: FailureStage,
    /// Rendered error.
    pub message: String,
}

impl fmt::Display for AddonFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.addon, self.stage, self.message)
    }
}

/// Manager errors.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// `run_addons` was called while a session is active.
    #[error("An addon session is already active")]
    SessionAlreadyActive,

    /// One or more addons failed to start.
    #[error("Addons: {}", join_failures(.0))]
    Addons(Vec<AddonFailure>),
}

fn join_failures(failures: &[AddonFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Outcome of a `run_addons` pass.
#[derive(Debug, Default, Clone)]
pub struct RunReport {
    /// Addons whose setup succeeded, in start order.
    pub started: Vec<String>,
    /// Isolated per-addon failures.
    pub failures: Vec<AddonFailure>,
}

impl RunReport {
    /// Converts collected failures into [`ManagerError::Addons`].
    pub fn into_result(self) -> Result<Vec<String>, ManagerError> {
        if self.failures.is_empty() {
            Ok(self.started)
        } else {
            Err(ManagerError::Addons(self.failures))
        }
    }
}

/// One enabled addon within a session.
struct SessionSlot {
    name: String,
    /// Absent when setup never completed.
    addon: Option<Arc<dyn Addon>>,
    worker: Option<JoinHandle<()>>,
    cancel: Option<CancellationToken>,
    state: AddonState,
}

/// Starts addons for a game session and tears them down afterwards.
pub struct AddonManager {
    /// Present exactly while a session is active.
    session: Option<Vec<SessionSlot>>,
    /// Final states of the last stopped session, kept until the next run.
    last_states: Vec<(String, AddonState)>,
    join_timeout: Duration,
}

impl Default for AddonManager {
    fn default() -> Self {
        Self::new()
    }
}

impl AddonManager {
    /// Creates a manager with no active session.
    #[must_use]
    pub fn new() -> Self {
        Self {
            session: None,
            last_states: Vec::new(),
            join_timeout: DEFAULT_JOIN_TIMEOUT,
        }
    }

    /// Sets the per-worker bounded wait used by `stop_addons`.
    #[must_use]
    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    /// Returns true while a session is active.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.session.is_some()
    }

    /// Returns the state of each enabled addon in the active session, or in
    /// the last stopped one when no session is active.
    ///
    /// Addons whose setup failed stay `Uninitialized`.
    #[must_use]
    pub fn states(&self) -> Vec<(String, AddonState)> {
        let Some(ref slots) = self.session else {
            return self.last_states.clone();
        };

        slots
            .iter()
            .map(|slot| {
                let state = match (&slot.worker, slot.state) {
                    (Some(handle), AddonState::Running) if handle.is_finished() => {
                        AddonState::Idle
                    }
                    (_, state) => state,
                };
                (slot.name.clone(), state)
            })
            .collect()
    }

    /// Sets up and starts every enabled entry, in list order.
    ///
    /// Failures are isolated per addon and collected in the report; only an
    /// already active session is an error.
    pub fn run_addons(
        &mut self,
        game: &Arc<GameProcess>,
        settings: &LauncherSettings,
        entries: Vec<AddonEntry>,
    ) -> Result<RunReport, ManagerError> {
        if self.session.is_some() {
            return Err(ManagerError::SessionAlreadyActive);
        }

        info!(
            "[ADDONS] Starting {} addon(s) for pid {}",
            entries.len(),
            game.pid()
        );

        self.last_states.clear();
        let mut report = RunReport::default();
        let mut slots = Vec::with_capacity(entries.len());

        for entry in entries {
            if !entry.is_enabled {
                debug!("[ADDONS] Skipping disabled addon {}", entry.addon.name());
                continue;
            }

            let mut addon = entry.addon;
            let name = addon.name();

            let setup = catch_unwind(AssertUnwindSafe(|| addon.setup(game, settings)))
                .unwrap_or_else(|payload| Err(AddonError::Panicked(panic_message(&*payload))));
            if let Err(e) = setup {
                error!("[ADDONS] Setup of {} failed: {}", name, e);
                report.failures.push(AddonFailure {
                    addon: name.clone(),
                    stage: FailureStage::Setup,
                    message: e.to_string(),
                });
                slots.push(SessionSlot {
                    name,
                    addon: None,
                    worker: None,
                    cancel: None,
                    state: AddonState::Uninitialized,
                });
                continue;
            }

            let addon: Arc<dyn Addon> = Arc::from(addon);
            let mut slot = SessionSlot {
                name: name.clone(),
                addon: Some(Arc::clone(&addon)),
                worker: None,
                cancel: None,
                state: AddonState::Configured,
            };

            if addon.as_persistent().is_some() {
                let token = CancellationToken::new();
                match spawn_worker(&name, Arc::clone(&addon), Arc::clone(game), token.clone()) {
                    Ok(handle) => {
                        slot.worker = Some(handle);
                        slot.cancel = Some(token);
                        slot.state = AddonState::Running;
                    }
                    Err(e) => {
                        error!("[ADDONS] Could not start worker for {}: {}", name, e);
                        report.failures.push(AddonFailure {
                            addon: name.clone(),
                            stage: FailureStage::Spawn,
                            message: e.to_string(),
                        });
                    }
                }
            }

            if let Some(runnable) = addon.as_runnable() {
                let result = catch_unwind(AssertUnwindSafe(|| runnable.run(game)))
                    .unwrap_or_else(|payload| {
                        Err(AddonError::Panicked(panic_message(&*payload)))
                    });
                match result {
                    Ok(()) => debug!("[ADDONS] Ran {}", name),
                    Err(e) if e.is_benign() => info!("[ADDONS] {}: {}", name, e),
                    Err(e) => {
                        error!("[ADDONS] Run of {} failed: {}", name, e);
                        report.failures.push(AddonFailure {
                            addon: name.clone(),
                            stage: FailureStage::Run,
                            message: e.to_string(),
                        });
                    }
                }
            }

            if slot.state == AddonState::Configured {
                slot.state = AddonState::Idle;
            }

            report.started.push(name);
            slots.push(slot);
        }

        info!(
            "[ADDONS] Session started: {} addon(s), {} failure(s)",
            report.started.len(),
            report.failures.len()
        );

        self.session = Some(slots);
        Ok(report)
    }

    /// Cancels, joins and notifies every addon of the active session.
    ///
    /// Does nothing when no session is active.
    pub fn stop_addons(&mut self) {
        let Some(mut slots) = self.session.take() else {
            return;
        };

        info!("[ADDONS] Stopping {} addon(s)", slots.len());

        for slot in &slots {
            if let Some(ref token) = slot.cancel {
                token.cancel();
            }
        }

        for slot in &mut slots {
            if let Some(handle) = slot.worker.take() {
                join_worker(&slot.name, handle, self.join_timeout);
            }

            let Some(ref addon) = slot.addon else {
                continue;
            };

            if let Some(notify) = addon.as_notify_on_close() {
                let result = catch_unwind(AssertUnwindSafe(|| notify.game_closed()))
                    .unwrap_or_else(|payload| {
                        Err(AddonError::Panicked(panic_message(&*payload)))
                    });
                if let Err(e) = result {
                    error!("[ADDONS] game_closed for {} failed: {}", slot.name, e);
                }
            }

            slot.state = AddonState::Stopped;
        }

        self.last_states = slots
            .iter()
            .map(|slot| (slot.name.clone(), slot.state))
            .collect();
        info!("[ADDONS] All addons stopped");
    }
}

impl Drop for AddonManager {
    fn drop(&mut self) {
        self.stop_addons();
    }
}

fn spawn_worker(
    name: &str,
    addon: Arc<dyn Addon>,
    game: Arc<GameProcess>,
    token: CancellationToken,
) -> std::io::Result<JoinHandle<()>> {
    let worker_name = name.to_string();
    thread::Builder::new()
        .name(format!("addon-{}", name))
        .spawn(move || {
            let Some(persistent) = addon.as_persistent() else {
                return;
            };

            debug!("[ADDONS] Worker for {} started", worker_name);
            let result = catch_unwind(AssertUnwindSafe(|| persistent.do_work(&game, &token)))
                .unwrap_or_else(|payload| Err(AddonError::Panicked(panic_message(&*payload))));

            match result {
                Ok(()) => debug!("[ADDONS] Worker for {} finished", worker_name),
                Err(e) => error!("[ADDONS] Worker for {} failed: {}", worker_name, e),
            }
        })
}

fn join_worker(name: &str, handle: JoinHandle<()>, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    let mut warned = false;

    while !handle.is_finished() {
        if !warned && Instant::now() >= deadline {
            warn!(
                "[ADDONS] Worker for {} did not stop within {:?}, still waiting",
                name, timeout
            );
            warned = true;
        }
        thread::sleep(JOIN_POLL);
    }

    if handle.join().is_err() {
        error!("[ADDONS] Worker for {} panicked", name);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addons::{NotifyOnClose, PersistentAddon, RunnableAddon};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counter {
        runs: AtomicUsize,
        closed: AtomicUsize,
    }

    struct Tracked {
        name: &'static str,
        counter: Arc<Counter>,
        fail_run: bool,
    }

    impl Addon for Tracked {
        fn name(&self) -> String {
            self.name.to_string()
        }

        fn setup(
            &mut self,
            _game: &Arc<GameProcess>,
            _settings: &LauncherSettings,
        ) -> Result<(), AddonError> {
            Ok(())
        }

        fn as_runnable(&self) -> Option<&dyn RunnableAddon> {
            Some(self)
        }

        fn as_notify_on_close(&self) -> Option<&dyn NotifyOnClose> {
            Some(self)
        }
    }

    impl RunnableAddon for Tracked {
        fn run(&self, _game: &GameProcess) -> Result<(), AddonError> {
            self.counter.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail_run {
                Err(AddonError::InvalidConfig("boom".into()))
            } else {
                Ok(())
            }
        }
    }

    impl NotifyOnClose for Tracked {
        fn game_closed(&self) -> Result<(), AddonError> {
            self.counter.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Looper;

    impl Addon for Looper {
        fn name(&self) -> String {
            "looper".to_string()
        }

        fn setup(
            &mut self,
            _game: &Arc<GameProcess>,
            _settings: &LauncherSettings,
        ) -> Result<(), AddonError> {
            Ok(())
        }

        fn as_persistent(&self) -> Option<&dyn PersistentAddon> {
            Some(self)
        }
    }

    impl PersistentAddon for Looper {
        fn do_work(&self, _game: &GameProcess, cancel: &CancellationToken) -> Result<(), AddonError> {
            while !cancel.wait_timeout(Duration::from_millis(10)) {}
            Ok(())
        }
    }

    fn game() -> Arc<GameProcess> {
        Arc::new(GameProcess::launcher())
    }

    #[test]
    fn test_run_failure_is_reported_and_isolated() {
        let counter = Arc::new(Counter::default());
        let entries = vec![
            AddonEntry::new(Box::new(Tracked {
                name: "bad",
                counter: Arc::clone(&counter),
                fail_run: true,
            })),
            AddonEntry::new(Box::new(Tracked {
                name: "good",
                counter: Arc::clone(&counter),
                fail_run: false,
            })),
        ];

        let mut manager = AddonManager::new();
        let report = manager
            .run_addons(&game(), &LauncherSettings::default(), entries)
            .unwrap();

        assert_eq!(counter.runs.load(Ordering::SeqCst), 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].stage, FailureStage::Run);

        let err = report.into_result().unwrap_err();
        assert!(err.to_string().starts_with("Addons: bad (run)"));

        manager.stop_addons();
        assert_eq!(counter.closed.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_states_track_lifecycle() {
        let counter = Arc::new(Counter::default());
        let entries = vec![
            AddonEntry::new(Box::new(Looper)),
            AddonEntry::new(Box::new(Tracked {
                name: "tracked",
                counter,
                fail_run: false,
            })),
        ];

        let mut manager = AddonManager::new();
        manager
            .run_addons(&game(), &LauncherSettings::default(), entries)
            .unwrap();

        assert!(manager.is_running());
        assert_eq!(
            manager.states(),
            vec![
                ("looper".to_string(), AddonState::Running),
                ("tracked".to_string(), AddonState::Idle),
            ]
        );

        manager.stop_addons();
        assert!(!manager.is_running());
        assert!(manager.states().iter().all(|(_, state)| state.is_stopped()));
        assert_eq!(manager.states().len(), 2);
    }

    #[test]
    fn test_stop_without_session_is_noop() {
        let mut manager = AddonManager::new();
        manager.stop_addons();
        assert!(!manager.is_running());
    }

    #[test]
    fn test_panic_message_extraction() {
        let payload = catch_unwind(|| panic!("kaboom")).unwrap_err();
        assert_eq!(panic_message(&*payload), "kaboom");
    }
}
