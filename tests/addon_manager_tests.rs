//! Integration tests for the addon manager.
//!
//! These tests verify session orchestration:
//! - Single active session per manager
//! - Failure isolation across entries
//! - Worker termination on stop
//! - Strict per-entry ordering

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use addonhost::addons::{
    Addon, AddonEntry, AddonError, AddonManager, AddonState, CancellationToken, FailureStage,
    GameProcess, ManagerError, NotifyOnClose, PersistentAddon, RunnableAddon, StartPhase,
    partition_entries,
};
use addonhost::config::LauncherSettings;

// ============================================================================
// Test addons
// ============================================================================

/// Shared record of what happened to the test addons.
#[derive(Default)]
struct Journal {
    events: Mutex<Vec<String>>,
}

impl Journal {
    fn push(&self, event: impl Into<String>) {
        self.events.lock().unwrap().push(event.into());
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

/// Runnable + notify addon that records calls.
struct RecordingAddon {
    name: String,
    journal: Arc<Journal>,
    fail_setup: bool,
    panic_setup: bool,
}

impl RecordingAddon {
    fn new(name: &str, journal: &Arc<Journal>) -> Self {
        Self {
            name: name.to_string(),
            journal: Arc::clone(journal),
            fail_setup: false,
            panic_setup: false,
        }
    }
}

impl Addon for RecordingAddon {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn setup(
        &mut self,
        _game: &Arc<GameProcess>,
        _settings: &LauncherSettings,
    ) -> Result<(), AddonError> {
        if self.panic_setup {
            panic!("setup exploded");
        }
        if self.fail_setup {
            return Err(AddonError::InvalidConfig("broken".into()));
        }
        self.journal.push(format!("setup:{}", self.name));
        Ok(())
    }

    fn as_runnable(&self) -> Option<&dyn RunnableAddon> {
        Some(self)
    }

    fn as_notify_on_close(&self) -> Option<&dyn NotifyOnClose> {
        Some(self)
    }
}

impl RunnableAddon for RecordingAddon {
    fn run(&self, _game: &GameProcess) -> Result<(), AddonError> {
        self.journal.push(format!("run:{}", self.name));
        Ok(())
    }
}

impl NotifyOnClose for RecordingAddon {
    fn game_closed(&self) -> Result<(), AddonError> {
        self.journal.push(format!("closed:{}", self.name));
        Ok(())
    }
}

/// Persistent addon that loops until cancelled.
struct LoopingAddon {
    started: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
    iterations: Arc<AtomicUsize>,
}

impl Addon for LoopingAddon {
    fn name(&self) -> String {
        "looping".to_string()
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

impl PersistentAddon for LoopingAddon {
    fn do_work(&self, _game: &GameProcess, cancel: &CancellationToken) -> Result<(), AddonError> {
        self.started.store(true, Ordering::SeqCst);
        while !cancel.wait_timeout(Duration::from_millis(10)) {
            self.iterations.fetch_add(1, Ordering::SeqCst);
        }
        self.finished.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Runnable that waits for a flag set by an earlier persistent worker.
struct WaitingRunnable {
    flag: Arc<AtomicBool>,
    observed: Arc<AtomicBool>,
}

impl Addon for WaitingRunnable {
    fn name(&self) -> String {
        "waiting".to_string()
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
}

impl RunnableAddon for WaitingRunnable {
    fn run(&self, _game: &GameProcess) -> Result<(), AddonError> {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if self.flag.load(Ordering::SeqCst) {
                self.observed.store(true, Ordering::SeqCst);
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        Ok(())
    }
}

/// Persistent + notify addon that lingers after cancellation and records
/// whether its worker had finished when `game_closed` ran.
struct LingeringAddon {
    name: String,
    linger: Duration,
    finished: Arc<AtomicBool>,
    finished_at_close: Arc<Mutex<Option<bool>>>,
}

impl LingeringAddon {
    fn new(name: &str, linger: Duration) -> Self {
        Self {
            name: name.to_string(),
            linger,
            finished: Arc::new(AtomicBool::new(false)),
            finished_at_close: Arc::new(Mutex::new(None)),
        }
    }
}

impl Addon for LingeringAddon {
    fn name(&self) -> String {
        self.name.clone()
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

    fn as_notify_on_close(&self) -> Option<&dyn NotifyOnClose> {
        Some(self)
    }
}

impl PersistentAddon for LingeringAddon {
    fn do_work(&self, _game: &GameProcess, cancel: &CancellationToken) -> Result<(), AddonError> {
        while !cancel.wait_timeout(Duration::from_millis(10)) {}
        std::thread::sleep(self.linger);
        self.finished.store(true, Ordering::SeqCst);
        Ok(())
    }
}

impl NotifyOnClose for LingeringAddon {
    fn game_closed(&self) -> Result<(), AddonError> {
        *self.finished_at_close.lock().unwrap() = Some(self.finished.load(Ordering::SeqCst));
        Ok(())
    }
}

fn looping() -> (LoopingAddon, Arc<AtomicBool>, Arc<AtomicBool>) {
    let started = Arc::new(AtomicBool::new(false));
    let finished = Arc::new(AtomicBool::new(false));
    let addon = LoopingAddon {
        started: Arc::clone(&started),
        finished: Arc::clone(&finished),
        iterations: Arc::new(AtomicUsize::new(0)),
    };
    (addon, started, finished)
}

fn game() -> Arc<GameProcess> {
    Arc::new(GameProcess::launcher())
}

// ============================================================================
// Session tests
// ============================================================================

mod session_tests {
    use super::*;

    #[test]
    fn test_second_run_fails_while_active() {
        let journal = Arc::new(Journal::default());
        let mut manager = AddonManager::new();

        let entries = vec![AddonEntry::new(Box::new(RecordingAddon::new("a", &journal)))];
        manager
            .run_addons(&game(), &LauncherSettings::default(), entries)
            .unwrap();
        assert!(manager.is_running());

        let again = vec![AddonEntry::new(Box::new(RecordingAddon::new("b", &journal)))];
        let err = manager
            .run_addons(&game(), &LauncherSettings::default(), again)
            .unwrap_err();
        assert!(matches!(err, ManagerError::SessionAlreadyActive));

        manager.stop_addons();
        assert!(!manager.is_running());
        assert!(!journal.events().contains(&"setup:b".to_string()));
    }

    #[test]
    fn test_run_again_after_stop() {
        let journal = Arc::new(Journal::default());
        let mut manager = AddonManager::new();

        for name in ["first", "second"] {
            let entries = vec![AddonEntry::new(Box::new(RecordingAddon::new(name, &journal)))];
            manager
                .run_addons(&game(), &LauncherSettings::default(), entries)
                .unwrap();
            manager.stop_addons();
        }

        assert_eq!(
            journal.events(),
            vec![
                "setup:first",
                "run:first",
                "closed:first",
                "setup:second",
                "run:second",
                "closed:second",
            ]
        );
    }

    #[test]
    fn test_stopped_states_cleared_by_next_run() {
        let journal = Arc::new(Journal::default());
        let mut manager = AddonManager::new();

        let entries = vec![AddonEntry::new(Box::new(RecordingAddon::new("old", &journal)))];
        manager
            .run_addons(&game(), &LauncherSettings::default(), entries)
            .unwrap();
        manager.stop_addons();
        assert_eq!(manager.states(), vec![("old".to_string(), AddonState::Stopped)]);

        let entries = vec![AddonEntry::new(Box::new(RecordingAddon::new("new", &journal)))];
        manager
            .run_addons(&game(), &LauncherSettings::default(), entries)
            .unwrap();
        assert_eq!(manager.states(), vec![("new".to_string(), AddonState::Idle)]);
        manager.stop_addons();
    }

    #[test]
    fn test_stop_without_session_is_noop() {
        let mut manager = AddonManager::new();
        manager.stop_addons();
        assert!(!manager.is_running());
        assert!(manager.states().is_empty());
    }
}

// ============================================================================
// Worker tests
// ============================================================================

mod worker_tests {
    use super::*;

    #[test]
    fn test_workers_terminated_after_stop() {
        let (first, first_started, first_finished) = looping();
        let (second, _, second_finished) = looping();
        let mut manager = AddonManager::new();

        let entries = vec![AddonEntry::new(Box::new(first)), AddonEntry::new(Box::new(second))];
        manager
            .run_addons(&game(), &LauncherSettings::default(), entries)
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while !first_started.load(Ordering::SeqCst) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(
            manager
                .states()
                .iter()
                .all(|(_, state)| *state == AddonState::Running)
        );

        manager.stop_addons();
        assert!(first_finished.load(Ordering::SeqCst));
        assert!(second_finished.load(Ordering::SeqCst));
    }

    #[test]
    fn test_all_workers_cancelled_before_any_join() {
        let linger = Duration::from_millis(500);
        let first = LingeringAddon::new("first", linger);
        let second = LingeringAddon::new("second", linger);
        let finished = [Arc::clone(&first.finished), Arc::clone(&second.finished)];

        let mut manager = AddonManager::new();
        manager
            .run_addons(
                &game(),
                &LauncherSettings::default(),
                vec![AddonEntry::new(Box::new(first)), AddonEntry::new(Box::new(second))],
            )
            .unwrap();

        let started = Instant::now();
        manager.stop_addons();
        let elapsed = started.elapsed();

        assert!(finished.iter().all(|f| f.load(Ordering::SeqCst)));
        assert!(elapsed >= linger, "{:?}", elapsed);
        assert!(elapsed < linger * 2 - Duration::from_millis(100), "{:?}", elapsed);
    }

    #[test]
    fn test_game_closed_runs_after_worker_joined() {
        let addon = LingeringAddon::new("lingering", Duration::from_millis(100));
        let finished_at_close = Arc::clone(&addon.finished_at_close);

        let mut manager = AddonManager::new();
        manager
            .run_addons(
                &game(),
                &LauncherSettings::default(),
                vec![AddonEntry::new(Box::new(addon))],
            )
            .unwrap();
        manager.stop_addons();

        assert_eq!(*finished_at_close.lock().unwrap(), Some(true));
    }

    #[test]
    fn test_drop_stops_session() {
        let (addon, _, finished) = looping();
        {
            let mut manager = AddonManager::new();
            manager
                .run_addons(
                    &game(),
                    &LauncherSettings::default(),
                    vec![AddonEntry::new(Box::new(addon))],
                )
                .unwrap();
        }
        assert!(finished.load(Ordering::SeqCst));
    }

    #[test]
    fn test_persistent_started_before_later_run() {
        let (persistent, started, _) = looping();
        let observed = Arc::new(AtomicBool::new(false));
        let waiting = WaitingRunnable {
            flag: started,
            observed: Arc::clone(&observed),
        };

        let mut manager = AddonManager::new();
        manager
            .run_addons(
                &game(),
                &LauncherSettings::default(),
                vec![
                    AddonEntry::new(Box::new(persistent)),
                    AddonEntry::new(Box::new(waiting)),
                ],
            )
            .unwrap();

        assert!(observed.load(Ordering::SeqCst));
        manager.stop_addons();
    }
}

// ============================================================================
// Isolation tests
// ============================================================================

mod isolation_tests {
    use super::*;

    #[test]
    fn test_failing_setup_does_not_block_others() {
        let journal = Arc::new(Journal::default());
        let mut broken = RecordingAddon::new("broken", &journal);
        broken.fail_setup = true;

        let entries = vec![
            AddonEntry::new(Box::new(RecordingAddon::new("before", &journal))),
            AddonEntry::new(Box::new(broken)),
            AddonEntry::new(Box::new(RecordingAddon::new("after", &journal))),
        ];

        let mut manager = AddonManager::new();
        let report = manager
            .run_addons(&game(), &LauncherSettings::default(), entries)
            .unwrap();

        assert_eq!(report.started, vec!["before", "after"]);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].addon, "broken");
        assert_eq!(report.failures[0].stage, FailureStage::Setup);
        assert_eq!(manager.states()[1], ("broken".to_string(), AddonState::Uninitialized));

        manager.stop_addons();
        assert_eq!(
            manager.states(),
            vec![
                ("before".to_string(), AddonState::Stopped),
                ("broken".to_string(), AddonState::Uninitialized),
                ("after".to_string(), AddonState::Stopped),
            ]
        );
        let events = journal.events();
        assert!(events.contains(&"run:after".to_string()));
        assert!(!events.contains(&"closed:broken".to_string()));
    }

    #[test]
    fn test_panicking_setup_is_isolated() {
        let journal = Arc::new(Journal::default());
        let mut exploding = RecordingAddon::new("exploding", &journal);
        exploding.panic_setup = true;

        let entries = vec![
            AddonEntry::new(Box::new(exploding)),
            AddonEntry::new(Box::new(RecordingAddon::new("survivor", &journal))),
        ];

        let mut manager = AddonManager::new();
        let report = manager
            .run_addons(&game(), &LauncherSettings::default(), entries)
            .unwrap();

        assert_eq!(report.started, vec!["survivor"]);
        let err = report.into_result().unwrap_err();
        assert!(err.to_string().starts_with("Addons: "));
        assert!(err.to_string().contains("exploding"));
    }

    #[test]
    fn test_disabled_entries_never_set_up() {
        let journal = Arc::new(Journal::default());
        let entries = vec![
            AddonEntry::new(Box::new(RecordingAddon::new("off", &journal))).disabled(),
            AddonEntry::new(Box::new(RecordingAddon::new("on", &journal))),
        ];

        let mut manager = AddonManager::new();
        let report = manager
            .run_addons(&game(), &LauncherSettings::default(), entries)
            .unwrap();
        manager.stop_addons();

        assert_eq!(report.started, vec!["on"]);
        assert!(journal.events().iter().all(|e| !e.ends_with(":off")));
    }

    #[test]
    fn test_partition_by_phase() {
        let journal = Arc::new(Journal::default());
        let entries = vec![
            AddonEntry::new(Box::new(RecordingAddon::new("game", &journal))),
            AddonEntry::new(Box::new(RecordingAddon::new("service", &journal)))
                .with_start_at(StartPhase::LauncherInitialized),
        ];

        let (services, rest) = partition_entries(entries, StartPhase::LauncherInitialized);
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].addon.name(), "service");
        assert_eq!(rest[0].addon.name(), "game");
    }
}
