//! Integration tests for the generic external-process addon.
//!
//! These tests launch real processes:
//! - Duplicate-by-name guard
//! - Kill after the game closes
//! - Deferred launch on close

#![cfg(unix)]
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tempfile::TempDir;

use addonhost::addons::builtin::{GenericAddon, GenericAddonConfig, Interpreters};
use addonhost::addons::process::find_processes_by_name;
use addonhost::addons::{Addon, GameProcess};
use addonhost::config::LauncherSettings;

/// Serializes copying and executing binaries.
static EXEC_LOCK: Mutex<()> = Mutex::new(());

/// Arguments keeping the relay companion alive until it is killed.
const IDLE_ARGS: &str = "0 GenericTest";

/// Copies a long-running binary under a unique name so process lookups only
/// see this test.
fn unique_program(dir: &Path) -> PathBuf {
    let name = format!("addonidle{}", uuid::Uuid::new_v4().simple());
    let target = dir.join(name);
    fs::copy(env!("CARGO_BIN_EXE_otp-relay"), &target).unwrap();
    target
}

fn stem(path: &Path) -> String {
    path.file_stem().unwrap().to_string_lossy().into_owned()
}

fn generic(config: GenericAddonConfig) -> GenericAddon {
    let mut addon = GenericAddon::new(config, Arc::new(Interpreters::default()));
    addon
        .setup(&Arc::new(GameProcess::launcher()), &LauncherSettings::default())
        .unwrap();
    addon
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    false
}

#[test]
fn test_second_run_while_alive_yields_one_process() {
    let _guard = EXEC_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let tmp = TempDir::new().unwrap();
    let program = unique_program(tmp.path());
    let config = GenericAddonConfig {
        path: program.clone(),
        command_line: IDLE_ARGS.into(),
        kill_after_close: true,
        ..GenericAddonConfig::default()
    };

    let first = generic(config.clone());
    let second = generic(config);
    let game = GameProcess::launcher();

    first.as_runnable().unwrap().run(&game).unwrap();
    first.as_runnable().unwrap().run(&game).unwrap();
    second.as_runnable().unwrap().run(&game).unwrap();

    assert_eq!(find_processes_by_name(&stem(&program)).len(), 1);
    assert!(first.pid().is_some());
    assert!(second.pid().is_none());

    first.as_notify_on_close().unwrap().game_closed().unwrap();
    second.as_notify_on_close().unwrap().game_closed().unwrap();
    assert!(wait_until(|| find_processes_by_name(&stem(&program)).is_empty()));
}

#[test]
fn test_process_left_running_without_kill_after_close() {
    let _guard = EXEC_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let tmp = TempDir::new().unwrap();
    let program = unique_program(tmp.path());
    let addon = generic(GenericAddonConfig {
        path: program.clone(),
        command_line: IDLE_ARGS.into(),
        ..GenericAddonConfig::default()
    });

    addon
        .as_runnable()
        .unwrap()
        .run(&GameProcess::launcher())
        .unwrap();
    let pid = addon.pid().unwrap();

    addon.as_notify_on_close().unwrap().game_closed().unwrap();
    assert_eq!(find_processes_by_name(&stem(&program)), vec![pid]);

    assert!(addonhost::addons::process::kill_pid(pid));
}

#[test]
fn test_run_on_close_defers_launch() {
    let _guard = EXEC_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let tmp = TempDir::new().unwrap();
    let marker = tmp.path().join("ran");
    let script = tmp.path().join("on-close.sh");
    fs::write(&script, format!("touch '{}'\n", marker.display())).unwrap();

    let addon = generic(GenericAddonConfig {
        path: script,
        run_on_close: true,
        ..GenericAddonConfig::default()
    });

    addon
        .as_runnable()
        .unwrap()
        .run(&GameProcess::launcher())
        .unwrap();
    std::thread::sleep(Duration::from_millis(200));
    assert!(!marker.exists());

    addon.as_notify_on_close().unwrap().game_closed().unwrap();
    assert!(wait_until(|| marker.exists()));
}
