//! Generic external-process addon.
//!
//! Launches an executable or script next to the game. Scripts go through the
//! matching interpreter; executables are guarded so a second copy is never
//! started while one with the same name is running.

use std::env;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::addons::process::{find_processes_by_name, hide_window, spawn_elevated};
use crate::addons::{Addon, AddonError, GameProcess, NotifyOnClose, RunnableAddon};
use crate::config::LauncherSettings;

/// Settings for a generic addon.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GenericAddonConfig {
    /// Executable or script to launch.
    pub path: PathBuf,
    /// Extra arguments, split with shell quoting rules.
    pub command_line: String,
    /// Launch with administrator rights.
    pub run_as_admin: bool,
    /// Launch when the game closes instead of when it starts.
    pub run_on_close: bool,
    /// Kill the launched process when the game closes.
    pub kill_after_close: bool,
}

/// Script interpreters, resolved once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interpreters {
    /// PowerShell for `.ps1` files (`pwsh` when on the search path).
    pub powershell: PathBuf,
    /// Command interpreter for `.bat` and `.cmd` files.
    pub batch: PathBuf,
    /// POSIX shell for `.sh` files.
    pub shell: PathBuf,
}

impl Interpreters {
    /// Resolves interpreters from the current environment.
    #[must_use]
    pub fn resolve() -> Self {
        Self::resolve_from(env::var_os("PATH").as_deref(), env::var_os("ComSpec"))
    }

    /// Resolves interpreters from explicit `PATH` and `ComSpec` values.
    #[must_use]
    pub fn resolve_from(path_var: Option<&OsStr>, comspec: Option<OsString>) -> Self {
        let (pwsh, fallback) = if cfg!(windows) {
            ("pwsh.exe", "powershell.exe")
        } else {
            ("pwsh", "pwsh")
        };

        let powershell = path_var
            .and_then(|paths| {
                env::split_paths(paths)
                    .map(|dir| dir.join(pwsh))
                    .find(|candidate| candidate.is_file())
            })
            .unwrap_or_else(|| PathBuf::from(fallback));

        let batch = comspec
            .filter(|c| !c.is_empty())
            .map_or_else(|| PathBuf::from("cmd.exe"), PathBuf::from);

        Self {
            powershell,
            batch,
            shell: PathBuf::from("/bin/sh"),
        }
    }
}

impl Default for Interpreters {
    fn default() -> Self {
        Self::resolve()
    }
}

/// How a configured path is launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LaunchKind {
    PowerShell,
    Batch,
    Shell,
    App,
}

impl LaunchKind {
    fn of(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_lowercase);

        match ext.as_deref() {
            Some("ps1") => Self::PowerShell,
            Some("bat" | "cmd") => Self::Batch,
            Some("sh") => Self::Shell,
            _ => Self::App,
        }
    }
}

/// Runs an external program or script alongside the game.
pub struct GenericAddon {
    config: GenericAddonConfig,
    interpreters: Arc<Interpreters>,
    /// Set by `setup`.
    game_pid: Option<u32>,
    process: Mutex<Option<Child>>,
}

impl GenericAddon {
    /// Creates the addon.
    #[must_use]
    pub fn new(config: GenericAddonConfig, interpreters: Arc<Interpreters>) -> Self {
        Self {
            config,
            interpreters,
            game_pid: None,
            process: Mutex::new(None),
        }
    }

    fn stem(&self) -> String {
        self.config
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    fn is_exe(&self) -> bool {
        self.config
            .path
            .extension()
            .is_some_and(|e| e.eq_ignore_ascii_case("exe"))
    }

    fn working_dir(&self) -> Option<&Path> {
        self.config
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
    }

    fn args(&self) -> Result<Vec<String>, AddonError> {
        shell_words::split(&self.config.command_line).map_err(|e| {
            AddonError::InvalidConfig(format!("command line for {}: {}", self.name(), e))
        })
    }

    /// Program and argv for the configured path.
    fn command_parts(&self) -> Result<(PathBuf, Vec<String>), AddonError> {
        let path = self.config.path.to_string_lossy().into_owned();
        let extra = self.args()?;

        let parts = match LaunchKind::of(&self.config.path) {
            LaunchKind::PowerShell => {
                let mut args = vec![
                    "-NoProfile".to_string(),
                    "-ExecutionPolicy".to_string(),
                    "Bypass".to_string(),
                    "-File".to_string(),
                    path,
                ];
                args.extend(extra);
                (self.interpreters.powershell.clone(), args)
            }
            LaunchKind::Batch => {
                let mut args = vec!["/C".to_string(), path];
                args.extend(extra);
                (self.interpreters.batch.clone(), args)
            }
            LaunchKind::Shell => {
                let mut args = vec![path];
                args.extend(extra);
                (self.interpreters.shell.clone(), args)
            }
            LaunchKind::App => (self.config.path.clone(), extra),
        };

        Ok(parts)
    }

    fn tracked_is_running(&self) -> bool {
        let Ok(mut guard) = self.process.lock() else {
            return false;
        };
        match guard.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    fn launch(&self) -> Result<(), AddonError> {
        if self.config.path.as_os_str().is_empty() {
            return Err(AddonError::InvalidConfig(
                "generic addon path is empty".to_string(),
            ));
        }

        let name = self.name();
        let kind = LaunchKind::of(&self.config.path);

        if self.tracked_is_running() {
            info!("[ADDONS] {} is already running", name);
            return Ok(());
        }

        if kind == LaunchKind::App {
            let running = find_processes_by_name(&self.stem());
            if !running.is_empty() {
                info!("[ADDONS] {} is already running (pid {:?})", name, running);
                return Ok(());
            }
        }

        let (program, args) = self.command_parts()?;

        if self.config.run_as_admin {
            return spawn_elevated(&name, &program, &args, self.working_dir());
        }

        let mut cmd = Command::new(&program);
        cmd.args(&args).stdin(Stdio::null());
        if let Some(dir) = self.working_dir() {
            cmd.current_dir(dir);
        }
        if kind != LaunchKind::App {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
            hide_window(&mut cmd);
        }

        let child = cmd.spawn().map_err(|source| AddonError::Spawn {
            name: name.clone(),
            source,
        })?;

        info!(
            "[ADDONS] Launched {} (pid {}, game pid {:?})",
            name,
            child.id(),
            self.game_pid
        );

        if let Ok(mut guard) = self.process.lock() {
            *guard = Some(child);
        }
        Ok(())
    }

    /// Pid of the process launched by this addon, while it runs.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        let mut guard = self.process.lock().ok()?;
        let child = guard.as_mut()?;
        matches!(child.try_wait(), Ok(None)).then(|| child.id())
    }
}

impl Addon for GenericAddon {
    fn name(&self) -> String {
        if self.config.path.as_os_str().is_empty() {
            return "Invalid addon".to_string();
        }

        if self.is_exe() {
            format!("Launch EXE : {}", self.stem())
        } else {
            format!("Launch : {}", self.stem())
        }
    }

    fn setup(
        &mut self,
        game: &Arc<GameProcess>,
        _settings: &LauncherSettings,
    ) -> Result<(), AddonError> {
        self.game_pid = Some(game.pid());
        Ok(())
    }

    fn as_runnable(&self) -> Option<&dyn RunnableAddon> {
        Some(self)
    }

    fn as_notify_on_close(&self) -> Option<&dyn NotifyOnClose> {
        Some(self)
    }
}

impl RunnableAddon for GenericAddon {
    fn run(&self, _game: &GameProcess) -> Result<(), AddonError> {
        if self.config.run_on_close {
            debug!("[ADDONS] {} deferred until the game closes", self.name());
            return Ok(());
        }
        self.launch()
    }
}

impl NotifyOnClose for GenericAddon {
    fn game_closed(&self) -> Result<(), AddonError> {
        if self.config.run_on_close {
            return match self.launch() {
                Err(e) if e.is_benign() => {
                    info!("[ADDONS] {}", e);
                    Ok(())
                }
                other => other,
            };
        }

        if self.config.run_as_admin || !self.config.kill_after_close {
            return Ok(());
        }

        let Ok(mut guard) = self.process.lock() else {
            return Ok(());
        };

        if let Some(mut child) = guard.take() {
            if matches!(child.try_wait(), Ok(None)) {
                if let Err(e) = child.kill() {
                    error!("[ADDONS] Could not kill {}: {}", self.name(), e);
                }
                let _ = child.wait();
                info!("[ADDONS] Killed {}", self.name());
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn addon(path: &str) -> GenericAddon {
        GenericAddon::new(
            GenericAddonConfig {
                path: PathBuf::from(path),
                ..GenericAddonConfig::default()
            },
            Arc::new(Interpreters::resolve_from(None, None)),
        )
    }

    #[test]
    fn test_names() {
        assert_eq!(addon("").name(), "Invalid addon");
        assert_eq!(addon("C:/Tools/Overlay.EXE").name(), "Launch EXE : Overlay");
        assert_eq!(addon("/opt/scripts/sync.ps1").name(), "Launch : sync");
    }

    #[test]
    fn test_launch_kind() {
        assert_eq!(LaunchKind::of(Path::new("a.PS1")), LaunchKind::PowerShell);
        assert_eq!(LaunchKind::of(Path::new("a.bat")), LaunchKind::Batch);
        assert_eq!(LaunchKind::of(Path::new("a.cmd")), LaunchKind::Batch);
        assert_eq!(LaunchKind::of(Path::new("a.sh")), LaunchKind::Shell);
        assert_eq!(LaunchKind::of(Path::new("a.exe")), LaunchKind::App);
    }

    #[test]
    fn test_interpreters_find_pwsh_on_path() {
        let tmp = TempDir::new().unwrap();
        let name = if cfg!(windows) { "pwsh.exe" } else { "pwsh" };
        std::fs::write(tmp.path().join(name), b"").unwrap();

        let path_var = env::join_paths([tmp.path()]).unwrap();
        let found = Interpreters::resolve_from(Some(&path_var), Some("C:/cmd.exe".into()));
        assert_eq!(found.powershell, tmp.path().join(name));
        assert_eq!(found.batch, PathBuf::from("C:/cmd.exe"));
    }

    #[test]
    fn test_interpreters_fallback() {
        let found = Interpreters::resolve_from(None, None);
        assert_eq!(found.batch, PathBuf::from("cmd.exe"));
        let expected = if cfg!(windows) { "powershell.exe" } else { "pwsh" };
        assert_eq!(found.powershell, PathBuf::from(expected));
    }

    #[test]
    fn test_batch_command_parts() {
        let mut addon = addon("C:/Tools/start.bat");
        addon.config.command_line = "--fast \"two words\"".to_string();
        let (program, args) = addon.command_parts().unwrap();
        assert_eq!(program, PathBuf::from("cmd.exe"));
        assert_eq!(args, vec!["/C", "C:/Tools/start.bat", "--fast", "two words"]);
    }

    #[test]
    fn test_bad_command_line_is_invalid_config() {
        let mut addon = addon("/bin/true");
        addon.config.command_line = "\"unterminated".to_string();
        assert!(matches!(
            addon.command_parts(),
            Err(AddonError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_empty_path_run_fails() {
        let game = GameProcess::launcher();
        assert!(matches!(
            addon("").run(&game),
            Err(AddonError::InvalidConfig(_))
        ));
    }
}
