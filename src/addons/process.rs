//! Companion process management.
//!
//! Spawning, supervising and inspecting the external processes launched by
//! addons. The monitored game process is never touched from here except to
//! check whether it is still alive.

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use sysinfo::{Pid, ProcessStatus, System};
use tracing::{debug, info, warn};

use super::types::AddonError;

/// `CREATE_NO_WINDOW` process creation flag.
pub const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Prevents a console window from appearing for the spawned process.
pub fn hide_window(cmd: &mut Command) {
    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }

    #[cfg(not(windows))]
    {
        let _ = cmd;
    }
}

/// Returns true if a non-zombie process with this pid exists.
#[must_use]
pub fn is_process_alive(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut sys = System::new();

    if !sys.refresh_process(pid) {
        return false;
    }

    sys.process(pid)
        .is_some_and(|p| p.status() != ProcessStatus::Zombie)
}

/// Normalizes a process or executable name for comparison.
fn normalize_name(name: &str) -> String {
    let lower = name.trim().to_lowercase();
    match lower.strip_suffix(".exe") {
        Some(stem) => stem.to_string(),
        None => lower,
    }
}

/// Finds live processes whose name matches `name` (case-insensitive, with
/// or without an `.exe` suffix).
#[must_use]
pub fn find_processes_by_name(name: &str) -> Vec<u32> {
    let wanted = normalize_name(name);
    if wanted.is_empty() {
        return Vec::new();
    }

    let mut sys = System::new();
    sys.refresh_processes();

    let mut found: Vec<u32> = sys
        .processes()
        .iter()
        .filter(|(_, p)| p.status() != ProcessStatus::Zombie)
        .filter(|(_, p)| {
            if normalize_name(p.name()) == wanted {
                return true;
            }
            p.cmd()
                .first()
                .and_then(|arg0| Path::new(arg0).file_name())
                .and_then(|f| f.to_str())
                .is_some_and(|f| normalize_name(f) == wanted)
        })
        .map(|(pid, _)| pid.as_u32())
        .collect();

    found.sort_unstable();
    found
}

/// Kills a process by pid. Returns true if a kill signal was delivered.
pub fn kill_pid(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut sys = System::new();

    if !sys.refresh_process(pid) {
        return false;
    }

    sys.process(pid).is_some_and(|p| p.kill())
}

/// Starts a process detached from any supervision.
///
/// Returns the pid of the started process.
pub fn spawn_detached(
    name: &str,
    program: &Path,
    args: &[String],
    working_dir: Option<&Path>,
    hidden: bool,
) -> Result<u32, AddonError> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    if let Some(dir) = working_dir {
        cmd.current_dir(dir);
    }
    if hidden {
        hide_window(&mut cmd);
    }

    let child = cmd.spawn().map_err(|source| AddonError::Spawn {
        name: name.to_string(),
        source,
    })?;

    info!("Started {} (pid {})", name, child.id());
    Ok(child.id())
}

/// Starts a process with administrator rights.
///
/// The elevated process is not tracked. A dismissed elevation prompt is
/// reported as [`AddonError::ElevationDeclined`].
pub fn spawn_elevated(
    name: &str,
    program: &Path,
    args: &[String],
    working_dir: Option<&Path>,
) -> Result<(), AddonError> {
    #[cfg(windows)]
    {
        let quote = |s: &str| format!("'{}'", s.replace('\'', "''"));

        let mut script = format!(
            "Start-Process -FilePath {} -Verb RunAs -WindowStyle Minimized",
            quote(&program.to_string_lossy())
        );
        if !args.is_empty() {
            script.push_str(&format!(
                " -ArgumentList {}",
                quote(&shell_words::join(args))
            ));
        }
        if let Some(dir) = working_dir {
            script.push_str(&format!(
                " -WorkingDirectory {}",
                quote(&dir.to_string_lossy())
            ));
        }

        let mut cmd = Command::new("powershell");
        cmd.args(["-NoProfile", "-NonInteractive", "-Command", &script]);
        hide_window(&mut cmd);

        let output = cmd.output().map_err(|source| AddonError::Spawn {
            name: name.to_string(),
            source,
        })?;

        if output.status.success() {
            info!("Started {} elevated", name);
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("canceled by the user") {
            return Err(AddonError::ElevationDeclined(name.to_string()));
        }

        Err(AddonError::Spawn {
            name: name.to_string(),
            source: std::io::Error::other(stderr.trim().to_string()),
        })
    }

    #[cfg(not(windows))]
    {
        let mut cmd = Command::new("pkexec");
        cmd.arg(program).args(args).stdin(Stdio::null());
        if let Some(dir) = working_dir {
            cmd.current_dir(dir);
        }

        let child = cmd.spawn().map_err(|source| AddonError::Spawn {
            name: name.to_string(),
            source,
        })?;

        info!("Started {} elevated via pkexec (pid {})", name, child.id());
        Ok(())
    }
}

/// Status of a supervised companion process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompanionStatus {
    /// Not started yet or stopped on request.
    Stopped,
    /// Process is running.
    Running,
    /// Process exited with a failure status.
    Crashed,
    /// Process failed to start.
    Failed,
}

/// Restart behaviour for a supervised companion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    /// Restart after a crash.
    pub restart_on_crash: bool,
    /// Maximum number of restarts.
    pub max_restarts: u32,
    /// Base delay before a restart; doubled for each restart.
    pub restart_delay: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            restart_on_crash: false,
            max_restarts: 0,
            restart_delay: Duration::from_secs(1),
        }
    }
}

/// A companion process owned by an addon.
///
/// Dropping the value kills the process.
pub struct CompanionProcess {
    /// Display name for logs.
    name: String,
    program: PathBuf,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
    env: Vec<(String, String)>,
    hidden: bool,
    child: Option<Child>,
    status: CompanionStatus,
    restart_count: u32,
    last_restart: Option<Instant>,
    policy: RestartPolicy,
}

impl CompanionProcess {
    /// Creates a new companion (not yet started).
    #[must_use]
    pub fn new(name: impl Into<String>, program: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
            hidden: false,
            child: None,
            status: CompanionStatus::Stopped,
            restart_count: 0,
            last_restart: None,
            policy: RestartPolicy::default(),
        }
    }

    /// Sets the command line arguments.
    #[must_use]
    pub fn args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Sets the working directory.
    #[must_use]
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Adds an environment variable.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Starts without a console window.
    #[must_use]
    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }

    /// Sets the restart policy.
    #[must_use]
    pub fn restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Starts the process.
    pub fn start(&mut self) -> Result<(), AddonError> {
        if self.child.is_some() {
            return Ok(());
        }

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        if let Some(ref dir) = self.working_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        if self.hidden {
            hide_window(&mut cmd);
        }

        match cmd.spawn() {
            Ok(child) => {
                info!("Started companion {} (pid {})", self.name, child.id());
                self.child = Some(child);
                self.status = CompanionStatus::Running;
                self.last_restart = Some(Instant::now());
                Ok(())
            }
            Err(source) => {
                self.status = CompanionStatus::Failed;
                Err(AddonError::Spawn {
                    name: self.name.clone(),
                    source,
                })
            }
        }
    }

    /// Kills the process and reaps it.
    pub fn stop(&mut self) {
        if let Some(mut child) = self.child.take() {
            if matches!(child.try_wait(), Ok(None)) {
                let _ = child.kill();
            }
            let _ = child.wait();
            self.status = CompanionStatus::Stopped;
            info!("Stopped companion {}", self.name);
        }
    }

    /// Polls the process and updates its status.
    pub fn check_status(&mut self) -> CompanionStatus {
        if let Some(ref mut child) = self.child {
            match child.try_wait() {
                Ok(Some(status)) => {
                    self.child = None;
                    self.status = if status.success() {
                        CompanionStatus::Stopped
                    } else {
                        CompanionStatus::Crashed
                    };
                    debug!("Companion {} exited: {}", self.name, status);
                }
                Ok(None) => self.status = CompanionStatus::Running,
                Err(e) => {
                    warn!("Could not poll companion {}: {}", self.name, e);
                    self.status = CompanionStatus::Failed;
                }
            }
        }
        self.status
    }

    /// Returns whether the process should be restarted.
    #[must_use]
    pub fn should_restart(&self) -> bool {
        if !self.policy.restart_on_crash || self.restart_count >= self.policy.max_restarts {
            return false;
        }

        matches!(
            self.status,
            CompanionStatus::Crashed | CompanionStatus::Failed
        )
    }

    /// Returns the delay before the next restart (exponential backoff).
    #[must_use]
    pub fn restart_delay(&self) -> Duration {
        self.policy.restart_delay * 2u32.saturating_pow(self.restart_count)
    }

    /// Restarts the process if it crashed and its backoff has elapsed.
    ///
    /// Returns true if a restart was attempted.
    pub fn restart_if_due(&mut self) -> bool {
        if !self.should_restart() {
            return false;
        }

        let due = self
            .last_restart
            .is_none_or(|t| t.elapsed() >= self.restart_delay());
        if !due {
            return false;
        }

        info!("Restarting companion {}", self.name);
        self.restart_count += 1;
        if let Err(e) = self.start() {
            warn!("Restart of {} failed: {}", self.name, e);
        }
        true
    }

    /// Returns the pid of the running process.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    /// Returns the last observed status.
    #[must_use]
    pub fn status(&self) -> CompanionStatus {
        self.status
    }

    /// Returns the number of restarts so far.
    #[must_use]
    pub fn restart_count(&self) -> u32 {
        self.restart_count
    }

    /// Returns the display name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for CompanionProcess {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("Notepad.EXE"), "notepad");
        assert_eq!(normalize_name("sleep"), "sleep");
    }

    #[test]
    fn test_current_process_is_alive() {
        assert!(is_process_alive(std::process::id()));
    }

    #[test]
    fn test_empty_name_finds_nothing() {
        assert!(find_processes_by_name("  ").is_empty());
    }

    #[test]
    fn test_restart_delay_backoff() {
        let mut companion = CompanionProcess::new("test", "does-not-exist").restart_policy(
            RestartPolicy {
                restart_on_crash: true,
                max_restarts: 3,
                restart_delay: Duration::from_millis(100),
            },
        );
        assert_eq!(companion.restart_delay(), Duration::from_millis(100));
        companion.restart_count = 2;
        assert_eq!(companion.restart_delay(), Duration::from_millis(400));
    }

    #[test]
    fn test_failed_start_reports_spawn_error() {
        let mut companion = CompanionProcess::new("ghost", "/definitely/not/here/ghost");
        let err = companion.start().unwrap_err();
        assert!(matches!(err, AddonError::Spawn { .. }));
        assert_eq!(companion.status(), CompanionStatus::Failed);
        assert!(!companion.should_restart());
    }

    #[cfg(unix)]
    #[test]
    fn test_crashed_companion_is_restarted() {
        let mut companion = CompanionProcess::new("crasher", "/bin/sh")
            .args(vec!["-c".into(), "exit 3".into()])
            .restart_policy(RestartPolicy {
                restart_on_crash: true,
                max_restarts: 1,
                restart_delay: Duration::ZERO,
            });

        companion.start().unwrap();
        for _ in 0..200 {
            if companion.check_status() == CompanionStatus::Crashed {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(companion.status(), CompanionStatus::Crashed);
        assert!(companion.restart_if_due());
        assert_eq!(companion.restart_count(), 1);
        companion.stop();
    }

    #[cfg(unix)]
    #[test]
    fn test_stop_kills_running_companion() {
        let mut companion =
            CompanionProcess::new("sleeper", "/bin/sh").args(vec!["-c".into(), "sleep 30".into()]);
        companion.start().unwrap();
        let pid = companion.pid().unwrap();
        assert!(is_process_alive(pid));

        companion.stop();
        assert_eq!(companion.status(), CompanionStatus::Stopped);
        assert!(!is_process_alive(pid));
    }
}
