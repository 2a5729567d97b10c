//! Read-only handle to the monitored game process.

use std::io;
use std::path::Path;
use std::process::{Child, Command};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use super::process;

/// The game process addons run alongside.
///
/// Addons may query the pid and exit status; nothing here can terminate the
/// game.
#[derive(Debug)]
pub struct GameProcess {
    pid: u32,
    /// Present when the game was started by this process.
    child: Option<Mutex<Child>>,
}

impl GameProcess {
    /// Starts the game executable.
    pub fn spawn(path: &Path, args: &[String]) -> io::Result<Self> {
        let mut cmd = Command::new(path);
        cmd.args(args);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            cmd.current_dir(parent);
        }

        let child = cmd.spawn()?;
        tracing::info!("Started game process {} (pid {})", path.display(), child.id());

        Ok(Self {
            pid: child.id(),
            child: Some(Mutex::new(child)),
        })
    }

    /// Attaches to an already running process by pid.
    #[must_use]
    pub fn attach(pid: u32) -> Self {
        Self { pid, child: None }
    }

    /// Handle to the launcher itself, used for launcher-phase addons that
    /// start before any game exists.
    #[must_use]
    pub fn launcher() -> Self {
        Self::attach(std::process::id())
    }

    /// Returns the OS process id.
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Returns true once the game has exited.
    #[must_use]
    pub fn has_exited(&self) -> bool {
        match &self.child {
            Some(child) => match child.lock() {
                Ok(mut child) => !matches!(child.try_wait(), Ok(None)),
                Err(_) => true,
            },
            None => !process::is_process_alive(self.pid),
        }
    }

    /// Blocks until the game exits, checking every `poll`.
    pub fn wait_for_exit(&self, poll: Duration) {
        while !self.has_exited() {
            thread::sleep(poll);
        }
    }
}
