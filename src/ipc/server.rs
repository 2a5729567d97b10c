//! Channel server.
//!
//! Runs in a background thread, accepts connections one at a time, and
//! dispatches each request to a [`ChannelHandler`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use tracing::{debug, error, info, warn};

use super::IpcError;
use super::protocol::{ChannelRequest, ChannelResponse};
use super::transport::{self, ChannelListener, Connection, FramedConnection, Stream};

/// Maximum requests served on one connection.
const MAX_REQUESTS_PER_CONNECTION: usize = 1024;

/// Launcher-side implementation of the channel operations.
pub trait ChannelHandler: Send + Sync {
    /// A companion announced its pid and purpose.
    fn register_callback(&self, pid: u32, purpose: &str) -> Result<(), String>;

    /// Pid of the tracked companion, if any.
    fn handle(&self) -> Option<u32>;

    /// Terminates the tracked companion. Returns true if one was killed.
    fn kill(&self) -> bool;

    /// A one-time password arrived.
    fn submit_otp(&self, code: &str) -> Result<(), String>;
}

/// Maps a request onto the handler.
pub fn dispatch(handler: &dyn ChannelHandler, request: ChannelRequest) -> ChannelResponse {
    match request {
        ChannelRequest::RegisterCallback { pid, purpose } => {
            match handler.register_callback(pid, &purpose) {
                Ok(()) => ChannelResponse::Ok,
                Err(e) => ChannelResponse::error(e),
            }
        }
        ChannelRequest::GetHandle => ChannelResponse::Handle {
            pid: handler.handle(),
        },
        ChannelRequest::Kill => ChannelResponse::Killed {
            killed: handler.kill(),
        },
        ChannelRequest::SubmitOtp { code } => match handler.submit_otp(&code) {
            Ok(()) => ChannelResponse::Ok,
            Err(e) => ChannelResponse::error(e),
        },
    }
}

/// Published channel served from a background thread.
pub struct ChannelServer {
    channel: String,
    thread_handle: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl ChannelServer {
    /// Binds `channel` and starts serving it.
    ///
    /// Binding happens before this returns, so clients may connect as soon
    /// as it succeeds.
    pub fn start(channel: &str, handler: Arc<dyn ChannelHandler>) -> Result<Self, IpcError> {
        let listener = ChannelListener::bind(channel)?;
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = Arc::clone(&shutdown);
        let name = channel.to_string();

        let thread_handle = thread::Builder::new()
            .name(format!("ipc-{}", channel))
            .spawn(move || {
                Self::run(listener, &name, handler.as_ref(), &shutdown_clone);
            })?;

        Ok(Self {
            channel: channel.to_string(),
            thread_handle: Some(thread_handle),
            shutdown,
        })
    }

    /// Returns the channel name.
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Returns true until `shutdown` has completed.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.thread_handle.is_some()
    }

    /// Stops the server and waits for its thread.
    pub fn shutdown(&mut self) {
        let Some(handle) = self.thread_handle.take() else {
            return;
        };

        self.shutdown.store(true, Ordering::SeqCst);
        // Wake the blocking accept.
        let _ = transport::connect(&self.channel);

        if handle.join().is_err() {
            error!("[IPC] Channel '{}' thread panicked", self.channel);
        }
        info!("[IPC] Channel '{}' closed", self.channel);
    }

    fn run(
        mut listener: ChannelListener,
        channel: &str,
        handler: &dyn ChannelHandler,
        shutdown: &AtomicBool,
    ) {
        while !shutdown.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok(mut conn) => {
                    if shutdown.load(Ordering::SeqCst) {
                        break;
                    }
                    Self::handle_connection(&mut conn, handler, shutdown);
                }
                Err(e) => {
                    if !shutdown.load(Ordering::SeqCst) {
                        warn!("[IPC] Accept on '{}' failed: {}", channel, e);
                    }
                }
            }
        }

        debug!("[IPC] Channel '{}' loop finished", channel);
    }

    fn handle_connection(
        conn: &mut FramedConnection<Stream>,
        handler: &dyn ChannelHandler,
        shutdown: &AtomicBool,
    ) {
        for _ in 0..MAX_REQUESTS_PER_CONNECTION {
            if shutdown.load(Ordering::SeqCst) || !conn.is_open() {
                break;
            }

            let request = match conn.recv::<ChannelRequest>() {
                Ok(Some(request)) => request,
                Ok(None) => break,
                Err(IpcError::Json(e)) => {
                    let _ = conn.send(&ChannelResponse::error(format!("Parse error: {}", e)));
                    continue;
                }
                Err(e) => {
                    debug!("[IPC] Connection dropped: {}", e);
                    break;
                }
            };

            debug!("[IPC] Request: {:?}", request);
            let response = dispatch(handler, request);

            if let Err(e) = conn.send(&response) {
                warn!("[IPC] Failed to send response: {}", e);
                break;
            }
        }
    }
}

impl Drop for ChannelServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
