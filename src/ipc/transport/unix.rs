//! Unix domain socket transport implementation.

use std::io::ErrorKind;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::time::Duration;

use tracing::{debug, error, info};

use super::{FramedConnection, sanitize_channel};
use crate::ipc::IpcError;

/// Underlying stream type.
pub type Stream = UnixStream;

/// Read/write timeout applied to every connection.
const IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Socket path for a channel name.
#[must_use]
pub fn socket_path(channel: &str) -> PathBuf {
    dirs::runtime_dir()
        .or_else(|| std::env::var_os("TMPDIR").map(PathBuf::from))
        .unwrap_or_else(std::env::temp_dir)
        .join(format!("addonhost-{}.sock", sanitize_channel(channel)))
}

/// Listening side of a channel.
pub struct ChannelListener {
    listener: UnixListener,
    socket_path: PathBuf,
}

impl ChannelListener {
    /// Binds the channel, replacing a stale socket left by a dead owner.
    pub fn bind(channel: &str) -> Result<Self, IpcError> {
        let path = socket_path(channel);

        if path.exists() {
            if UnixStream::connect(&path).is_ok() {
                return Err(IpcError::ChannelInUse(channel.to_string()));
            }
            debug!("Removing stale socket file: {:?}", path);
            let _ = std::fs::remove_file(&path);
        }

        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let listener = UnixListener::bind(&path)?;

        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
        }

        info!("[IPC] Channel '{}' listening on {:?}", channel, path);

        Ok(Self {
            listener,
            socket_path: path,
        })
    }

    /// Returns the socket path.
    pub fn socket_path(&self) -> &PathBuf {
        &self.socket_path
    }

    /// Accepts a new connection (blocking).
    pub fn accept(&mut self) -> Result<FramedConnection<Stream>, IpcError> {
        match self.listener.accept() {
            Ok((stream, _)) => {
                stream.set_read_timeout(Some(IO_TIMEOUT))?;
                stream.set_write_timeout(Some(IO_TIMEOUT))?;
                Ok(FramedConnection::new(stream))
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
                Err(IpcError::Transport(e))
            }
        }
    }
}

impl Drop for ChannelListener {
    fn drop(&mut self) {
        if self.socket_path.exists() {
            debug!("Removing socket file: {:?}", self.socket_path);
            let _ = std::fs::remove_file(&self.socket_path);
        }
    }
}

/// Connects to a channel.
pub fn connect(channel: &str) -> Result<FramedConnection<Stream>, IpcError> {
    let path = socket_path(channel);
    let stream = UnixStream::connect(&path).map_err(|e| {
        if e.kind() == ErrorKind::NotFound {
            IpcError::Transport(std::io::Error::new(
                ErrorKind::NotFound,
                format!("channel '{}' is not published", channel),
            ))
        } else {
            IpcError::Transport(e)
        }
    })?;

    stream.set_read_timeout(Some(IO_TIMEOUT))?;
    stream.set_write_timeout(Some(IO_TIMEOUT))?;
    Ok(FramedConnection::new(stream))
}
