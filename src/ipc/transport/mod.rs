//! Transport layer for the local channel.
//!
//! Provides platform-specific IPC implementations:
//! - Windows: Named Pipes
//! - Unix: Domain Sockets

#[cfg(windows)]
pub mod windows;

#[cfg(unix)]
pub mod unix;

use std::io::{Read, Write};

use serde::Serialize;
use serde::de::DeserializeOwned;

use super::IpcError;
use super::protocol::{read_frame, write_frame};

#[cfg(unix)]
pub use unix::{ChannelListener, Stream, connect};

#[cfg(windows)]
pub use windows::{ChannelListener, Stream, connect};

/// Connection trait for reading/writing framed messages.
pub trait Connection: Send {
    /// Reads a single frame body. `None` once the peer has closed.
    fn read_message(&mut self) -> Result<Option<Vec<u8>>, IpcError>;

    /// Writes a single frame body.
    fn write_message(&mut self, body: &[u8]) -> Result<(), IpcError>;

    /// Checks if connection is still open.
    fn is_open(&self) -> bool;
}

/// Length-prefixed connection over any byte stream.
pub struct FramedConnection<S> {
    stream: S,
    open: bool,
}

impl<S: Read + Write + Send> FramedConnection<S> {
    /// Wraps a connected stream.
    pub fn new(stream: S) -> Self {
        Self { stream, open: true }
    }

    /// Serializes and sends a message.
    pub fn send<T: Serialize>(&mut self, msg: &T) -> Result<(), IpcError> {
        let body = serde_json::to_vec(msg)?;
        self.write_message(&body)
    }

    /// Receives and deserializes a message.
    pub fn recv<T: DeserializeOwned>(&mut self) -> Result<Option<T>, IpcError> {
        match self.read_message()? {
            Some(body) => Ok(Some(serde_json::from_slice(&body)?)),
            None => Ok(None),
        }
    }
}

impl<S: Read + Write + Send> Connection for FramedConnection<S> {
    fn read_message(&mut self) -> Result<Option<Vec<u8>>, IpcError> {
        if !self.open {
            return Ok(None);
        }

        match read_frame(&mut self.stream) {
            Ok(Some(body)) => Ok(Some(body)),
            Ok(None) => {
                self.open = false;
                Ok(None)
            }
            Err(e) => {
                self.open = false;
                Err(e)
            }
        }
    }

    fn write_message(&mut self, body: &[u8]) -> Result<(), IpcError> {
        if !self.open {
            return Err(IpcError::Transport(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "Connection closed",
            )));
        }

        write_frame(&mut self.stream, body)
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

/// Restricts a channel name to characters safe in paths and pipe names.
#[must_use]
pub fn sanitize_channel(channel: &str) -> String {
    channel
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
