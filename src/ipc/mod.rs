//! Named local channel between the launcher and companion processes.
//!
//! The launcher publishes a channel under a well-known name; companions
//! connect to it to announce themselves and to forward one-time passwords,
//! and the launcher's own teardown connects to it to kill the companion.
//!
//! Uses Unix domain sockets on Unix and named pipes on Windows. Messages are
//! framed as a 4-byte big-endian length followed by a UTF-8 JSON body.

pub mod client;
pub mod protocol;
pub mod server;
pub mod transport;

use thiserror::Error;

pub use client::ChannelClient;
pub use protocol::{ChannelRequest, ChannelResponse, MAX_FRAME_LEN};
pub use server::{ChannelHandler, ChannelServer};

/// Well-known channel name used by the OTP relay.
pub const DEFAULT_OTP_CHANNEL: &str = "otpLink";

/// IPC error types.
#[derive(Debug, Error)]
pub enum IpcError {
    /// Transport/IO error.
    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Protocol violation.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Frame exceeds the maximum size.
    #[error("Frame of {0} bytes exceeds the limit")]
    FrameTooLarge(usize),

    /// Another live server already owns the channel.
    #[error("Channel '{0}' is already in use")]
    ChannelInUse(String),

    /// The server reported an error.
    #[error("Remote error: {0}")]
    Remote(String),

    /// The server answered with the wrong response kind.
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),
}
