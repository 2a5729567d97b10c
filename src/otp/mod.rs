//! One-time password relay.
//!
//! The companion side of the OTP relay: a loopback HTTP listener that
//! accepts codes from a paired device and forwards them to the launcher's
//! published channel.

pub mod listener;

use thiserror::Error;
use tracing::debug;

use crate::ipc::ChannelClient;

pub use listener::{OtpListener, OtpSink};

/// Default listener port.
pub const DEFAULT_OTP_PORT: u16 = 4646;

/// Number of digits in a valid code.
pub const OTP_LENGTH: usize = 6;

/// Environment variable carrying the launcher channel name to the companion.
pub const CHANNEL_ENV: &str = "ADDONHOST_OTP_CHANNEL";

/// OTP errors.
#[derive(Debug, Error)]
pub enum OtpError {
    /// Code is not six ASCII digits.
    #[error("Invalid OTP: {0:?}")]
    Invalid(String),

    /// Listener could not bind.
    #[error("Failed to bind port {port}: {source}")]
    Bind {
        /// Requested port.
        port: u16,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

/// Trims and validates a code.
pub fn normalize_otp(input: &str) -> Result<String, OtpError> {
    let code = input.trim();
    if code.len() == OTP_LENGTH && code.bytes().all(|b| b.is_ascii_digit()) {
        Ok(code.to_string())
    } else {
        Err(OtpError::Invalid(input.to_string()))
    }
}

/// Forwards codes to a launcher channel, one connection per code.
#[derive(Debug, Clone)]
pub struct ChannelForwarder {
    channel: String,
}

impl ChannelForwarder {
    /// Creates a forwarder for `channel`.
    #[must_use]
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
        }
    }
}

impl OtpSink for ChannelForwarder {
    fn submit(&self, code: &str) -> Result<(), String> {
        debug!("[OTP] Forwarding code to '{}'", self.channel);
        ChannelClient::connect(&self.channel)
            .and_then(|mut client| client.submit_otp(code))
            .map_err(|e| e.to_string())
    }
}
