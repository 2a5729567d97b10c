//! Channel message types and framing.

use std::io::{ErrorKind, Read, Write};

use serde::{Deserialize, Serialize};

use super::IpcError;

/// Maximum body size of a single frame.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Request sent to the channel owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ChannelRequest {
    /// A companion announces itself.
    RegisterCallback {
        /// Companion process id.
        pid: u32,
        /// Why the companion was started (e.g. `Login`).
        purpose: String,
    },
    /// Asks for the pid of the tracked companion.
    GetHandle,
    /// Terminates the tracked companion.
    Kill,
    /// Delivers a one-time password.
    SubmitOtp {
        /// The code as received.
        code: String,
    },
}

/// Response from the channel owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ChannelResponse {
    /// Request accepted.
    Ok,
    /// Tracked companion pid, if any.
    Handle {
        /// Process id.
        pid: Option<u32>,
    },
    /// Outcome of a kill request.
    Killed {
        /// True if a process was terminated.
        killed: bool,
    },
    /// Request failed.
    Error {
        /// Error description.
        message: String,
    },
}

impl ChannelResponse {
    /// Creates an error response.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

/// Writes one length-prefixed frame.
pub fn write_frame<W: Write>(writer: &mut W, body: &[u8]) -> Result<(), IpcError> {
    if body.len() > MAX_FRAME_LEN {
        return Err(IpcError::FrameTooLarge(body.len()));
    }

    let len = u32::try_from(body.len()).map_err(|_| IpcError::FrameTooLarge(body.len()))?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(body)?;
    writer.flush()?;
    Ok(())
}

/// Reads one length-prefixed frame. Returns `None` on a clean end of stream.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Option<Vec<u8>>, IpcError> {
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(IpcError::Transport(e)),
    }

    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(IpcError::FrameTooLarge(len));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).map_err(|e| {
        if e.kind() == ErrorKind::UnexpectedEof {
            IpcError::Protocol("truncated frame".to_string())
        } else {
            IpcError::Transport(e)
        }
    })?;

    Ok(Some(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_request_wire_format() {
        let json = serde_json::to_string(&ChannelRequest::SubmitOtp {
            code: "123456".into(),
        })
        .unwrap();
        assert_eq!(json, r#"{"op":"submit_otp","code":"123456"}"#);

        let kill: ChannelRequest = serde_json::from_str(r#"{"op":"kill"}"#).unwrap();
        assert_eq!(kill, ChannelRequest::Kill);
    }

    #[test]
    fn test_response_wire_format() {
        let json = serde_json::to_string(&ChannelResponse::Handle { pid: Some(42) }).unwrap();
        assert_eq!(json, r#"{"status":"handle","pid":42}"#);
        assert_eq!(
            serde_json::to_string(&ChannelResponse::Ok).unwrap(),
            r#"{"status":"ok"}"#
        );
    }

    #[test]
    fn test_frame_header_is_big_endian() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"abc").unwrap();
        assert_eq!(&buf[..4], &[0, 0, 0, 3]);

        let mut cursor = Cursor::new(buf);
        assert_eq!(read_frame(&mut cursor).unwrap().unwrap(), b"abc");
        assert!(read_frame(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut header = ((MAX_FRAME_LEN + 1) as u32).to_be_bytes().to_vec();
        header.extend_from_slice(b"ignored");
        let err = read_frame(&mut Cursor::new(header)).unwrap_err();
        assert!(matches!(err, IpcError::FrameTooLarge(_)));

        let body = vec![0u8; MAX_FRAME_LEN + 1];
        assert!(write_frame(&mut Vec::new(), &body).is_err());
    }

    #[test]
    fn test_truncated_frame_is_protocol_error() {
        let data = vec![0, 0, 0, 10, b'x'];
        let err = read_frame(&mut Cursor::new(data)).unwrap_err();
        assert!(matches!(err, IpcError::Protocol(_)));
    }
}
