//! Channel client used by companions and by teardown.

use super::IpcError;
use super::protocol::{ChannelRequest, ChannelResponse};
use super::transport::{self, FramedConnection, Stream};

/// Connection to a published channel.
pub struct ChannelClient {
    conn: FramedConnection<Stream>,
}

impl ChannelClient {
    /// Connects to `channel`.
    pub fn connect(channel: &str) -> Result<Self, IpcError> {
        Ok(Self {
            conn: transport::connect(channel)?,
        })
    }

    /// Sends one request and waits for its response.
    pub fn call(&mut self, request: &ChannelRequest) -> Result<ChannelResponse, IpcError> {
        self.conn.send(request)?;
        match self.conn.recv::<ChannelResponse>()? {
            Some(ChannelResponse::Error { message }) => Err(IpcError::Remote(message)),
            Some(response) => Ok(response),
            None => Err(IpcError::Protocol(
                "channel closed before responding".to_string(),
            )),
        }
    }

    /// Announces this process to the channel owner.
    pub fn register_callback(&mut self, pid: u32, purpose: &str) -> Result<(), IpcError> {
        let request = ChannelRequest::RegisterCallback {
            pid,
            purpose: purpose.to_string(),
        };
        match self.call(&request)? {
            ChannelResponse::Ok => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    /// Returns the pid of the tracked companion.
    pub fn get_handle(&mut self) -> Result<Option<u32>, IpcError> {
        match self.call(&ChannelRequest::GetHandle)? {
            ChannelResponse::Handle { pid } => Ok(pid),
            other => Err(unexpected(&other)),
        }
    }

    /// Asks the channel owner to terminate the tracked companion.
    pub fn kill(&mut self) -> Result<bool, IpcError> {
        match self.call(&ChannelRequest::Kill)? {
            ChannelResponse::Killed { killed } => Ok(killed),
            other => Err(unexpected(&other)),
        }
    }

    /// Delivers a one-time password.
    pub fn submit_otp(&mut self, code: &str) -> Result<(), IpcError> {
        let request = ChannelRequest::SubmitOtp {
            code: code.to_string(),
        };
        match self.call(&request)? {
            ChannelResponse::Ok => Ok(()),
            other => Err(unexpected(&other)),
        }
    }
}

fn unexpected(response: &ChannelResponse) -> IpcError {
    IpcError::UnexpectedResponse(format!("{:?}", response))
}
