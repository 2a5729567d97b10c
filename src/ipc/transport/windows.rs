//! Windows Named Pipe transport implementation.

use std::ffi::OsStr;
use std::io;
use std::os::windows::ffi::OsStrExt;
use std::ptr;
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info};

use super::{FramedConnection, sanitize_channel};
use crate::ipc::IpcError;

// Windows API constants
const PIPE_ACCESS_DUPLEX: u32 = 0x00000003;
const FILE_FLAG_FIRST_PIPE_INSTANCE: u32 = 0x00080000;
const PIPE_TYPE_BYTE: u32 = 0x00000000;
const PIPE_READMODE_BYTE: u32 = 0x00000000;
const PIPE_WAIT: u32 = 0x00000000;
const PIPE_REJECT_REMOTE_CLIENTS: u32 = 0x00000008;
const PIPE_UNLIMITED_INSTANCES: u32 = 255;
const INVALID_HANDLE_VALUE: isize = -1;
const ERROR_FILE_NOT_FOUND: u32 = 2;
const ERROR_ACCESS_DENIED: u32 = 5;
const ERROR_BROKEN_PIPE: u32 = 109;
const ERROR_PIPE_BUSY: u32 = 231;
const ERROR_PIPE_CONNECTED: u32 = 535;
const GENERIC_READ: u32 = 0x80000000;
const GENERIC_WRITE: u32 = 0x40000000;
const OPEN_EXISTING: u32 = 3;

/// Connect attempts while the server is between pipe instances.
const CONNECT_ATTEMPTS: u32 = 5;
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(50);

#[link(name = "kernel32")]
unsafe extern "system" {
    fn CreateNamedPipeW(
        lpName: *const u16,
        dwOpenMode: u32,
        dwPipeMode: u32,
        nMaxInstances: u32,
        nOutBufferSize: u32,
        nInBufferSize: u32,
        nDefaultTimeOut: u32,
        lpSecurityAttributes: *mut std::ffi::c_void,
    ) -> isize;

    fn ConnectNamedPipe(hNamedPipe: isize, lpOverlapped: *mut std::ffi::c_void) -> i32;

    fn DisconnectNamedPipe(hNamedPipe: isize) -> i32;

    fn WaitNamedPipeW(lpNamedPipeName: *const u16, nTimeOut: u32) -> i32;

    fn CloseHandle(hObject: isize) -> i32;

    fn GetLastError() -> u32;

    fn CreateFileW(
        lpFileName: *const u16,
        dwDesiredAccess: u32,
        dwShareMode: u32,
        lpSecurityAttributes: *mut std::ffi::c_void,
        dwCreationDisposition: u32,
        dwFlagsAndAttributes: u32,
        hTemplateFile: isize,
    ) -> isize;

    fn ReadFile(
        hFile: isize,
        lpBuffer: *mut u8,
        nNumberOfBytesToRead: u32,
        lpNumberOfBytesRead: *mut u32,
        lpOverlapped: *mut std::ffi::c_void,
    ) -> i32;

    fn WriteFile(
        hFile: isize,
        lpBuffer: *const u8,
        nNumberOfBytesToWrite: u32,
        lpNumberOfBytesWritten: *mut u32,
        lpOverlapped: *mut std::ffi::c_void,
    ) -> i32;

    fn FlushFileBuffers(hFile: isize) -> i32;
}

/// Converts a Rust string to a null-terminated wide string.
fn to_wide_string(s: &str) -> Vec<u16> {
    OsStr::new(s)
        .encode_wide()
        .chain(std::iter::once(0))
        .collect()
}

fn last_error() -> u32 {
    unsafe { GetLastError() }
}

/// Pipe name for a channel.
#[must_use]
pub fn pipe_name(channel: &str) -> String {
    format!(r"\\.\pipe\addonhost-{}", sanitize_channel(channel))
}

/// Windows pipe handle wrapper.
struct PipeHandle(isize);

impl PipeHandle {
    fn is_valid(&self) -> bool {
        self.0 != INVALID_HANDLE_VALUE && self.0 != 0
    }
}

impl Drop for PipeHandle {
    fn drop(&mut self) {
        if self.is_valid() {
            unsafe {
                CloseHandle(self.0);
            }
        }
    }
}

/// One end of a connected pipe.
pub struct PipeStream {
    handle: PipeHandle,
    /// Server ends are disconnected before the handle is closed.
    server_side: bool,
}

/// Underlying stream type.
pub type Stream = PipeStream;

impl io::Read for PipeStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut bytes_read: u32 = 0;
        let len = u32::try_from(buf.len()).unwrap_or(u32::MAX);

        let result = unsafe {
            ReadFile(
                self.handle.0,
                buf.as_mut_ptr(),
                len,
                &mut bytes_read,
                ptr::null_mut(),
            )
        };

        if result == 0 {
            let err = last_error();
            if err == ERROR_BROKEN_PIPE {
                return Ok(0);
            }
            return Err(io::Error::from_raw_os_error(err as i32));
        }

        Ok(bytes_read as usize)
    }
}

impl io::Write for PipeStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut bytes_written: u32 = 0;
        let len = u32::try_from(buf.len()).unwrap_or(u32::MAX);

        let result = unsafe {
            WriteFile(
                self.handle.0,
                buf.as_ptr(),
                len,
                &mut bytes_written,
                ptr::null_mut(),
            )
        };

        if result == 0 {
            return Err(io::Error::from_raw_os_error(last_error() as i32));
        }

        Ok(bytes_written as usize)
    }

    fn flush(&mut self) -> io::Result<()> {
        let result = unsafe { FlushFileBuffers(self.handle.0) };
        if result == 0 {
            return Err(io::Error::from_raw_os_error(last_error() as i32));
        }
        Ok(())
    }
}

impl Drop for PipeStream {
    fn drop(&mut self) {
        if self.server_side && self.handle.is_valid() {
            unsafe {
                DisconnectNamedPipe(self.handle.0);
            }
        }
    }
}

/// Listening side of a channel.
pub struct ChannelListener {
    pipe_name: String,
    wide_name: Vec<u16>,
    /// First instance, created at bind time so a second owner is detected.
    pending: Option<PipeHandle>,
}

impl ChannelListener {
    /// Creates the first pipe instance for the channel.
    pub fn bind(channel: &str) -> Result<Self, IpcError> {
        let pipe_name = pipe_name(channel);
        let wide_name = to_wide_string(&pipe_name);

        let handle = Self::create_instance(&wide_name, FILE_FLAG_FIRST_PIPE_INSTANCE).map_err(
            |err| {
                if err == ERROR_ACCESS_DENIED || err == ERROR_PIPE_BUSY {
                    IpcError::ChannelInUse(channel.to_string())
                } else {
                    IpcError::Transport(io::Error::from_raw_os_error(err as i32))
                }
            },
        )?;

        info!("[IPC] Channel '{}' listening on {}", channel, pipe_name);

        Ok(Self {
            pipe_name,
            wide_name,
            pending: Some(handle),
        })
    }

    fn create_instance(wide_name: &[u16], extra_flags: u32) -> Result<PipeHandle, u32> {
        let handle = unsafe {
            CreateNamedPipeW(
                wide_name.as_ptr(),
                PIPE_ACCESS_DUPLEX | extra_flags,
                PIPE_TYPE_BYTE | PIPE_READMODE_BYTE | PIPE_WAIT | PIPE_REJECT_REMOTE_CLIENTS,
                PIPE_UNLIMITED_INSTANCES,
                4096, // Output buffer size
                4096, // Input buffer size
                0,    // Default timeout
                ptr::null_mut(),
            )
        };

        if handle == INVALID_HANDLE_VALUE {
            Err(last_error())
        } else {
            Ok(PipeHandle(handle))
        }
    }

    /// Returns the pipe name.
    pub fn pipe_name(&self) -> &str {
        &self.pipe_name
    }

    /// Accepts a new connection (blocking).
    pub fn accept(&mut self) -> Result<FramedConnection<Stream>, IpcError> {
        let handle = match self.pending.take() {
            Some(handle) => handle,
            None => Self::create_instance(&self.wide_name, 0).map_err(|err| {
                error!("Failed to create named pipe: error {}", err);
                IpcError::Transport(io::Error::from_raw_os_error(err as i32))
            })?,
        };

        let result = unsafe { ConnectNamedPipe(handle.0, ptr::null_mut()) };
        if result == 0 {
            let err = last_error();
            if err != ERROR_PIPE_CONNECTED {
                error!("Failed to connect named pipe: error {}", err);
                return Err(IpcError::Transport(io::Error::from_raw_os_error(
                    err as i32,
                )));
            }
        }

        debug!("Client connected to {}", self.pipe_name);

        Ok(FramedConnection::new(PipeStream {
            handle,
            server_side: true,
        }))
    }
}

/// Connects to a channel.
pub fn connect(channel: &str) -> Result<FramedConnection<Stream>, IpcError> {
    let wide_name = to_wide_string(&pipe_name(channel));
    let mut last = ERROR_FILE_NOT_FOUND;

    for _ in 0..CONNECT_ATTEMPTS {
        let handle = unsafe {
            CreateFileW(
                wide_name.as_ptr(),
                GENERIC_READ | GENERIC_WRITE,
                0,
                ptr::null_mut(),
                OPEN_EXISTING,
                0,
                0,
            )
        };

        if handle != INVALID_HANDLE_VALUE {
            return Ok(FramedConnection::new(PipeStream {
                handle: PipeHandle(handle),
                server_side: false,
            }));
        }

        last = last_error();
        match last {
            ERROR_PIPE_BUSY => unsafe {
                WaitNamedPipeW(wide_name.as_ptr(), 2000);
            },
            // The server may be between instances.
            ERROR_FILE_NOT_FOUND => thread::sleep(CONNECT_RETRY_DELAY),
            _ => break,
        }
    }

    Err(IpcError::Transport(io::Error::from_raw_os_error(
        last as i32,
    )))
}
