//! The RFCOMM session collaborator used to carry hands-free AT commands.
//!
//! The AT-command wire format itself is out of scope for this crate (a
//! named external collaborator); what lives here is the session
//! lifecycle contract the transport core drives: dispatching codec
//! switch / volume signals and rendezvousing on codec-selection
//! completion.

use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::unix::AsyncFd;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::sock::OwnedFd;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RfcommSignal {
    HfpSetCodecCvsd,
    HfpSetCodecMsbc,
    UpdateVolume(u16),
}

#[derive(Clone, Error, Debug)]
pub enum RfcommError {
    #[error("io: {0}")]
    Io(std::io::ErrorKind),
    #[error("session already destroyed")]
    Destroyed,
}

impl From<std::io::Error> for RfcommError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.kind())
    }
}

#[async_trait]
pub trait RfcommSession: Send + Sync + std::fmt::Debug {
    async fn send_signal(&self, signal: RfcommSignal) -> Result<(), RfcommError>;
    async fn destroy(&self);
    fn codec_selection_completed(&self) -> Arc<Notify>;
}

/// One byte per signal on the wire, the same convention as the IO
/// worker control pipe. Standing in for full AT-command framing, which
/// this crate does not implement.
fn encode(signal: RfcommSignal) -> [u8; 3] {
    match signal {
        RfcommSignal::HfpSetCodecCvsd => [0x01, 0, 0],
        RfcommSignal::HfpSetCodecMsbc => [0x02, 0, 0],
        RfcommSignal::UpdateVolume(v) => [0x03, (v & 0xff) as u8, (v >> 8) as u8],
    }
}

#[derive(Debug)]
pub struct RawRfcommSession {
    fd: AsyncFd<OwnedFd>,
    codec_selection_completed: Arc<Notify>,
    reader: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl RawRfcommSession {
    pub fn new(raw_fd: RawFd) -> std::io::Result<Arc<Self>> {
        let fd = AsyncFd::new(unsafe { OwnedFd::new(raw_fd) })?;
        let session = Arc::new(Self {
            fd,
            codec_selection_completed: Arc::new(Notify::new()),
            reader: std::sync::Mutex::new(None),
        });
        let spawned = {
            let session = session.clone();
            tokio::spawn(async move {
                session.read_loop().await;
            })
        };
        *session.reader.lock().unwrap() = Some(spawned);
        Ok(session)
    }

    async fn read_loop(&self) {
        let mut buf = [0u8; 3];
        loop {
            let mut guard = match self.fd.readable().await {
                Ok(guard) => guard,
                Err(_) => return,
            };
            let result = guard.try_io(|inner| {
                match unsafe {
                    libc::read(inner.get_ref().as_raw_fd(), buf.as_mut_ptr() as *mut _, buf.len())
                } {
                    -1 => Err(std::io::Error::last_os_error()),
                    0 => Ok(0),
                    n => Ok(n as usize),
                }
            });
            match result {
                Ok(Ok(0)) => return,
                Ok(Ok(_)) => {
                    // A completion notification (codec ack) wakes anyone
                    // waiting on the codec-switch handshake; the actual
                    // `type.codec` comparison happens in the caller.
                    self.codec_selection_completed.notify_waiters();
                }
                Ok(Err(_)) => return,
                Err(_would_block) => continue,
            }
        }
    }
}

#[async_trait]
impl RfcommSession for RawRfcommSession {
    async fn send_signal(&self, signal: RfcommSignal) -> Result<(), RfcommError> {
        let buf = encode(signal);
        loop {
            let mut guard = self.fd.writable().await?;
            match guard.try_io(|inner| {
                match unsafe {
                    libc::write(inner.get_ref().as_raw_fd(), buf.as_ptr() as *const _, buf.len())
                } {
                    -1 => Err(std::io::Error::last_os_error()),
                    n => Ok(n as usize),
                }
            }) {
                Ok(result) => {
                    result?;
                    return Ok(());
                }
                Err(_would_block) => continue,
            }
        }
    }

    async fn destroy(&self) {
        if let Some(handle) = self.reader.lock().unwrap().take() {
            handle.abort();
        }
    }

    fn codec_selection_completed(&self) -> Arc<Notify> {
        self.codec_selection_completed.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_produces_the_expected_wire_bytes() {
        assert_eq!(encode(RfcommSignal::HfpSetCodecCvsd), [0x01, 0, 0]);
        assert_eq!(encode(RfcommSignal::HfpSetCodecMsbc), [0x02, 0, 0]);
        assert_eq!(encode(RfcommSignal::UpdateVolume(0x1234)), [0x03, 0x34, 0x12]);
    }

    #[tokio::test]
    async fn destroy_is_idempotent() {
        let (read_fd, write_fd) = {
            let mut fds = [0i32; 2];
            assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
            (fds[0], fds[1])
        };
        let session = RawRfcommSession::new(read_fd).unwrap();
        session.destroy().await;
        session.destroy().await;
        unsafe {
            libc::close(write_fd);
        }
    }
}
