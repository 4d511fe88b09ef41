//! The bidirectional byte channel between host and sandboxee.
//!
//! One frame carries one postcard-encoded message; descriptors ride the
//! same frame as SCM_RIGHTS ancillary data. The host side is async
//! ([`Comms`]), the sandboxee side blocking ([`SyncComms`]): the serving
//! loop is a plain single-threaded process and gains nothing from a
//! runtime.

use std::collections::VecDeque;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use bytes::BytesMut;
use farcall_util::{fd, frame};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::io::Interest;

#[derive(Debug, Error)]
pub enum ChannelError {
    /// An i/o error occurred on the channel socket.
    #[error("an i/o error occurred")]
    Io(std::io::Error),
    /// A message could not be encoded or decoded.
    #[error("failed to serialize or deserialize a message")]
    Codec(#[from] postcard::Error),
    /// A frame was oversized or failed checksum validation.
    #[error(transparent)]
    Frame(#[from] frame::FrameError),
    /// A descriptor that should have accompanied a message did not arrive.
    #[error("a file descriptor could not be transferred")]
    FdTransfer,
    /// The remote endpoint has closed the channel.
    #[error("the remote endpoint has disconnected")]
    Disconnected,
    /// The sandboxee reported an error for a request.
    #[error("the sandboxee reported an error: {0}")]
    Remote(String),
}

impl From<std::io::Error> for ChannelError {
    fn from(value: std::io::Error) -> Self {
        match value.kind() {
            std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::NotConnected
            | std::io::ErrorKind::WriteZero
            | std::io::ErrorKind::UnexpectedEof => Self::Disconnected,
            _ => Self::Io(value),
        }
    }
}

/// Host-side channel endpoint.
#[derive(Debug)]
pub struct Comms {
    stream: tokio::net::UnixStream,
    fds: VecDeque<OwnedFd>,
}

impl Comms {
    pub fn new(stream: tokio::net::UnixStream) -> Self {
        Self {
            stream,
            fds: VecDeque::new(),
        }
    }

    pub async fn send<T: Serialize>(&mut self, message: &T) -> Result<(), ChannelError> {
        self.send_with_fds(message, &[]).await
    }

    pub async fn send_with_fds<T: Serialize>(
        &mut self,
        message: &T,
        fds: &[RawFd],
    ) -> Result<(), ChannelError> {
        let body = postcard::to_allocvec(message)?;
        let mut buffer = BytesMut::with_capacity(frame::HEADER_SIZE + body.len());
        frame::encode(&body, &mut buffer)?;

        let socket = self.stream.as_raw_fd();
        let mut sent = 0;
        while sent < buffer.len() {
            // Descriptors go out with the first chunk only.
            let pass = if sent == 0 { fds } else { &[] };
            let chunk = self
                .stream
                .async_io(Interest::WRITABLE, || {
                    fd::send(socket, &buffer[sent..], pass)
                })
                .await?;
            if chunk == 0 {
                return Err(ChannelError::Disconnected);
            }
            sent += chunk;
        }
        Ok(())
    }

    pub async fn recv<T: DeserializeOwned>(&mut self) -> Result<T, ChannelError> {
        let mut header = [0u8; frame::HEADER_SIZE];
        self.recv_exact(&mut header).await?;
        let (crc, len) = frame::decode_header(header)?;

        let mut body = vec![0u8; len];
        self.recv_exact(&mut body).await?;
        frame::verify(crc, &body)?;
        Ok(postcard::from_bytes(&body)?)
    }

    async fn recv_exact(&mut self, bytes: &mut [u8]) -> Result<(), ChannelError> {
        let socket = self.stream.as_raw_fd();
        let mut filled = 0;
        while filled < bytes.len() {
            let mut received = Vec::new();
            let chunk = self
                .stream
                .async_io(Interest::READABLE, || {
                    fd::recv(socket, &mut bytes[filled..], &mut received)
                })
                .await?;
            self.fds.extend(received);
            if chunk == 0 {
                return Err(ChannelError::Disconnected);
            }
            filled += chunk;
        }
        Ok(())
    }

    /// Takes the oldest received descriptor not yet claimed by a message.
    pub fn take_fd(&mut self) -> Option<OwnedFd> {
        self.fds.pop_front()
    }
}

/// Sandboxee-side channel endpoint.
#[derive(Debug)]
pub struct SyncComms {
    stream: std::os::unix::net::UnixStream,
    fds: VecDeque<OwnedFd>,
}

impl SyncComms {
    pub fn new(stream: std::os::unix::net::UnixStream) -> Self {
        Self {
            stream,
            fds: VecDeque::new(),
        }
    }

    pub fn send<T: Serialize>(&mut self, message: &T) -> Result<(), ChannelError> {
        self.send_with_fds(message, &[])
    }

    pub fn send_with_fds<T: Serialize>(
        &mut self,
        message: &T,
        fds: &[RawFd],
    ) -> Result<(), ChannelError> {
        let body = postcard::to_allocvec(message)?;
        let mut buffer = BytesMut::with_capacity(frame::HEADER_SIZE + body.len());
        frame::encode(&body, &mut buffer)?;
        fd::send_all(self.stream.as_raw_fd(), &buffer, fds)?;
        Ok(())
    }

    pub fn recv<T: DeserializeOwned>(&mut self) -> Result<T, ChannelError> {
        let mut header = [0u8; frame::HEADER_SIZE];
        self.recv_exact(&mut header)?;
        let (crc, len) = frame::decode_header(header)?;

        let mut body = vec![0u8; len];
        self.recv_exact(&mut body)?;
        frame::verify(crc, &body)?;
        Ok(postcard::from_bytes(&body)?)
    }

    fn recv_exact(&mut self, bytes: &mut [u8]) -> Result<(), ChannelError> {
        let mut received = Vec::new();
        fd::recv_exact(self.stream.as_raw_fd(), bytes, &mut received)?;
        self.fds.extend(received);
        Ok(())
    }

    pub fn take_fd(&mut self) -> Option<OwnedFd> {
        self.fds.pop_front()
    }
}

#[cfg(test)]
mod test {
    use std::os::unix::net::UnixStream;
    use std::time::Duration;

    use rstest::rstest;

    use super::*;
    use crate::proto::{Request, Response};

    fn pair() -> (Comms, SyncComms) {
        let (host, guest) = UnixStream::pair().unwrap();
        host.set_nonblocking(true).unwrap();
        let host = tokio::net::UnixStream::from_std(host).unwrap();
        (Comms::new(host), SyncComms::new(guest))
    }

    #[tokio::test]
    async fn request_response_round_trip() {
        let (mut host, mut guest) = pair();

        let served = std::thread::spawn(move || {
            let request: Request = guest.recv().unwrap();
            match request {
                Request::Allocate { size } => {
                    assert_eq!(size, 10);
                    guest.send(&Response::Allocated { addr: 42 }).unwrap();
                }
                other => panic!("unexpected request: {other:?}"),
            }
        });

        host.send(&Request::Allocate { size: 10 }).await.unwrap();
        let response: Response = host.recv().await.unwrap();
        assert!(matches!(response, Response::Allocated { addr: 42 }));
        served.join().unwrap();
    }

    #[tokio::test]
    async fn descriptor_rides_the_frame() {
        let (mut host, mut guest) = pair();
        let (payload_host, payload_guest) = UnixStream::pair().unwrap();

        let served = std::thread::spawn(move || {
            let request: Request = guest.recv().unwrap();
            assert!(matches!(request, Request::PushFd));
            let fd = guest.take_fd().expect("descriptor should arrive with the frame");
            guest
                .send(&Response::FdPushed {
                    remote_fd: fd.as_raw_fd(),
                })
                .unwrap();
            fd
        });

        host.send_with_fds(&Request::PushFd, &[payload_guest.as_raw_fd()])
            .await
            .unwrap();
        drop(payload_guest);
        let response: Response = host.recv().await.unwrap();
        assert!(matches!(response, Response::FdPushed { .. }));
        drop(payload_host);
        drop(served.join().unwrap());
    }

    #[rstest]
    #[timeout(Duration::from_secs(2))]
    fn corrupted_frame_detected() {
        use std::io::Write;

        let (mut writer, reader) = UnixStream::pair().unwrap();

        // Valid length, wrong checksum.
        let mut raw = Vec::new();
        raw.extend_from_slice(&0xFFFF_FFFFu32.to_le_bytes());
        raw.extend_from_slice(&4u32.to_le_bytes());
        raw.extend_from_slice(b"abcd");
        writer.write_all(&raw).unwrap();

        let mut comms = SyncComms::new(reader);
        let error = comms.recv::<Request>().unwrap_err();
        assert!(matches!(
            error,
            ChannelError::Frame(farcall_util::frame::FrameError::Corrupt)
        ));
    }

    #[tokio::test]
    async fn disconnect_reported() {
        let (mut host, guest) = pair();
        drop(guest);
        let error = host.recv::<Response>().await.unwrap_err();
        assert!(matches!(error, ChannelError::Disconnected));
    }
}
