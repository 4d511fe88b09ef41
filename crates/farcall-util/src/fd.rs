//! SCM_RIGHTS descriptor passing over unix sockets.
//!
//! Descriptors ride as ancillary data on the first chunk of a frame; the
//! receiver collects them into owned handles so nothing leaks when a read
//! fails halfway through.

use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};

/// Ancillary capacity per receive. One descriptor per message is the
/// protocol norm; a little headroom costs nothing.
const MAX_FDS: usize = 4;

pub fn to_io(error: nix::Error) -> std::io::Error {
    std::io::Error::from_raw_os_error(error as i32)
}

/// Sends as much of `bytes` as the socket accepts, attaching `fds` as
/// SCM_RIGHTS ancillary data. Returns the number of payload bytes written.
pub fn send(socket: RawFd, bytes: &[u8], fds: &[RawFd]) -> std::io::Result<usize> {
    let iov = [IoSlice::new(bytes)];
    let cmsgs = if fds.is_empty() {
        Vec::new()
    } else {
        vec![ControlMessage::ScmRights(fds)]
    };
    sendmsg::<()>(socket, &iov, &cmsgs, MsgFlags::MSG_NOSIGNAL, None).map_err(to_io)
}

/// Receives into `bytes`, appending any passed descriptors to `out`.
/// Returns the number of payload bytes read; zero means the peer is gone.
pub fn recv(socket: RawFd, bytes: &mut [u8], out: &mut Vec<OwnedFd>) -> std::io::Result<usize> {
    let mut iov = [IoSliceMut::new(bytes)];
    let mut cmsg_buffer = nix::cmsg_space!([RawFd; MAX_FDS]);
    let msg = recvmsg::<()>(
        socket,
        &mut iov,
        Some(&mut cmsg_buffer),
        MsgFlags::empty(),
    )
    .map_err(to_io)?;
    for cmsg in msg.cmsgs() {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            out.extend(
                fds.into_iter()
                    .map(|fd| unsafe { OwnedFd::from_raw_fd(fd) }),
            );
        }
    }
    Ok(msg.bytes)
}

/// Blocking write of the whole buffer. Descriptors go out with the first
/// chunk only; the kernel delivers them with whichever read picks it up.
pub fn send_all(socket: RawFd, bytes: &[u8], fds: &[RawFd]) -> std::io::Result<()> {
    let mut sent = 0;
    let mut first = true;
    while sent < bytes.len() {
        let chunk = send(socket, &bytes[sent..], if first { fds } else { &[] })?;
        if chunk == 0 {
            return Err(std::io::ErrorKind::WriteZero.into());
        }
        sent += chunk;
        first = false;
    }
    Ok(())
}

/// Blocking read of exactly `bytes.len()` bytes, collecting descriptors.
pub fn recv_exact(
    socket: RawFd,
    bytes: &mut [u8],
    out: &mut Vec<OwnedFd>,
) -> std::io::Result<()> {
    let mut filled = 0;
    while filled < bytes.len() {
        let chunk = recv(socket, &mut bytes[filled..], out)?;
        if chunk == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        filled += chunk;
    }
    Ok(())
}
