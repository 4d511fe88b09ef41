use std::os::fd::{AsFd, BorrowedFd, OwnedFd, RawFd};

use nix::unistd::Pid;

use crate::error::{Error, Result};
use crate::proto::{Kind, WireValue};

use super::{Block, Var};

/// A file descriptor argument or return.
///
/// Descriptors never travel through sandboxee memory: the orchestrator
/// passes them over the channel's SCM_RIGHTS facility and substitutes the
/// sandboxee-side number into the wire value. A return slot starts empty
/// and is filled with the descriptor pulled back after the call.
#[derive(Debug, Default)]
pub struct FdVar {
    local: Option<OwnedFd>,
    remote: Option<RawFd>,
}

impl FdVar {
    pub fn new(fd: impl Into<OwnedFd>) -> Self {
        Self {
            local: Some(fd.into()),
            remote: None,
        }
    }

    /// An empty slot, for receiving a descriptor return.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn fd(&self) -> Option<BorrowedFd<'_>> {
        self.local.as_ref().map(AsFd::as_fd)
    }

    pub fn into_fd(self) -> Option<OwnedFd> {
        self.local
    }

    /// The descriptor number this fd has inside the sandboxee, once passed.
    pub fn remote_fd(&self) -> Option<RawFd> {
        self.remote
    }

    pub(crate) fn set_remote_fd(&mut self, fd: RawFd) {
        self.remote = Some(fd);
    }

    pub(crate) fn adopt(&mut self, fd: OwnedFd) {
        self.local = Some(fd);
    }
}

impl Var for FdVar {
    fn kind(&self) -> Kind {
        Kind::Fd
    }

    fn size(&self) -> usize {
        std::mem::size_of::<RawFd>()
    }

    fn remote(&self) -> Option<u64> {
        None
    }

    fn blocks(&mut self) -> Vec<Block<'_>> {
        Vec::new()
    }

    fn transfer_to(&mut self, _pid: Pid) -> Result<()> {
        Err(Error::precondition(
            "descriptors are passed over the call channel, not through memory",
        ))
    }

    fn transfer_from(&mut self, _pid: Pid) -> Result<()> {
        Err(Error::precondition(
            "descriptors are passed over the call channel, not through memory",
        ))
    }

    fn wire_value(&self) -> WireValue {
        WireValue::Int(i64::from(self.remote.unwrap_or(-1)))
    }

    fn set_wire_value(&mut self, value: WireValue) -> Result<()> {
        let raw = value
            .as_int()
            .ok_or_else(|| Error::precondition("wire value does not match the variable type"))?;
        self.remote = i32::try_from(raw).ok().filter(|fd| *fd >= 0);
        Ok(())
    }

    fn as_fd_var(&mut self) -> Option<&mut FdVar> {
        Some(self)
    }
}

#[cfg(test)]
mod test {
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    use super::*;

    #[test]
    fn empty_slot_has_no_descriptor() {
        let var = FdVar::empty();
        assert!(var.fd().is_none());
        assert!(var.remote_fd().is_none());
        assert_eq!(var.wire_value(), WireValue::Int(-1));
    }

    #[test]
    fn remote_number_round_trips() {
        let (a, _b) = UnixStream::pair().unwrap();
        let raw = a.as_raw_fd();
        let mut var = FdVar::new(OwnedFd::from(a));
        assert!(var.fd().is_some());

        var.set_remote_fd(7);
        assert_eq!(var.wire_value(), WireValue::Int(7));
        assert_eq!(var.remote_fd(), Some(7));

        var.set_wire_value(WireValue::Int(9)).unwrap();
        assert_eq!(var.remote_fd(), Some(9));

        assert_eq!(var.into_fd().unwrap().as_raw_fd(), raw);
    }

    #[test]
    fn negative_wire_value_clears_remote() {
        let mut var = FdVar::empty();
        var.set_remote_fd(3);
        var.set_wire_value(WireValue::Int(-1)).unwrap();
        assert!(var.remote_fd().is_none());
    }
}
