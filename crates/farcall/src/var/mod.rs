//! Typed variables: the host-side description of every value that crosses
//! the call boundary.
//!
//! A variable lives locally, remotely, or both. Remote storage is acquired
//! through an explicit allocation against an active sandbox and recorded in
//! a [`RemoteSlot`]; byte transfers move the local image into or out of
//! that storage with `process_vm_writev`/`process_vm_readv`. A slot armed
//! for automatic release enqueues its address on the controller's
//! deferred-free queue when the variable is dropped; the queue is drained
//! before the next wire operation, so release happens exactly once and
//! never from a destructor doing i/o.

mod array;
mod bytes;
mod fd;
mod msg;
mod scalar;

use std::io::{IoSlice, IoSliceMut};
use std::sync::Arc;

use nix::sys::uio::{process_vm_readv, process_vm_writev, RemoteIoVec};
use nix::unistd::Pid;

use crate::error::{Error, Result};
use crate::proto::{Kind, WireValue};
use crate::rpc::FreeQueue;

pub use self::array::{ArrayVar, StructVar};
pub use self::bytes::Bytes;
pub use self::fd::FdVar;
pub use self::msg::Msg;
pub use self::scalar::{Scalar, ScalarType, Void};

/// Directionality of pointee synchronization relative to a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Never transferred in either direction.
    None,
    /// Pushed to the sandboxee before the call.
    Before,
    /// Pulled back from the sandboxee after the call.
    After,
    /// Pushed before and pulled after.
    Both,
}

impl SyncMode {
    pub fn before(self) -> bool {
        matches!(self, Self::Before | Self::Both)
    }

    pub fn after(self) -> bool {
        matches!(self, Self::After | Self::Both)
    }
}

/// Bookkeeping for one block of sandboxee memory backing a variable.
#[derive(Debug, Default)]
pub struct RemoteSlot {
    addr: Option<u64>,
    auto_free: bool,
    reclaim: Option<Arc<FreeQueue>>,
}

impl RemoteSlot {
    pub const fn new() -> Self {
        Self {
            addr: None,
            auto_free: false,
            reclaim: None,
        }
    }

    pub fn addr(&self) -> Option<u64> {
        self.addr
    }

    pub(crate) fn assign(&mut self, addr: u64, auto_free: bool, reclaim: Arc<FreeQueue>) {
        self.addr = Some(addr);
        self.auto_free = auto_free;
        self.reclaim = auto_free.then_some(reclaim);
    }

    /// Records a new address for an allocation the sandboxee relocated.
    /// Ownership and auto-free arming carry over.
    pub(crate) fn move_to(&mut self, addr: u64) {
        self.addr = Some(addr);
    }

    /// Disarms the slot and yields the address, if any. Used by explicit
    /// free so that drop cannot enqueue the address a second time.
    pub(crate) fn clear(&mut self) -> Option<u64> {
        self.auto_free = false;
        self.reclaim = None;
        self.addr.take()
    }
}

impl Drop for RemoteSlot {
    fn drop(&mut self) {
        if self.auto_free {
            if let (Some(addr), Some(reclaim)) = (self.addr, self.reclaim.as_ref()) {
                reclaim.push(addr);
            }
        }
    }
}

/// A remote block a variable needs: how many bytes, and where to record
/// the resulting address.
pub struct Block<'a> {
    pub len: usize,
    pub slot: &'a mut RemoteSlot,
}

/// The capability surface shared by every variable kind.
pub trait Var: std::fmt::Debug + Send {
    fn kind(&self) -> Kind;

    /// Byte length of the local representation.
    fn size(&self) -> usize;

    /// Address of the variable's primary remote block, once allocated.
    fn remote(&self) -> Option<u64>;

    /// Remote blocks backing this variable, primary first.
    fn blocks(&mut self) -> Vec<Block<'_>>;

    /// Runs once after every block has a remote address. Variables with
    /// internal geometry (buffer headers) seed it here, so a callee can
    /// navigate the variable even when no payload push precedes the call.
    fn on_allocated(&mut self, _pid: Pid) -> Result<()> {
        Ok(())
    }

    /// Copies the local image into the sandboxee.
    fn transfer_to(&mut self, pid: Pid) -> Result<()>;

    /// Copies the sandboxee's image back over the local one.
    fn transfer_from(&mut self, pid: Pid) -> Result<()>;

    /// The fixed-width value marshalled for this variable.
    fn wire_value(&self) -> WireValue;

    /// Writes a returned wire value into the local representation.
    fn set_wire_value(&mut self, value: WireValue) -> Result<()>;

    #[doc(hidden)]
    fn as_fd_var(&mut self) -> Option<&mut FdVar> {
        None
    }
}

/// One call argument. Pointers are modeled here rather than as a variable
/// type of their own: the pointee stays owned by the call site and the
/// argument holds only a non-owning borrow plus the sync direction.
pub enum Arg<'a> {
    /// Passed by value (scalars).
    Val(&'a mut dyn Var),
    /// A descriptor, passed out-of-band and renumbered for the sandboxee.
    Fd(&'a mut FdVar),
    /// A pointer to `pointee`, synchronized according to `mode`.
    Ptr {
        pointee: &'a mut dyn Var,
        mode: SyncMode,
    },
}

impl<'a> Arg<'a> {
    pub fn val(var: &'a mut dyn Var) -> Self {
        Self::Val(var)
    }

    pub fn fd(var: &'a mut FdVar) -> Self {
        Self::Fd(var)
    }

    pub fn ptr_none(pointee: &'a mut dyn Var) -> Self {
        Self::Ptr {
            pointee,
            mode: SyncMode::None,
        }
    }

    pub fn ptr_before(pointee: &'a mut dyn Var) -> Self {
        Self::Ptr {
            pointee,
            mode: SyncMode::Before,
        }
    }

    pub fn ptr_after(pointee: &'a mut dyn Var) -> Self {
        Self::Ptr {
            pointee,
            mode: SyncMode::After,
        }
    }

    pub fn ptr_both(pointee: &'a mut dyn Var) -> Self {
        Self::Ptr {
            pointee,
            mode: SyncMode::Both,
        }
    }
}

/// Sanity bound on a sandboxee-reported buffer length. Resize requests are
/// capped per channel; this is the last line of defense against a rewritten
/// header turning a transfer into a giant read.
pub(crate) const fn bytes_transfer_cap() -> usize {
    1 << 30
}

pub(crate) fn transfer_error(error: nix::Error) -> Error {
    Error::Channel(crate::channel::ChannelError::Io(
        std::io::Error::from_raw_os_error(error as i32),
    ))
}

/// Writes `bytes` at `addr` in the sandboxee's address space.
pub(crate) fn write_remote(pid: Pid, addr: u64, bytes: &[u8]) -> Result<()> {
    let mut offset = 0;
    while offset < bytes.len() {
        let local = [IoSlice::new(&bytes[offset..])];
        let remote = [RemoteIoVec {
            base: addr as usize + offset,
            len: bytes.len() - offset,
        }];
        let copied = process_vm_writev(pid, &local, &remote).map_err(transfer_error)?;
        if copied == 0 {
            return Err(transfer_error(nix::errno::Errno::EIO));
        }
        offset += copied;
    }
    Ok(())
}

/// Reads `bytes.len()` bytes at `addr` in the sandboxee's address space.
pub(crate) fn read_remote(pid: Pid, addr: u64, bytes: &mut [u8]) -> Result<()> {
    let mut offset = 0;
    while offset < bytes.len() {
        let len = bytes.len() - offset;
        let mut local = [IoSliceMut::new(&mut bytes[offset..])];
        let remote = [RemoteIoVec {
            base: addr as usize + offset,
            len,
        }];
        let copied = process_vm_readv(pid, &mut local, &remote).map_err(transfer_error)?;
        if copied == 0 {
            return Err(transfer_error(nix::errno::Errno::EIO));
        }
        offset += copied;
    }
    Ok(())
}

/// Raw byte view of a plain-old-data value, for transfers.
pub(crate) fn raw_bytes<T: Copy>(value: &T) -> &[u8] {
    unsafe {
        std::slice::from_raw_parts((value as *const T).cast::<u8>(), std::mem::size_of::<T>())
    }
}

pub(crate) fn raw_bytes_mut<T: Copy>(value: &mut T) -> &mut [u8] {
    unsafe {
        std::slice::from_raw_parts_mut((value as *mut T).cast::<u8>(), std::mem::size_of::<T>())
    }
}

pub(crate) fn raw_slice_bytes<T: Copy>(values: &[T]) -> &[u8] {
    unsafe {
        std::slice::from_raw_parts(
            values.as_ptr().cast::<u8>(),
            std::mem::size_of_val(values),
        )
    }
}

pub(crate) fn raw_slice_bytes_mut<T: Copy>(values: &mut [T]) -> &mut [u8] {
    unsafe {
        std::slice::from_raw_parts_mut(
            values.as_mut_ptr().cast::<u8>(),
            std::mem::size_of_val(values),
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn slot_enqueues_on_drop_when_armed() {
        let queue = Arc::new(FreeQueue::default());
        {
            let mut slot = RemoteSlot::new();
            slot.assign(0x1000, true, queue.clone());
        }
        assert_eq!(queue.drain(), vec![0x1000]);
        assert!(queue.drain().is_empty());
    }

    #[test]
    fn cleared_slot_does_not_enqueue() {
        let queue = Arc::new(FreeQueue::default());
        {
            let mut slot = RemoteSlot::new();
            slot.assign(0x1000, true, queue.clone());
            assert_eq!(slot.clear(), Some(0x1000));
        }
        assert!(queue.drain().is_empty());
    }

    #[test]
    fn unarmed_slot_does_not_enqueue() {
        let queue = Arc::new(FreeQueue::default());
        {
            let mut slot = RemoteSlot::new();
            slot.assign(0x1000, false, queue.clone());
        }
        assert!(queue.drain().is_empty());
    }

    #[test]
    fn relocated_slot_keeps_arming() {
        let queue = Arc::new(FreeQueue::default());
        {
            let mut slot = RemoteSlot::new();
            slot.assign(0x1000, true, queue.clone());
            slot.move_to(0x2000);
        }
        assert_eq!(queue.drain(), vec![0x2000]);
    }

    #[test]
    fn sync_mode_directions() {
        assert!(!SyncMode::None.before() && !SyncMode::None.after());
        assert!(SyncMode::Before.before() && !SyncMode::Before.after());
        assert!(!SyncMode::After.before() && SyncMode::After.after());
        assert!(SyncMode::Both.before() && SyncMode::Both.after());
    }

    #[test]
    fn self_transfer_round_trip() {
        // The transfer path against our own address space, which is exactly
        // how the loopback engine runs it.
        let mut target = vec![0u8; 10].into_boxed_slice();
        let addr = target.as_mut_ptr() as u64;

        write_remote(Pid::this(), addr, b"0123456789").unwrap();
        assert_eq!(&target[..], b"0123456789");

        let mut readback = [0u8; 10];
        read_remote(Pid::this(), addr, &mut readback).unwrap();
        assert_eq!(&readback, b"0123456789");
    }
}
