use nix::unistd::Pid;

use crate::error::{Error, Result};
use crate::proto::{Kind, WireValue};

use super::{
    raw_bytes, raw_bytes_mut, raw_slice_bytes, raw_slice_bytes_mut, read_remote, write_remote,
    Block, RemoteSlot, Var,
};

/// A fixed-length array of plain-old-data elements, always passed by
/// pointer. The element count is fixed for the lifetime of the variable;
/// resizable data belongs in [`super::Bytes`].
#[derive(Debug)]
pub struct ArrayVar<T: Copy + std::fmt::Debug + Send + 'static> {
    items: Vec<T>,
    remote: RemoteSlot,
}

impl<T: Copy + std::fmt::Debug + Send + 'static> ArrayVar<T> {
    pub fn new(items: impl Into<Vec<T>>) -> Self {
        Self {
            items: items.into(),
            remote: RemoteSlot::new(),
        }
    }

    pub fn as_slice(&self) -> &[T] {
        &self.items
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<T: Copy + std::fmt::Debug + Send + 'static> Var for ArrayVar<T> {
    fn kind(&self) -> Kind {
        Kind::Array
    }

    fn size(&self) -> usize {
        std::mem::size_of_val(self.items.as_slice())
    }

    fn remote(&self) -> Option<u64> {
        self.remote.addr()
    }

    fn blocks(&mut self) -> Vec<Block<'_>> {
        let len = self.size();
        vec![Block {
            len,
            slot: &mut self.remote,
        }]
    }

    fn transfer_to(&mut self, pid: Pid) -> Result<()> {
        let addr = self
            .remote
            .addr()
            .ok_or_else(|| Error::precondition("transfer of an unallocated variable"))?;
        write_remote(pid, addr, raw_slice_bytes(&self.items))
    }

    fn transfer_from(&mut self, pid: Pid) -> Result<()> {
        let addr = self
            .remote
            .addr()
            .ok_or_else(|| Error::precondition("transfer of an unallocated variable"))?;
        read_remote(pid, addr, raw_slice_bytes_mut(&mut self.items))
    }

    fn wire_value(&self) -> WireValue {
        WireValue::Int(self.remote.addr().unwrap_or(0) as i64)
    }

    fn set_wire_value(&mut self, _value: WireValue) -> Result<()> {
        Err(Error::precondition("an array cannot be set from a wire value"))
    }
}

/// A `#[repr(C)]` plain-old-data struct passed by pointer. The sandboxee
/// sees (and may rewrite) the raw byte image, so `T` must tolerate any bit
/// pattern the library produces — the same contract the underlying C ABI
/// already imposes.
#[derive(Debug)]
pub struct StructVar<T: Copy + std::fmt::Debug + Send + 'static> {
    value: T,
    remote: RemoteSlot,
}

impl<T: Copy + std::fmt::Debug + Send + 'static> StructVar<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            remote: RemoteSlot::new(),
        }
    }

    pub fn get(&self) -> &T {
        &self.value
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

impl<T: Copy + std::fmt::Debug + Send + 'static> Var for StructVar<T> {
    fn kind(&self) -> Kind {
        Kind::Struct
    }

    fn size(&self) -> usize {
        std::mem::size_of::<T>()
    }

    fn remote(&self) -> Option<u64> {
        self.remote.addr()
    }

    fn blocks(&mut self) -> Vec<Block<'_>> {
        vec![Block {
            len: std::mem::size_of::<T>(),
            slot: &mut self.remote,
        }]
    }

    fn transfer_to(&mut self, pid: Pid) -> Result<()> {
        let addr = self
            .remote
            .addr()
            .ok_or_else(|| Error::precondition("transfer of an unallocated variable"))?;
        write_remote(pid, addr, raw_bytes(&self.value))
    }

    fn transfer_from(&mut self, pid: Pid) -> Result<()> {
        let addr = self
            .remote
            .addr()
            .ok_or_else(|| Error::precondition("transfer of an unallocated variable"))?;
        read_remote(pid, addr, raw_bytes_mut(&mut self.value))
    }

    fn wire_value(&self) -> WireValue {
        WireValue::Int(self.remote.addr().unwrap_or(0) as i64)
    }

    fn set_wire_value(&mut self, _value: WireValue) -> Result<()> {
        Err(Error::precondition("a struct cannot be set from a wire value"))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn array_reports_byte_size() {
        let var = ArrayVar::new([1u32, 2, 3]);
        assert_eq!(var.size(), 12);
        assert_eq!(var.kind(), Kind::Array);
        assert_eq!(var.as_slice(), &[1, 2, 3]);
    }

    #[test]
    fn unallocated_transfer_fails() {
        let mut var = ArrayVar::new([0u8; 4]);
        let error = var.transfer_to(Pid::this()).unwrap_err();
        assert!(matches!(error, Error::FailedPrecondition(_)));
    }

    #[test]
    fn struct_round_trips_through_memory() {
        #[derive(Debug, Clone, Copy, PartialEq)]
        #[repr(C)]
        struct Pair {
            a: u32,
            b: u32,
        }

        let mut backing = vec![0u8; std::mem::size_of::<Pair>()].into_boxed_slice();
        let addr = backing.as_mut_ptr() as u64;
        let queue = std::sync::Arc::new(crate::rpc::FreeQueue::default());

        let mut var = StructVar::new(Pair { a: 7, b: 9 });
        var.blocks()[0].slot.assign(addr, false, queue);
        var.transfer_to(Pid::this()).unwrap();

        let mut readback = StructVar::new(Pair { a: 0, b: 0 });
        readback.blocks()[0].slot.assign(addr, false, std::sync::Arc::new(crate::rpc::FreeQueue::default()));
        readback.transfer_from(Pid::this()).unwrap();
        assert_eq!(*readback.get(), Pair { a: 7, b: 9 });
    }
}
