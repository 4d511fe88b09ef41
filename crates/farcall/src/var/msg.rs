use nix::unistd::Pid;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::channel::ChannelError;
use crate::error::{Error, Result};
use crate::proto::{Kind, WireValue};

use super::{Block, Bytes, Var};

/// A structured payload layered on the length-prefixed buffer transfer.
///
/// The value is encoded into a [`Bytes`] image before the call and decoded
/// from whatever the sandboxee left behind afterwards, so a callee that
/// rewrites the message with different-length content works the same way a
/// resized raw buffer does.
pub struct Msg<T> {
    inner: Bytes,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T: Serialize + DeserializeOwned> Msg<T> {
    pub fn new(value: &T) -> Result<Self> {
        let encoded = postcard::to_allocvec(value).map_err(|e| Error::Channel(e.into()))?;
        Ok(Self {
            inner: Bytes::new(encoded),
            _marker: std::marker::PhantomData,
        })
    }

    /// Decodes the current local image. Call after a synchronized call to
    /// observe the sandboxee's output.
    pub fn get(&self) -> Result<T> {
        postcard::from_bytes(self.inner.as_slice())
            .map_err(|e| Error::Channel(ChannelError::from(e)))
    }
}

impl<T> std::fmt::Debug for Msg<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Msg")
            .field("encoded_len", &self.inner.len())
            .finish()
    }
}

impl<T> Var for Msg<T> {
    fn kind(&self) -> Kind {
        Kind::Message
    }

    fn size(&self) -> usize {
        self.inner.size()
    }

    fn remote(&self) -> Option<u64> {
        self.inner.remote()
    }

    fn blocks(&mut self) -> Vec<Block<'_>> {
        self.inner.blocks()
    }

    fn on_allocated(&mut self, pid: Pid) -> Result<()> {
        self.inner.on_allocated(pid)
    }

    fn transfer_to(&mut self, pid: Pid) -> Result<()> {
        self.inner.transfer_to(pid)
    }

    fn transfer_from(&mut self, pid: Pid) -> Result<()> {
        self.inner.transfer_from(pid)
    }

    fn wire_value(&self) -> WireValue {
        self.inner.wire_value()
    }

    fn set_wire_value(&mut self, _value: WireValue) -> Result<()> {
        Err(Error::precondition(
            "a message cannot be set from a wire value",
        ))
    }
}
