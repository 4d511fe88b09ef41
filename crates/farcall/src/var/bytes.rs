use nix::unistd::Pid;

use crate::channel::ChannelError;
use crate::error::{Error, Result};
use crate::proto::{decode_buf_header, encode_buf_header, Kind, WireValue, BUF_HEADER_SIZE};
use crate::rpc::RpcChannel;

use super::{read_remote, write_remote, Block, RemoteSlot, Var};

/// A length-prefixed byte buffer whose size the sandboxee may change.
///
/// Two remote blocks back the variable: a header recording the current
/// length and payload address, and the payload itself. A callee that needs
/// more room reallocates the payload on its side and reports the new length
/// and address through the header; `transfer_from` re-reads the header
/// before touching a single payload byte, so the local view is never read
/// stale.
#[derive(Debug)]
pub struct Bytes {
    data: Vec<u8>,
    header: RemoteSlot,
    payload: RemoteSlot,
}

impl Bytes {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            header: RemoteSlot::new(),
            payload: RemoteSlot::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Grows or shrinks the buffer, reallocating the remote payload when
    /// one exists. The remote header still reports the old geometry until
    /// the next `transfer_to` rewrites it, which every `Before`-synchronized
    /// call does.
    pub async fn resize(&mut self, rpc: &mut RpcChannel, new_len: usize) -> Result<()> {
        if new_len > rpc.max_resize() {
            return Err(Error::precondition(format!(
                "resize to {new_len} bytes exceeds the configured maximum of {}",
                rpc.max_resize()
            )));
        }
        if let Some(addr) = self.payload.addr() {
            let new_addr = rpc.reallocate(addr, new_len).await?;
            self.payload.move_to(new_addr);
        }
        self.data.resize(new_len, 0);
        Ok(())
    }
}

impl Var for Bytes {
    fn kind(&self) -> Kind {
        Kind::Bytes
    }

    fn size(&self) -> usize {
        self.data.len()
    }

    fn remote(&self) -> Option<u64> {
        self.header.addr()
    }

    fn blocks(&mut self) -> Vec<Block<'_>> {
        let payload_len = self.data.len();
        vec![
            Block {
                len: BUF_HEADER_SIZE,
                slot: &mut self.header,
            },
            Block {
                len: payload_len,
                slot: &mut self.payload,
            },
        ]
    }

    fn on_allocated(&mut self, pid: Pid) -> Result<()> {
        let header_addr = self
            .header
            .addr()
            .ok_or_else(|| Error::precondition("buffer header was not allocated"))?;
        let payload_addr = self
            .payload
            .addr()
            .ok_or_else(|| Error::precondition("buffer payload was not allocated"))?;
        let header = encode_buf_header(self.data.len() as u64, payload_addr);
        write_remote(pid, header_addr, &header)
    }

    fn transfer_to(&mut self, pid: Pid) -> Result<()> {
        let header_addr = self
            .header
            .addr()
            .ok_or_else(|| Error::precondition("transfer of an unallocated variable"))?;
        let payload_addr = self
            .payload
            .addr()
            .ok_or_else(|| Error::precondition("transfer of an unallocated variable"))?;

        if !self.data.is_empty() {
            write_remote(pid, payload_addr, &self.data)?;
        }
        let header = encode_buf_header(self.data.len() as u64, payload_addr);
        write_remote(pid, header_addr, &header)
    }

    fn transfer_from(&mut self, pid: Pid) -> Result<()> {
        let header_addr = self
            .header
            .addr()
            .ok_or_else(|| Error::precondition("transfer of an unallocated variable"))?;

        let mut header = [0u8; BUF_HEADER_SIZE];
        read_remote(pid, header_addr, &mut header)?;
        let (len, payload_addr) = decode_buf_header(&header);

        let len = usize::try_from(len)
            .ok()
            .filter(|len| *len <= super::bytes_transfer_cap())
            .ok_or_else(|| {
                Error::Channel(ChannelError::Remote(format!(
                    "sandboxee reported an oversized buffer ({len} bytes)"
                )))
            })?;

        // The callee may have relocated the payload; adopt the new block.
        if self.payload.addr() != Some(payload_addr) {
            self.payload.move_to(payload_addr);
        }
        self.data.resize(len, 0);
        if len > 0 {
            read_remote(pid, payload_addr, &mut self.data)?;
        }
        Ok(())
    }

    fn wire_value(&self) -> WireValue {
        WireValue::Int(self.header.addr().unwrap_or(0) as i64)
    }

    fn set_wire_value(&mut self, _value: WireValue) -> Result<()> {
        Err(Error::precondition("a buffer cannot be set from a wire value"))
    }
}
