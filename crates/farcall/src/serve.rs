//! The dispatch loop that runs inside the sandboxee.
//!
//! It owns the remote side of every protocol operation: the allocation
//! table the host's variables live in, the registry of native functions
//! callable by name, and the table of descriptors passed in. The loop is
//! synchronous and handles one request at a time, in delivery order —
//! exactly the execution model the host's one-outstanding-call channel
//! promises.

use std::collections::HashMap;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use thiserror::Error;

use crate::channel::{ChannelError, SyncComms};
use crate::proto::{
    decode_buf_header, encode_buf_header, ArgSpec, CallRequest, CallResponse, Kind, Request,
    Response, WireValue, ARGS_MAX, BUF_HEADER_SIZE, FUNC_NAME_MAX,
};

/// A native function callable from the host. Errors are plain strings:
/// they travel to the host verbatim inside an error response.
pub type NativeFn = fn(&mut CallFrame<'_>) -> Result<WireValue, String>;

/// Per-request allocation ceiling, matching the host's default resize cap.
const ALLOC_MAX: u64 = 1 << 30;

const SYMBOL_BASE: u64 = 0x1000;

#[derive(Debug, Error)]
pub enum ServeError {
    #[error("call channel failed")]
    Channel(#[from] ChannelError),
}

/// The sandboxee-side allocation table. Blocks are real heap memory, so
/// the addresses handed to the host are valid targets for direct memory
/// transfers into this process.
#[derive(Debug, Default)]
pub struct Heap {
    blocks: HashMap<u64, Box<[u8]>>,
    allocated: u64,
    released: u64,
}

impl Heap {
    pub fn allocate(&mut self, size: usize) -> u64 {
        // A minimum of one byte keeps zero-size addresses unique.
        let block = vec![0u8; size.max(1)].into_boxed_slice();
        let addr = block.as_ptr() as u64;
        self.blocks.insert(addr, block);
        self.allocated += 1;
        addr
    }

    pub fn free(&mut self, addr: u64) -> Result<(), String> {
        if self.blocks.remove(&addr).is_some() {
            self.released += 1;
            Ok(())
        } else {
            Err(format!("release of unknown address {addr:#x}"))
        }
    }

    /// Moves a block to a new size, retaining the common prefix. The old
    /// block is released; the new address is the caller's to report.
    pub fn reallocate(&mut self, addr: u64, new_size: usize) -> Result<u64, String> {
        let old = self
            .blocks
            .remove(&addr)
            .ok_or_else(|| format!("reallocation of unknown address {addr:#x}"))?;
        self.released += 1;

        let mut block = vec![0u8; new_size.max(1)].into_boxed_slice();
        let keep = old.len().min(new_size);
        block[..keep].copy_from_slice(&old[..keep]);
        let new_addr = block.as_ptr() as u64;
        self.blocks.insert(new_addr, block);
        self.allocated += 1;
        Ok(new_addr)
    }

    pub fn bytes(&self, addr: u64) -> Option<&[u8]> {
        self.blocks.get(&addr).map(|block| &block[..])
    }

    pub fn bytes_mut(&mut self, addr: u64) -> Option<&mut [u8]> {
        self.blocks.get_mut(&addr).map(|block| &mut block[..])
    }

    pub fn block_len(&self, addr: u64) -> Option<usize> {
        self.blocks.get(&addr).map(|block| block.len())
    }

    /// Blocks currently live.
    pub fn outstanding(&self) -> usize {
        self.blocks.len()
    }

    pub fn allocations(&self) -> u64 {
        self.allocated
    }

    pub fn releases(&self) -> u64 {
        self.released
    }
}

/// Named native functions the host may call.
#[derive(Default)]
pub struct Registry {
    funcs: HashMap<String, (usize, NativeFn)>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, func: NativeFn) {
        let index = self.funcs.len();
        self.funcs.insert(name.into(), (index, func));
    }

    fn lookup(&self, name: &str) -> Option<NativeFn> {
        self.funcs.get(name).map(|(_, func)| *func)
    }

    /// Stable pseudo-address for an exported function, for symbol
    /// resolution requests.
    fn symbol_addr(&self, name: &str) -> Option<u64> {
        self.funcs
            .get(name)
            .map(|(index, _)| SYMBOL_BASE + (*index as u64) * 0x10)
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("funcs", &self.funcs.len())
            .finish()
    }
}

/// One in-flight call, as seen by a native function: the argument specs
/// plus access to the allocation and descriptor tables.
pub struct CallFrame<'a> {
    request: &'a CallRequest,
    heap: &'a mut Heap,
    fds: &'a mut Vec<OwnedFd>,
}

impl CallFrame<'_> {
    pub fn arg_count(&self) -> usize {
        self.request.args.len()
    }

    fn arg(&self, index: usize) -> Result<&ArgSpec, String> {
        self.request
            .args
            .get(index)
            .ok_or_else(|| format!("argument {index} out of range"))
    }

    pub fn int_arg(&self, index: usize) -> Result<i64, String> {
        let arg = self.arg(index)?;
        if arg.kind != Kind::Int {
            return Err(format!("argument {index} is not an integer"));
        }
        arg.value
            .as_int()
            .ok_or_else(|| format!("argument {index} carries no integer value"))
    }

    pub fn float_arg(&self, index: usize) -> Result<f64, String> {
        let arg = self.arg(index)?;
        if arg.kind != Kind::Float {
            return Err(format!("argument {index} is not a float"));
        }
        arg.value
            .as_float()
            .ok_or_else(|| format!("argument {index} carries no float value"))
    }

    pub fn ptr_arg(&self, index: usize) -> Result<u64, String> {
        let arg = self.arg(index)?;
        if arg.kind != Kind::Pointer {
            return Err(format!("argument {index} is not a pointer"));
        }
        let addr = arg
            .value
            .as_int()
            .ok_or_else(|| format!("argument {index} carries no address"))?;
        if addr == 0 {
            return Err(format!("argument {index} is a null pointer"));
        }
        Ok(addr as u64)
    }

    pub fn fd_arg(&self, index: usize) -> Result<RawFd, String> {
        let arg = self.arg(index)?;
        if arg.kind != Kind::Fd {
            return Err(format!("argument {index} is not a descriptor"));
        }
        let raw = arg
            .value
            .as_int()
            .ok_or_else(|| format!("argument {index} carries no descriptor"))?;
        i32::try_from(raw)
            .ok()
            .filter(|fd| *fd >= 0)
            .ok_or_else(|| format!("argument {index} carries an invalid descriptor"))
    }

    /// Direct view of a pointed-to flat block (array or struct pointee).
    pub fn bytes_arg(&mut self, index: usize) -> Result<&mut [u8], String> {
        let addr = self.ptr_arg(index)?;
        self.heap
            .bytes_mut(addr)
            .ok_or_else(|| format!("argument {index} points outside the allocation table"))
    }

    /// Copies out the current contents of a length-prefixed buffer
    /// argument.
    pub fn read_buf(&self, index: usize) -> Result<Vec<u8>, String> {
        let header_addr = self.ptr_arg(index)?;
        let (len, data) = self.read_header(header_addr)?;
        let block = self
            .heap
            .bytes(data)
            .ok_or_else(|| format!("argument {index} payload is not allocated"))?;
        let len = usize::try_from(len)
            .ok()
            .filter(|len| *len <= block.len())
            .ok_or_else(|| format!("argument {index} header reports an impossible length"))?;
        Ok(block[..len].to_vec())
    }

    /// Replaces the contents of a length-prefixed buffer argument,
    /// reallocating its payload when the size changes and reporting the
    /// new geometry through the header.
    pub fn write_buf(&mut self, index: usize, payload: &[u8]) -> Result<(), String> {
        let header_addr = self.ptr_arg(index)?;
        let (_, data) = self.read_header(header_addr)?;

        let data = if self.heap.block_len(data) == Some(payload.len().max(1)) {
            data
        } else {
            self.heap.reallocate(data, payload.len())?
        };
        let block = self
            .heap
            .bytes_mut(data)
            .ok_or_else(|| format!("argument {index} payload is not allocated"))?;
        block[..payload.len()].copy_from_slice(payload);

        let header = encode_buf_header(payload.len() as u64, data);
        let slot = self
            .heap
            .bytes_mut(header_addr)
            .and_then(|bytes| bytes.get_mut(..BUF_HEADER_SIZE))
            .ok_or_else(|| format!("argument {index} header is not allocated"))?;
        slot.copy_from_slice(&header);
        Ok(())
    }

    fn read_header(&self, header_addr: u64) -> Result<(u64, u64), String> {
        let header: [u8; BUF_HEADER_SIZE] = self
            .heap
            .bytes(header_addr)
            .and_then(|bytes| bytes.get(..BUF_HEADER_SIZE))
            .ok_or_else(|| format!("buffer header at {header_addr:#x} is not allocated"))?
            .try_into()
            .unwrap();
        Ok(decode_buf_header(&header))
    }

    pub fn heap(&mut self) -> &mut Heap {
        self.heap
    }

    /// Keeps a descriptor alive so the host can pull it after the call.
    pub fn register_fd(&mut self, fd: OwnedFd) -> RawFd {
        let raw = fd.as_raw_fd();
        self.fds.push(fd);
        raw
    }
}

/// Serves requests until the host asks for a clean exit or the channel
/// closes. Returns `Ok` only for a requested exit.
#[tracing::instrument(level = "trace", skip_all)]
pub fn serve(stream: UnixStream, registry: &Registry) -> Result<(), ServeError> {
    let mut comms = SyncComms::new(stream);
    let mut heap = Heap::default();
    let mut fd_table: Vec<OwnedFd> = Vec::new();

    loop {
        let request: Request = comms.recv()?;
        match request {
            Request::Allocate { size } => {
                let response = if size > ALLOC_MAX {
                    Response::Error {
                        message: format!("allocation of {size} bytes exceeds the limit"),
                    }
                } else {
                    Response::Allocated {
                        addr: heap.allocate(size as usize),
                    }
                };
                comms.send(&response)?;
            }
            Request::Free { addr } => {
                let response = match heap.free(addr) {
                    Ok(()) => Response::Freed,
                    Err(message) => Response::Error { message },
                };
                comms.send(&response)?;
            }
            Request::Reallocate { addr, size } => {
                let response = if size > ALLOC_MAX {
                    Response::Error {
                        message: format!("reallocation of {size} bytes exceeds the limit"),
                    }
                } else {
                    match heap.reallocate(addr, size as usize) {
                        Ok(addr) => Response::Reallocated { addr },
                        Err(message) => Response::Error { message },
                    }
                };
                comms.send(&response)?;
            }
            Request::Symbol { name } => {
                comms.send(&Response::Symbol {
                    addr: registry.symbol_addr(&name),
                })?;
            }
            Request::PushFd => {
                let response = match comms.take_fd() {
                    Some(fd) => {
                        let remote_fd = fd.as_raw_fd();
                        fd_table.push(fd);
                        Response::FdPushed { remote_fd }
                    }
                    None => Response::Error {
                        message: "no descriptor accompanied the request".into(),
                    },
                };
                comms.send(&response)?;
            }
            Request::PullFd { remote_fd } => {
                if fd_table.iter().any(|fd| fd.as_raw_fd() == remote_fd) {
                    comms.send_with_fds(&Response::FdPulled, &[remote_fd])?;
                } else {
                    comms.send(&Response::Error {
                        message: format!("unknown descriptor {remote_fd}"),
                    })?;
                }
            }
            Request::Call(call) => {
                let response = dispatch(&call, registry, &mut heap, &mut fd_table);
                comms.send(&response)?;
            }
            Request::Exit => {
                tracing::debug!(live = heap.outstanding(), "exit requested");
                return Ok(());
            }
        }
    }
}

fn dispatch(
    call: &CallRequest,
    registry: &Registry,
    heap: &mut Heap,
    fds: &mut Vec<OwnedFd>,
) -> Response {
    if call.func.len() > FUNC_NAME_MAX || call.args.len() > ARGS_MAX {
        return Response::Error {
            message: "malformed call request".into(),
        };
    }
    let func = match registry.lookup(&call.func) {
        Some(func) => func,
        None => {
            return Response::Error {
                message: format!("unknown function {:?}", call.func),
            }
        }
    };

    tracing::trace!(func = %call.func, argc = call.args.len(), "dispatching");
    let mut frame = CallFrame {
        request: call,
        heap,
        fds,
    };
    match func(&mut frame) {
        Ok(value) => Response::Call(CallResponse {
            ret_kind: call.ret_kind,
            value,
        }),
        Err(message) => {
            tracing::debug!(func = %call.func, message, "native function failed");
            Response::Error { message }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn heap_ledger_balances() {
        let mut heap = Heap::default();
        let a = heap.allocate(16);
        let b = heap.allocate(0);
        assert_ne!(a, b);
        assert_eq!(heap.outstanding(), 2);

        let a2 = heap.reallocate(a, 32).unwrap();
        assert_eq!(heap.block_len(a2), Some(32));
        assert_eq!(heap.outstanding(), 2);

        heap.free(a2).unwrap();
        heap.free(b).unwrap();
        assert_eq!(heap.outstanding(), 0);
        assert_eq!(heap.allocations(), heap.releases());
    }

    #[test]
    fn double_free_rejected() {
        let mut heap = Heap::default();
        let addr = heap.allocate(8);
        heap.free(addr).unwrap();
        assert!(heap.free(addr).is_err());
    }

    #[test]
    fn reallocate_keeps_prefix() {
        let mut heap = Heap::default();
        let addr = heap.allocate(4);
        heap.bytes_mut(addr).unwrap().copy_from_slice(b"abcd");

        let grown = heap.reallocate(addr, 6).unwrap();
        assert_eq!(&heap.bytes(grown).unwrap()[..4], b"abcd");

        let shrunk = heap.reallocate(grown, 2).unwrap();
        assert_eq!(heap.bytes(shrunk).unwrap(), b"ab");
    }

    #[test]
    fn frame_reads_and_writes_buffers() {
        let mut heap = Heap::default();
        let mut fds = Vec::new();

        let payload = heap.allocate(5);
        heap.bytes_mut(payload).unwrap().copy_from_slice(b"hello");
        let header = heap.allocate(BUF_HEADER_SIZE);
        heap.bytes_mut(header)
            .unwrap()
            .copy_from_slice(&encode_buf_header(5, payload));

        let request = CallRequest {
            func: "f".into(),
            args: vec![ArgSpec {
                kind: Kind::Pointer,
                size: 8,
                pointee_kind: Some(Kind::Bytes),
                pointee_size: Some(5),
                value: WireValue::Int(header as i64),
            }],
            ret_kind: Kind::Int,
            ret_size: 8,
        };
        let mut frame = CallFrame {
            request: &request,
            heap: &mut heap,
            fds: &mut fds,
        };

        assert_eq!(frame.read_buf(0).unwrap(), b"hello");

        frame.write_buf(0, b"hellohello").unwrap();
        assert_eq!(frame.read_buf(0).unwrap(), b"hellohello");

        // The header now reports the new geometry.
        let (len, data) = frame.read_header(header).unwrap();
        assert_eq!(len, 10);
        assert_eq!(frame.heap().block_len(data), Some(10));
    }

    #[test]
    fn unknown_function_reported() {
        let registry = Registry::new();
        let mut heap = Heap::default();
        let mut fds = Vec::new();
        let call = CallRequest {
            func: "missing".into(),
            args: Vec::new(),
            ret_kind: Kind::Void,
            ret_size: 0,
        };
        let response = dispatch(&call, &registry, &mut heap, &mut fds);
        assert!(matches!(response, Response::Error { .. }));
    }

    #[test]
    fn symbols_resolve_for_registered_functions() {
        fn nop(_frame: &mut CallFrame<'_>) -> Result<WireValue, String> {
            Ok(WireValue::Int(0))
        }

        let mut registry = Registry::new();
        registry.register("nop", nop);
        assert!(registry.symbol_addr("nop").is_some());
        assert!(registry.symbol_addr("other").is_none());
    }
}
