//! Wire messages exchanged between the host and the sandboxee.
//!
//! Requests and responses are postcard-encoded and framed by
//! [`farcall_util::frame`]. Bulk data never travels here: buffer contents
//! move directly between address spaces, so the messages stay small and the
//! frame limit stays meaningful.

use serde::{Deserialize, Serialize};

/// Upper bound on the function-name identifier.
pub const FUNC_NAME_MAX: usize = 128;

/// Upper bound on the number of call arguments.
pub const ARGS_MAX: usize = 32;

/// Discriminates every variable shape that can cross the call boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Kind {
    Void,
    Int,
    Float,
    Pointer,
    Fd,
    Array,
    Struct,
    Bytes,
    Message,
}

/// The fixed-width value slot carried per argument and per return.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum WireValue {
    Int(i64),
    Float(f64),
}

impl WireValue {
    pub fn as_int(self) -> Option<i64> {
        match self {
            Self::Int(value) => Some(value),
            Self::Float(_) => None,
        }
    }

    pub fn as_float(self) -> Option<f64> {
        match self {
            Self::Float(value) => Some(value),
            Self::Int(_) => None,
        }
    }
}

/// One argument slot: its own shape plus, for pointers, the pointee's.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArgSpec {
    pub kind: Kind,
    pub size: u64,
    pub pointee_kind: Option<Kind>,
    pub pointee_size: Option<u64>,
    pub value: WireValue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRequest {
    pub func: String,
    pub args: Vec<ArgSpec>,
    pub ret_kind: Kind,
    pub ret_size: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CallResponse {
    pub ret_kind: Kind,
    pub value: WireValue,
}

#[derive(Debug, Serialize, Deserialize)]
pub enum Request {
    Call(CallRequest),
    Allocate { size: u64 },
    Free { addr: u64 },
    Reallocate { addr: u64, size: u64 },
    Symbol { name: String },
    /// The frame carrying this request also carries the descriptor.
    PushFd,
    PullFd { remote_fd: i32 },
    Exit,
}

#[derive(Debug, Serialize, Deserialize)]
pub enum Response {
    Call(CallResponse),
    Allocated { addr: u64 },
    Freed,
    Reallocated { addr: u64 },
    Symbol { addr: Option<u64> },
    FdPushed { remote_fd: i32 },
    /// The frame carrying this response also carries the descriptor.
    FdPulled,
    Error { message: String },
}

/// Remote image of a length-prefixed buffer: the length and the address of
/// a separately allocated payload block. The callee may reallocate the
/// payload and report a new length and address through this header; the
/// host re-reads it after every call before touching payload bytes.
pub const BUF_HEADER_SIZE: usize = 16;

pub fn encode_buf_header(len: u64, data: u64) -> [u8; BUF_HEADER_SIZE] {
    let mut header = [0u8; BUF_HEADER_SIZE];
    header[..8].copy_from_slice(&len.to_ne_bytes());
    header[8..].copy_from_slice(&data.to_ne_bytes());
    header
}

pub fn decode_buf_header(header: &[u8; BUF_HEADER_SIZE]) -> (u64, u64) {
    let len = u64::from_ne_bytes(header[..8].try_into().unwrap());
    let data = u64::from_ne_bytes(header[8..].try_into().unwrap());
    (len, data)
}
