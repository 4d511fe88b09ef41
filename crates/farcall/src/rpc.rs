//! Typed request/response operations over one call channel.
//!
//! One channel, one outstanding request: every method holds `&mut self`
//! for a full send/receive cycle. Addresses queued by dropped auto-freed
//! variables are released here, immediately before the next request, so the
//! sandboxee's allocator only ever runs between calls.

use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::channel::{ChannelError, Comms};
use crate::error::{Error, Result};
use crate::proto::{CallRequest, CallResponse, Request, Response};

/// Remote addresses whose owning variables have been dropped and that are
/// waiting to be released on the sandboxee.
#[derive(Debug, Default)]
pub struct FreeQueue(Mutex<Vec<u64>>);

impl FreeQueue {
    pub(crate) fn push(&self, addr: u64) {
        self.0.lock().push(addr);
    }

    pub(crate) fn drain(&self) -> Vec<u64> {
        std::mem::take(&mut self.0.lock())
    }
}

pub struct RpcChannel {
    comms: Comms,
    reclaim: Arc<FreeQueue>,
    max_resize: usize,
}

impl RpcChannel {
    pub(crate) fn new(
        stream: tokio::net::UnixStream,
        reclaim: Arc<FreeQueue>,
        max_resize: usize,
    ) -> Self {
        Self {
            comms: Comms::new(stream),
            reclaim,
            max_resize,
        }
    }

    /// The configured upper bound for buffer reallocation requests.
    pub fn max_resize(&self) -> usize {
        self.max_resize
    }

    async fn transact(&mut self, request: &Request) -> Result<Response, ChannelError> {
        self.reap().await?;
        self.comms.send(request).await?;
        match self.comms.recv().await? {
            Response::Error { message } => Err(ChannelError::Remote(message)),
            response => Ok(response),
        }
    }

    /// Releases every address queued by dropped auto-freed variables.
    async fn reap(&mut self) -> Result<(), ChannelError> {
        for addr in self.reclaim.drain() {
            tracing::trace!(addr, "releasing dropped remote allocation");
            self.comms.send(&Request::Free { addr }).await?;
            match self.comms.recv().await? {
                Response::Freed => {}
                Response::Error { message } => {
                    // The variable is gone either way; nothing to retry.
                    tracing::warn!(addr, message, "sandboxee failed to release an allocation");
                }
                other => return Err(unexpected(&other)),
            }
        }
        Ok(())
    }

    pub async fn allocate(&mut self, size: usize) -> Result<u64> {
        match self
            .transact(&Request::Allocate { size: size as u64 })
            .await?
        {
            Response::Allocated { addr } => Ok(addr),
            other => Err(unexpected(&other).into()),
        }
    }

    pub async fn free(&mut self, addr: u64) -> Result<()> {
        match self.transact(&Request::Free { addr }).await? {
            Response::Freed => Ok(()),
            other => Err(unexpected(&other).into()),
        }
    }

    pub async fn reallocate(&mut self, addr: u64, size: usize) -> Result<u64> {
        if size > self.max_resize {
            return Err(Error::precondition(format!(
                "reallocation of {size} bytes exceeds the configured maximum of {}",
                self.max_resize
            )));
        }
        match self
            .transact(&Request::Reallocate {
                addr,
                size: size as u64,
            })
            .await?
        {
            Response::Reallocated { addr } => Ok(addr),
            other => Err(unexpected(&other).into()),
        }
    }

    /// Resolves a function's address inside the sandboxee, if it exports
    /// one under that name.
    pub async fn symbol(&mut self, name: &str) -> Result<Option<u64>> {
        match self
            .transact(&Request::Symbol { name: name.into() })
            .await?
        {
            Response::Symbol { addr } => Ok(addr),
            other => Err(unexpected(&other).into()),
        }
    }

    pub async fn call(&mut self, request: CallRequest) -> Result<CallResponse> {
        match self.transact(&Request::Call(request)).await? {
            Response::Call(response) => Ok(response),
            other => Err(unexpected(&other).into()),
        }
    }

    /// Hands a descriptor to the sandboxee; returns its number over there.
    pub async fn push_fd(&mut self, fd: BorrowedFd<'_>) -> Result<RawFd> {
        self.reap().await?;
        self.comms
            .send_with_fds(&Request::PushFd, &[fd.as_raw_fd()])
            .await?;
        match self.comms.recv().await? {
            Response::FdPushed { remote_fd } => Ok(remote_fd),
            Response::Error { message } => Err(ChannelError::Remote(message).into()),
            other => Err(unexpected(&other).into()),
        }
    }

    /// Pulls a sandboxee descriptor back into a local one.
    pub async fn pull_fd(&mut self, remote_fd: RawFd) -> Result<OwnedFd> {
        match self.transact(&Request::PullFd { remote_fd }).await? {
            Response::FdPulled => self
                .comms
                .take_fd()
                .ok_or_else(|| ChannelError::FdTransfer.into()),
            other => Err(unexpected(&other).into()),
        }
    }

    /// Asks the sandboxee to exit cleanly. One-way: no reply is expected,
    /// the sender observes the outcome through process termination.
    pub async fn exit(&mut self) -> Result<()> {
        self.reap().await?;
        self.comms.send(&Request::Exit).await?;
        Ok(())
    }
}

impl std::fmt::Debug for RpcChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcChannel")
            .field("max_resize", &self.max_resize)
            .finish()
    }
}

fn unexpected(response: &Response) -> ChannelError {
    tracing::error!(?response, "response does not match the outstanding request");
    ChannelError::Remote("response does not match the outstanding request".into())
}
