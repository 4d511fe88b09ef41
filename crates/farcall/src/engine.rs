//! The contract consumed from the process-isolation engine.
//!
//! The controller never touches namespaces, syscall filters or signal
//! plumbing itself. It starts a fork server from the sandboxee image once,
//! then spawns cheap executor instances from it, each confined by a policy
//! and surfaced as a [`SandboxProcess`] handle. Any backend with that shape
//! can implement these traits; the in-process loopback used by the test
//! suite is one such backend.

use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use nix::sys::signal::Signal;
use nix::unistd::Pid;

use crate::error::Result;
use crate::policy::Policy;

/// The sandboxee executable: a path on disk, or an in-memory descriptor
/// for an image embedded into the host binary.
#[derive(Debug)]
pub enum Image {
    Path(PathBuf),
    Fd(OwnedFd),
}

/// Resource ceilings applied to a spawned sandboxee. `None` means
/// unlimited; the confined library is expected to self-impose anything
/// tighter once it is running.
#[derive(Debug, Clone, Copy, Default)]
pub struct Limits {
    pub wall_time: Option<Duration>,
    pub cpu_time: Option<Duration>,
    pub address_space: Option<u64>,
}

/// How a sandboxee instance ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationResult {
    Exited(i32),
    Signaled(Signal),
    PolicyViolation { syscall: String },
    TimedOut,
    SetupFailure(String),
}

impl TerminationResult {
    /// A clean exit: status zero, no signal.
    pub fn is_clean(&self) -> bool {
        matches!(self, Self::Exited(0))
    }
}

impl std::fmt::Display for TerminationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exited with status {code}"),
            Self::Signaled(signal) => write!(f, "killed by {signal}"),
            Self::PolicyViolation { syscall } => {
                write!(f, "killed for calling disallowed syscall {syscall}")
            }
            Self::TimedOut => write!(f, "killed after exceeding its wall-time limit"),
            Self::SetupFailure(message) => write!(f, "failed to start: {message}"),
        }
    }
}

pub trait Engine: Send + Sync {
    /// Loads the sandboxee image and starts a fork server from it. The
    /// handle is shared: several controllers may spawn from one server,
    /// and it dies when the last reference is dropped.
    fn start_fork_server(
        &self,
        image: &Image,
        args: &[String],
        envs: &[String],
    ) -> Result<Arc<dyn ForkServer>>;
}

pub trait ForkServer: Send + Sync {
    /// Forks a fresh, not-yet-running sandboxee confined by `policy`.
    fn spawn_executor(&self, policy: Policy) -> Result<Box<dyn Executor>>;
}

pub trait Executor: Send {
    fn set_cwd(&mut self, cwd: PathBuf);

    fn limits_mut(&mut self) -> &mut Limits;

    /// Starts the sandboxee asynchronously and hands back its handle.
    fn run(self: Box<Self>) -> Result<Box<dyn SandboxProcess>>;
}

pub trait SandboxProcess: Send {
    fn pid(&self) -> Pid;

    /// The process's communication endpoint. Yielded once; the controller
    /// owns it afterwards.
    fn take_comms(&mut self) -> Option<tokio::net::UnixStream>;

    fn is_terminated(&self) -> bool;

    fn kill(&mut self);

    /// Adjusts the running instance's wall-time budget. `None` disables
    /// the limit.
    fn set_wall_time_limit(&mut self, limit: Option<Duration>);

    /// Resolves once the process has terminated. Idempotent: after the
    /// first resolution the same result is reported again.
    fn await_result(&mut self) -> BoxFuture<'_, TerminationResult>;
}
