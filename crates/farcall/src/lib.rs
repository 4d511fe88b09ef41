//! Remote calls into a library running inside a restricted child process.
//!
//! The host never links the untrusted library. Instead it spawns the library
//! inside a policy-confined sandboxee, describes each call with typed
//! variables, and drives a request/response protocol over a unix socket:
//! pointer arguments are synchronized into and out of the sandboxee's
//! address space around the call, descriptors travel as SCM_RIGHTS, and the
//! sandboxee's lifecycle (fork server, policy, wall-time limits,
//! termination) is owned by a single controller.
//!
//! The process-isolation machinery itself (namespaces, syscall filtering)
//! is not implemented here; it is consumed through the traits in
//! [`engine`], so any confinement backend with a fork-server shape plugs in.

pub mod channel;
pub mod engine;
pub mod error;
pub mod policy;
pub mod proto;
pub mod rpc;
pub mod sandbox;
pub mod serve;
pub mod transaction;
pub mod var;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use error::{Error, Result};
pub use sandbox::{Sandbox, SandboxOptions};
pub use transaction::Transaction;
pub use var::{Arg, SyncMode, Var};
