//! Low-level plumbing shared by both ends of a sandbox call channel:
//! message framing and SCM_RIGHTS descriptor passing.

pub mod fd;
pub mod frame;
