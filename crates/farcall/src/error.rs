use thiserror::Error;

use crate::channel::ChannelError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// The sandbox or its channel is not active. The caller may
    /// re-initialize the sandbox and retry.
    #[error("sandbox unavailable: {0}")]
    Unavailable(String),
    /// An operation was attempted on a variable in the wrong state.
    /// Retrying without fixing the call site will not help.
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),
    /// The body of a transaction reported an application-level failure.
    /// The diagnostic is surfaced verbatim.
    #[error("transaction failed: {0}")]
    Transaction(String),
    /// The call channel failed. The sandboxee must be assumed dead.
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

impl Error {
    pub fn transaction(message: impl Into<String>) -> Self {
        Self::Transaction(message.into())
    }

    pub(crate) fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }

    pub(crate) fn precondition(message: impl Into<String>) -> Self {
        Self::FailedPrecondition(message.into())
    }

    /// Whether re-initializing the sandbox may clear the error. Channel
    /// failures count: after one, the sandboxee state is unknown and the
    /// only safe recovery is a fresh instance.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Channel(_))
    }
}
