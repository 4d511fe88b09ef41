//! A single-outcome wrapper around a sequence of sandbox calls.
//!
//! The transaction owns its sandbox, guarantees it is initialized before
//! the body runs, and funnels every failure — including explicit
//! application-level failures raised with [`crate::Error::transaction`] — into
//! the one returned status. It never retries on its own; a caller that
//! wants retries wraps `run` in a loop and re-runs the whole body, since a
//! failed body leaves the sandboxee's state unknown.

use futures::future::BoxFuture;

use crate::error::Result;
use crate::sandbox::Sandbox;

pub struct Transaction {
    sandbox: Sandbox,
}

impl Transaction {
    pub fn new(sandbox: Sandbox) -> Self {
        Self { sandbox }
    }

    pub fn sandbox(&mut self) -> &mut Sandbox {
        &mut self.sandbox
    }

    /// Ensures the sandbox is up, then executes `body` against it.
    #[tracing::instrument(level = "trace", skip_all)]
    pub async fn run<F>(&mut self, body: F) -> Result<()>
    where
        F: for<'a> FnOnce(&'a mut Sandbox) -> BoxFuture<'a, Result<()>>,
    {
        self.sandbox.init().await?;
        match body(&mut self.sandbox).await {
            Ok(()) => Ok(()),
            Err(error) => {
                tracing::debug!(%error, "transaction body failed");
                Err(error)
            }
        }
    }

    /// Stops the sandbox and releases the controller.
    pub async fn finish(mut self) -> Sandbox {
        self.sandbox.terminate(true).await;
        self.sandbox
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("sandbox", &self.sandbox)
            .finish()
    }
}
