//! An in-process implementation of the isolation-engine contract.
//!
//! The "sandboxee" is a thread running the serving loop over a socketpair.
//! No confinement is applied, but every other mechanism is the real one:
//! allocations are live heap blocks, so direct memory transfers against
//! this process's own pid exercise the same path a separate process would;
//! wall-time limits are enforced by a timer that severs the channel, which
//! is how an engine-enforced limit looks from the host's side.

use std::net::Shutdown;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use nix::sys::signal::Signal;
use nix::unistd::Pid;

use crate::engine::{
    Engine, Executor, ForkServer, Image, Limits, SandboxProcess, TerminationResult,
};
use crate::error::{Error, Result};
use crate::policy::Policy;
use crate::serve::{serve, Registry};

pub struct LoopbackEngine {
    registry: Arc<Registry>,
    unresponsive: bool,
    servers_started: AtomicUsize,
}

impl LoopbackEngine {
    pub fn new(registry: Registry) -> Self {
        Self {
            registry: Arc::new(registry),
            unresponsive: false,
            servers_started: AtomicUsize::new(0),
        }
    }

    /// An engine whose sandboxees read requests and never act on them.
    /// For exercising the forced-termination paths.
    pub fn unresponsive(registry: Registry) -> Self {
        Self {
            registry: Arc::new(registry),
            unresponsive: true,
            servers_started: AtomicUsize::new(0),
        }
    }

    /// How many fork servers have been started. A controller that reuses
    /// its fork server across instances keeps this at one.
    pub fn fork_servers_started(&self) -> usize {
        self.servers_started.load(Ordering::Relaxed)
    }
}

impl Engine for LoopbackEngine {
    fn start_fork_server(
        &self,
        image: &Image,
        _args: &[String],
        _envs: &[String],
    ) -> Result<Arc<dyn ForkServer>> {
        self.servers_started.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(?image, "loopback fork server started");
        Ok(Arc::new(LoopbackForkServer {
            registry: self.registry.clone(),
            unresponsive: self.unresponsive,
        }))
    }
}

pub struct LoopbackForkServer {
    registry: Arc<Registry>,
    unresponsive: bool,
}

impl ForkServer for LoopbackForkServer {
    fn spawn_executor(&self, policy: Policy) -> Result<Box<dyn Executor>> {
        Ok(Box::new(LoopbackExecutor {
            registry: self.registry.clone(),
            unresponsive: self.unresponsive,
            _policy: policy,
            cwd: PathBuf::from("/"),
            limits: Limits::default(),
        }))
    }
}

pub struct LoopbackExecutor {
    registry: Arc<Registry>,
    unresponsive: bool,
    _policy: Policy,
    cwd: PathBuf,
    limits: Limits,
}

impl Executor for LoopbackExecutor {
    fn set_cwd(&mut self, cwd: PathBuf) {
        self.cwd = cwd;
    }

    fn limits_mut(&mut self) -> &mut Limits {
        &mut self.limits
    }

    fn run(self: Box<Self>) -> Result<Box<dyn SandboxProcess>> {
        tracing::trace!(cwd = ?self.cwd, limits = ?self.limits, "starting loopback sandboxee");
        let (host, guest) = StdUnixStream::pair()
            .map_err(|error| Error::Unavailable(format!("socketpair failed: {error}")))?;
        let kill_handle = host
            .try_clone()
            .map_err(|error| Error::Unavailable(format!("socket clone failed: {error}")))?;

        let terminated = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        {
            let registry = self.registry.clone();
            let terminated = terminated.clone();
            let unresponsive = self.unresponsive;
            std::thread::Builder::new()
                .name("farcall-sandboxee".into())
                .spawn(move || {
                    let outcome = if unresponsive {
                        drain(guest)
                    } else {
                        match serve(guest, &registry) {
                            Ok(()) => TerminationResult::Exited(0),
                            Err(error) => {
                                tracing::trace!(?error, "serving ended on channel failure");
                                TerminationResult::Signaled(Signal::SIGKILL)
                            }
                        }
                    };
                    terminated.store(true, Ordering::Release);
                    let _ = done_tx.send(outcome);
                })
                .map_err(|error| Error::Unavailable(format!("thread spawn failed: {error}")))?;
        }

        host.set_nonblocking(true)
            .map_err(|error| Error::Unavailable(format!("socket setup failed: {error}")))?;
        let comms = tokio::net::UnixStream::from_std(host)
            .map_err(|error| Error::Unavailable(format!("socket setup failed: {error}")))?;

        Ok(Box::new(LoopbackProcess {
            comms: Some(comms),
            kill_handle,
            terminated,
            timed_out: Arc::new(AtomicBool::new(false)),
            done: Some(done_rx),
            result: None,
            timer: None,
        }))
    }
}

/// Reads and discards everything: a sandboxee that is alive but will not
/// honor any request, including an exit request.
fn drain(mut stream: StdUnixStream) -> TerminationResult {
    use std::io::Read;
    let mut sink = [0u8; 256];
    loop {
        match stream.read(&mut sink) {
            Ok(0) | Err(_) => return TerminationResult::Signaled(Signal::SIGKILL),
            Ok(_) => {}
        }
    }
}

pub struct LoopbackProcess {
    comms: Option<tokio::net::UnixStream>,
    kill_handle: StdUnixStream,
    terminated: Arc<AtomicBool>,
    timed_out: Arc<AtomicBool>,
    done: Option<tokio::sync::oneshot::Receiver<TerminationResult>>,
    result: Option<TerminationResult>,
    timer: Option<tokio::task::AbortHandle>,
}

impl SandboxProcess for LoopbackProcess {
    fn pid(&self) -> Pid {
        // The sandboxee shares this process's address space.
        Pid::this()
    }

    fn take_comms(&mut self) -> Option<tokio::net::UnixStream> {
        self.comms.take()
    }

    fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    fn kill(&mut self) {
        let _ = self.kill_handle.shutdown(Shutdown::Both);
    }

    fn set_wall_time_limit(&mut self, limit: Option<Duration>) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        let limit = match limit {
            Some(limit) => limit,
            None => return,
        };
        let kill = match self.kill_handle.try_clone() {
            Ok(kill) => kill,
            Err(error) => {
                tracing::error!(?error, "cannot arm wall-time limit");
                return;
            }
        };
        let timed_out = self.timed_out.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(limit).await;
            timed_out.store(true, Ordering::Release);
            let _ = kill.shutdown(Shutdown::Both);
        });
        self.timer = Some(timer.abort_handle());
    }

    fn await_result(&mut self) -> BoxFuture<'_, TerminationResult> {
        Box::pin(async move {
            if self.result.is_none() {
                let outcome = match self.done.take() {
                    Some(done) => done
                        .await
                        .unwrap_or(TerminationResult::Signaled(Signal::SIGKILL)),
                    None => TerminationResult::Signaled(Signal::SIGKILL),
                };
                let outcome = if self.timed_out.load(Ordering::Acquire) && !outcome.is_clean() {
                    TerminationResult::TimedOut
                } else {
                    outcome
                };
                self.result = Some(outcome);
            }
            self.result.clone().expect("result recorded above")
        })
    }
}

impl Drop for LoopbackProcess {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        let _ = self.kill_handle.shutdown(Shutdown::Both);
    }
}


#[cfg(test)]
mod test {
    use std::io::Read;
    use std::os::fd::OwnedFd;
    use std::os::unix::net::UnixStream;
    use std::time::{Duration, Instant};

    use pretty_assertions::assert_eq;

    use super::fixtures::{stringop_registry, Greeting};
    use super::*;
    use crate::engine::Image;
    use crate::error::Error;
    use crate::sandbox::{Sandbox, State};
    use crate::var::{Arg, Bytes, FdVar, Msg, Scalar, Void};

    fn stringop_sandbox() -> (Arc<LoopbackEngine>, Sandbox) {
        let engine = Arc::new(LoopbackEngine::new(stringop_registry()));
        let sandbox = Sandbox::new(
            engine.clone(),
            Image::Path("/usr/lib/libstringop.so".into()),
        );
        (engine, sandbox)
    }

    #[tokio::test]
    async fn duplicates_a_buffer() {
        let (_engine, mut sandbox) = stringop_sandbox();
        sandbox.init().await.unwrap();

        let mut param = Bytes::new(b"0123456789".to_vec());
        let mut ret = Scalar::<i32>::new(0);
        sandbox
            .call("duplicate_string", &mut ret, &mut [Arg::ptr_both(&mut param)])
            .await
            .unwrap();

        assert_eq!(ret.get(), 1);
        assert_eq!(param.len(), 20);
        assert_eq!(param.as_slice(), b"01234567890123456789");

        sandbox.terminate(true).await;
    }

    #[tokio::test]
    async fn reverses_and_resizes_a_buffer() {
        let (_engine, mut sandbox) = stringop_sandbox();
        sandbox.init().await.unwrap();

        let mut param = Bytes::new(b"0123456789".to_vec());
        let mut ret = Scalar::<i32>::new(0);
        sandbox
            .call("reverse_string", &mut ret, &mut [Arg::ptr_both(&mut param)])
            .await
            .unwrap();
        assert_eq!(ret.get(), 1);
        assert_eq!(param.as_slice(), b"9876543210");

        // Reuse the same variable with more data.
        let channel = sandbox.channel().unwrap();
        param.resize(channel, 16).await.unwrap();
        assert_eq!(param.len(), 16);
        param.as_mut_slice()[10..].copy_from_slice(b"ABCDEF");
        assert_eq!(param.as_slice(), b"9876543210ABCDEF");

        sandbox
            .call("reverse_string", &mut ret, &mut [Arg::ptr_both(&mut param)])
            .await
            .unwrap();
        assert_eq!(param.as_slice(), b"FEDCBA0123456789");

        sandbox.terminate(true).await;
    }

    #[tokio::test]
    async fn passes_scalars_by_value() {
        let (_engine, mut sandbox) = stringop_sandbox();
        sandbox.init().await.unwrap();

        let mut a = Scalar::<i32>::new(2);
        let mut b = Scalar::<i64>::new(40);
        let mut c = Scalar::<u8>::new(200);
        let mut ret = Scalar::<i64>::new(0);
        sandbox
            .call(
                "sum",
                &mut ret,
                &mut [Arg::val(&mut a), Arg::val(&mut b), Arg::val(&mut c)],
            )
            .await
            .unwrap();
        assert_eq!(ret.get(), 242);

        let mut factor = Scalar::<f64>::new(0.5);
        let mut value = Scalar::<i32>::new(9);
        let mut scaled = Scalar::<f64>::new(0.0);
        sandbox
            .call(
                "scale",
                &mut scaled,
                &mut [Arg::val(&mut factor), Arg::val(&mut value)],
            )
            .await
            .unwrap();
        assert_eq!(scaled.get(), 4.5);

        sandbox.terminate(true).await;
    }

    #[tokio::test]
    async fn sync_none_is_never_transferred() {
        let (_engine, mut sandbox) = stringop_sandbox();
        sandbox.init().await.unwrap();

        // Establish remote storage by hand, then call with no
        // synchronization in either direction.
        let mut param = Bytes::new(b"0123456789".to_vec());
        sandbox.allocate(&mut param, false).await.unwrap();
        sandbox.transfer_to(&mut param).unwrap();

        let mut ret = Scalar::<i32>::new(0);
        sandbox
            .call("stomp", &mut ret, &mut [Arg::ptr_none(&mut param)])
            .await
            .unwrap();
        assert_eq!(ret.get(), 1);

        // The callee overwrote its copy, not ours.
        assert_eq!(param.as_slice(), b"0123456789");

        // Pulling explicitly shows the overwrite actually happened.
        sandbox.transfer_from(&mut param).unwrap();
        assert_eq!(param.as_slice(), &[0xFF; 10]);

        sandbox.free(&mut param).await.unwrap();
        sandbox.terminate(true).await;
    }

    #[tokio::test]
    async fn sync_after_pulls_pure_output() {
        let (_engine, mut sandbox) = stringop_sandbox();
        sandbox.init().await.unwrap();

        // Local contents are never pushed; the callee fills the buffer.
        let mut out = Bytes::new(vec![0xEE; 6]);
        let mut ret = Scalar::<i64>::new(0);
        sandbox
            .call("fill_pattern", &mut ret, &mut [Arg::ptr_after(&mut out)])
            .await
            .unwrap();

        assert_eq!(ret.get(), 6);
        assert_eq!(out.as_slice(), &[0, 1, 2, 3, 4, 5]);

        sandbox.terminate(true).await;
    }

    #[tokio::test]
    async fn auto_freed_allocations_are_released_exactly_once() {
        let (_engine, mut sandbox) = stringop_sandbox();
        sandbox.init().await.unwrap();

        {
            let mut param = Bytes::new(b"0123456789".to_vec());
            let mut ret = Scalar::<i32>::new(0);
            sandbox
                .call("reverse_string", &mut ret, &mut [Arg::ptr_both(&mut param)])
                .await
                .unwrap();

            // The buffer's header and payload blocks are still owned by
            // the live variable.
            let mut live = Scalar::<i64>::new(0);
            sandbox.call("outstanding", &mut live, &mut []).await.unwrap();
            assert_eq!(live.get(), 2);
        }

        // The variable is gone; the next wire operation reaps its blocks.
        let mut live = Scalar::<i64>::new(0);
        sandbox.call("outstanding", &mut live, &mut []).await.unwrap();
        assert_eq!(live.get(), 0);

        sandbox.terminate(true).await;
    }

    #[tokio::test]
    async fn explicit_free_disarms_automatic_release() {
        let (_engine, mut sandbox) = stringop_sandbox();
        sandbox.init().await.unwrap();

        let mut param = Bytes::new(b"abc".to_vec());
        sandbox.allocate(&mut param, true).await.unwrap();
        sandbox.free(&mut param).await.unwrap();
        // A second free has nothing left to release.
        sandbox.free(&mut param).await.unwrap();
        drop(param);

        let mut live = Scalar::<i64>::new(0);
        sandbox.call("outstanding", &mut live, &mut []).await.unwrap();
        assert_eq!(live.get(), 0);

        sandbox.terminate(true).await;
    }

    #[tokio::test]
    async fn descriptors_are_renumbered_and_usable() {
        let (_engine, mut sandbox) = stringop_sandbox();
        sandbox.init().await.unwrap();

        let (mut receiver, sender) = UnixStream::pair().unwrap();
        let mut fd = FdVar::new(OwnedFd::from(sender));
        let mut payload = Bytes::new(b"over the wall".to_vec());
        let mut ret = Scalar::<i64>::new(0);
        sandbox
            .call(
                "write_fd",
                &mut ret,
                &mut [Arg::fd(&mut fd), Arg::ptr_before(&mut payload)],
            )
            .await
            .unwrap();
        assert_eq!(ret.get(), 13);
        assert!(fd.remote_fd().is_some());

        let mut read_back = [0u8; 13];
        receiver.read_exact(&mut read_back).unwrap();
        assert_eq!(&read_back, b"over the wall");

        sandbox.terminate(true).await;
    }

    #[tokio::test]
    async fn descriptor_returns_are_pulled_back() {
        let (_engine, mut sandbox) = stringop_sandbox();
        sandbox.init().await.unwrap();

        let mut ret = FdVar::empty();
        sandbox.call("open_greeter", &mut ret, &mut []).await.unwrap();

        let fd = ret.into_fd().expect("descriptor should be pulled back");
        let mut stream = UnixStream::from(fd);
        let mut greeting = [0u8; 2];
        stream.read_exact(&mut greeting).unwrap();
        assert_eq!(&greeting, b"hi");

        sandbox.terminate(true).await;
    }

    #[tokio::test]
    async fn structured_messages_round_trip() {
        let (_engine, mut sandbox) = stringop_sandbox();
        sandbox.init().await.unwrap();

        let mut msg = Msg::new(&Greeting {
            text: "hello".into(),
        })
        .unwrap();
        let mut ret = Scalar::<i32>::new(0);
        sandbox
            .call("shout", &mut ret, &mut [Arg::ptr_both(&mut msg)])
            .await
            .unwrap();
        assert_eq!(ret.get(), 1);
        assert_eq!(
            msg.get().unwrap(),
            Greeting {
                text: "HELLO".into()
            }
        );

        sandbox.terminate(true).await;
    }

    #[tokio::test]
    async fn symbols_resolve_end_to_end() {
        let (_engine, mut sandbox) = stringop_sandbox();
        sandbox.init().await.unwrap();

        assert!(sandbox.symbol("reverse_string").await.unwrap().is_some());
        assert!(sandbox.symbol("no_such_symbol").await.unwrap().is_none());

        sandbox.terminate(true).await;
    }

    #[tokio::test]
    async fn graceful_termination_is_clean() {
        let (_engine, mut sandbox) = stringop_sandbox();
        sandbox.init().await.unwrap();
        assert!(sandbox.is_active());

        sandbox.terminate(true).await;
        assert!(!sandbox.is_active());
        assert_eq!(sandbox.state(), State::Terminated);

        let result = sandbox.await_result().await;
        assert!(result.is_clean(), "unexpected result: {result}");
        // Cached: asking again returns the same outcome without waiting.
        assert_eq!(sandbox.await_result().await, result);
    }

    #[tokio::test]
    async fn unresponsive_sandboxee_is_killed_within_the_grace_window() {
        let engine = Arc::new(LoopbackEngine::unresponsive(Registry::new()));
        let mut sandbox = Sandbox::new(
            engine.clone(),
            Image::Path("/usr/lib/libstringop.so".into()),
        );
        sandbox.init().await.unwrap();
        assert!(sandbox.is_active());

        let started = Instant::now();
        sandbox.terminate(true).await;
        let elapsed = started.elapsed();

        let result = sandbox.await_result().await;
        assert!(!result.is_clean(), "unexpected result: {result}");
        assert_eq!(result, TerminationResult::TimedOut);
        assert!(elapsed < Duration::from_secs(5), "took {elapsed:?}");
    }

    #[tokio::test]
    async fn init_is_idempotent_and_reuses_the_fork_server() {
        let (engine, mut sandbox) = stringop_sandbox();

        sandbox.init().await.unwrap();
        sandbox.init().await.unwrap();
        assert_eq!(engine.fork_servers_started(), 1);
        let pid = sandbox.pid();

        sandbox.terminate(false).await;
        assert!(!sandbox.is_active());

        // A fresh instance spawns from the existing fork server.
        sandbox.init().await.unwrap();
        assert!(sandbox.is_active());
        assert_eq!(engine.fork_servers_started(), 1);
        assert_eq!(sandbox.pid(), pid);

        let mut ret = Scalar::<i64>::new(0);
        sandbox.call("outstanding", &mut ret, &mut []).await.unwrap();
        assert_eq!(ret.get(), 0);

        sandbox.terminate(true).await;
    }

    #[tokio::test]
    async fn wall_time_limit_requires_an_active_sandbox() {
        let (_engine, mut sandbox) = stringop_sandbox();
        let error = sandbox
            .set_wall_time_limit(Some(Duration::from_secs(1)))
            .unwrap_err();
        assert!(matches!(error, Error::Unavailable(_)));
    }

    #[tokio::test]
    async fn calls_against_an_inactive_sandbox_fail_without_io() {
        let (engine, mut sandbox) = stringop_sandbox();

        let mut ret = Void;
        let error = sandbox.call("sum", &mut ret, &mut []).await.unwrap_err();
        assert!(matches!(error, Error::Unavailable(_)));
        // Nothing was started, let alone written to.
        assert_eq!(engine.fork_servers_started(), 0);
        assert_eq!(sandbox.state(), State::Uninitialized);
    }
}
