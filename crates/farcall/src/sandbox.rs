//! The sandbox process controller and call orchestrator.
//!
//! One `Sandbox` owns at most one live sandboxee: its process handle, its
//! call channel and its pid. Nothing else mutates sandboxee state. The fork
//! server behind it is shared and reference-counted, so a crashed or
//! terminated instance can be replaced without re-loading the executable
//! image.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use nix::unistd::Pid;

use crate::engine::{Engine, ForkServer, Image, Limits, SandboxProcess, TerminationResult};
use crate::error::{Error, Result};
use crate::policy::{default_policy, TmpfsMount};
use crate::proto::{ArgSpec, CallRequest, Kind, WireValue, ARGS_MAX, FUNC_NAME_MAX};
use crate::rpc::{FreeQueue, RpcChannel};
use crate::var::{Arg, SyncMode, Var};

/// Grace window given to a cooperative exit before the sandboxee is killed.
const EXIT_GRACE: Duration = Duration::from_secs(1);

/// Default ceiling for buffer reallocation requests.
pub const DEFAULT_MAX_RESIZE: usize = 1 << 30;

/// Lifecycle of one sandboxee instance. `Terminated` is absorbing for the
/// instance; re-initializing the controller starts a fresh instance at
/// `Starting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Uninitialized,
    Starting,
    Active,
    Terminating,
    Terminated,
}

/// Caller-supplied customization applied on top of the safety-net policy
/// and the fork-server invocation.
#[derive(Debug, Clone)]
pub struct SandboxOptions {
    /// Extra argv entries for the fork server, after the image path.
    pub args: Vec<String>,
    /// Environment for the fork server.
    pub envs: Vec<String>,
    /// Syscalls allowed in addition to the safety net.
    pub extra_syscalls: Vec<String>,
    /// Paths readable in addition to the safety net.
    pub readable_paths: Vec<PathBuf>,
    /// Tmpfs mounts in addition to the default scratch mount.
    pub tmpfs: Vec<TmpfsMount>,
    /// Upper bound for one buffer reallocation request.
    pub max_resize: usize,
}

impl Default for SandboxOptions {
    fn default() -> Self {
        Self {
            args: Vec::new(),
            envs: Vec::new(),
            extra_syscalls: Vec::new(),
            readable_paths: Vec::new(),
            tmpfs: Vec::new(),
            max_resize: DEFAULT_MAX_RESIZE,
        }
    }
}

pub struct Sandbox {
    engine: Arc<dyn Engine>,
    image: Image,
    options: SandboxOptions,
    fork_server: Option<Arc<dyn ForkServer>>,
    proc: Option<Box<dyn SandboxProcess>>,
    rpc: Option<RpcChannel>,
    reclaim: Arc<FreeQueue>,
    state: State,
    result: Option<TerminationResult>,
}

impl Sandbox {
    pub fn new(engine: Arc<dyn Engine>, image: Image) -> Self {
        Self::with_options(engine, image, SandboxOptions::default())
    }

    pub fn with_options(engine: Arc<dyn Engine>, image: Image, options: SandboxOptions) -> Self {
        Self {
            engine,
            image,
            options,
            fork_server: None,
            proc: None,
            rpc: None,
            reclaim: Arc::new(FreeQueue::default()),
            state: State::Uninitialized,
            result: None,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn options(&self) -> &SandboxOptions {
        &self.options
    }

    /// The shared fork server, once started. Handing the clone to another
    /// controller lets it spawn instances without re-loading the image.
    pub fn fork_server(&self) -> Option<Arc<dyn ForkServer>> {
        self.fork_server.clone()
    }

    /// Adopts an already-running fork server instead of starting one.
    pub fn adopt_fork_server(&mut self, server: Arc<dyn ForkServer>) {
        self.fork_server = Some(server);
    }

    pub fn is_active(&self) -> bool {
        self.state == State::Active
            && self
                .proc
                .as_ref()
                .map(|proc| !proc.is_terminated())
                .unwrap_or(false)
    }

    pub fn pid(&self) -> Option<Pid> {
        self.proc.as_ref().map(|proc| proc.pid())
    }

    /// Direct access to the call channel, for operations layered on it
    /// such as buffer resizing.
    pub fn channel(&mut self) -> Result<&mut RpcChannel> {
        if !self.is_active() {
            return Err(Error::unavailable("sandbox not active"));
        }
        self.rpc
            .as_mut()
            .ok_or_else(|| Error::unavailable("sandbox not active"))
    }

    /// Starts the sandboxee. A no-op when one is already active. Starting
    /// the fork server happens only on the first initialization (or after
    /// adopting none); later calls reuse it, which is what makes replacing
    /// a dead instance cheap.
    #[tracing::instrument(level = "trace", skip_all)]
    pub async fn init(&mut self) -> Result<()> {
        if self.is_active() {
            return Ok(());
        }

        // A previous instance that died on its own still needs its result
        // recorded before a new one takes its place.
        if self.proc.is_some() {
            self.state = State::Terminating;
            self.reap().await;
        }

        self.state = State::Starting;

        if self.fork_server.is_none() {
            tracing::debug!(image = ?self.image, "starting fork server");
            let server = self
                .engine
                .start_fork_server(&self.image, &self.options.args, &self.options.envs)
                .map_err(|error| {
                    tracing::error!(?error, "could not start the fork server");
                    self.state = State::Uninitialized;
                    Error::unavailable("could not start the fork server")
                })?;
            self.fork_server = Some(server);
        }

        let mut policy = default_policy()
            .allow_syscalls(self.options.extra_syscalls.iter().cloned());
        for path in &self.options.readable_paths {
            policy = policy.add_readable_path(path.clone());
        }
        for mount in &self.options.tmpfs {
            policy = policy.add_tmpfs(mount.path.clone(), mount.max_size);
        }

        let spawn = || -> Result<Box<dyn SandboxProcess>> {
            let server = self.fork_server.as_ref().unwrap();
            let mut executor = server.spawn_executor(policy.build())?;
            executor.set_cwd(PathBuf::from("/"));
            // No lifecycle-imposed ceilings; the confined library imposes
            // its own once running.
            *executor.limits_mut() = Limits::default();
            executor.run()
        };

        let mut proc = match spawn() {
            Ok(proc) => proc,
            Err(error) => {
                tracing::error!(?error, "could not start the sandboxee");
                self.state = State::Uninitialized;
                return Err(Error::unavailable("could not start the sandboxee"));
            }
        };

        let stream = match proc.take_comms() {
            Some(stream) => stream,
            None => {
                proc.kill();
                self.state = State::Uninitialized;
                return Err(Error::unavailable(
                    "sandboxee exposes no communication endpoint",
                ));
            }
        };

        let pid = proc.pid();
        self.rpc = Some(RpcChannel::new(
            stream,
            self.reclaim.clone(),
            self.options.max_resize,
        ));
        self.proc = Some(proc);
        self.state = State::Active;
        tracing::info!(?pid, "sandboxee started");
        Ok(())
    }

    /// Allocates every remote block the variable needs and records the
    /// addresses. With `auto_free`, release is scoped to the variable's
    /// lifetime.
    pub async fn allocate(&mut self, var: &mut dyn Var, auto_free: bool) -> Result<()> {
        if !self.is_active() {
            return Err(Error::unavailable("sandbox not active"));
        }
        if var.remote().is_some() {
            return Err(Error::precondition("variable is already allocated"));
        }
        let pid = self.pid().expect("active sandbox has a pid");
        let reclaim = self.reclaim.clone();
        let rpc = self.rpc.as_mut().expect("active sandbox has a channel");
        for block in var.blocks() {
            let addr = rpc.allocate(block.len).await?;
            block.slot.assign(addr, auto_free, reclaim.clone());
        }
        var.on_allocated(pid)
    }

    /// Releases the variable's remote blocks. A no-op for blocks that were
    /// never allocated; each allocated block is released exactly once.
    pub async fn free(&mut self, var: &mut dyn Var) -> Result<()> {
        if !self.is_active() {
            return Err(Error::unavailable("sandbox not active"));
        }
        let rpc = self.rpc.as_mut().expect("active sandbox has a channel");
        for block in var.blocks() {
            if let Some(addr) = block.slot.clear() {
                rpc.free(addr).await?;
            }
        }
        Ok(())
    }

    /// Pushes the variable's local bytes into the sandboxee.
    pub fn transfer_to(&mut self, var: &mut dyn Var) -> Result<()> {
        if !self.is_active() {
            return Err(Error::unavailable("sandbox not active"));
        }
        let pid = self.pid().expect("active sandbox has a pid");
        var.transfer_to(pid)
    }

    /// Pulls the variable's bytes back from the sandboxee.
    pub fn transfer_from(&mut self, var: &mut dyn Var) -> Result<()> {
        if !self.is_active() {
            return Err(Error::unavailable("sandbox not active"));
        }
        let pid = self.pid().expect("active sandbox has a pid");
        var.transfer_from(pid)
    }

    /// Resolves an exported function's address inside the sandboxee.
    pub async fn symbol(&mut self, name: &str) -> Result<Option<u64>> {
        self.channel()?.symbol(name).await
    }

    /// Invokes `func` inside the sandboxee.
    ///
    /// Arguments are visited strictly in call order, both for the outbound
    /// synchronization pass and for the inbound one after the response.
    /// Pointees lacking remote storage are allocated here with release
    /// scoped to the pointee's lifetime. A failure before the request is
    /// sent leaves the wire untouched; a failure after it means the
    /// sandboxee's state is unknown and the caller should re-initialize.
    #[tracing::instrument(level = "trace", skip_all, fields(func = %func))]
    pub async fn call(
        &mut self,
        func: &str,
        ret: &mut dyn Var,
        args: &mut [Arg<'_>],
    ) -> Result<()> {
        if !self.is_active() {
            return Err(Error::unavailable("sandbox not active"));
        }
        if func.len() > FUNC_NAME_MAX {
            return Err(Error::precondition("function name too long"));
        }
        if args.len() > ARGS_MAX {
            return Err(Error::precondition("too many arguments"));
        }

        let pid = self.pid().expect("active sandbox has a pid");
        tracing::trace!(argc = args.len(), "dispatching call");

        let mut specs = Vec::with_capacity(args.len());
        for arg in args.iter_mut() {
            let spec = match arg {
                Arg::Val(var) => ArgSpec {
                    kind: var.kind(),
                    size: var.size() as u64,
                    pointee_kind: None,
                    pointee_size: None,
                    value: var.wire_value(),
                },
                Arg::Fd(var) => {
                    let remote_fd = match var.remote_fd() {
                        Some(fd) => fd,
                        None => {
                            let local = var.fd().ok_or_else(|| {
                                Error::precondition("descriptor argument holds no descriptor")
                            })?;
                            let remote_fd = self
                                .rpc
                                .as_mut()
                                .expect("active sandbox has a channel")
                                .push_fd(local)
                                .await?;
                            var.set_remote_fd(remote_fd);
                            remote_fd
                        }
                    };
                    ArgSpec {
                        kind: Kind::Fd,
                        size: var.size() as u64,
                        pointee_kind: None,
                        pointee_size: None,
                        value: WireValue::Int(i64::from(remote_fd)),
                    }
                }
                Arg::Ptr { pointee, mode } => {
                    let mode = *mode;
                    if mode != SyncMode::None && pointee.remote().is_none() {
                        // Storage for the whole synchronization cycle,
                        // released when the pointee goes away.
                        self.allocate_pointee(pid, &mut **pointee).await?;
                    }
                    if mode.before() {
                        pointee.transfer_to(pid)?;
                    }
                    ArgSpec {
                        kind: Kind::Pointer,
                        size: std::mem::size_of::<u64>() as u64,
                        pointee_kind: Some(pointee.kind()),
                        pointee_size: Some(pointee.size() as u64),
                        value: WireValue::Int(pointee.remote().unwrap_or(0) as i64),
                    }
                }
            };
            specs.push(spec);
        }

        let request = CallRequest {
            func: func.into(),
            args: specs,
            ret_kind: ret.kind(),
            ret_size: ret.size() as u64,
        };

        let response = self
            .rpc
            .as_mut()
            .expect("active sandbox has a channel")
            .call(request)
            .await?;

        ret.set_wire_value(response.value)?;
        if response.ret_kind == Kind::Fd {
            if let Some(fd_ret) = ret.as_fd_var() {
                if let Some(remote_fd) = fd_ret.remote_fd() {
                    let local = self
                        .rpc
                        .as_mut()
                        .expect("active sandbox has a channel")
                        .pull_fd(remote_fd)
                        .await?;
                    fd_ret.adopt(local);
                }
            }
        }

        for arg in args.iter_mut() {
            if let Arg::Ptr { pointee, mode } = arg {
                if mode.after() {
                    if pointee.remote().is_none() {
                        return Err(Error::precondition(
                            "synchronizing a pointee that was never allocated",
                        ));
                    }
                    pointee.transfer_from(pid)?;
                }
            }
        }

        tracing::trace!("call completed");
        Ok(())
    }

    async fn allocate_pointee(&mut self, pid: Pid, var: &mut dyn Var) -> Result<()> {
        let reclaim = self.reclaim.clone();
        let rpc = self.rpc.as_mut().expect("active sandbox has a channel");
        for block in var.blocks() {
            let addr = rpc.allocate(block.len).await?;
            block.slot.assign(addr, true, reclaim.clone());
        }
        var.on_allocated(pid)
    }

    /// Adjusts the running sandboxee's wall-time budget.
    pub fn set_wall_time_limit(&mut self, limit: Option<Duration>) -> Result<()> {
        if !self.is_active() {
            return Err(Error::unavailable("sandbox not active"));
        }
        self.proc
            .as_mut()
            .expect("active sandbox has a process")
            .set_wall_time_limit(limit);
        Ok(())
    }

    /// Stops the sandboxee. With `graceful`, it is asked to exit on its
    /// own under a short wall-time budget and killed only if it does not
    /// comply; otherwise it is killed immediately. Always records the
    /// termination result.
    #[tracing::instrument(level = "trace", skip_all, fields(graceful = graceful))]
    pub async fn terminate(&mut self, graceful: bool) {
        if !self.is_active() {
            if self.proc.is_some() {
                self.state = State::Terminating;
                self.reap().await;
            }
            return;
        }
        self.state = State::Terminating;

        if graceful {
            self.proc
                .as_mut()
                .expect("terminating sandbox has a process")
                .set_wall_time_limit(Some(EXIT_GRACE));
            let exited = match self.rpc.as_mut() {
                Some(rpc) => rpc.exit().await.is_ok(),
                None => false,
            };
            if !exited {
                tracing::warn!("graceful exit request failed, killing the sandboxee");
                self.proc
                    .as_mut()
                    .expect("terminating sandbox has a process")
                    .kill();
            }
        } else {
            self.proc
                .as_mut()
                .expect("terminating sandbox has a process")
                .kill();
        }

        self.reap().await;
    }

    /// Waits for the sandboxee to terminate and returns the recorded
    /// result. Subsequent calls return the cached result without waiting.
    pub async fn await_result(&mut self) -> TerminationResult {
        if self.proc.is_some() {
            self.state = State::Terminating;
            self.reap().await;
        }
        self.result
            .clone()
            .unwrap_or_else(|| TerminationResult::SetupFailure("never started".into()))
    }

    async fn reap(&mut self) {
        if let Some(mut proc) = self.proc.take() {
            let result = proc.await_result().await;
            if result.is_clean() {
                tracing::debug!(%result, "sandboxee finished");
            } else {
                tracing::warn!(%result, "sandboxee did not exit cleanly");
            }
            self.result = Some(result);
        }
        self.rpc = None;
        self.state = State::Terminated;
    }
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("image", &self.image)
            .field("state", &self.state)
            .finish()
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        // Best effort: the engine reports the result to nobody, but the
        // process must not outlive its controller.
        if let Some(proc) = self.proc.as_mut() {
            proc.kill();
        }
    }
}
