//! Process supervisor - owns the worker subprocess and the exchange protocol.
//!
//! Lifecycle:
//! 1. Spawn the worker with all three standard streams piped
//! 2. Start draining stderr into the [`StderrRing`]
//! 3. Wait for the handshake line (bounded by the startup timeout)
//! 4. Serve exchanges: one line written, one line read, under the exchange lock
//!
//! A worker that dies mid-exchange is respawned once per supervisor. The second
//! death is fatal and leaves the supervisor `Dead`.

use std::ffi::OsString;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::runtime::Handle;
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::app::AppKind;
use crate::bridge::codec::{JsonLinesCodec, LineCodec};
use crate::bridge::protocol::{
    ControlMessage, ControlReply, HandshakeStatus, KIND_BODY_TOO_LARGE, MAX_BODY_BYTES,
    ResetStatus, STATUS_BODY_TOO_LARGE, WireRequest, WireResponse, WorkerInbound, WorkerOutbound,
};
use crate::stderr_drain::{StderrDrain, StderrRing};

pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Environment variable naming the worker binary.
pub const WORKER_BIN_ENV: &str = "SOCKETLESS_WORKER_BIN";
pub const DEFAULT_WORKER_PROGRAM: &str = "socketless-worker";

/// How long a dead worker's stderr gets to reach the ring before the tail is read.
const DRAIN_SETTLE: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Starting,
    Handshaking,
    Ready,
    Restarting,
    /// Terminal.
    Dead,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Handshaking => "handshaking",
            Self::Ready => "ready",
            Self::Restarting => "restarting",
            Self::Dead => "dead",
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Program and arguments for one worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerLaunch {
    pub program: OsString,
    pub args: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

/// Extension point for different worker spawn strategies.
///
/// The returned child must have stdin, stdout and stderr piped.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, launch: &WorkerLaunch) -> Result<Child, SpawnError>;
}

/// Spawns `launch.program` directly.
pub struct CommandSpawner;

impl WorkerSpawner for CommandSpawner {
    fn spawn(&self, launch: &WorkerLaunch) -> Result<Child, SpawnError> {
        let child = Command::new(&launch.program)
            .args(&launch.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        Ok(child)
    }
}

#[derive(Clone)]
pub struct SupervisorConfig {
    pub app: String,
    pub reset_hook: Option<String>,
    pub app_kind: AppKind,
    pub debug: bool,
    pub startup_timeout: Duration,
    pub shutdown_grace: Duration,
    pub worker_program: Option<OsString>,
    pub spawner: Arc<dyn WorkerSpawner>,
}

impl SupervisorConfig {
    /// `app` is a `module:attr` locator understood by the worker binary.
    pub fn new(app: impl Into<String>) -> Self {
        Self {
            app: app.into(),
            reset_hook: None,
            app_kind: AppKind::Auto,
            debug: false,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            worker_program: None,
            spawner: Arc::new(CommandSpawner),
        }
    }

    pub fn with_reset_hook(mut self, hook: impl Into<String>) -> Self {
        self.reset_hook = Some(hook.into());
        self
    }

    pub fn with_app_kind(mut self, kind: AppKind) -> Self {
        self.app_kind = kind;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_worker_program(mut self, program: impl Into<OsString>) -> Self {
        self.worker_program = Some(program.into());
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn WorkerSpawner>) -> Self {
        self.spawner = spawner;
        self
    }

    pub fn launch(&self) -> WorkerLaunch {
        let program = self
            .worker_program
            .clone()
            .or_else(|| std::env::var_os(WORKER_BIN_ENV))
            .unwrap_or_else(|| OsString::from(DEFAULT_WORKER_PROGRAM));

        let mut args = vec!["--app".to_string(), self.app.clone()];
        if let Some(hook) = &self.reset_hook {
            args.push("--reset-hook".to_string());
            args.push(hook.clone());
        }
        args.push("--app-kind".to_string());
        args.push(self.app_kind.as_str().to_string());
        if self.debug {
            args.push("--debug".to_string());
        }
        WorkerLaunch { program, args }
    }
}

impl std::fmt::Debug for SupervisorConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SupervisorConfig")
            .field("app", &self.app)
            .field("reset_hook", &self.reset_hook)
            .field("app_kind", &self.app_kind)
            .field("debug", &self.debug)
            .field("startup_timeout", &self.startup_timeout)
            .field("shutdown_grace", &self.shutdown_grace)
            .field("worker_program", &self.worker_program)
            .finish_non_exhaustive()
    }
}

fn with_tail(stderr: &str) -> String {
    if stderr.is_empty() {
        String::new()
    } else {
        format!("\nworker stderr:\n{stderr}")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("failed to spawn worker: {0}")]
    Spawn(#[from] SpawnError),
    #[error("worker handshake failed: {reason}{}", with_tail(.stderr))]
    Handshake { reason: String, stderr: String },
    #[error("worker died and was already restarted once: {reason}{}", with_tail(.stderr))]
    ProcessDeath { reason: String, stderr: String },
    #[error("worker is dead{}", with_tail(.stderr))]
    WorkerDead { stderr: String },
    #[error("protocol error: {reason}{}", with_tail(.stderr))]
    Protocol { reason: String, stderr: String },
    #[error("response body of {size} bytes exceeds limit of {} bytes", MAX_BODY_BYTES)]
    ResponseTooLarge { size: usize },
    #[error("supervisor is closed")]
    Closed,
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl SupervisorError {
    /// Worker stderr captured when the error was raised, if any.
    pub fn stderr(&self) -> Option<&str> {
        match self {
            Self::Handshake { stderr, .. }
            | Self::ProcessDeath { stderr, .. }
            | Self::WorkerDead { stderr }
            | Self::Protocol { stderr, .. } => Some(stderr),
            _ => None,
        }
    }
}

/// Why a single exchange did not produce a line.
enum ExchangeFailure {
    Died(String),
    Corrupt(String),
    Io(io::Error),
}

/// One live worker process and its pipes.
struct Worker {
    child: StdMutex<Child>,
    pid: Option<u32>,
    stdin: Mutex<FramedWrite<ChildStdin, JsonLinesCodec<WorkerInbound>>>,
    stdout: Mutex<FramedRead<ChildStdout, LineCodec>>,
    drain: StderrDrain,
}

impl Worker {
    fn spawn(config: &SupervisorConfig, ring: &StderrRing) -> Result<Self, SupervisorError> {
        let launch = config.launch();
        tracing::info!(
            program = ?launch.program,
            args = ?launch.args,
            "Spawning worker subprocess"
        );
        let mut child = config.spawner.spawn(&launch)?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SpawnError::Other("stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SpawnError::Other("stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SpawnError::Other("stderr not captured".to_string()))?;

        let pid = child.id();
        let drain = StderrDrain::spawn(stderr, ring.clone());

        Ok(Self {
            child: StdMutex::new(child),
            pid,
            stdin: Mutex::new(FramedWrite::new(stdin, JsonLinesCodec::new())),
            stdout: Mutex::new(FramedRead::new(stdout, LineCodec::new())),
            drain,
        })
    }

    fn exit_status(&self) -> Option<ExitStatus> {
        let mut child = self.child.lock().unwrap_or_else(PoisonError::into_inner);
        child.try_wait().ok().flatten()
    }

    /// Read lines until the handshake arrives. The first non-blank line must be it.
    async fn handshake(&self, timeout: Duration) -> Result<(), String> {
        let start = Instant::now();
        let read = tokio::time::timeout(timeout, async {
            let mut stdout = self.stdout.lock().await;
            stdout.next().await
        })
        .await;

        let line = match read {
            Err(_) => return Err(format!("timed out after {timeout:?}")),
            Ok(None) => return Err("worker exited during handshake".to_string()),
            Ok(Some(Err(e))) => return Err(format!("failed to read handshake: {e}")),
            Ok(Some(Ok(line))) => line,
        };

        match serde_json::from_str::<WorkerOutbound>(&line) {
            Ok(WorkerOutbound::Control(ControlReply::Handshake {
                status: HandshakeStatus::Ok,
            })) => {
                tracing::debug!(
                    pid = ?self.pid,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Handshake ok"
                );
                Ok(())
            }
            Ok(other) => Err(format!("unexpected handshake message: {other:?}")),
            Err(_) => Err(format!("invalid handshake: {line:?}")),
        }
    }

    async fn round_trip(&self, message: &WorkerInbound) -> Result<String, ExchangeFailure> {
        if let Some(status) = self.exit_status() {
            return Err(ExchangeFailure::Died(format!(
                "process exited before send ({status})"
            )));
        }

        {
            let mut stdin = self.stdin.lock().await;
            if let Err(e) = stdin.send(message.clone()).await {
                return Err(match e.kind() {
                    io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset => {
                        ExchangeFailure::Died(format!("write to worker failed: {e}"))
                    }
                    _ if self.exit_status().is_some() => {
                        ExchangeFailure::Died(format!("write to worker failed: {e}"))
                    }
                    _ => ExchangeFailure::Io(e),
                });
            }
        }

        let mut stdout = self.stdout.lock().await;
        match stdout.next().await {
            Some(Ok(line)) => Ok(line),
            Some(Err(e)) if e.kind() == io::ErrorKind::InvalidData => {
                Err(ExchangeFailure::Corrupt(e.to_string()))
            }
            Some(Err(e)) => Err(ExchangeFailure::Io(e)),
            None => Err(ExchangeFailure::Died(
                "process exited during read".to_string(),
            )),
        }
    }

    /// SIGTERM, wait up to `grace`, then SIGKILL. Settles the drain afterwards.
    async fn terminate(self, grace: Duration) -> Option<ExitStatus> {
        let Self {
            child,
            pid,
            stdin,
            stdout,
            mut drain,
        } = self;
        // Closing stdin alone ends a healthy worker's serving loop.
        drop(stdin);
        drop(stdout);
        let mut child = child.into_inner().unwrap_or_else(PoisonError::into_inner);

        let status = match child.try_wait() {
            Ok(Some(status)) => Some(status),
            _ => {
                request_termination(&mut child, pid);
                match tokio::time::timeout(grace, child.wait()).await {
                    Ok(Ok(status)) => Some(status),
                    _ => {
                        tracing::warn!(?pid, "Worker did not exit within grace period, killing");
                        if let Err(e) = child.kill().await {
                            tracing::debug!(error = %e, "Kill failed");
                        }
                        child.wait().await.ok()
                    }
                }
            }
        };

        drain.settle(DRAIN_SETTLE).await;
        drain.stop();
        status
    }
}

#[cfg(unix)]
fn request_termination(child: &mut Child, pid: Option<u32>) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Some(pid) = pid else {
        return;
    };
    match i32::try_from(pid) {
        Ok(raw) => {
            if let Err(e) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
                tracing::debug!(pid, error = %e, "SIGTERM failed");
            }
        }
        Err(_) => {
            let _ = child.start_kill();
        }
    }
}

#[cfg(not(unix))]
fn request_termination(child: &mut Child, _pid: Option<u32>) {
    let _ = child.start_kill();
}

/// Owner of one worker subprocess.
///
/// Safe to share between tasks (`Arc<WorkerSupervisor>`): every exchange holds the
/// exchange lock from write to read, so concurrent callers always get their own
/// response.
///
/// Worker processes are always spawned on the runtime that ran [`WorkerSupervisor::start`],
/// whichever runtime the caller triggering a restart happens to be on.
pub struct WorkerSupervisor {
    config: SupervisorConfig,
    /// Runtime owning the worker's pipes, child handle and stderr drain.
    runtime: Handle,
    /// Exchange lock. `None` once the worker is gone for good.
    worker: Mutex<Option<Worker>>,
    ring: StderrRing,
    state: StdMutex<LifecycleState>,
    restart_attempted: AtomicBool,
    closed: AtomicBool,
    pid: AtomicU32,
}

impl WorkerSupervisor {
    /// Spawn the worker and complete the handshake.
    pub async fn start(config: SupervisorConfig) -> Result<Self, SupervisorError> {
        let runtime = Handle::try_current().map_err(io::Error::other)?;
        let supervisor = Self {
            config,
            runtime,
            worker: Mutex::new(None),
            ring: StderrRing::default(),
            state: StdMutex::new(LifecycleState::Starting),
            restart_attempted: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            pid: AtomicU32::new(0),
        };

        match supervisor.launch().await {
            Ok(worker) => {
                *supervisor.worker.lock().await = Some(worker);
                supervisor.set_state(LifecycleState::Ready);
                Ok(supervisor)
            }
            Err(e) => {
                supervisor.set_state(LifecycleState::Dead);
                Err(e)
            }
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pid of the current worker process, if one is running.
    pub fn worker_pid(&self) -> Option<u32> {
        match self.pid.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }

    /// Most recent worker stderr lines, joined with `\n`.
    pub fn stderr_tail(&self) -> String {
        self.ring.tail()
    }

    pub fn restart_attempted(&self) -> bool {
        self.restart_attempted.load(Ordering::SeqCst)
    }

    /// Send one request and wait for its response.
    ///
    /// Application failures and size-limit rejections come back as a response with
    /// `error` set. Only process and protocol failures are returned as `Err`.
    ///
    /// A request body over [`MAX_BODY_BYTES`] is answered with a 413 here and never
    /// reaches the worker.
    pub async fn send(&self, request: &WireRequest) -> Result<WireResponse, SupervisorError> {
        tracing::debug!(
            method = %request.method,
            url = %request.url,
            headers = request.headers.len(),
            body_len = request.body_len(),
            "-> send"
        );
        if request.body_len() > MAX_BODY_BYTES {
            tracing::debug!(body_len = request.body_len(), "Request too large, not sent");
            return Ok(WireResponse::rejected(
                Some(request.id.clone()),
                STATUS_BODY_TOO_LARGE,
                KIND_BODY_TOO_LARGE,
                "request body too large",
            ));
        }
        let response = self
            .exchange(&WorkerInbound::Request(request.clone()), |reply| match reply {
                WorkerOutbound::Response(response) => Ok(response),
                other => Err(other),
            })
            .await?;
        let size = response.body_len();
        if size > MAX_BODY_BYTES {
            return Err(SupervisorError::ResponseTooLarge { size });
        }
        tracing::debug!(
            status = response.status,
            error = ?response.error,
            body_len = size,
            "<- recv"
        );
        Ok(response)
    }

    /// Ask the worker to run its reset hook.
    pub async fn reset(&self) -> Result<ResetStatus, SupervisorError> {
        tracing::debug!("Sending reset request");
        let status = self
            .exchange(&WorkerInbound::Control(ControlMessage::Reset), |reply| {
                match reply {
                    WorkerOutbound::Control(ControlReply::Reset { status }) => Ok(status),
                    other => Err(other),
                }
            })
            .await?;
        tracing::debug!(status = status.as_str(), "Reset result");
        Ok(status)
    }

    /// Terminate the worker: SIGTERM, grace period, SIGKILL. Idempotent.
    pub async fn close(&self) -> Result<(), SupervisorError> {
        self.closed.store(true, Ordering::SeqCst);
        let mut slot = self.worker.lock().await;
        if let Some(worker) = slot.take() {
            tracing::debug!(pid = ?worker.pid, "Closing worker");
            let status = worker.terminate(self.config.shutdown_grace).await;
            tracing::debug!(?status, "Worker closed");
        }
        self.pid.store(0, Ordering::SeqCst);
        self.set_state(LifecycleState::Dead);
        Ok(())
    }

    /// One write-then-read under the exchange lock, with the restart policy applied
    /// when the worker turns out to be dead.
    ///
    /// `accept` picks the expected reply out of the line. Anything else discards the
    /// worker that sent it, before the lock is released.
    async fn exchange<T>(
        &self,
        message: &WorkerInbound,
        accept: fn(WorkerOutbound) -> Result<T, WorkerOutbound>,
    ) -> Result<T, SupervisorError> {
        let mut slot = self.worker.lock().await;
        loop {
            let Some(worker) = slot.as_ref() else {
                return Err(self.unavailable());
            };
            match worker.round_trip(message).await {
                Ok(line) => {
                    let reply = match serde_json::from_str::<WorkerOutbound>(&line) {
                        Ok(reply) => reply,
                        Err(e) => {
                            let reason = format!("invalid response ({e}): {}", preview(&line));
                            return Err(self.discard(&mut slot, reason).await);
                        }
                    };
                    return match accept(reply) {
                        Ok(value) => Ok(value),
                        Err(other) => {
                            let reason = format!("unexpected reply: {other:?}");
                            Err(self.discard(&mut slot, reason).await)
                        }
                    };
                }
                Err(ExchangeFailure::Died(reason)) => {
                    // Either respawns (and the loop retries once) or returns fatal.
                    self.recover(&mut slot, reason).await?;
                }
                Err(ExchangeFailure::Corrupt(reason)) => {
                    return Err(self.discard(&mut slot, reason).await);
                }
                Err(ExchangeFailure::Io(e)) => {
                    let reason = format!("pipe error: {e}");
                    return Err(self.discard(&mut slot, reason).await);
                }
            }
        }
    }

    /// Restart policy: the first death respawns and re-handshakes, any later one is fatal.
    async fn recover(
        &self,
        slot: &mut Option<Worker>,
        reason: String,
    ) -> Result<(), SupervisorError> {
        if let Some(worker) = slot.take() {
            let status = worker.terminate(self.config.shutdown_grace).await;
            tracing::warn!(%reason, ?status, "Worker exited");
        }
        self.pid.store(0, Ordering::SeqCst);

        if self.restart_attempted.swap(true, Ordering::SeqCst) {
            self.set_state(LifecycleState::Dead);
            return Err(SupervisorError::ProcessDeath {
                reason,
                stderr: self.ring.tail(),
            });
        }

        self.set_state(LifecycleState::Restarting);
        match self.launch().await {
            Ok(worker) => {
                *slot = Some(worker);
                self.set_state(LifecycleState::Ready);
                tracing::info!("Worker restarted successfully");
                Ok(())
            }
            Err(e) => {
                self.set_state(LifecycleState::Dead);
                Err(e)
            }
        }
    }

    /// Spawn a worker and run the handshake. On failure the worker is torn down.
    async fn launch(&self) -> Result<Worker, SupervisorError> {
        let worker = {
            let _runtime = self.runtime.enter();
            Worker::spawn(&self.config, &self.ring)?
        };
        self.pid.store(worker.pid.unwrap_or(0), Ordering::SeqCst);
        self.set_state(LifecycleState::Handshaking);

        match worker.handshake(self.config.startup_timeout).await {
            Ok(()) => Ok(worker),
            Err(reason) => {
                tracing::debug!(%reason, "Handshake failed");
                worker.terminate(self.config.shutdown_grace).await;
                self.pid.store(0, Ordering::SeqCst);
                Err(SupervisorError::Handshake {
                    reason,
                    stderr: self.ring.tail(),
                })
            }
        }
    }

    /// Protocol corruption: the channel can no longer be trusted, so the worker goes.
    async fn discard(&self, slot: &mut Option<Worker>, reason: String) -> SupervisorError {
        tracing::error!(%reason, "Protocol error, stopping worker");
        if let Some(worker) = slot.take() {
            worker.terminate(self.config.shutdown_grace).await;
        }
        self.pid.store(0, Ordering::SeqCst);
        self.set_state(LifecycleState::Dead);
        SupervisorError::Protocol {
            reason,
            stderr: self.ring.tail(),
        }
    }

    fn unavailable(&self) -> SupervisorError {
        if self.closed.load(Ordering::SeqCst) {
            SupervisorError::Closed
        } else {
            SupervisorError::WorkerDead {
                stderr: self.ring.tail(),
            }
        }
    }

    fn set_state(&self, next: LifecycleState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != next {
            tracing::debug!(from = state.as_str(), to = next.as_str(), "Supervisor state");
            *state = next;
        }
    }
}

fn preview(line: &str) -> String {
    const MAX: usize = 200;
    if line.len() <= MAX {
        return format!("{line:?}");
    }
    let mut end = MAX;
    while !line.is_char_boundary(end) {
        end -= 1;
    }
    format!("{:?}... ({} bytes)", &line[..end], line.len())
}
