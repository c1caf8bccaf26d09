//! Synchronous facade over [`WorkerSupervisor`].
//!
//! Owns a small multi-thread runtime that drives the worker's pipes and stderr drain.
//! Any number of OS threads may call in concurrently; they queue on the same exchange
//! lock as async callers holding [`BlockingSupervisor::shared`].

use std::future::Future;
use std::sync::Arc;

use tokio::runtime::{Builder, Handle, Runtime};

use crate::bridge::protocol::{ResetStatus, WireRequest, WireResponse};
use crate::supervisor::{LifecycleState, SupervisorConfig, SupervisorError, WorkerSupervisor};

/// Synchronous handle on one worker.
///
/// Create and use it outside any async context. It may be dropped inside one: the
/// close is skipped, the runtime is shut down in the background, and the worker is
/// killed when its last owner goes away.
pub struct BlockingSupervisor {
    inner: Arc<WorkerSupervisor>,
    /// `None` only while dropping.
    runtime: Option<Runtime>,
    handle: Handle,
}

impl BlockingSupervisor {
    /// Spawn the worker and complete the handshake.
    ///
    /// Must not be called from inside an async context.
    pub fn start(config: SupervisorConfig) -> Result<Self, SupervisorError> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("socketless-supervisor")
            .enable_all()
            .build()?;
        let inner = runtime.block_on(WorkerSupervisor::start(config))?;
        Ok(Self {
            inner: Arc::new(inner),
            handle: runtime.handle().clone(),
            runtime: Some(runtime),
        })
    }

    pub fn send(&self, request: &WireRequest) -> Result<WireResponse, SupervisorError> {
        self.block_on(self.inner.send(request))
    }

    pub fn reset(&self) -> Result<ResetStatus, SupervisorError> {
        self.block_on(self.inner.reset())
    }

    pub fn close(&self) -> Result<(), SupervisorError> {
        self.block_on(self.inner.close())
    }

    fn block_on<T>(
        &self,
        operation: impl Future<Output = Result<T, SupervisorError>>,
    ) -> Result<T, SupervisorError> {
        match &self.runtime {
            Some(runtime) => runtime.block_on(operation),
            None => Err(SupervisorError::Closed),
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.inner.state()
    }

    pub fn worker_pid(&self) -> Option<u32> {
        self.inner.worker_pid()
    }

    pub fn stderr_tail(&self) -> String {
        self.inner.stderr_tail()
    }

    /// The async supervisor behind this facade.
    pub fn shared(&self) -> Arc<WorkerSupervisor> {
        Arc::clone(&self.inner)
    }

    /// Runtime driving the worker's pipes, for callers mixing async and blocking use.
    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }
}

impl Drop for BlockingSupervisor {
    fn drop(&mut self) {
        let Some(runtime) = self.runtime.take() else {
            return;
        };
        if Handle::try_current().is_ok() {
            // Blocking is not allowed here; kill_on_drop reaps the worker instead.
            tracing::debug!("Dropped inside an async context, skipping graceful close");
            runtime.shutdown_background();
            return;
        }
        if std::thread::panicking() || self.inner.state() == LifecycleState::Dead {
            return;
        }
        if let Err(e) = runtime.block_on(self.inner.close()) {
            tracing::debug!(error = %e, "Failed to close worker on drop");
        }
    }
}
