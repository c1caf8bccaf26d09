//! Worker runtime - the subprocess side of the protocol.
//!
//! The parent side (spawning, restarts, exchange locking) is in supervisor.rs.
//!
//! Lifecycle: `Importing → AdapterReady → HandshakeSent → ServingLoop`. Importing and
//! adapter construction happen in [`crate::entry`]; this module writes the handshake and
//! runs the loop:
//!
//! - read one line from stdin (EOF ends the worker cleanly)
//! - dispatch it: reset control message or HTTP-shaped request
//! - write exactly one line back, in the order requests were read
//!
//! Application failures never end the loop; they become synthetic 599 responses.
//! Malformed input does: the line is not reprocessed and the worker exits.

use std::io;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, stdin, stdout};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::app::{AdapterError, AppKind, AppRequest, HostedApp};
use crate::bridge::codec::JsonLinesCodec;
use crate::bridge::protocol::{
    ControlMessage, ControlReply, KIND_BODY_TOO_LARGE, KIND_RESPONSE_TOO_LARGE, MAX_BODY_BYTES,
    ResetStatus, STATUS_BODY_TOO_LARGE, STATUS_PROTOCOL_ERROR, WireRequest, WireResponse,
    WorkerInbound, WorkerOutbound,
};
use crate::diagnostics::{
    ActivityRegistry, DEFAULT_WATCHDOG_AFTER, Phase, Watchdog, dump_activities,
};
use crate::registry::{ImportError, ResetHook, Resolved};

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("failed to import application: {0}")]
    Import(#[from] ImportError),
    #[error("failed to build application adapter: {0}")]
    Adapter(#[from] AdapterError),
    #[error("protocol error: {0}")]
    Protocol(io::Error),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl WorkerError {
    fn from_read(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::InvalidData {
            Self::Protocol(e)
        } else {
            Self::Io(e)
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub app_kind: AppKind,
    pub watchdog_after: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            app_kind: AppKind::Auto,
            watchdog_after: DEFAULT_WATCHDOG_AFTER,
        }
    }
}

/// Routes one inbound message to the application or the reset hook.
pub struct Dispatcher {
    app: HostedApp,
    reset_hook: Option<ResetHook>,
    activities: ActivityRegistry,
    watchdog_after: Duration,
}

impl Dispatcher {
    pub fn new(app: HostedApp, reset_hook: Option<ResetHook>) -> Self {
        Self {
            app,
            reset_hook,
            activities: ActivityRegistry::new(),
            watchdog_after: DEFAULT_WATCHDOG_AFTER,
        }
    }

    pub fn with_watchdog_after(mut self, after: Duration) -> Self {
        self.watchdog_after = after;
        self
    }

    pub fn activities(&self) -> &ActivityRegistry {
        &self.activities
    }

    pub async fn dispatch(&self, message: WorkerInbound) -> WorkerOutbound {
        match message {
            WorkerInbound::Control(ControlMessage::Reset) => self.reset().into(),
            WorkerInbound::Request(request) => {
                let response = self.handle_request(request).await;
                tracing::debug!(
                    status = response.status,
                    error = ?response.error,
                    "Response ready"
                );
                response.into()
            }
        }
    }

    fn reset(&self) -> ControlReply {
        let status = match &self.reset_hook {
            Some(hook) => {
                tracing::debug!("Reset hook invoked");
                hook();
                tracing::debug!("Reset hook completed");
                ResetStatus::Ok
            }
            None => {
                tracing::debug!("Reset requested but no hook configured");
                ResetStatus::Noop
            }
        };
        ControlReply::Reset { status }
    }

    async fn handle_request(&self, request: WireRequest) -> WireResponse {
        let id = Some(request.id.clone());
        let start = Instant::now();
        let activity = self.activities.begin(
            format!("{} {}", request.method, request.url),
            Phase::Received,
        );

        let registry = self.activities.clone();
        let activity_id = activity.id();
        let _watchdog = Watchdog::arm(self.watchdog_after, move || {
            dump_activities(&registry, "watchdog: request still running", Some(activity_id));
        });

        let body_len = request.body_len();
        if body_len > MAX_BODY_BYTES {
            tracing::debug!(
                method = %request.method,
                url = %request.url,
                body_len,
                "Request rejected (body too large)"
            );
            return WireResponse::rejected(
                id,
                STATUS_BODY_TOO_LARGE,
                KIND_BODY_TOO_LARGE,
                "request body too large",
            );
        }
        tracing::debug!(
            method = %request.method,
            url = %request.url,
            headers = request.headers.len(),
            body_len,
            "Request received"
        );

        activity.set_phase(if self.app.is_offloaded() {
            Phase::OffloadedToPool
        } else {
            Phase::AwaitingApplication
        });
        let app_request = AppRequest {
            method: request.method,
            url: request.url,
            headers: request.headers,
            body: request.body.unwrap_or_default(),
        };
        let outcome = self.app.call(app_request).await;
        activity.set_phase(Phase::Encoding);

        match outcome {
            Ok(response) => {
                tracing::debug!(
                    status = response.status,
                    headers = response.headers.len(),
                    body_len = response.body.len(),
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Application returned"
                );
                if response.body.len() > MAX_BODY_BYTES {
                    tracing::debug!(body_len = response.body.len(), "Response too large");
                    return WireResponse::rejected(
                        id,
                        STATUS_PROTOCOL_ERROR,
                        KIND_RESPONSE_TOO_LARGE,
                        "response body too large",
                    );
                }
                WireResponse::success(id, response.status, response.headers, response.body)
            }
            Err(e) => {
                tracing::debug!(kind = e.kind(), message = e.message(), "Handler error");
                WireResponse::rejected(id, STATUS_PROTOCOL_ERROR, e.kind(), e.message())
            }
        }
    }
}

/// Write the handshake, then serve lines until EOF.
pub async fn serve<R, W>(reader: R, writer: W, dispatcher: &Dispatcher) -> Result<(), WorkerError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut requests = FramedRead::new(reader, JsonLinesCodec::<WorkerInbound>::new());
    let mut replies = FramedWrite::new(writer, JsonLinesCodec::<WorkerOutbound>::new());

    replies.send(ControlReply::handshake().into()).await?;
    tracing::debug!("Handshake sent");

    let serving = dispatcher
        .activities()
        .begin("serving loop", Phase::ReadingInput);
    loop {
        serving.set_phase(Phase::ReadingInput);
        let message = match requests.next().await {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                tracing::error!(error = %e, "Unreadable message from supervisor");
                return Err(WorkerError::from_read(e));
            }
            None => {
                tracing::debug!("Stdin closed, exiting");
                return Ok(());
            }
        };
        serving.set_phase(Phase::Dispatching);
        let reply = dispatcher.dispatch(message).await;
        replies.send(reply).await?;
    }
}

/// Run the worker on this process's stdin/stdout.
pub async fn run_worker(resolved: Resolved, config: WorkerConfig) -> Result<(), WorkerError> {
    let app = HostedApp::adapt(resolved.app, config.app_kind)?;
    tracing::debug!(
        app_kind = %config.app_kind,
        offloaded = app.is_offloaded(),
        "Application adapter ready"
    );

    let dispatcher =
        Dispatcher::new(app, resolved.reset_hook).with_watchdog_after(config.watchdog_after);

    #[cfg(unix)]
    let signal_dump = match crate::diagnostics::spawn_signal_dump(dispatcher.activities().clone())
    {
        Ok(task) => Some(task),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to install SIGUSR2 handler, stack dumps disabled");
            None
        }
    };

    let result = serve(stdin(), stdout(), &dispatcher).await;

    #[cfg(unix)]
    if let Some(task) = signal_dump {
        task.abort();
    }

    result
}
