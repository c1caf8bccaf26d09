//! socketless: drive an HTTP application hosted in a worker subprocess over stdio pipes.
//!
//! The supervisor side ([`WorkerSupervisor`], [`BlockingSupervisor`], [`IpcClient`])
//! spawns the worker and exchanges one JSON line per request. The worker side
//! ([`entry::worker_main`]) hosts an [`Application`] resolved from an [`AppRegistry`].

pub mod app;
pub mod blocking;
pub mod bridge;
pub mod client;
pub mod diagnostics;
pub mod entry;
pub mod registry;
pub mod stderr_drain;
pub mod supervisor;
pub mod worker;

pub use app::{
    AdapterError, AppError, AppKind, AppRequest, AppResponse, Application, AsyncApp, BlockingApp,
    HostedApp, RouterApp,
};
pub use blocking::BlockingSupervisor;
pub use bridge::protocol::{
    MAX_BODY_BYTES, ResetStatus, WireError, WireRequest, WireResponse,
};
pub use client::{ClientError, ClientResponse, IpcClient, Session};
pub use registry::{AppRegistry, ImportError, Locator, Module, ResetHook, Resolved};
pub use supervisor::{
    LifecycleState, SupervisorConfig, SupervisorError, WorkerSpawner, WorkerSupervisor,
};
pub use worker::{Dispatcher, WorkerConfig, WorkerError, serve};
