#![allow(dead_code)]

use std::time::Duration;

use socketless::{Session, SupervisorConfig, WorkerSupervisor};

pub const WORKER: &str = env!("CARGO_BIN_EXE_socketless-worker");

pub fn config(app: &str) -> SupervisorConfig {
    SupervisorConfig::new(app)
        .with_worker_program(WORKER)
        .with_startup_timeout(Duration::from_secs(30))
        .with_shutdown_grace(Duration::from_secs(2))
}

pub fn config_with_hook(module: &str) -> SupervisorConfig {
    config(&format!("{module}:app")).with_reset_hook(format!("{module}:reset_state"))
}

pub async fn session(module: &str) -> Session {
    Session::open(config_with_hook(module))
        .await
        .expect("worker should start")
}

/// Wait until the worker's stderr tail contains `needle`, returning the tail.
pub async fn stderr_containing(supervisor: &WorkerSupervisor, needle: &str) -> String {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let tail = supervisor.stderr_tail();
        if tail.contains(needle) || tokio::time::Instant::now() >= deadline {
            return tail;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
