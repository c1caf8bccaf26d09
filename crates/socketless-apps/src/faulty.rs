//! Misbehaving endpoints for exercising limits, isolation and crash recovery.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::{
    Router,
    body::Bytes,
    extract::{Query, State},
    http::header::CONTENT_TYPE,
    response::{IntoResponse, Json},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};
use socketless::app::Application;
use socketless::registry::Module;

/// Size of the `/large` body: one MiB over the protocol limit.
pub const LARGE_BODY_BYTES: usize = 6 * 1024 * 1024;

/// Exit code used by `/exit`.
pub const EXIT_CODE: i32 = 3;

#[derive(Clone, Default)]
pub struct Calls {
    echo: Arc<AtomicU64>,
}

impl Calls {
    pub fn echo_calls(&self) -> u64 {
        self.echo.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.echo.store(0, Ordering::SeqCst);
    }
}

#[derive(Debug, Deserialize)]
struct SlowParams {
    #[serde(default)]
    ms: u64,
}

pub fn router(calls: Calls) -> Router {
    Router::new()
        .route("/echo", post(echo))
        .route("/calls", get(calls_count))
        .route("/large", get(large))
        .route("/panic", get(explode))
        .route("/slow", get(slow))
        .route("/exit", post(exit))
        .with_state(calls)
}

pub fn module() -> Module {
    let calls = Calls::default();
    let for_reset = calls.clone();
    Module::new()
        .app("app", Application::router(router(calls)))
        .reset_hook("reset_state", move || for_reset.reset())
}

async fn echo(State(calls): State<Calls>, body: Bytes) -> impl IntoResponse {
    calls.echo.fetch_add(1, Ordering::SeqCst);
    (
        [
            (CONTENT_TYPE, "application/octet-stream".to_string()),
            (
                axum::http::HeaderName::from_static("x-echo-len"),
                body.len().to_string(),
            ),
        ],
        body,
    )
}

async fn calls_count(State(calls): State<Calls>) -> Json<Value> {
    Json(json!({ "calls": calls.echo_calls() }))
}

async fn large() -> Vec<u8> {
    vec![b'x'; LARGE_BODY_BYTES]
}

async fn explode() -> &'static str {
    panic!("requested panic")
}

async fn slow(Query(params): Query<SlowParams>) -> Json<Value> {
    tokio::time::sleep(Duration::from_millis(params.ms)).await;
    Json(json!({ "slept_ms": params.ms }))
}

async fn exit() -> &'static str {
    tracing::warn!(code = EXIT_CODE, "Exiting on request");
    std::process::exit(EXIT_CODE)
}
