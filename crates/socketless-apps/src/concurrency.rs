//! Job-queue style application whose handlers do their work on the blocking pool.
//!
//! Runs move `queued → running` when polled and `running → completed` on heartbeat;
//! any run can be cancelled.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use axum::{
    Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use serde::Serialize;
use serde_json::{Value, json};
use socketless::app::Application;
use socketless::registry::Module;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Queued,
    Running,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct Run {
    pub id: u64,
    pub status: RunStatus,
    pub heartbeats: u64,
}

#[derive(Default)]
struct RunTable {
    next_id: u64,
    runs: BTreeMap<u64, Run>,
}

#[derive(Clone, Default)]
pub struct Runs {
    inner: Arc<Mutex<RunTable>>,
}

impl Runs {
    fn lock(&self) -> MutexGuard<'_, RunTable> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn create(&self) -> Run {
        let mut table = self.lock();
        table.next_id += 1;
        let run = Run {
            id: table.next_id,
            status: RunStatus::Queued,
            heartbeats: 0,
        };
        table.runs.insert(run.id, run.clone());
        tracing::debug!(run_id = run.id, "Run created");
        run
    }

    /// Claim the oldest queued run.
    pub fn poll(&self) -> Option<u64> {
        let mut table = self.lock();
        let run = table
            .runs
            .values_mut()
            .find(|run| run.status == RunStatus::Queued)?;
        run.status = RunStatus::Running;
        tracing::debug!(run_id = run.id, "Run claimed");
        Some(run.id)
    }

    pub fn heartbeat(&self, id: u64) -> Option<Run> {
        let mut table = self.lock();
        let run = table.runs.get_mut(&id)?;
        run.heartbeats += 1;
        run.status = RunStatus::Completed;
        Some(run.clone())
    }

    pub fn get(&self, id: u64) -> Option<Run> {
        self.lock().runs.get(&id).cloned()
    }

    pub fn cancel(&self, id: u64) -> Option<Run> {
        let mut table = self.lock();
        let run = table.runs.get_mut(&id)?;
        run.status = RunStatus::Cancelled;
        Some(run.clone())
    }

    pub fn reset(&self) {
        *self.lock() = RunTable::default();
        tracing::debug!("Runs reset");
    }
}

enum ApiError {
    NotFound,
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::NotFound => (
                StatusCode::NOT_FOUND,
                Json(json!({ "detail": "run not found" })),
            )
                .into_response(),
            Self::Internal(detail) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "detail": detail })),
            )
                .into_response(),
        }
    }
}

/// Run `work` on the blocking pool.
async fn offload<T, F>(work: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce() -> Option<T> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .ok_or(ApiError::NotFound)
}

pub fn router(runs: Runs) -> Router {
    Router::new()
        .route("/runs", post(create_run))
        .route("/workers/poll", get(poll_job))
        .route("/runs/{run_id}", get(get_run))
        .route("/runs/{run_id}/heartbeat", post(heartbeat))
        .route("/runs/{run_id}/cancel", post(cancel_run))
        .with_state(runs)
}

pub fn module() -> Module {
    let runs = Runs::default();
    let for_reset = runs.clone();
    Module::new()
        .app("app", Application::router(router(runs)))
        .reset_hook("reset_state", move || for_reset.reset())
}

async fn create_run(State(runs): State<Runs>) -> Result<Json<Run>, ApiError> {
    offload(move || Some(runs.create())).await.map(Json)
}

async fn poll_job(State(runs): State<Runs>) -> Result<Json<Value>, ApiError> {
    let claimed = offload(move || Some(runs.poll())).await?;
    Ok(Json(match claimed {
        Some(id) => json!({ "job": { "id": id } }),
        None => json!({ "job": null }),
    }))
}

async fn heartbeat(
    State(runs): State<Runs>,
    Path(run_id): Path<u64>,
) -> Result<Json<Value>, ApiError> {
    offload(move || runs.heartbeat(run_id)).await?;
    Ok(Json(json!({ "status": "ok" })))
}

async fn get_run(State(runs): State<Runs>, Path(run_id): Path<u64>) -> Result<Json<Run>, ApiError> {
    offload(move || runs.get(run_id)).await.map(Json)
}

async fn cancel_run(
    State(runs): State<Runs>,
    Path(run_id): Path<u64>,
) -> Result<Json<Value>, ApiError> {
    offload(move || runs.cancel(run_id)).await?;
    Ok(Json(json!({ "status": "cancelled" })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_lifecycle() {
        let runs = Runs::default();
        let first = runs.create();
        let second = runs.create();
        assert_eq!((first.id, second.id), (1, 2));

        assert_eq!(runs.poll(), Some(1));
        assert_eq!(runs.poll(), Some(2));
        assert_eq!(runs.poll(), None);

        let done = runs.heartbeat(1).unwrap();
        assert_eq!(done.status, RunStatus::Completed);
        assert_eq!(done.heartbeats, 1);
        assert_eq!(runs.cancel(2).unwrap().status, RunStatus::Cancelled);
        assert!(runs.heartbeat(99).is_none());
    }

    #[test]
    fn reset_restarts_ids() {
        let runs = Runs::default();
        runs.create();
        runs.reset();
        assert!(runs.get(1).is_none());
        assert_eq!(runs.create().id, 1);
    }
}
