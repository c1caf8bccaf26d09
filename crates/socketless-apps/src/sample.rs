//! Key/value item store served by an axum router.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use axum::{
    Router,
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::get,
};
use serde::Deserialize;
use serde_json::{Value, json};
use socketless::app::Application;
use socketless::registry::Module;

#[derive(Clone, Default)]
pub struct Items {
    inner: Arc<Mutex<BTreeMap<String, String>>>,
}

impl Items {
    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, String>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, id: impl Into<String>, value: impl Into<String>) {
        self.lock().insert(id.into(), value.into());
    }

    pub fn get(&self, id: &str) -> Option<String> {
        self.lock().get(id).cloned()
    }

    /// All items ordered by id.
    pub fn list(&self) -> Vec<(String, String)> {
        self.lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

#[derive(Debug, Deserialize)]
struct Item {
    value: String,
}

pub fn router(items: Items) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/items", get(list_items))
        .route("/items/{item_id}", get(read_item).post(create_item))
        .with_state(items)
}

pub fn module() -> Module {
    let items = Items::default();
    let for_reset = items.clone();
    Module::new()
        .app("app", Application::router(router(items)))
        .reset_hook("reset_state", move || for_reset.clear())
}

async fn ping() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn create_item(
    State(items): State<Items>,
    Path(item_id): Path<String>,
    Json(item): Json<Item>,
) -> Json<Value> {
    items.insert(item_id.clone(), item.value.clone());
    Json(json!({ "id": item_id, "value": item.value }))
}

async fn read_item(
    State(items): State<Items>,
    Path(item_id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match items.get(&item_id) {
        Some(value) => Ok(Json(json!({ "id": item_id, "value": value }))),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "detail": "not found" })),
        )),
    }
}

async fn list_items(State(items): State<Items>) -> Json<Value> {
    let listed: Vec<Value> = items
        .list()
        .into_iter()
        .map(|(id, value)| json!({ "id": id, "value": value }))
        .collect();
    Json(Value::Array(listed))
}
