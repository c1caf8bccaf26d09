//! The item store as a directly blocking application, routed by hand.

use serde_json::{Value, json};
use socketless::app::{AppError, AppRequest, AppResponse, Application, BlockingApp};
use socketless::registry::Module;

use crate::sample::Items;

pub struct ItemsApp {
    items: Items,
}

impl ItemsApp {
    pub fn new(items: Items) -> Self {
        Self { items }
    }

    fn create(&self, id: &str, body: &[u8]) -> AppResponse {
        let value = serde_json::from_slice::<Value>(body)
            .ok()
            .and_then(|v| v.get("value").and_then(Value::as_str).map(str::to_string));
        match value {
            Some(value) => {
                self.items.insert(id, value.clone());
                AppResponse::json(200, &json!({ "id": id, "value": value }))
            }
            None => AppResponse::json(400, &json!({ "detail": "missing value" })),
        }
    }

    fn read(&self, id: &str) -> AppResponse {
        match self.items.get(id) {
            Some(value) => AppResponse::json(200, &json!({ "id": id, "value": value })),
            None => AppResponse::json(404, &json!({ "detail": "not found" })),
        }
    }

    fn list(&self) -> AppResponse {
        let listed: Vec<Value> = self
            .items
            .list()
            .into_iter()
            .map(|(id, value)| json!({ "id": id, "value": value }))
            .collect();
        AppResponse::json(200, &Value::Array(listed))
    }
}

impl BlockingApp for ItemsApp {
    fn call(&self, request: AppRequest) -> Result<AppResponse, AppError> {
        let path = request.path().trim_end_matches('/');
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let response = match (request.method.as_str(), segments.as_slice()) {
            ("GET", ["ping"]) => AppResponse::json(200, &json!({ "status": "ok" })),
            ("GET", ["items"]) => self.list(),
            ("GET", ["items", id]) => self.read(id),
            ("POST", ["items", id]) => self.create(id, &request.body),
            (_, ["ping"] | ["items"] | ["items", _]) => {
                AppResponse::json(405, &json!({ "detail": "method not allowed" }))
            }
            _ => AppResponse::json(404, &json!({ "detail": "not found" })),
        };
        Ok(response)
    }
}

pub fn module() -> Module {
    let items = Items::default();
    let for_reset = items.clone();
    Module::new()
        .app("app", Application::from_blocking(ItemsApp::new(items)))
        .reset_hook("reset_state", move || for_reset.clear())
}
