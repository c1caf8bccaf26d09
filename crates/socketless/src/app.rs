//! Application adapter interface.
//!
//! The worker hosts exactly one application. It is either awaitable ([`AsyncApp`],
//! e.g. an axum `Router`) or directly blocking ([`BlockingApp`]). Blocking calls are
//! always offloaded to the runtime's bounded blocking pool so the serving loop stays
//! responsive (watchdog, signals) while the application works.

use std::convert::Infallible;
use std::sync::Arc;

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use http_body_util::BodyExt;
use tokio::task::JoinError;
use tower::ServiceExt;

use crate::bridge::protocol::HeaderList;

/// Request tuple handed to the application.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppRequest {
    pub method: String,
    pub url: String,
    pub headers: HeaderList,
    pub body: Vec<u8>,
}

impl AppRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Path component of `url`, which may be absolute (`http://host/path?q`) or
    /// origin-form (`/path?q`).
    pub fn path(&self) -> &str {
        let rest = match self.url.find("://") {
            Some(scheme_end) => {
                let after = &self.url[scheme_end + 3..];
                after.find('/').map_or("/", |i| &after[i..])
            }
            None => self.url.as_str(),
        };
        rest.split(['?', '#']).next().unwrap_or("/")
    }
}

/// Response tuple produced by the application.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppResponse {
    pub status: u16,
    pub headers: HeaderList,
    pub body: Vec<u8>,
}

impl AppResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            ..Self::default()
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn json(status: u16, value: &serde_json::Value) -> Self {
        Self::new(status)
            .with_header("content-type", "application/json")
            .with_body(value.to_string())
    }
}

/// Failure raised while invoking the application.
///
/// `kind` is the category reported on the wire; `message` is free text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct AppError {
    kind: String,
    message: String,
}

impl AppError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    fn from_join(e: JoinError) -> Self {
        if e.is_panic() {
            let payload = e.into_panic();
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "application panicked".to_string());
            Self::new("panic", message)
        } else {
            Self::new("cancelled", "application call was cancelled")
        }
    }
}

/// Awaitable application.
#[async_trait]
pub trait AsyncApp: Send + Sync + 'static {
    async fn call(&self, request: AppRequest) -> Result<AppResponse, AppError>;
}

/// Directly blocking application. Runs on the blocking pool, never on the serving loop.
pub trait BlockingApp: Send + Sync + 'static {
    fn call(&self, request: AppRequest) -> Result<AppResponse, AppError>;
}

impl<F> BlockingApp for F
where
    F: Fn(AppRequest) -> Result<AppResponse, AppError> + Send + Sync + 'static,
{
    fn call(&self, request: AppRequest) -> Result<AppResponse, AppError> {
        self(request)
    }
}

/// Hosts an axum `Router` in-process: requests go straight into the router's
/// service without a listener.
#[derive(Clone)]
pub struct RouterApp {
    router: Router,
}

impl RouterApp {
    pub fn new(router: Router) -> Self {
        Self { router }
    }
}

#[async_trait]
impl AsyncApp for RouterApp {
    async fn call(&self, request: AppRequest) -> Result<AppResponse, AppError> {
        let mut builder = axum::http::Request::builder()
            .method(request.method.as_str())
            .uri(request.url.as_str());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let http_request = builder
            .body(Body::from(request.body))
            .map_err(|e| AppError::new("invalid_request", e.to_string()))?;

        let response = self
            .router
            .clone()
            .oneshot(http_request)
            .await
            .unwrap_or_else(|e: Infallible| match e {});

        let (parts, body) = response.into_parts();
        let bytes = body
            .collect()
            .await
            .map_err(|e| AppError::new("response_body", e.to_string()))?
            .to_bytes();

        let headers = parts
            .headers
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();

        Ok(AppResponse {
            status: parts.status.as_u16(),
            headers,
            body: bytes.to_vec(),
        })
    }
}

/// An application as registered, tagged with the hosting style it declares.
#[derive(Clone)]
pub enum Application {
    Async(Arc<dyn AsyncApp>),
    Blocking(Arc<dyn BlockingApp>),
}

impl Application {
    pub fn router(router: Router) -> Self {
        Self::Async(Arc::new(RouterApp::new(router)))
    }

    pub fn from_async(app: impl AsyncApp) -> Self {
        Self::Async(Arc::new(app))
    }

    /// Blocking application from a plain function or closure.
    pub fn blocking<F>(handler: F) -> Self
    where
        F: Fn(AppRequest) -> Result<AppResponse, AppError> + Send + Sync + 'static,
    {
        Self::Blocking(Arc::new(handler))
    }

    pub fn from_blocking(app: impl BlockingApp) -> Self {
        Self::Blocking(Arc::new(app))
    }

    pub fn declared_kind(&self) -> AppKind {
        match self {
            Self::Async(_) => AppKind::Async,
            Self::Blocking(_) => AppKind::Blocking,
        }
    }
}

impl std::fmt::Debug for Application {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Async(_) => f.write_str("Application::Async"),
            Self::Blocking(_) => f.write_str("Application::Blocking"),
        }
    }
}

/// Hosting style requested on the worker command line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AppKind {
    /// Use whatever the application declares.
    #[default]
    Auto,
    Async,
    Blocking,
}

impl AppKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Async => "async",
            Self::Blocking => "blocking",
        }
    }
}

impl std::fmt::Display for AppKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AppKind {
    type Err = AdapterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(Self::Auto),
            "async" | "asgi" => Ok(Self::Async),
            "blocking" | "wsgi" => Ok(Self::Blocking),
            other => Err(AdapterError::UnknownKind(other.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("unknown app kind '{0}', expected auto, async or blocking")]
    UnknownKind(String),
    #[error("application is blocking and cannot be hosted as async")]
    BlockingAsAsync,
}

/// Application wrapped for the worker's dispatch loop.
#[derive(Clone)]
pub enum HostedApp {
    /// Awaited on the serving loop's runtime.
    Async(Arc<dyn AsyncApp>),
    /// Called on the blocking pool.
    Blocking(Arc<dyn BlockingApp>),
    /// Async application forced onto the blocking pool; each call is driven with
    /// `Handle::block_on` from a pool thread.
    AsyncOnPool(Arc<dyn AsyncApp>),
}

impl HostedApp {
    pub fn adapt(app: Application, kind: AppKind) -> Result<Self, AdapterError> {
        match (app, kind) {
            (Application::Async(app), AppKind::Auto | AppKind::Async) => Ok(Self::Async(app)),
            (Application::Async(app), AppKind::Blocking) => Ok(Self::AsyncOnPool(app)),
            (Application::Blocking(app), AppKind::Auto | AppKind::Blocking) => {
                Ok(Self::Blocking(app))
            }
            (Application::Blocking(_), AppKind::Async) => Err(AdapterError::BlockingAsAsync),
        }
    }

    /// Whether calls run on the blocking pool.
    pub fn is_offloaded(&self) -> bool {
        !matches!(self, Self::Async(_))
    }

    /// Invoke the application. Panics are caught and reported as [`AppError`].
    pub async fn call(&self, request: AppRequest) -> Result<AppResponse, AppError> {
        let joined = match self {
            Self::Async(app) => {
                let app = Arc::clone(app);
                tokio::spawn(async move { app.call(request).await }).await
            }
            Self::Blocking(app) => {
                let app = Arc::clone(app);
                tokio::task::spawn_blocking(move || app.call(request)).await
            }
            Self::AsyncOnPool(app) => {
                let app = Arc::clone(app);
                let handle = tokio::runtime::Handle::current();
                tokio::task::spawn_blocking(move || handle.block_on(app.call(request))).await
            }
        };
        match joined {
            Ok(result) => result,
            Err(e) => Err(AppError::from_join(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::{get, post};

    fn echo_router() -> Router {
        Router::new()
            .route("/ping", get(|| async { axum::Json(serde_json::json!({"status": "ok"})) }))
            .route("/echo", post(|body: axum::body::Bytes| async move { body }))
            .route("/boom", get(boom))
    }

    async fn boom() -> &'static str {
        panic!("boom")
    }

    fn request(method: &str, url: &str, body: &[u8]) -> AppRequest {
        AppRequest {
            method: method.to_string(),
            url: url.to_string(),
            headers: Vec::new(),
            body: body.to_vec(),
        }
    }

    #[test]
    fn app_kind_parses_aliases() {
        assert_eq!("auto".parse::<AppKind>().unwrap(), AppKind::Auto);
        assert_eq!("asgi".parse::<AppKind>().unwrap(), AppKind::Async);
        assert_eq!("wsgi".parse::<AppKind>().unwrap(), AppKind::Blocking);
        assert!("fastcgi".parse::<AppKind>().is_err());
    }

    #[test]
    fn request_path_handles_absolute_and_relative_urls() {
        assert_eq!(request("GET", "http://testserver/items/a?x=1", b"").path(), "/items/a");
        assert_eq!(request("GET", "http://testserver", b"").path(), "/");
        assert_eq!(request("GET", "/ping#frag", b"").path(), "/ping");
    }

    #[test]
    fn blocking_app_cannot_be_forced_async() {
        let app = Application::blocking(|_req: AppRequest| Ok(AppResponse::new(204)));
        assert!(matches!(
            HostedApp::adapt(app, AppKind::Async),
            Err(AdapterError::BlockingAsAsync)
        ));
    }

    #[test]
    fn auto_follows_declared_kind() {
        let app = Application::router(echo_router());
        assert_eq!(app.declared_kind(), AppKind::Async);
        let hosted = HostedApp::adapt(app, AppKind::Auto).unwrap();
        assert!(!hosted.is_offloaded());
    }

    #[tokio::test]
    async fn router_app_serves_in_process() {
        let app = RouterApp::new(echo_router());
        let resp = app.call(request("GET", "http://testserver/ping", b"")).await.unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, br#"{"status":"ok"}"#);
        assert!(resp.headers.iter().any(|(k, v)| k == "content-type" && v == "application/json"));
    }

    #[tokio::test]
    async fn router_app_returns_404_for_unknown_route() {
        let app = RouterApp::new(echo_router());
        let resp = app.call(request("GET", "/nope", b"")).await.unwrap();
        assert_eq!(resp.status, 404);
    }

    #[tokio::test]
    async fn hosted_panic_becomes_app_error() {
        let hosted = HostedApp::adapt(Application::router(echo_router()), AppKind::Auto).unwrap();
        let err = hosted.call(request("GET", "/boom", b"")).await.unwrap_err();
        assert_eq!(err.kind(), "panic");
        assert_eq!(err.message(), "boom");
    }

    #[tokio::test]
    async fn blocking_app_runs_on_pool() {
        let app = Application::blocking(|req: AppRequest| {
            Ok(AppResponse::new(200).with_body(req.body))
        });
        let hosted = HostedApp::adapt(app, AppKind::Auto).unwrap();
        assert!(hosted.is_offloaded());
        let resp = hosted.call(request("POST", "/echo", b"abc")).await.unwrap();
        assert_eq!(resp.body, b"abc");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn async_app_forced_onto_pool() {
        let hosted =
            HostedApp::adapt(Application::router(echo_router()), AppKind::Blocking).unwrap();
        assert!(hosted.is_offloaded());
        let resp = hosted.call(request("POST", "/echo", b"pooled")).await.unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, b"pooled");
    }
}
