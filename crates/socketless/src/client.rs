//! HTTP-style client over a supervised worker.
//!
//! Callers get an [`IpcClient`] (or a whole [`Session`]) explicitly and pass it to
//! whatever needs to talk to the hosted application. Nothing global is patched.

use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::bridge::protocol::{
    HeaderList, MAX_BODY_BYTES, ResetStatus, WireError, WireRequest, WireResponse,
};
use crate::supervisor::{SupervisorConfig, SupervisorError, WorkerSupervisor};

pub const DEFAULT_BASE_URL: &str = "http://testserver";

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("request body of {size} bytes exceeds limit of {} bytes", MAX_BODY_BYTES)]
    BodyTooLarge { size: usize },
    #[error("worker returned error (status {status}): {error}")]
    Remote { status: u16, error: WireError },
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientResponse {
    pub status: u16,
    pub headers: HeaderList,
    pub body: Vec<u8>,
}

impl ClientResponse {
    /// First header with this name. Names on the wire are lowercase.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ClientError> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

impl TryFrom<WireResponse> for ClientResponse {
    type Error = ClientError;

    fn try_from(response: WireResponse) -> Result<Self, Self::Error> {
        if let Some(error) = response.error {
            return Err(ClientError::Remote {
                status: response.status,
                error,
            });
        }
        Ok(Self {
            status: response.status,
            headers: response.headers,
            body: response.body.unwrap_or_default(),
        })
    }
}

#[derive(Clone)]
pub struct IpcClient {
    supervisor: Arc<WorkerSupervisor>,
    base_url: String,
}

impl IpcClient {
    pub fn new(supervisor: Arc<WorkerSupervisor>) -> Self {
        Self {
            supervisor,
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn supervisor(&self) -> &Arc<WorkerSupervisor> {
        &self.supervisor
    }

    /// Absolute URL for `path`. Absolute inputs pass through unchanged.
    pub fn url(&self, path: &str) -> String {
        join_url(&self.base_url, path)
    }

    pub async fn request<I, K, V>(
        &self,
        method: &str,
        path: &str,
        headers: I,
        body: impl Into<Vec<u8>>,
    ) -> Result<ClientResponse, ClientError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let body = body.into();
        if body.len() > MAX_BODY_BYTES {
            return Err(ClientError::BodyTooLarge { size: body.len() });
        }
        let request = WireRequest::new(uuid::Uuid::new_v4().to_string(), method, self.url(path))
            .with_headers(headers)
            .with_body(body);
        let response = self.supervisor.send(&request).await?;
        ClientResponse::try_from(response)
    }

    pub async fn get(&self, path: &str) -> Result<ClientResponse, ClientError> {
        self.request("GET", path, no_headers(), Vec::new()).await
    }

    pub async fn post(
        &self,
        path: &str,
        body: impl Into<Vec<u8>>,
    ) -> Result<ClientResponse, ClientError> {
        self.request(
            "POST",
            path,
            [("content-type", "application/octet-stream")],
            body,
        )
        .await
    }

    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        value: &T,
    ) -> Result<ClientResponse, ClientError> {
        let body = serde_json::to_vec(value)?;
        self.request("POST", path, [("content-type", "application/json")], body)
            .await
    }

    pub async fn reset(&self) -> Result<ResetStatus, ClientError> {
        Ok(self.supervisor.reset().await?)
    }
}

fn join_url(base: &str, path: &str) -> String {
    if path.starts_with("http://") || path.starts_with("https://") {
        return path.to_string();
    }
    let base = base.trim_end_matches('/');
    if path.starts_with('/') {
        format!("{base}{path}")
    } else {
        format!("{base}/{path}")
    }
}

fn no_headers() -> [(&'static str, String); 0] {
    []
}

type LocalReset = Box<dyn Fn() + Send + Sync>;

/// A running worker plus the client bound to it, owned by the caller.
pub struct Session {
    client: IpcClient,
    local_reset: Option<LocalReset>,
}

impl Session {
    /// Start a worker and wait for its handshake.
    pub async fn open(config: SupervisorConfig) -> Result<Self, SupervisorError> {
        let supervisor = WorkerSupervisor::start(config).await?;
        Ok(Self {
            client: IpcClient::new(Arc::new(supervisor)),
            local_reset: None,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.client = self.client.with_base_url(base_url);
        self
    }

    /// Callback run in this process after every successful worker reset.
    pub fn with_local_reset<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.local_reset = Some(Box::new(hook));
        self
    }

    pub fn client(&self) -> &IpcClient {
        &self.client
    }

    pub fn supervisor(&self) -> &Arc<WorkerSupervisor> {
        self.client.supervisor()
    }

    /// Reset the worker's application state, then run the local callback.
    pub async fn reset(&self) -> Result<ResetStatus, ClientError> {
        let status = self.client.reset().await?;
        if let Some(hook) = &self.local_reset {
            hook();
        }
        Ok(status)
    }

    pub async fn close(self) -> Result<(), SupervisorError> {
        self.client.supervisor().close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_join_against_base() {
        assert_eq!(join_url(DEFAULT_BASE_URL, "/ping"), "http://testserver/ping");
        assert_eq!(join_url("http://api.local/", "items/a"), "http://api.local/items/a");
        assert_eq!(join_url(DEFAULT_BASE_URL, "https://other/x"), "https://other/x");
    }

    #[test]
    fn remote_error_becomes_client_error() {
        let wire = WireResponse::rejected(Some("1".into()), 599, "ValueError", "nope");
        let err = ClientResponse::try_from(wire).unwrap_err();
        match err {
            ClientError::Remote { status, error } => {
                assert_eq!(status, 599);
                assert_eq!(error.kind, "ValueError");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn success_maps_missing_body_to_empty() {
        let wire = WireResponse::success(
            None,
            204,
            vec![("X-Trace".to_string(), "t1".to_string())],
            Vec::new(),
        );
        let resp = ClientResponse::try_from(wire).unwrap();
        assert_eq!(resp.status, 204);
        assert!(resp.body.is_empty());
        assert_eq!(resp.header("x-trace"), Some("t1"));
        assert_eq!(resp.header("X-TRACE"), Some("t1"));
        assert!(resp.is_success());
    }

    #[test]
    fn json_body_decodes() {
        let resp = ClientResponse {
            status: 200,
            headers: Vec::new(),
            body: br#"{"id":"item1","value":"hello"}"#.to_vec(),
        };
        let value: serde_json::Value = resp.json().unwrap();
        assert_eq!(value["value"], "hello");
        assert!(resp.json::<Vec<u8>>().is_err());
    }
}
