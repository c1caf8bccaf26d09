//! Wire protocol types for supervisor-worker communication.
//!
//! One channel, the worker's stdin/stdout pair:
//! - **Inbound** (supervisor → worker): HTTP-shaped requests and the reset control message
//! - **Outbound** (worker → supervisor): the startup handshake, reset acknowledgements and
//!   one response per request
//!
//! Bodies are base64 encoded so arbitrary bytes survive line framing. Header names are
//! lowercased in both directions; original casing is not preserved.

use serde::{Deserialize, Serialize};

/// Largest body accepted in either direction, on either side of the pipe.
pub const MAX_BODY_BYTES: usize = 5 * 1024 * 1024;

/// Status used when the worker rejects an oversized request body.
pub const STATUS_BODY_TOO_LARGE: u16 = 413;

/// Status used for protocol-level failures (application error, oversized response).
pub const STATUS_PROTOCOL_ERROR: u16 = 599;

pub const KIND_BODY_TOO_LARGE: &str = "body_too_large";
pub const KIND_RESPONSE_TOO_LARGE: &str = "response_too_large";

/// Ordered header list as it travels on the wire: `[[name, value], ...]`.
pub type HeaderList = Vec<(String, String)>;

/// Lowercase every header name, keeping order and values.
pub fn lowercase_headers<I, K, V>(headers: I) -> HeaderList
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: Into<String>,
{
    headers
        .into_iter()
        .map(|(name, value)| (name.as_ref().to_ascii_lowercase(), value.into()))
        .collect()
}

/// HTTP-shaped request sent to the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireRequest {
    /// Correlation token. Echoed back but never used for matching.
    #[serde(default)]
    pub id: String,
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: HeaderList,
    #[serde(default, with = "base64_body")]
    pub body: Option<Vec<u8>>,
    /// Reserved.
    #[serde(default)]
    pub cookies: Vec<(String, String)>,
}

impl WireRequest {
    pub fn new(id: impl Into<String>, method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            method: method.into(),
            url: url.into(),
            headers: Vec::new(),
            body: None,
            cookies: Vec::new(),
        }
    }

    pub fn with_headers<I, K, V>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        self.headers = lowercase_headers(headers);
        self
    }

    /// Attach a body. Empty bodies are sent as `null`.
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        let body = body.into();
        self.body = if body.is_empty() { None } else { Some(body) };
        self
    }

    pub fn body_len(&self) -> usize {
        self.body.as_ref().map_or(0, Vec::len)
    }
}

/// Structured error attached to synthetic responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub kind: String,
    pub message: String,
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Worker reply to a [`WireRequest`].
///
/// `status` is always populated. When `error` is set the status is a sentinel
/// (413 or 599), not something the application produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireResponse {
    #[serde(default)]
    pub id: Option<String>,
    pub status: u16,
    #[serde(default)]
    pub headers: HeaderList,
    #[serde(default, with = "base64_body")]
    pub body: Option<Vec<u8>>,
    #[serde(default)]
    pub error: Option<WireError>,
}

impl WireResponse {
    pub fn success(id: Option<String>, status: u16, headers: HeaderList, body: Vec<u8>) -> Self {
        Self {
            id,
            status,
            headers: lowercase_headers(headers),
            body: if body.is_empty() { None } else { Some(body) },
            error: None,
        }
    }

    /// Synthetic response for a request that never produced an application result.
    pub fn rejected(
        id: Option<String>,
        status: u16,
        kind: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id,
            status,
            headers: Vec::new(),
            body: None,
            error: Some(WireError {
                kind: kind.into(),
                message: message.into(),
            }),
        }
    }

    pub fn body_len(&self) -> usize {
        self.body.as_ref().map_or(0, Vec::len)
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Control messages from supervisor to worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Run the configured reset hook, if any.
    Reset,
}

/// Control replies from worker to supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlReply {
    /// Emitted exactly once, after the application was resolved and wrapped.
    Handshake { status: HandshakeStatus },
    Reset { status: ResetStatus },
}

impl ControlReply {
    pub fn handshake() -> Self {
        Self::Handshake {
            status: HandshakeStatus::Ok,
        }
    }
}

/// There is no failure handshake: a worker that cannot start exits instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandshakeStatus {
    Ok,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetStatus {
    /// A reset hook ran.
    Ok,
    /// No reset hook is configured; nothing happened.
    Noop,
}

impl ResetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Noop => "noop",
        }
    }
}

/// Any line the worker reads.
///
/// Control messages carry a `type` tag; requests do not, so the control variant is
/// tried first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WorkerInbound {
    Control(ControlMessage),
    Request(WireRequest),
}

/// Any line the worker writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WorkerOutbound {
    Control(ControlReply),
    Response(WireResponse),
}

impl From<WireResponse> for WorkerOutbound {
    fn from(response: WireResponse) -> Self {
        Self::Response(response)
    }
}

impl From<ControlReply> for WorkerOutbound {
    fn from(reply: ControlReply) -> Self {
        Self::Control(reply)
    }
}

/// Serde adapter: `Option<Vec<u8>>` <-> `null | "<base64>"`.
mod base64_body {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match body {
            Some(bytes) => s.serialize_some(&STANDARD.encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(d)?;
        encoded
            .map(|text| STANDARD.decode(text.as_bytes()))
            .transpose()
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reset_request_serializes() {
        let msg = WorkerInbound::Control(ControlMessage::Reset);
        insta::assert_json_snapshot!(msg, @r#"
        {
          "type": "reset"
        }
        "#);
    }

    #[test]
    fn handshake_serializes() {
        let msg = WorkerOutbound::from(ControlReply::handshake());
        insta::assert_json_snapshot!(msg, @r#"
        {
          "type": "handshake",
          "status": "ok"
        }
        "#);
    }

    #[test]
    fn reset_noop_serializes() {
        let msg = WorkerOutbound::from(ControlReply::Reset {
            status: ResetStatus::Noop,
        });
        insta::assert_json_snapshot!(msg, @r#"
        {
          "type": "reset",
          "status": "noop"
        }
        "#);
    }

    #[test]
    fn request_wire_shape() {
        let req = WireRequest::new("req-1", "POST", "http://testserver/items/a")
            .with_headers([("Content-Type", "application/json")])
            .with_body(b"hi".to_vec());
        let value = serde_json::to_value(WorkerInbound::Request(req)).unwrap();
        assert_eq!(
            value,
            json!({
                "id": "req-1",
                "method": "POST",
                "url": "http://testserver/items/a",
                "headers": [["content-type", "application/json"]],
                "body": "aGk=",
                "cookies": []
            })
        );
    }

    #[test]
    fn empty_body_travels_as_null() {
        let req = WireRequest::new("x", "GET", "/ping").with_body(Vec::new());
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["body"], serde_json::Value::Null);
    }

    #[test]
    fn rejected_response_wire_shape() {
        let resp = WireResponse::rejected(
            Some("x".into()),
            STATUS_BODY_TOO_LARGE,
            KIND_BODY_TOO_LARGE,
            "request body too large",
        );
        let value = serde_json::to_value(WorkerOutbound::from(resp)).unwrap();
        assert_eq!(
            value,
            json!({
                "id": "x",
                "status": 413,
                "headers": [],
                "body": null,
                "error": {"kind": "body_too_large", "message": "request body too large"}
            })
        );
    }

    #[test]
    fn success_response_lowercases_headers() {
        let resp = WireResponse::success(
            None,
            200,
            vec![("X-Custom".into(), "Value".into())],
            b"ok".to_vec(),
        );
        assert_eq!(resp.headers, vec![("x-custom".to_string(), "Value".to_string())]);
        assert_eq!(resp.error, None);
    }

    #[test]
    fn binary_body_survives_encoding() {
        let body: Vec<u8> = (0..=255u8).chain([0, b'\n', b'\r', 0xff]).collect();
        let req = WireRequest::new("bin", "POST", "/echo").with_body(body.clone());
        let line = serde_json::to_string(&req).unwrap();
        assert!(!line.contains('\n'));
        let decoded: WireRequest = serde_json::from_str(&line).unwrap();
        assert_eq!(decoded.body, Some(body));
    }

    #[test]
    fn inbound_distinguishes_control_from_request() {
        let reset: WorkerInbound = serde_json::from_str(r#"{"type":"reset"}"#).unwrap();
        assert_eq!(reset, WorkerInbound::Control(ControlMessage::Reset));

        let req: WorkerInbound =
            serde_json::from_str(r#"{"id":"1","method":"GET","url":"/ping","headers":[]}"#)
                .unwrap();
        assert!(matches!(req, WorkerInbound::Request(r) if r.url == "/ping" && r.body.is_none()));
    }

    #[test]
    fn unknown_control_type_is_rejected() {
        assert!(serde_json::from_str::<WorkerInbound>(r#"{"type":"shutdown"}"#).is_err());
    }

    #[test]
    fn handshake_with_other_status_is_rejected() {
        let parsed = serde_json::from_str::<ControlReply>(r#"{"type":"handshake","status":"error"}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn invalid_base64_is_rejected() {
        let parsed = serde_json::from_str::<WireResponse>(r#"{"status":200,"body":"***"}"#);
        assert!(parsed.is_err());
    }
}
