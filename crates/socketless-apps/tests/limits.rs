mod common;

use serde_json::Value;
use socketless::{ClientError, LifecycleState, MAX_BODY_BYTES, Session, WireRequest};

async fn echo_calls(session: &Session) -> u64 {
    let calls: Value = session.client().get("/calls").await.unwrap().json().unwrap();
    calls["calls"].as_u64().unwrap()
}

#[tokio::test]
async fn oversized_request_is_rejected_before_the_application() {
    let session = common::session("faulty").await;

    let body = vec![b'a'; 6 * 1024 * 1024];
    let request = WireRequest::new("big", "POST", "http://testserver/echo").with_body(body);
    let resp = session.supervisor().send(&request).await.unwrap();

    assert_eq!(resp.status, 413);
    assert_eq!(resp.error.as_ref().unwrap().kind, "body_too_large");
    assert_eq!(resp.id.as_deref(), Some("big"));
    assert_eq!(echo_calls(&session).await, 0);

    session.close().await.unwrap();
}

#[tokio::test]
async fn body_beyond_the_line_limit_does_not_kill_the_worker() {
    let session = common::session("faulty").await;
    let pid = session.supervisor().worker_pid();

    let body = vec![b'a'; 30 * 1024 * 1024];
    let request = WireRequest::new("huge", "POST", "http://testserver/echo").with_body(body);
    let resp = session.supervisor().send(&request).await.unwrap();

    assert_eq!(resp.status, 413);
    assert_eq!(resp.error.as_ref().unwrap().kind, "body_too_large");
    assert_eq!(session.supervisor().worker_pid(), pid);
    assert!(!session.supervisor().restart_attempted());
    assert_eq!(session.supervisor().state(), LifecycleState::Ready);
    assert_eq!(echo_calls(&session).await, 0);

    session.close().await.unwrap();
}

#[tokio::test]
async fn client_rejects_oversized_body_locally() {
    let session = common::session("faulty").await;

    let err = session
        .client()
        .post("/echo", vec![0u8; MAX_BODY_BYTES + 1])
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::BodyTooLarge { size } if size == MAX_BODY_BYTES + 1));
    assert_eq!(echo_calls(&session).await, 0);

    session.close().await.unwrap();
}

#[tokio::test]
async fn body_at_the_limit_round_trips() {
    let session = common::session("faulty").await;

    let body: Vec<u8> = (0..MAX_BODY_BYTES).map(|i| (i % 253) as u8).collect();
    let resp = session.client().post("/echo", body.clone()).await.unwrap();
    assert_eq!(resp.status, 200);
    assert_eq!(resp.header("x-echo-len"), Some(MAX_BODY_BYTES.to_string().as_str()));
    assert!(resp.body == body);
    assert_eq!(echo_calls(&session).await, 1);

    session.close().await.unwrap();
}

#[tokio::test]
async fn binary_bodies_are_lossless() {
    let session = common::session("faulty").await;

    let every_byte: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
    let resp = session.client().post("/echo", every_byte.clone()).await.unwrap();
    assert_eq!(resp.body, every_byte);

    let newlines = b"line one\nline two\r\n\n".to_vec();
    let resp = session.client().post("/echo", newlines.clone()).await.unwrap();
    assert_eq!(resp.body, newlines);

    let resp = session.client().post("/echo", Vec::new()).await.unwrap();
    assert!(resp.body.is_empty());

    session.close().await.unwrap();
}

#[tokio::test]
async fn oversized_response_is_a_synthetic_599() {
    let session = common::session("faulty").await;

    let err = session.client().get("/large").await.unwrap_err();
    match err {
        ClientError::Remote { status, error } => {
            assert_eq!(status, 599);
            assert_eq!(error.kind, "response_too_large");
        }
        other => panic!("unexpected error: {other}"),
    }

    // The worker survives and keeps serving.
    assert_eq!(session.client().get("/calls").await.unwrap().status, 200);
    session.close().await.unwrap();
}

#[tokio::test]
async fn panicking_handler_does_not_kill_worker() {
    let session = common::session("faulty").await;
    let pid = session.supervisor().worker_pid();

    let err = session.client().get("/panic").await.unwrap_err();
    match err {
        ClientError::Remote { status, error } => {
            assert_eq!(status, 599);
            assert_eq!(error.kind, "panic");
            assert!(error.message.contains("requested panic"));
        }
        other => panic!("unexpected error: {other}"),
    }

    assert_eq!(session.client().get("/calls").await.unwrap().status, 200);
    assert_eq!(session.supervisor().worker_pid(), pid);
    assert!(!session.supervisor().restart_attempted());

    session.close().await.unwrap();
}

#[tokio::test]
async fn slow_request_survives_the_watchdog() {
    let session = common::session("faulty").await;

    let resp = session.client().get("/slow?ms=2500").await.unwrap();
    let body: Value = resp.json().unwrap();
    assert_eq!(body["slept_ms"], 2500);

    // The dump names the stalled request first and is diagnostic only.
    let tail =
        common::stderr_containing(session.supervisor(), "watchdog: request still running").await;
    assert!(tail.contains("watchdog: request still running"), "{tail}");
    assert!(tail.contains("/slow?ms=2500 phase=awaiting_application"), "{tail}");
    assert!(tail.contains("<- stalled"), "{tail}");
    assert!(tail.contains("serving loop"), "{tail}");

    session.close().await.unwrap();
}
