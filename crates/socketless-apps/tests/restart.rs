#![cfg(unix)]

mod common;

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use socketless::{
    BlockingSupervisor, ClientError, LifecycleState, Session, SupervisorError, WireRequest,
};

fn kill_worker(session: &Session) -> u32 {
    let pid = session.supervisor().worker_pid().expect("worker is running");
    kill(Pid::from_raw(pid as i32), Signal::SIGKILL).unwrap();
    pid
}

#[tokio::test]
async fn restarts_once_then_fails() {
    let session = common::session("sample").await;
    let client = session.client();
    assert_eq!(client.get("/ping").await.unwrap().status, 200);

    let first_pid = kill_worker(&session);
    let resp = client.get("/ping").await.unwrap();
    assert_eq!(resp.status, 200);
    assert!(session.supervisor().restart_attempted());
    assert_eq!(session.supervisor().state(), LifecycleState::Ready);
    let second_pid = session.supervisor().worker_pid().unwrap();
    assert_ne!(first_pid, second_pid);

    kill_worker(&session);
    let err = client.get("/ping").await.unwrap_err();
    assert!(
        matches!(err, ClientError::Supervisor(SupervisorError::ProcessDeath { .. })),
        "{err}"
    );
    assert_eq!(session.supervisor().state(), LifecycleState::Dead);
    assert_eq!(session.supervisor().worker_pid(), None);

    // No further restart is attempted.
    let err = client.get("/ping").await.unwrap_err();
    assert!(matches!(
        err,
        ClientError::Supervisor(SupervisorError::WorkerDead { .. })
    ));
}

#[tokio::test]
async fn state_does_not_survive_a_restart() {
    let session = common::session("sample").await;
    let client = session.client();
    client
        .post_json("/items/a", &serde_json::json!({"value": "1"}))
        .await
        .unwrap();

    kill_worker(&session);
    assert_eq!(client.get("/items/a").await.unwrap().status, 404);

    session.close().await.unwrap();
}

#[tokio::test]
async fn deterministic_crash_is_not_retried_forever() {
    let session = common::session("faulty").await;

    // The retried request kills the respawned worker too.
    let err = session.client().post("/exit", Vec::new()).await.unwrap_err();
    assert!(
        matches!(err, ClientError::Supervisor(SupervisorError::ProcessDeath { .. })),
        "{err}"
    );
    assert_eq!(session.supervisor().state(), LifecycleState::Dead);
}

#[tokio::test]
async fn reset_recovers_from_a_dead_worker() {
    let session = common::session("sample").await;
    kill_worker(&session);

    assert_eq!(
        session.reset().await.unwrap(),
        socketless::ResetStatus::Ok
    );
    assert_eq!(session.supervisor().state(), LifecycleState::Ready);

    session.close().await.unwrap();
}

#[test]
fn restart_from_another_runtime_outlives_that_runtime() {
    let supervisor = BlockingSupervisor::start(common::config("sample:app")).unwrap();
    let first_pid = supervisor.worker_pid().unwrap();
    kill(Pid::from_raw(first_pid as i32), Signal::SIGKILL).unwrap();

    // The restart is triggered by a caller on its own short-lived runtime.
    let caller = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let shared = supervisor.shared();
    let resp = caller
        .block_on(shared.send(&WireRequest::new("a", "GET", "/ping")))
        .unwrap();
    assert_eq!(resp.status, 200);
    drop(caller);

    assert_ne!(supervisor.worker_pid(), Some(first_pid));
    for i in 0..3 {
        let resp = supervisor
            .send(&WireRequest::new(format!("b{i}"), "GET", "/ping"))
            .unwrap();
        assert_eq!(resp.status, 200);
    }
    assert_eq!(supervisor.state(), LifecycleState::Ready);
    supervisor.close().unwrap();
}

#[tokio::test]
async fn sigusr2_dumps_worker_activity() {
    let session = common::session("sample").await;
    let pid = session.supervisor().worker_pid().unwrap();

    kill(Pid::from_raw(pid as i32), Signal::SIGUSR2).unwrap();
    let tail = common::stderr_containing(session.supervisor(), "SIGUSR2 received").await;
    assert!(tail.contains("SIGUSR2 received"), "{tail}");
    assert!(tail.contains("signal listener (SIGUSR2)"), "{tail}");

    // The worker keeps serving afterwards.
    assert_eq!(session.client().get("/ping").await.unwrap().status, 200);
    assert_eq!(session.supervisor().worker_pid(), Some(pid));
    session.close().await.unwrap();
}
