//! Integration tests for the server lifecycle.

use std::sync::Arc;
use std::time::{Duration, Instant};

use ai_action_streamer::Error;
use ai_action_streamer::client::ActionClient;
use ai_action_streamer::handler::{ActionHandler, ObservationHandler};
use ai_action_streamer::model::{Action, TaskObservation, new_action_id};
use ai_action_streamer::server::{ServerConfig, ServerState, Supervisor};
use ai_action_streamer::sink::TracingSink;

fn local_config() -> ServerConfig {
    ServerConfig::new("127.0.0.1:0".parse().unwrap())
}

fn test_supervisor() -> Supervisor<ActionHandler> {
    Supervisor::new(local_config(), ActionHandler::new(Arc::new(TracingSink)))
}

fn addr_of<H: ObservationHandler>(supervisor: &Supervisor<H>) -> String {
    format!("127.0.0.1:{}", supervisor.port().expect("server should be bound"))
}

/// Acknowledges after a fixed delay.
struct SlowHandler {
    delay: Duration,
}

impl ObservationHandler for SlowHandler {
    async fn handle(&self, observation: TaskObservation) -> Action {
        tokio::time::sleep(self.delay).await;
        Action {
            observation_event_id: observation.event_id,
            action_id: new_action_id(),
            action_details: "slow".to_string(),
            success: true,
            message: "done slowly".to_string(),
        }
    }
}

fn slow_supervisor(delay: Duration) -> Supervisor<SlowHandler> {
    Supervisor::new(local_config(), SlowHandler { delay })
}

// ---------------------------------------------------------------------------
// Start
// ---------------------------------------------------------------------------

#[tokio::test]
async fn start_is_ready_for_traffic_immediately() {
    let supervisor = test_supervisor();
    assert_eq!(supervisor.state(), ServerState::Unstarted);
    assert_eq!(supervisor.port(), None);

    let state = supervisor.start().await.unwrap();
    assert_eq!(state, ServerState::Running);
    assert_eq!(supervisor.state(), ServerState::Running);

    let mut client = ActionClient::connect(&addr_of(&supervisor)).await.unwrap();
    let action = client
        .send_task_observation(TaskObservation::new("ready-1", "task_start"))
        .await
        .unwrap();
    assert_eq!(action.observation_event_id, "ready-1");
    assert!(action.success);

    supervisor.stop(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn second_start_is_a_noop() {
    let supervisor = test_supervisor();
    supervisor.start().await.unwrap();
    let port = supervisor.port();

    assert_eq!(supervisor.start().await.unwrap(), ServerState::Running);
    assert_eq!(supervisor.port(), port);

    supervisor.stop(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn concurrent_starts_bind_once() {
    let supervisor = test_supervisor();
    let (a, b) = tokio::join!(supervisor.start(), supervisor.start());

    assert_eq!(a.unwrap(), ServerState::Running);
    assert_eq!(b.unwrap(), ServerState::Running);

    supervisor.stop(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn bind_failure_leaves_supervisor_unstarted() {
    let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = occupied.local_addr().unwrap();

    let supervisor = Supervisor::new(
        ServerConfig::new(addr),
        ActionHandler::new(Arc::new(TracingSink)),
    );
    let err = supervisor.start().await.unwrap_err();

    assert!(matches!(err, Error::Bind { .. }), "got {err:?}");
    assert_eq!(supervisor.state(), ServerState::Unstarted);
    assert_eq!(supervisor.port(), None);
}

#[tokio::test]
async fn stopped_supervisor_cannot_restart() {
    let supervisor = test_supervisor();
    supervisor.start().await.unwrap();
    supervisor.stop(Duration::from_secs(1)).await.unwrap();

    let err = supervisor.start().await.unwrap_err();
    assert!(matches!(
        err,
        Error::InvalidTransition {
            from: ServerState::Stopped,
            to: ServerState::Starting
        }
    ));
}

// ---------------------------------------------------------------------------
// Stop
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stop_twice_is_idempotent() {
    let supervisor = test_supervisor();
    supervisor.start().await.unwrap();

    supervisor.stop(Duration::from_secs(1)).await.unwrap();
    supervisor.stop(Duration::from_secs(1)).await.unwrap();

    assert_eq!(supervisor.state(), ServerState::Stopped);
}

#[tokio::test]
async fn stop_before_start_terminates() {
    let supervisor = test_supervisor();
    supervisor.stop(Duration::from_secs(1)).await.unwrap();

    assert_eq!(supervisor.state(), ServerState::Stopped);
    assert!(supervisor.start().await.is_err());
}

#[tokio::test]
async fn stop_releases_the_socket() {
    let supervisor = test_supervisor();
    supervisor.start().await.unwrap();
    let addr = supervisor.local_addr().unwrap();

    supervisor.stop(Duration::from_secs(1)).await.unwrap();

    assert!(ActionClient::connect(&addr.to_string()).await.is_err());
    let rebound = std::net::TcpListener::bind(addr);
    assert!(rebound.is_ok(), "port should be free after stop");
}

#[tokio::test]
async fn dropping_every_clone_releases_the_socket() {
    let supervisor = test_supervisor();
    let clone = supervisor.clone();
    supervisor.start().await.unwrap();
    let addr = supervisor.local_addr().unwrap();

    let mut client = ActionClient::connect(&addr.to_string()).await.unwrap();
    client
        .send_task_observation(TaskObservation::new("orphan-1", "heartbeat"))
        .await
        .unwrap();

    drop(supervisor);
    drop(clone);

    let mut rebound = None;
    for _ in 0..50 {
        if let Ok(listener) = std::net::TcpListener::bind(addr) {
            rebound = Some(listener);
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(rebound.is_some(), "port should be free once every clone is dropped");

    let reply = client
        .send_task_observation(TaskObservation::new("orphan-2", "heartbeat"))
        .await;
    assert!(reply.is_err(), "idle connection should be closed");
}

#[tokio::test]
async fn idle_connections_do_not_delay_stop() {
    let supervisor = test_supervisor();
    supervisor.start().await.unwrap();

    let mut client = ActionClient::connect(&addr_of(&supervisor)).await.unwrap();
    client
        .send_task_observation(TaskObservation::new("idle-1", "heartbeat"))
        .await
        .unwrap();

    let started = Instant::now();
    supervisor.stop(Duration::from_secs(5)).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));

    let after = client
        .send_task_observation(TaskObservation::new("idle-2", "heartbeat"))
        .await;
    assert!(after.is_err());
}

// ---------------------------------------------------------------------------
// Grace window
// ---------------------------------------------------------------------------

#[tokio::test]
async fn in_flight_call_completes_within_grace() {
    let supervisor = slow_supervisor(Duration::from_millis(300));
    supervisor.start().await.unwrap();
    let addr = addr_of(&supervisor);

    let call = tokio::spawn(async move {
        let mut client = ActionClient::connect(&addr).await?;
        client
            .send_task_observation(TaskObservation::new("inflight-1", "task_complete"))
            .await
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = Instant::now();
    supervisor.stop(Duration::from_secs(1)).await.unwrap();
    let elapsed = started.elapsed();

    let action = call.await.unwrap().unwrap();
    assert_eq!(action.observation_event_id, "inflight-1");
    assert!(elapsed < Duration::from_secs(1), "stop took {elapsed:?}");
    assert_eq!(supervisor.state(), ServerState::Stopped);
}

#[tokio::test]
async fn call_exceeding_grace_is_cut_off() {
    let supervisor = slow_supervisor(Duration::from_secs(10));
    supervisor.start().await.unwrap();
    let addr = addr_of(&supervisor);

    let call = tokio::spawn(async move {
        let mut client = ActionClient::connect(&addr).await?;
        client
            .send_task_observation(TaskObservation::new("too-slow", "task_complete"))
            .await
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = Instant::now();
    supervisor.stop(Duration::from_millis(200)).await.unwrap();
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_millis(200));
    assert!(elapsed < Duration::from_secs(1), "stop took {elapsed:?}");
    assert!(call.await.unwrap().is_err());
}

#[tokio::test]
async fn calls_are_handled_in_parallel() {
    let supervisor = slow_supervisor(Duration::from_millis(300));
    supervisor.start().await.unwrap();
    let addr = addr_of(&supervisor);

    let started = Instant::now();
    let calls: Vec<_> = (0..5)
        .map(|i| {
            let addr = addr.clone();
            tokio::spawn(async move {
                let mut client = ActionClient::connect(&addr).await?;
                client
                    .send_task_observation(TaskObservation::new(format!("par-{i}"), "task_start"))
                    .await
            })
        })
        .collect();
    for (i, call) in calls.into_iter().enumerate() {
        let action = call.await.unwrap().unwrap();
        assert_eq!(action.observation_event_id, format!("par-{i}"));
    }
    assert!(started.elapsed() < Duration::from_millis(1200));

    supervisor.stop(Duration::from_secs(1)).await.unwrap();
}

// ---------------------------------------------------------------------------
// Termination
// ---------------------------------------------------------------------------

#[tokio::test]
async fn await_termination_unblocks_on_stop() {
    let supervisor = test_supervisor();
    supervisor.start().await.unwrap();

    let waiter = {
        let supervisor = supervisor.clone();
        tokio::spawn(async move { supervisor.await_termination().await })
    };

    supervisor.stop(Duration::from_secs(1)).await.unwrap();
    tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("await_termination should resolve after stop")
        .unwrap();
}

#[tokio::test]
async fn await_termination_returns_at_once_when_stopped() {
    let supervisor = test_supervisor();
    supervisor.stop(Duration::ZERO).await.unwrap();

    tokio::time::timeout(Duration::from_millis(100), supervisor.await_termination())
        .await
        .expect("already stopped");
}

#[tokio::test]
async fn shutdown_signal_triggers_bounded_stop() {
    let supervisor = slow_supervisor(Duration::from_secs(10));
    supervisor.start().await.unwrap();
    let addr = addr_of(&supervisor);

    let (signal, signalled) = tokio::sync::oneshot::channel::<()>();
    let host = {
        let supervisor = supervisor.clone();
        tokio::spawn(async move {
            supervisor
                .run_until(
                    async move {
                        let _ = signalled.await;
                    },
                    Duration::from_millis(200),
                )
                .await
        })
    };

    let _call = tokio::spawn(async move {
        let mut client = ActionClient::connect(&addr).await?;
        client
            .send_task_observation(TaskObservation::new("stuck", "task_start"))
            .await
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = Instant::now();
    signal.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(2), host)
        .await
        .expect("host must not block past the grace window")
        .unwrap()
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(supervisor.state(), ServerState::Stopped);
}

#[tokio::test]
async fn subscribers_observe_terminal_state() {
    let supervisor = test_supervisor();
    let mut states = supervisor.subscribe();
    supervisor.start().await.unwrap();
    supervisor.stop(Duration::from_secs(1)).await.unwrap();

    let state = *states
        .wait_for(|s| *s == ServerState::Stopped)
        .await
        .unwrap();
    assert_eq!(state, ServerState::Stopped);
}
