#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
//! Integration tests for `GateClient` against the scripted `MockTransport`.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde_json::json;
use waggle_gate_client::protocol::{AccessDecision, PLAYER_DATA_CMD};
use waggle_gate_client::{
    ConnectionState, EventStream, FeedbackState, GateClient, GateClientError, GateEvent, PlayerId,
    Transport,
};

use common::{
    connected_client, eventually, expect_event, gate_frame, heartbeat_frame, player_frame,
    player_frame_with, test_config, MockTransport,
};

fn queued_ids(client: &GateClient) -> Vec<PlayerId> {
    client
        .state()
        .queue()
        .iter()
        .map(|entry| entry.player_id)
        .collect()
}

// ── Session and stream ──────────────────────────────────────────────

#[tokio::test]
async fn session_is_acquired_and_stream_opened() {
    let (transport, recorder) = MockTransport::new();
    let (mut client, mut events) = GateClient::start(transport, test_config());

    assert_eq!(
        events.recv().await.unwrap(),
        GateEvent::ConnectionChanged(ConnectionState::Connecting)
    );
    assert_eq!(
        events.recv().await.unwrap(),
        GateEvent::SessionEstablished {
            session_id: "session-1".into()
        }
    );
    assert_eq!(events.recv().await.unwrap(), GateEvent::StreamOpened);
    assert_eq!(
        events.recv().await.unwrap(),
        GateEvent::ConnectionChanged(ConnectionState::Connected)
    );

    let state = client.state();
    assert_eq!(state.session_id(), "session-1");
    assert_eq!(state.connection(), ConnectionState::Connected);
    assert_eq!(recorder.session_calls(), 1);
    assert_eq!(recorder.opened(), vec!["session-1".to_string()]);

    client.shutdown().await;
}

#[tokio::test]
async fn retry_converges_after_failures() {
    let (transport, recorder) = MockTransport::new();
    recorder.script_sessions(vec![
        Err(GateClientError::TransportRequest("refused".into())),
        Err(GateClientError::HttpStatus { status: 503 }),
        Err(GateClientError::Timeout),
    ]);
    let (mut client, mut events) = GateClient::start(transport, test_config());

    let established = expect_event(&mut events, |e| {
        matches!(e, GateEvent::SessionEstablished { .. })
    })
    .await;
    assert_eq!(
        established,
        GateEvent::SessionEstablished {
            session_id: "session-4".into()
        }
    );
    expect_event(&mut events, |e| {
        *e == GateEvent::ConnectionChanged(ConnectionState::Connected)
    })
    .await;

    // The retry loop is over: no further session requests, one stream.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(recorder.session_calls(), 4);
    assert_eq!(recorder.opened(), vec!["session-4".to_string()]);
    assert_eq!(client.state().connection(), ConnectionState::Connected);

    client.shutdown().await;
}

#[tokio::test]
async fn lost_stream_acquires_new_session() {
    let (mut client, mut events, recorder) = connected_client(test_config()).await;

    recorder.end_stream();
    expect_event(&mut events, |e| {
        *e == GateEvent::ConnectionChanged(ConnectionState::Disconnected)
    })
    .await;
    expect_event(&mut events, |e| {
        *e == GateEvent::SessionEstablished {
            session_id: "session-2".into(),
        }
    })
    .await;
    expect_event(&mut events, |e| matches!(e, GateEvent::StreamOpened)).await;

    assert_eq!(
        recorder.opened(),
        vec!["session-1".to_string(), "session-2".to_string()]
    );
    eventually(|| recorder.closed() == 1).await;
    assert_eq!(client.state().session_id(), "session-2");

    client.shutdown().await;
}

#[tokio::test]
async fn stream_error_is_recovered() {
    let (mut client, mut events, recorder) = connected_client(test_config()).await;

    recorder.fail_stream("connection reset");
    expect_event(&mut events, |e| {
        *e == GateEvent::SessionEstablished {
            session_id: "session-2".into(),
        }
    })
    .await;
    eventually(|| client.state().connection() == ConnectionState::Connected).await;

    client.shutdown().await;
}

#[tokio::test]
async fn silent_stream_times_out_and_reconnects() {
    let config = test_config().with_liveness_timeout(Duration::from_millis(100));
    let (mut client, mut events, recorder) = connected_client(config).await;

    expect_event(&mut events, |e| {
        *e == GateEvent::ConnectionChanged(ConnectionState::Disconnected)
    })
    .await;
    expect_event(&mut events, |e| {
        *e == GateEvent::SessionEstablished {
            session_id: "session-2".into(),
        }
    })
    .await;
    // The replaced stream was closed.
    eventually(|| recorder.closed() >= 1).await;

    client.shutdown().await;
}

#[tokio::test]
async fn heartbeats_keep_the_connection_alive() {
    let config = test_config().with_liveness_timeout(Duration::from_millis(150));
    let (mut client, _events, recorder) = connected_client(config).await;

    for _ in 0..10 {
        recorder.push(heartbeat_frame());
        tokio::time::sleep(Duration::from_millis(40)).await;
    }

    assert_eq!(recorder.session_calls(), 1);
    assert_eq!(client.state().connection(), ConnectionState::Connected);

    client.shutdown().await;
}

/// Hands out sessions freely but never delivers a usable stream.
struct UnusableStreamTransport {
    sessions: Arc<AtomicUsize>,
    /// `true`: the stream opens and ends at once. `false`: it is refused.
    end_on_open: bool,
}

struct EndedStream;

#[async_trait]
impl EventStream for EndedStream {
    async fn recv(&mut self) -> Option<Result<String, GateClientError>> {
        None
    }

    async fn close(&mut self) -> Result<(), GateClientError> {
        Ok(())
    }
}

#[async_trait]
impl Transport for UnusableStreamTransport {
    async fn create_session(&self) -> Result<String, GateClientError> {
        let n = self.sessions.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("session-{n}"))
    }

    async fn open_stream(&self, _session_id: &str) -> Result<Box<dyn EventStream>, GateClientError> {
        if self.end_on_open {
            Ok(Box::new(EndedStream))
        } else {
            Err(GateClientError::HttpStatus { status: 401 })
        }
    }

    async fn send_access_decision(
        &self,
        _session_id: &str,
        _decision: &AccessDecision,
    ) -> Result<u16, GateClientError> {
        Ok(200)
    }
}

/// Run a client against an unusable stream for `run` and return how many
/// sessions it requested.
async fn session_requests_with_unusable_stream(end_on_open: bool, run: Duration) -> usize {
    let sessions = Arc::new(AtomicUsize::new(0));
    let transport = UnusableStreamTransport {
        sessions: Arc::clone(&sessions),
        end_on_open,
    };
    let config = test_config().with_retry_interval(Duration::from_millis(200));
    let (mut client, _events) = GateClient::start(transport, config);
    tokio::time::sleep(run).await;
    client.shutdown().await;
    sessions.load(Ordering::SeqCst)
}

#[tokio::test]
async fn refused_stream_paces_session_requests() {
    // 700ms at one request per 200ms: four at most, one spare for jitter.
    let requests = session_requests_with_unusable_stream(false, Duration::from_millis(700)).await;
    assert!((2..=5).contains(&requests), "{requests} session requests");
}

#[tokio::test]
async fn stream_ending_on_open_paces_session_requests() {
    let requests = session_requests_with_unusable_stream(true, Duration::from_millis(700)).await;
    assert!((2..=5).contains(&requests), "{requests} session requests");
}

// ── Queue reconciliation ────────────────────────────────────────────

#[tokio::test]
async fn gate_resolution_removes_player_once() {
    let (mut client, mut events, recorder) = connected_client(test_config()).await;

    recorder.push(player_frame(7, "A1", "Gate"));
    let waiting = expect_event(&mut events, |e| {
        matches!(e, GateEvent::PlayerWaiting { .. })
    })
    .await;
    assert_eq!(
        waiting,
        GateEvent::PlayerWaiting {
            player_id: 7,
            display_name: "Ann Smith".into()
        }
    );
    assert_eq!(queued_ids(&client), vec![7]);

    recorder.push(gate_frame(&[("A1", "AccessGranted")]));
    eventually(|| client.state().queue().is_empty()).await;

    // Same event again: nothing left to remove, nothing breaks.
    recorder.push(gate_frame(&[("A1", "AccessGranted")]));
    recorder.push(player_frame(8, "A2", "Gate"));
    eventually(|| queued_ids(&client) == vec![8]).await;

    client.shutdown().await;
}

#[tokio::test]
async fn query_and_empty_player_events_are_ignored() {
    let (mut client, mut events, recorder) = connected_client(test_config()).await;

    recorder.push(player_frame(1, "A1", "Query"));
    recorder.push(
        json!({
            "cmd": PLAYER_DATA_CMD,
            "payload": {"hasData": false, "type": "Gate", "position": "A1", "playerId": 2}
        })
        .to_string(),
    );
    recorder.push(player_frame(3, "A2", "Gate"));

    let waiting = expect_event(&mut events, |e| {
        matches!(e, GateEvent::PlayerWaiting { .. })
    })
    .await;
    assert!(matches!(waiting, GateEvent::PlayerWaiting { player_id: 3, .. }));
    assert_eq!(queued_ids(&client), vec![3]);

    client.shutdown().await;
}

#[tokio::test]
async fn duplicate_player_is_dropped() {
    let (mut client, mut events, recorder) = connected_client(test_config()).await;

    recorder.push(player_frame(5, "A1", "Gate"));
    recorder.push(player_frame_with(5, "B2", "Gate", false, "Other", "Name"));
    recorder.push(player_frame(6, "A2", "Gate"));

    eventually(|| queued_ids(&client) == vec![5, 6]).await;
    let first = client.state().head().unwrap();
    assert_eq!(first.position, "A1");
    assert_eq!(first.first_name, "Ann");

    // Exactly two notifications, for 5 and 6.
    let mut notified = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let GateEvent::PlayerWaiting { player_id, .. } = event {
            notified.push(player_id);
        }
    }
    assert_eq!(notified, vec![5, 6]);

    client.shutdown().await;
}

#[tokio::test]
async fn all_gates_ready_clears_queue() {
    let (mut client, _events, recorder) = connected_client(test_config()).await;

    recorder.push(player_frame(1, "A1", "Gate"));
    recorder.push(player_frame(2, "A2", "Gate"));
    recorder.push(player_frame(3, "C9", "Gate"));
    eventually(|| client.state().queue().len() == 3).await;

    // C9 is not in the batch, but the batch is all-ready.
    recorder.push(gate_frame(&[("A1", "ReadyForUse"), ("A2", "ReadyForUse")]));
    eventually(|| client.state().queue().is_empty()).await;

    client.shutdown().await;
}

#[tokio::test]
async fn non_resolving_states_keep_player_queued() {
    let (mut client, _events, recorder) = connected_client(test_config()).await;

    recorder.push(player_frame(1, "A1", "Gate"));
    eventually(|| queued_ids(&client) == vec![1]).await;

    recorder.push(gate_frame(&[
        ("A1", "WaitingForApprovement"),
        ("A2", "ReadyForUse"),
    ]));
    recorder.push(gate_frame(&[("A1", "GettingData")]));
    recorder.push(player_frame(2, "A3", "Gate"));
    eventually(|| queued_ids(&client) == vec![1, 2]).await;

    recorder.push(gate_frame(&[("A1", "AccessDenied")]));
    eventually(|| queued_ids(&client) == vec![2]).await;

    client.shutdown().await;
}

#[tokio::test]
async fn malformed_and_unrecognized_frames_are_dropped() {
    let (mut client, _events, recorder) = connected_client(test_config()).await;

    recorder.push(r#"{"cmd":"drMemberCPPlayerData","payload":{"#);
    recorder.push(r#"{"cmd":"currentTime","payload":"12:00:00"}"#);
    recorder.push(r#"{"cmd":"AreYouThere"}"#);
    recorder.push(player_frame(4, "A1", "Gate"));

    eventually(|| queued_ids(&client) == vec![4]).await;
    assert_eq!(client.state().connection(), ConnectionState::Connected);

    client.shutdown().await;
}

#[tokio::test]
async fn second_photo_is_selected() {
    let (mut client, _events, recorder) = connected_client(test_config()).await;

    recorder.push(
        json!({
            "cmd": PLAYER_DATA_CMD,
            "payload": {
                "hasData": true,
                "type": "Gate",
                "position": "A1",
                "playerId": 9,
                "passphotos": [
                    {"data": STANDARD.encode(b"thumbnail")},
                    {"data": STANDARD.encode(b"portrait")}
                ]
            }
        })
        .to_string(),
    );

    eventually(|| !client.state().queue().is_empty()).await;
    let head = client.state().head().unwrap();
    assert_eq!(head.photo.unwrap().as_bytes(), b"portrait");

    client.shutdown().await;
}

#[tokio::test]
async fn blacklisted_arrival_shows_negative_feedback() {
    let (mut client, _events, recorder) = connected_client(test_config()).await;

    recorder.push(player_frame_with(11, "A1", "Gate", true, "Eve", "Black"));
    eventually(|| client.state().feedback().state == FeedbackState::Negative).await;
    assert!(client.state().feedback().message.is_none());

    // Reverts after the deny dwell.
    eventually(|| client.state().feedback().state == FeedbackState::Neutral).await;
    assert_eq!(queued_ids(&client), vec![11]);

    client.shutdown().await;
}

// ── Decisions ───────────────────────────────────────────────────────

#[tokio::test]
async fn accept_head_sends_decision_and_removes_player() {
    let (mut client, mut events, recorder) = connected_client(test_config()).await;

    recorder.push(player_frame(7, "A1", "Gate"));
    recorder.push(player_frame(8, "A2", "Gate"));
    eventually(|| client.state().queue().len() == 2).await;

    client.accept_head().unwrap();
    let completed = expect_event(&mut events, |e| {
        matches!(e, GateEvent::DecisionCompleted { .. })
    })
    .await;
    assert_eq!(
        completed,
        GateEvent::DecisionCompleted {
            player_id: 7,
            position: "A1".into(),
            granted: true
        }
    );

    assert_eq!(
        recorder.decisions(),
        vec![("session-1".to_string(), AccessDecision::new("A1", true))]
    );
    assert_eq!(queued_ids(&client), vec![8]);

    let feedback = client.state().feedback();
    assert_eq!(feedback.state, FeedbackState::Positive);
    assert_eq!(feedback.message.as_deref(), Some("Accepted Ann Smith"));
    let last = feedback.last_handled.unwrap();
    assert_eq!(last.full_name, "Ann Smith");
    assert!(last.accepted);

    eventually(|| client.state().feedback().state == FeedbackState::Neutral).await;
    assert!(client.state().feedback().last_handled.is_none());

    client.shutdown().await;
}

#[tokio::test]
async fn deny_head_sends_denial() {
    let (mut client, mut events, recorder) = connected_client(test_config()).await;

    recorder.push(player_frame(7, "A1", "Gate"));
    eventually(|| client.state().queue().len() == 1).await;

    client.deny_head().unwrap();
    expect_event(&mut events, |e| {
        matches!(e, GateEvent::DecisionCompleted { granted: false, .. })
    })
    .await;
    assert_eq!(recorder.decisions()[0].1, AccessDecision::new("A1", false));
    assert!(client.state().queue().is_empty());

    let feedback = client.state().feedback();
    assert_eq!(feedback.state, FeedbackState::Negative);
    assert_eq!(feedback.message.as_deref(), Some("Denied Ann Smith"));

    client.shutdown().await;
}

#[tokio::test]
async fn failed_decision_keeps_queue_and_reports() {
    let (mut client, mut events, recorder) = connected_client(test_config()).await;
    recorder.script_decisions(vec![Ok(500)]);

    recorder.push(player_frame(7, "A1", "Gate"));
    eventually(|| client.state().queue().len() == 1).await;

    client.deny_head().unwrap();
    let failed = expect_event(&mut events, |e| {
        matches!(e, GateEvent::DecisionFailed { .. })
    })
    .await;
    assert!(matches!(
        failed,
        GateEvent::DecisionFailed {
            player_id: 7,
            granted: false,
            status: Some(500),
            ..
        }
    ));
    assert_eq!(queued_ids(&client), vec![7]);

    let feedback = client.state().feedback();
    assert_eq!(feedback.state, FeedbackState::Negative);
    assert_eq!(feedback.message.as_deref(), Some("Failed to deny: HTTP 500"));

    // Not retried automatically.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(recorder.decisions().len(), 1);

    client.shutdown().await;
}

#[tokio::test]
async fn transport_error_on_decision_is_reported() {
    let (mut client, mut events, recorder) = connected_client(test_config()).await;
    recorder.script_decisions(vec![Err(GateClientError::Timeout)]);

    recorder.push(player_frame(7, "A1", "Gate"));
    eventually(|| client.state().queue().len() == 1).await;

    client.accept_head().unwrap();
    let failed = expect_event(&mut events, |e| {
        matches!(e, GateEvent::DecisionFailed { .. })
    })
    .await;
    assert!(matches!(
        failed,
        GateEvent::DecisionFailed { status: None, .. }
    ));
    assert_eq!(
        client.state().feedback().message.as_deref(),
        Some("Error sending acceptance")
    );
    assert_eq!(queued_ids(&client), vec![7]);

    client.shutdown().await;
}

#[tokio::test]
async fn accept_on_empty_queue_is_a_no_op() {
    let (mut client, _events, recorder) = connected_client(test_config()).await;

    client.accept_head().unwrap();
    client.deny_head().unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(recorder.decisions().is_empty());
    assert_eq!(client.state().feedback().state, FeedbackState::Neutral);

    client.shutdown().await;
}

#[tokio::test]
async fn guarded_accept_ignores_stale_head() {
    let (mut client, mut events, recorder) = connected_client(test_config()).await;

    recorder.push(player_frame(7, "A1", "Gate"));
    recorder.push(player_frame(8, "A2", "Gate"));
    eventually(|| client.state().queue().len() == 2).await;

    // The operator saw 7, but a gate event removes it first.
    recorder.push(gate_frame(&[("A1", "AccessGranted")]));
    eventually(|| queued_ids(&client) == vec![8]).await;

    client.accept(7).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(recorder.decisions().is_empty());

    client.accept(8).unwrap();
    expect_event(&mut events, |e| {
        matches!(e, GateEvent::DecisionCompleted { player_id: 8, .. })
    })
    .await;
    assert_eq!(recorder.decisions()[0].1, AccessDecision::new("A2", true));

    client.shutdown().await;
}

#[tokio::test]
async fn decision_racing_gate_removal_is_idempotent() {
    let (mut client, mut events, recorder) = connected_client(test_config()).await;
    recorder.set_decision_delay(Duration::from_millis(100));

    recorder.push(player_frame(7, "A1", "Gate"));
    recorder.push(player_frame(8, "A2", "Gate"));
    eventually(|| client.state().queue().len() == 2).await;

    client.accept_head().unwrap();
    eventually(|| recorder.decisions().len() == 1).await;

    // The gate resolves while the decision is in flight.
    recorder.push(gate_frame(&[("A1", "AccessGranted")]));
    eventually(|| queued_ids(&client) == vec![8]).await;

    expect_event(&mut events, |e| {
        matches!(e, GateEvent::DecisionCompleted { player_id: 7, .. })
    })
    .await;
    assert_eq!(queued_ids(&client), vec![8]);

    client.shutdown().await;
}

#[tokio::test]
async fn second_decision_while_in_flight_is_ignored() {
    let (mut client, mut events, recorder) = connected_client(test_config()).await;
    recorder.set_decision_delay(Duration::from_millis(100));

    recorder.push(player_frame(7, "A1", "Gate"));
    eventually(|| client.state().queue().len() == 1).await;

    client.accept_head().unwrap();
    client.accept_head().unwrap();
    client.deny_head().unwrap();
    expect_event(&mut events, |e| {
        matches!(e, GateEvent::DecisionCompleted { .. })
    })
    .await;

    assert_eq!(recorder.decisions().len(), 1);
    assert!(client.state().queue().is_empty());

    client.shutdown().await;
}

// ── Shutdown ────────────────────────────────────────────────────────

#[tokio::test]
async fn shutdown_closes_stream_and_emits_stopped() {
    let (mut client, mut events, recorder) = connected_client(test_config()).await;

    client.shutdown().await;
    assert_eq!(recorder.closed(), 1);
    assert_eq!(client.state().connection(), ConnectionState::Disconnected);
    assert!(matches!(
        client.accept_head(),
        Err(GateClientError::NotRunning)
    ));

    let mut last = None;
    while let Some(event) = events.recv().await {
        last = Some(event);
    }
    assert_eq!(last, Some(GateEvent::Stopped));
}

#[tokio::test]
async fn state_view_outlives_client() {
    let (mut client, _events, recorder) = connected_client(test_config()).await;
    recorder.push(player_frame(7, "A1", "Gate"));
    eventually(|| client.state().queue().len() == 1).await;

    let view = client.state();
    client.shutdown().await;
    drop(client);

    assert_eq!(view.session_id(), "session-1");
    assert_eq!(view.queue().len(), 1);
    assert_eq!(view.connection(), ConnectionState::Disconnected);
}
