#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing,
    dead_code
)]
//! Shared test utilities for gate client integration tests.
//!
//! Provides a scripted [`MockTransport`] whose [`Recorder`] lets a test push
//! frames into the currently open stream and inspect every call the client
//! made, plus builders for the backend's event JSON.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;

use waggle_gate_client::protocol::{AccessDecision, GATE_ARRAY_CMD, PLAYER_DATA_CMD};
use waggle_gate_client::{
    EventStream, GateClient, GateClientConfig, GateClientError, GateEvent, Transport,
};

/// One scripted stream item. `None` ends the stream.
type StreamItem = Option<Result<String, GateClientError>>;

// ── Recorder ────────────────────────────────────────────────────────

/// Shared script and call log of a [`MockTransport`].
#[derive(Default)]
pub struct Recorder {
    session_script: StdMutex<VecDeque<Result<String, GateClientError>>>,
    decision_script: StdMutex<VecDeque<Result<u16, GateClientError>>>,
    decision_delay: StdMutex<Duration>,
    session_calls: AtomicUsize,
    opened: StdMutex<Vec<String>>,
    streams: StdMutex<Vec<mpsc::UnboundedSender<StreamItem>>>,
    closed: AtomicUsize,
    decisions: StdMutex<Vec<(String, AccessDecision)>>,
}

impl Recorder {
    /// Results for the next session requests, in order. Once exhausted,
    /// requests succeed with `session-<n>` (n counts every request).
    pub fn script_sessions(&self, results: Vec<Result<String, GateClientError>>) {
        self.session_script.lock().unwrap().extend(results);
    }

    /// Results for the next decisions. Once exhausted, decisions get `200`.
    pub fn script_decisions(&self, results: Vec<Result<u16, GateClientError>>) {
        self.decision_script.lock().unwrap().extend(results);
    }

    /// Delay every decision answer by `delay`.
    pub fn set_decision_delay(&self, delay: Duration) {
        *self.decision_delay.lock().unwrap() = delay;
    }

    pub fn session_calls(&self) -> usize {
        self.session_calls.load(Ordering::SeqCst)
    }

    /// Session ids of every `open_stream` call, in order.
    pub fn opened(&self) -> Vec<String> {
        self.opened.lock().unwrap().clone()
    }

    /// Number of streams closed by the client.
    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn decisions(&self) -> Vec<(String, AccessDecision)> {
        self.decisions.lock().unwrap().clone()
    }

    /// Deliver `frame` on the most recently opened stream.
    pub fn push(&self, frame: impl Into<String>) {
        self.send_latest(Some(Ok(frame.into())));
    }

    /// End the most recently opened stream cleanly.
    pub fn end_stream(&self) {
        self.send_latest(None);
    }

    /// Fail the most recently opened stream.
    pub fn fail_stream(&self, reason: &str) {
        self.send_latest(Some(Err(GateClientError::TransportReceive(reason.into()))));
    }

    fn send_latest(&self, item: StreamItem) {
        let streams = self.streams.lock().unwrap();
        let latest = streams.last().expect("no stream has been opened");
        // The stream may already be gone; that is fine for tests.
        let _ = latest.send(item);
    }
}

// ── MockTransport ───────────────────────────────────────────────────

/// A scripted in-memory transport.
pub struct MockTransport {
    recorder: Arc<Recorder>,
}

impl MockTransport {
    /// Create a transport plus the handle used to drive and inspect it.
    pub fn new() -> (Self, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        (
            Self {
                recorder: Arc::clone(&recorder),
            },
            recorder,
        )
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn create_session(&self) -> Result<String, GateClientError> {
        let n = self.recorder.session_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let scripted = self.recorder.session_script.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| Ok(format!("session-{n}")))
    }

    async fn open_stream(&self, session_id: &str) -> Result<Box<dyn EventStream>, GateClientError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.recorder
            .opened
            .lock()
            .unwrap()
            .push(session_id.to_string());
        self.recorder.streams.lock().unwrap().push(tx);
        Ok(Box::new(MockStream {
            rx,
            recorder: Arc::clone(&self.recorder),
            closed: false,
        }))
    }

    async fn send_access_decision(
        &self,
        session_id: &str,
        decision: &AccessDecision,
    ) -> Result<u16, GateClientError> {
        self.recorder
            .decisions
            .lock()
            .unwrap()
            .push((session_id.to_string(), decision.clone()));
        let delay = *self.recorder.decision_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let scripted = self.recorder.decision_script.lock().unwrap().pop_front();
        scripted.unwrap_or(Ok(200))
    }
}

struct MockStream {
    rx: mpsc::UnboundedReceiver<StreamItem>,
    recorder: Arc<Recorder>,
    closed: bool,
}

#[async_trait]
impl EventStream for MockStream {
    async fn recv(&mut self) -> Option<Result<String, GateClientError>> {
        self.rx.recv().await.flatten()
    }

    async fn close(&mut self) -> Result<(), GateClientError> {
        if !self.closed {
            self.closed = true;
            self.recorder.closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

// ── Config and waiting helpers ──────────────────────────────────────

/// Short timers so tests run in milliseconds. Liveness is long enough that
/// it never expires unless a test shortens it.
pub fn test_config() -> GateClientConfig {
    GateClientConfig::new()
        .with_retry_interval(Duration::from_millis(50))
        .with_monitor_interval(Duration::from_millis(20))
        .with_liveness_timeout(Duration::from_secs(5))
        .with_feedback_dwell(Duration::from_millis(100), Duration::from_millis(150))
}

/// Poll `condition` until it holds, failing the test after two seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within 2s"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Receive events until one matches `predicate`, failing after two seconds.
pub async fn expect_event(
    events: &mut mpsc::Receiver<GateEvent>,
    mut predicate: impl FnMut(&GateEvent) -> bool,
) -> GateEvent {
    let wait = async {
        loop {
            match events.recv().await {
                Some(event) if predicate(&event) => return event,
                Some(_) => {}
                None => panic!("event channel closed before the expected event"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(2), wait)
        .await
        .expect("expected event not received within 2s")
}

/// Start a client on a fresh mock transport and wait until its first stream
/// is open.
pub async fn connected_client(
    config: GateClientConfig,
) -> (GateClient, mpsc::Receiver<GateEvent>, Arc<Recorder>) {
    let (transport, recorder) = MockTransport::new();
    let (client, mut events) = GateClient::start(transport, config);
    expect_event(&mut events, |e| matches!(e, GateEvent::StreamOpened)).await;
    (client, events, recorder)
}

// ── Frame builders ──────────────────────────────────────────────────

/// A player-data frame for `Ann Smith` with the given id, position and type.
pub fn player_frame(player_id: i64, position: &str, kind: &str) -> String {
    player_frame_with(player_id, position, kind, false, "Ann", "Smith")
}

pub fn player_frame_with(
    player_id: i64,
    position: &str,
    kind: &str,
    is_blacklisted: bool,
    first_name: &str,
    last_name: &str,
) -> String {
    json!({
        "cmd": PLAYER_DATA_CMD,
        "payload": {
            "hasData": true,
            "type": kind,
            "position": position,
            "playerId": player_id,
            "isBlacklisted": is_blacklisted,
            "player": {
                "firstName": first_name,
                "secondName": "",
                "lastName": last_name,
                "lastName2": ""
            },
            "passphotos": []
        }
    })
    .to_string()
}

/// A gate-array frame reporting `(position, wire_state)` pairs.
pub fn gate_frame(gates: &[(&str, &str)]) -> String {
    let list: Vec<_> = gates
        .iter()
        .map(|(position, state)| json!({"position": position, "state": state}))
        .collect();
    json!({"cmd": GATE_ARRAY_CMD, "payload": {"list": list}}).to_string()
}

pub fn heartbeat_frame() -> String {
    json!({"cmd": "test"}).to_string()
}
