//! # Loopback Gate Example
//!
//! Demonstrates a complete gate client lifecycle:
//!
//! 1. Acquire a session and open the event stream
//! 2. Watch players arrive and gates change state
//! 3. Accept or deny whoever is at the head of the queue
//! 4. Shut down gracefully on Ctrl+C or after a few decisions
//!
//! Without `WAGGLE_BASE_URL` the client talks to an in-process loopback
//! backend that replays a short `text/event-stream` script, so the example
//! runs without any server.
//!
//! ## Running
//!
//! ```sh
//! cargo run --example loopback_gate
//!
//! # Against a real backend:
//! WAGGLE_BASE_URL=http://10.0.0.5:5050 RUST_LOG=debug cargo run --example loopback_gate
//! ```

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::json;
use waggle_gate_client::protocol::AccessDecision;
use waggle_gate_client::{
    EventStream, GateClient, GateClientConfig, GateClientError, GateEvent, HttpEventStream,
    HttpTransport, HttpTransportConfig, StateView, Transport,
};

/// Decisions to make before the example exits.
const DECISIONS: usize = 3;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // ── Logging ─────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // ── Configuration ───────────────────────────────────────────────
    let config = GateClientConfig::new().with_feedback_dwell(
        Duration::from_millis(500),
        Duration::from_millis(800),
    );

    match std::env::var("WAGGLE_BASE_URL") {
        Ok(url) => {
            tracing::info!("Connecting to {url}");
            let transport = HttpTransport::new(HttpTransportConfig::new(url))?;
            run(transport, config).await;
        }
        Err(_) => {
            tracing::info!("WAGGLE_BASE_URL not set, using the loopback backend");
            run(LoopbackTransport, config).await;
        }
    }
    Ok(())
}

async fn run(transport: impl Transport, config: GateClientConfig) {
    let (mut client, mut event_rx) = GateClient::start(transport, config);
    let state = client.state();
    let mut decided = 0;

    // ── Event loop ──────────────────────────────────────────────────
    loop {
        tokio::select! {
            event = event_rx.recv() => {
                let Some(event) = event else { break };
                match event {
                    GateEvent::SessionEstablished { session_id } => {
                        tracing::info!("Session {session_id}");
                    }
                    GateEvent::ConnectionChanged(connection) => {
                        tracing::info!("Connection: {connection}");
                    }
                    GateEvent::PlayerWaiting { player_id, display_name } => {
                        tracing::info!(
                            "{display_name} ({player_id}) waiting; queue length {}",
                            state.queue().len()
                        );
                        decide_head(&client, &state);
                    }
                    GateEvent::DecisionCompleted { player_id, granted, .. } => {
                        decided += 1;
                        let feedback = state.feedback();
                        tracing::info!(
                            "Player {player_id} {}: {:?} {}",
                            if granted { "accepted" } else { "denied" },
                            feedback.state,
                            feedback.message.unwrap_or_default()
                        );
                        if decided >= DECISIONS {
                            break;
                        }
                        decide_head(&client, &state);
                    }
                    GateEvent::DecisionFailed { player_id, reason, .. } => {
                        tracing::warn!("Decision for {player_id} failed: {reason}");
                    }
                    GateEvent::StreamOpened => tracing::info!("Event stream open"),
                    GateEvent::Stopped => break,
                }
            }

            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Ctrl+C received, shutting down");
                break;
            }
        }
    }

    client.shutdown().await;
    tracing::info!("Remaining in queue: {}", state.queue().len());
}

/// Deny odd ids, accept even ones. Guarded by id so a player already
/// waved through by the gate is skipped.
fn decide_head(client: &GateClient, state: &StateView) {
    let Some(head) = state.head() else { return };
    let result = if head.player_id % 2 == 0 {
        client.accept(head.player_id)
    } else {
        client.deny(head.player_id)
    };
    if let Err(e) = result {
        tracing::warn!("Could not send decision: {e}");
    }
}

// ── Loopback backend ────────────────────────────────────────────────

/// An in-process backend: every stream replays [`script`] as raw
/// event-stream bytes, one chunk every 300 ms.
struct LoopbackTransport;

#[async_trait]
impl Transport for LoopbackTransport {
    async fn create_session(&self) -> Result<String, GateClientError> {
        Ok("loopback-session".to_string())
    }

    async fn open_stream(&self, _session_id: &str) -> Result<Box<dyn EventStream>, GateClientError> {
        let chunks = futures_util::stream::iter(script()).then(|chunk| async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok::<_, GateClientError>(chunk.into_bytes())
        });
        // Keep the stream open after the script so the session stays up.
        let body = chunks.chain(futures_util::stream::pending()).boxed();
        Ok(Box::new(HttpEventStream::from_chunks(body)))
    }

    async fn send_access_decision(
        &self,
        session_id: &str,
        decision: &AccessDecision,
    ) -> Result<u16, GateClientError> {
        tracing::info!(
            "[loopback] {session_id}: {} -> {}",
            decision.position,
            if decision.is_access_granted { "grant" } else { "deny" }
        );
        Ok(200)
    }
}

fn sse(frame: serde_json::Value) -> String {
    format!("data: {frame}\n\n")
}

fn player(player_id: i64, position: &str, first: &str, last: &str) -> String {
    sse(json!({
        "cmd": "drMemberCPPlayerData",
        "payload": {
            "hasData": true,
            "type": "Gate",
            "position": position,
            "playerId": player_id,
            "isBlacklisted": false,
            "player": {"firstName": first, "lastName": last},
            "passphotos": []
        }
    }))
}

fn script() -> Vec<String> {
    vec![
        sse(json!({"cmd": "test"})),
        player(2, "A1", "Ann", "Smith"),
        sse(json!({"cmd": "currentTime", "payload": "12:00:00"})),
        player(3, "A2", "Bo", "Jensen"),
        sse(json!({"cmd": "drMemberCPGateArray", "payload": {"list": [
            {"position": "A1", "state": "WaitingForApprovement"}
        ]}})),
        player(4, "A3", "Cy", "Moreau"),
        sse(json!({"cmd": "test"})),
    ]
}
