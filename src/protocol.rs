//! Wire types for the gate-control backend.
//!
//! Every stream event is a JSON object `{"cmd": "...", "payload": ...}`.
//! Requests to the backend are plain JSON bodies posted to `client2server`.
//! Field names follow the backend's camelCase convention.

use std::fmt;

use serde::{Deserialize, Serialize};

// ── Command tags ────────────────────────────────────────────────────

/// Command tag of a player-arrival event.
pub const PLAYER_DATA_CMD: &str = "drMemberCPPlayerData";

/// Command tag of a gate-array event.
pub const GATE_ARRAY_CMD: &str = "drMemberCPGateArray";

/// Command tag of the backend keep-alive marker.
pub const HEARTBEAT_CMD: &str = "test";

/// Key wrapping an access decision in the request body.
pub const ACCESS_CMD: &str = "drMemberCPAccess";

/// Command sent to open a new session.
pub const NEW_SESSION_CMD: &str = "newSession";

/// Player payload type tag that belongs in the gate queue.
/// Other tags (e.g. `"Query"`) come from lookup terminals and are ignored.
pub const GATE_PLAYER_TYPE: &str = "Gate";

// ── Type aliases ────────────────────────────────────────────────────

/// Backend identifier of a player. Used as the queue dedup key.
pub type PlayerId = i64;

/// Player id used when the payload omits one.
pub const UNKNOWN_PLAYER_ID: PlayerId = -1;

// ── Session ─────────────────────────────────────────────────────────

/// Body of the session-creation request: `{"cmd": "newSession"}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewSessionRequest {
    pub cmd: String,
}

impl Default for NewSessionRequest {
    fn default() -> Self {
        Self {
            cmd: NEW_SESSION_CMD.to_string(),
        }
    }
}

/// Response to the session-creation request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionIdResponse {
    pub session_id: String,
}

// ── Stream envelope ─────────────────────────────────────────────────

/// Outer shape of every stream event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub cmd: Option<String>,
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
}

// ── Player data ─────────────────────────────────────────────────────

/// Payload of a `drMemberCPPlayerData` event.
///
/// Every field is optional on the wire; `null` and a missing key are
/// treated the same.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerDataPayload {
    #[serde(default)]
    pub has_data: Option<bool>,
    /// Origin of the scan (`"Gate"`, `"Query"`, ...).
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub position: Option<String>,
    #[serde(default)]
    pub player_id: Option<PlayerId>,
    #[serde(default)]
    pub is_blacklisted: Option<bool>,
    #[serde(default)]
    pub player: Option<PlayerName>,
    #[serde(default)]
    pub passphotos: Option<Vec<PassPhoto>>,
}

/// Name fields of a player.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PlayerName {
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub second_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub last_name2: Option<String>,
}

/// One embedded identity photo.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PassPhoto {
    /// Base64-encoded image bytes.
    pub data: String,
}

// ── Gate array ──────────────────────────────────────────────────────

/// Payload of a `drMemberCPGateArray` event.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GateArrayPayload {
    #[serde(default)]
    pub list: Option<Vec<GateStatus>>,
}

/// State report for a single gate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GateStatus {
    #[serde(default)]
    pub position: Option<String>,
    #[serde(default)]
    pub state: Option<GateState>,
}

/// Physical state of a gate as reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GateState {
    /// Gate is closed.
    Closed,
    /// Reading the card or ticket.
    #[serde(rename = "GettingData")]
    AwaitingData,
    /// Waiting for an operator decision.
    #[serde(rename = "WaitingForApprovement")]
    AwaitingApproval,
    /// Card was rejected by the reader.
    #[serde(rename = "CardRejected")]
    Rejected,
    AccessGranted,
    AccessDenied,
    /// Staff member passed with an override.
    #[serde(rename = "StaffEntered")]
    StaffOverride,
    #[serde(rename = "PrintingTickets")]
    Printing,
    /// Gate is idle and ready for the next player.
    ReadyForUse,
    /// Any state string this client does not know.
    #[serde(other)]
    Unknown,
}

impl GateState {
    /// Returns `true` if reaching this state settles whoever waits at the gate.
    pub fn resolves_position(self) -> bool {
        matches!(
            self,
            Self::AccessGranted | Self::AccessDenied | Self::ReadyForUse
        )
    }

    /// The wire string for this state.
    pub fn as_wire(self) -> &'static str {
        match self {
            Self::Closed => "Closed",
            Self::AwaitingData => "GettingData",
            Self::AwaitingApproval => "WaitingForApprovement",
            Self::Rejected => "CardRejected",
            Self::AccessGranted => "AccessGranted",
            Self::AccessDenied => "AccessDenied",
            Self::StaffOverride => "StaffEntered",
            Self::Printing => "PrintingTickets",
            Self::ReadyForUse => "ReadyForUse",
            Self::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for GateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_wire())
    }
}

// ── Access decision ─────────────────────────────────────────────────

/// Operator decision for the player waiting at `position`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AccessDecision {
    pub position: String,
    pub is_access_granted: bool,
}

impl AccessDecision {
    pub fn new(position: impl Into<String>, granted: bool) -> Self {
        Self {
            position: position.into(),
            is_access_granted: granted,
        }
    }
}

/// Request body carrying an [`AccessDecision`]:
/// `{"drMemberCPAccess": {"position": "...", "isAccessGranted": true}}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccessRequest {
    #[serde(rename = "drMemberCPAccess")]
    pub access: AccessDecision,
}

impl From<AccessDecision> for AccessRequest {
    fn from(access: AccessDecision) -> Self {
        Self { access }
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn new_session_request_body() {
        let body = serde_json::to_value(NewSessionRequest::default()).unwrap();
        assert_eq!(body, json!({"cmd": "newSession"}));
    }

    #[test]
    fn session_id_response_reads_camel_case() {
        let resp: SessionIdResponse =
            serde_json::from_str(r#"{"sessionId":"abc-123"}"#).unwrap();
        assert_eq!(resp.session_id, "abc-123");
    }

    #[test]
    fn access_request_body_shape() {
        let body = serde_json::to_value(AccessRequest::from(AccessDecision::new("A1", true)))
            .unwrap();
        assert_eq!(
            body,
            json!({"drMemberCPAccess": {"position": "A1", "isAccessGranted": true}})
        );
    }

    #[test]
    fn gate_states_use_backend_names() {
        let cases = [
            ("Closed", GateState::Closed),
            ("GettingData", GateState::AwaitingData),
            ("WaitingForApprovement", GateState::AwaitingApproval),
            ("CardRejected", GateState::Rejected),
            ("AccessGranted", GateState::AccessGranted),
            ("AccessDenied", GateState::AccessDenied),
            ("StaffEntered", GateState::StaffOverride),
            ("PrintingTickets", GateState::Printing),
            ("ReadyForUse", GateState::ReadyForUse),
        ];
        for (wire, expected) in cases {
            let parsed: GateState = serde_json::from_value(json!(wire)).unwrap();
            assert_eq!(parsed, expected, "wire name {wire}");
            assert_eq!(parsed.as_wire(), wire);
        }
    }

    #[test]
    fn unknown_gate_state_is_tolerated() {
        let parsed: GateState = serde_json::from_value(json!("Exploded")).unwrap();
        assert_eq!(parsed, GateState::Unknown);
        assert!(!parsed.resolves_position());
    }

    #[test]
    fn resolving_states() {
        assert!(GateState::AccessGranted.resolves_position());
        assert!(GateState::AccessDenied.resolves_position());
        assert!(GateState::ReadyForUse.resolves_position());
        assert!(!GateState::AwaitingApproval.resolves_position());
        assert!(!GateState::Closed.resolves_position());
    }

    #[test]
    fn player_payload_tolerates_nulls() {
        let payload: PlayerDataPayload = serde_json::from_value(json!({
            "hasData": true,
            "type": "Gate",
            "position": null,
            "playerId": null,
            "player": {"firstName": "Ann", "lastName2": null}
        }))
        .unwrap();
        assert_eq!(payload.kind.as_deref(), Some("Gate"));
        assert!(payload.position.is_none());
        assert!(payload.player_id.is_none());
        let name = payload.player.unwrap();
        assert_eq!(name.first_name.as_deref(), Some("Ann"));
        assert!(name.last_name2.is_none());
    }
}
