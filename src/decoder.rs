//! Decoding of raw stream events into typed [`StreamEvent`]s.
//!
//! Classification is by command-tag substring on the raw text, checked in a
//! fixed order: player data, then gate array, then the heartbeat marker.
//! The heartbeat substring is only a prefilter: the event counts as a
//! heartbeat when its `cmd` is exactly the marker. Anything else is
//! [`StreamEvent::Unrecognized`] and never an error.
//!
//! A [`DecodeError`] never affects later events: the caller logs it and
//! drops the event.

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine as _;
use thiserror::Error;

use crate::protocol::{
    Envelope, GateArrayPayload, GateState, PassPhoto, PlayerDataPayload, GATE_ARRAY_CMD,
    GATE_PLAYER_TYPE, HEARTBEAT_CMD, PLAYER_DATA_CMD, UNKNOWN_PLAYER_ID,
};
use crate::queue::{GateUpdate, Photo, PlayerEntry};

/// Base64 engine for embedded photos. Padding is optional on the wire.
const PHOTO_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Why a stream event could not be decoded.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed JSON: {0}")]
    MalformedJson(#[from] serde_json::Error),

    #[error("event has no payload")]
    MissingPayload,

    #[error("payload is missing `{0}`")]
    MissingField(&'static str),

    #[error("invalid photo data: {0}")]
    InvalidPhoto(#[from] base64::DecodeError),
}

/// A decoded stream event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// A player scanned a card somewhere.
    PlayerData(PlayerArrival),
    /// State reports for one or more gates.
    GateArray(Vec<GateUpdate>),
    /// Backend keep-alive marker.
    Heartbeat,
    /// Any other command (`currentTime`, `sync`, `AreYouThere`, ...).
    Unrecognized,
}

/// A player-data event before queue filtering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerArrival {
    /// `hasData` flag from the payload; `false` when absent.
    pub has_data: bool,
    /// Payload type tag (`"Gate"`, `"Query"`, ...); empty when absent.
    pub kind: String,
    pub entry: PlayerEntry,
}

impl PlayerArrival {
    /// Only arrivals with data at a `Gate` reader join the queue. `Query`
    /// and other lookups are informational.
    pub fn is_gate_arrival(&self) -> bool {
        self.has_data && self.kind == GATE_PLAYER_TYPE
    }
}

/// Decode one complete stream event.
pub fn decode(raw: &str) -> Result<StreamEvent, DecodeError> {
    if raw.contains(PLAYER_DATA_CMD) {
        decode_player(raw).map(StreamEvent::PlayerData)
    } else if raw.contains(GATE_ARRAY_CMD) {
        decode_gate_array(raw).map(StreamEvent::GateArray)
    } else if raw.contains(HEARTBEAT_CMD) && is_heartbeat(raw) {
        Ok(StreamEvent::Heartbeat)
    } else {
        Ok(StreamEvent::Unrecognized)
    }
}

/// Which of `count` embedded photos to show.
///
/// Some payload variants carry a thumbnail duplicate first, so the second
/// photo wins whenever there are at least two: `min(1, count - 1)`.
pub fn select_photo_index(count: usize) -> Option<usize> {
    count.checked_sub(1).map(|last| last.min(1))
}

fn is_heartbeat(raw: &str) -> bool {
    serde_json::from_str::<Envelope>(raw)
        .is_ok_and(|envelope| envelope.cmd.as_deref() == Some(HEARTBEAT_CMD))
}

fn payload_of(raw: &str) -> Result<serde_json::Value, DecodeError> {
    let envelope: Envelope = serde_json::from_str(raw)?;
    envelope
        .payload
        .filter(|payload| !payload.is_null())
        .ok_or(DecodeError::MissingPayload)
}

fn decode_player(raw: &str) -> Result<PlayerArrival, DecodeError> {
    let payload: PlayerDataPayload = serde_json::from_value(payload_of(raw)?)?;
    let name = payload.player.unwrap_or_default();
    let photos = payload.passphotos.unwrap_or_default();

    let entry = PlayerEntry {
        position: payload.position.unwrap_or_default(),
        player_id: payload.player_id.unwrap_or(UNKNOWN_PLAYER_ID),
        first_name: name.first_name.unwrap_or_default(),
        second_name: name.second_name.unwrap_or_default(),
        last_name: name.last_name.unwrap_or_default(),
        last_name2: name.last_name2.unwrap_or_default(),
        photo: decode_photo(&photos)?,
        is_blacklisted: payload.is_blacklisted.unwrap_or(false),
    };

    Ok(PlayerArrival {
        has_data: payload.has_data.unwrap_or(false),
        kind: payload.kind.unwrap_or_default(),
        entry,
    })
}

fn decode_photo(photos: &[PassPhoto]) -> Result<Option<Photo>, DecodeError> {
    let Some(photo) = select_photo_index(photos.len()).and_then(|i| photos.get(i)) else {
        return Ok(None);
    };
    // MIME-style payloads wrap the base64 text every 76 characters.
    let compact: Vec<u8> = photo
        .data
        .bytes()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    let bytes = PHOTO_ENGINE.decode(compact)?;
    Ok(Some(Photo::new(bytes)))
}

fn decode_gate_array(raw: &str) -> Result<Vec<GateUpdate>, DecodeError> {
    let payload: GateArrayPayload = serde_json::from_value(payload_of(raw)?)?;
    let list = payload.list.ok_or(DecodeError::MissingField("list"))?;
    Ok(list
        .into_iter()
        .map(|gate| GateUpdate {
            position: gate.position.unwrap_or_default(),
            state: gate.state.unwrap_or(GateState::Unknown),
        })
        .collect())
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
    use base64::engine::general_purpose::STANDARD;
    use serde_json::json;

    fn player_event(payload: serde_json::Value) -> String {
        json!({"cmd": PLAYER_DATA_CMD, "payload": payload}).to_string()
    }

    fn photo(bytes: &[u8]) -> serde_json::Value {
        json!({"data": STANDARD.encode(bytes)})
    }

    #[test]
    fn photo_index_rule() {
        assert_eq!(select_photo_index(0), None);
        assert_eq!(select_photo_index(1), Some(0));
        assert_eq!(select_photo_index(2), Some(1));
        assert_eq!(select_photo_index(5), Some(1));
    }

    #[test]
    fn decodes_full_player_payload() {
        let raw = player_event(json!({
            "hasData": true,
            "type": "Gate",
            "position": "A1",
            "playerId": 7,
            "isBlacklisted": true,
            "player": {
                "firstName": "Ann",
                "secondName": "Marie",
                "lastName": "Smith",
                "lastName2": "Jones"
            },
            "passphotos": [photo(b"thumb"), photo(b"full")]
        }));

        let StreamEvent::PlayerData(arrival) = decode(&raw).unwrap() else {
            panic!("expected player data");
        };
        assert!(arrival.has_data);
        assert_eq!(arrival.kind, "Gate");
        let entry = arrival.entry;
        assert_eq!(entry.position, "A1");
        assert_eq!(entry.player_id, 7);
        assert_eq!(entry.first_name, "Ann");
        assert_eq!(entry.second_name, "Marie");
        assert_eq!(entry.last_name, "Smith");
        assert_eq!(entry.last_name2, "Jones");
        assert!(entry.is_blacklisted);
        assert_eq!(entry.photo.unwrap().as_bytes(), b"full");
    }

    #[test]
    fn single_photo_is_used() {
        let raw = player_event(json!({
            "hasData": true, "type": "Gate", "playerId": 1,
            "passphotos": [photo(b"only")]
        }));
        let StreamEvent::PlayerData(arrival) = decode(&raw).unwrap() else {
            panic!("expected player data");
        };
        assert_eq!(arrival.entry.photo.unwrap().as_bytes(), b"only");
    }

    #[test]
    fn wrapped_unpadded_base64_is_accepted() {
        let encoded = STANDARD.encode(b"abcd").trim_end_matches('=').to_string();
        let wrapped = format!("{}\n{}", &encoded[..3], &encoded[3..]);
        let raw = player_event(json!({
            "hasData": true, "type": "Gate", "playerId": 1,
            "passphotos": [{"data": wrapped}]
        }));
        let StreamEvent::PlayerData(arrival) = decode(&raw).unwrap() else {
            panic!("expected player data");
        };
        assert_eq!(arrival.entry.photo.unwrap().as_bytes(), b"abcd");
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let raw = player_event(json!({"type": "Query"}));
        let StreamEvent::PlayerData(arrival) = decode(&raw).unwrap() else {
            panic!("expected player data");
        };
        assert!(!arrival.has_data);
        assert_eq!(arrival.kind, "Query");
        assert_eq!(arrival.entry.player_id, UNKNOWN_PLAYER_ID);
        assert_eq!(arrival.entry.position, "");
        assert!(arrival.entry.photo.is_none());
        assert!(!arrival.entry.is_blacklisted);
    }

    #[test]
    fn invalid_photo_is_a_decode_error() {
        let raw = player_event(json!({
            "hasData": true, "type": "Gate", "playerId": 1,
            "passphotos": [{"data": "!!not base64!!"}]
        }));
        assert!(matches!(decode(&raw), Err(DecodeError::InvalidPhoto(_))));
    }

    #[test]
    fn decodes_gate_array() {
        let raw = json!({
            "cmd": GATE_ARRAY_CMD,
            "payload": {"list": [
                {"position": "A1", "state": "AccessGranted"},
                {"position": "A2", "state": "WaitingForApprovement"},
                {"position": "A3", "state": "SomethingNew"},
                {"position": "A4"}
            ]}
        })
        .to_string();

        let StreamEvent::GateArray(updates) = decode(&raw).unwrap() else {
            panic!("expected gate array");
        };
        assert_eq!(
            updates,
            vec![
                GateUpdate::new("A1", GateState::AccessGranted),
                GateUpdate::new("A2", GateState::AwaitingApproval),
                GateUpdate::new("A3", GateState::Unknown),
                GateUpdate::new("A4", GateState::Unknown),
            ]
        );
    }

    #[test]
    fn gate_array_without_list_is_an_error() {
        let raw = json!({"cmd": GATE_ARRAY_CMD, "payload": {}}).to_string();
        assert!(matches!(
            decode(&raw),
            Err(DecodeError::MissingField("list"))
        ));
    }

    #[test]
    fn missing_payload_is_an_error() {
        let raw = json!({"cmd": PLAYER_DATA_CMD}).to_string();
        assert!(matches!(decode(&raw), Err(DecodeError::MissingPayload)));
        let raw = json!({"cmd": GATE_ARRAY_CMD, "payload": null}).to_string();
        assert!(matches!(decode(&raw), Err(DecodeError::MissingPayload)));
    }

    #[test]
    fn malformed_json_is_an_error() {
        let raw = r#"{"cmd":"drMemberCPPlayerData","payload":{"#;
        assert!(matches!(decode(raw), Err(DecodeError::MalformedJson(_))));
    }

    #[test]
    fn heartbeat_and_other_commands() {
        assert_eq!(
            decode(r#"{"cmd":"test"}"#).unwrap(),
            StreamEvent::Heartbeat
        );
        assert_eq!(
            decode(r#"{"cmd":"currentTime","payload":"12:00"}"#).unwrap(),
            StreamEvent::Unrecognized
        );
        assert_eq!(decode("not json at all").unwrap(), StreamEvent::Unrecognized);
    }

    #[test]
    fn marker_text_outside_cmd_is_not_a_heartbeat() {
        for raw in [
            r#"{"cmd":"currentTime","payload":"latest"}"#,
            r#"{"cmd":"testing"}"#,
            r#"{"payload":"test"}"#,
            "test",
        ] {
            assert_eq!(decode(raw).unwrap(), StreamEvent::Unrecognized, "{raw}");
        }
    }

    #[test]
    fn player_tag_wins_over_heartbeat_marker() {
        // A player named "Test" must not be mistaken for a keep-alive.
        let raw = player_event(json!({
            "hasData": true, "type": "Gate", "playerId": 2,
            "player": {"firstName": "test"}
        }));
        assert!(matches!(decode(&raw).unwrap(), StreamEvent::PlayerData(_)));
    }
}
