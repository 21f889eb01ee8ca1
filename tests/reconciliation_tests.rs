#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
//! Wire-to-queue tests: raw event text through the framer and decoder into
//! a `PlayerQueue`, without the client actor.

mod common;

use waggle_gate_client::decoder::{self, StreamEvent};
use waggle_gate_client::sse::SseFrameDecoder;
use waggle_gate_client::{GateState, PlayerId, PlayerQueue};

use common::{gate_frame, heartbeat_frame, player_frame, player_frame_with};

/// Fold one raw event into `queue` the way the client does.
fn fold(queue: &mut PlayerQueue, raw: &str) {
    match decoder::decode(raw).unwrap() {
        StreamEvent::PlayerData(arrival) => {
            if arrival.is_gate_arrival() {
                queue.enqueue(arrival.entry);
            }
        }
        StreamEvent::GateArray(updates) => {
            queue.apply_gate_updates(&updates);
        }
        StreamEvent::Heartbeat | StreamEvent::Unrecognized => {}
    }
}

fn ids(queue: &PlayerQueue) -> Vec<PlayerId> {
    queue.entries().iter().map(|e| e.player_id).collect()
}

#[test]
fn player_then_gate_then_repeat() {
    let mut queue = PlayerQueue::new();

    fold(&mut queue, &player_frame(7, "A1", "Gate"));
    assert_eq!(ids(&queue), vec![7]);

    fold(&mut queue, &gate_frame(&[("A1", "AccessGranted")]));
    assert!(queue.is_empty());
    assert_eq!(queue.gate_state("A1"), Some(GateState::AccessGranted));

    fold(&mut queue, &gate_frame(&[("A1", "AccessGranted")]));
    assert!(queue.is_empty());
}

#[test]
fn repeated_gate_state_does_not_remove_again() {
    let mut queue = PlayerQueue::new();
    fold(&mut queue, &gate_frame(&[("A1", "AccessDenied")]));

    // A new player at A1 while the gate still reports the same state.
    fold(&mut queue, &player_frame(9, "A1", "Gate"));
    fold(&mut queue, &gate_frame(&[("A1", "AccessDenied")]));
    assert_eq!(ids(&queue), vec![9]);

    // Only an edge removes.
    fold(&mut queue, &gate_frame(&[("A1", "WaitingForApprovement")]));
    fold(&mut queue, &gate_frame(&[("A1", "AccessDenied")]));
    assert!(queue.is_empty());
}

#[test]
fn query_arrival_leaves_queue_unchanged() {
    let mut queue = PlayerQueue::new();
    fold(&mut queue, &player_frame(1, "A1", "Gate"));
    fold(&mut queue, &player_frame(2, "A2", "Query"));
    assert_eq!(ids(&queue), vec![1]);
}

#[test]
fn duplicate_ids_yield_single_entry() {
    let mut queue = PlayerQueue::new();
    fold(&mut queue, &player_frame(5, "A1", "Gate"));
    fold(
        &mut queue,
        &player_frame_with(5, "A2", "Gate", true, "Else", "Where"),
    );
    assert_eq!(queue.len(), 1);
    let head = queue.head().unwrap();
    assert_eq!(head.position, "A1");
    assert!(!head.is_blacklisted);
}

#[test]
fn all_ready_batch_clears_everything() {
    let mut queue = PlayerQueue::new();
    for (id, position) in [(1, "A1"), (2, "A2"), (3, "B7")] {
        fold(&mut queue, &player_frame(id, position, "Gate"));
    }
    fold(
        &mut queue,
        &gate_frame(&[("A1", "ReadyForUse"), ("A2", "ReadyForUse")]),
    );
    assert!(queue.is_empty());
}

#[test]
fn empty_gate_batch_clears_everything() {
    let mut queue = PlayerQueue::new();
    fold(&mut queue, &player_frame(1, "A1", "Gate"));
    fold(&mut queue, &player_frame(2, "A2", "Gate"));
    fold(&mut queue, &gate_frame(&[]));
    assert!(queue.is_empty());
}

#[test]
fn empty_or_unflagged_arrivals_never_queue() {
    let mut queue = PlayerQueue::new();
    fold(
        &mut queue,
        &player_frame_with(4, "A1", "Gate", false, "No", "Data").replace(
            r#""hasData":true"#,
            r#""hasData":false"#,
        ),
    );
    fold(&mut queue, &player_frame(5, "A2", "query"));
    fold(&mut queue, &player_frame(6, "A3", ""));
    assert!(queue.is_empty());
}

#[test]
fn framed_stream_folds_in_order() {
    let body = [
        format!("data: {}\n\n", heartbeat_frame()),
        format!("data: {}\n\n", player_frame(1, "A1", "Gate")),
        format!("data: {}\n\n", player_frame(2, "A2", "Gate")),
        format!("data: {}\n\n", gate_frame(&[("A1", "AccessGranted")])),
    ]
    .concat();

    let mut framer = SseFrameDecoder::new();
    let mut queue = PlayerQueue::new();
    // Deliver in awkward 7-byte chunks.
    for chunk in body.as_bytes().chunks(7) {
        for frame in framer.push_bytes(chunk) {
            fold(&mut queue, &frame);
        }
    }
    assert_eq!(framer.finish(), None);
    assert_eq!(ids(&queue), vec![2]);
}
