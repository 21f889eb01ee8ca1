//! Ordered queue of players waiting at the gates.
//!
//! [`PlayerQueue`] is plain state with no I/O. The [client](crate::client)
//! actor owns the only instance and folds stream events and operator
//! decisions into it one at a time.
//!
//! Invariants:
//! - insertion order is arrival order, the head is the entry subject to
//!   accept/deny
//! - at most one entry per [`PlayerId`]; a repeated arrival is dropped, never
//!   merged
//! - gate states are remembered per position so only *changes* act on the
//!   queue

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::protocol::{GateState, PlayerId};

// ── Entries ─────────────────────────────────────────────────────────

/// Decoded identity photo. Cheap to clone.
#[derive(Clone, PartialEq, Eq)]
pub struct Photo(Arc<[u8]>);

impl Photo {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes.into())
    }

    /// Raw image bytes (JPEG/PNG as sent by the backend).
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Photo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Photo({} bytes)", self.0.len())
    }
}

/// A player waiting at a gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerEntry {
    /// Gate (lane) the player is standing at.
    pub position: String,
    pub player_id: PlayerId,
    pub first_name: String,
    pub second_name: String,
    pub last_name: String,
    pub last_name2: String,
    pub photo: Option<Photo>,
    pub is_blacklisted: bool,
}

impl PlayerEntry {
    /// `"first last"`, trimmed. Used for notifications and feedback.
    pub fn display_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_string()
    }
}

/// One `(position, state)` report from a gate-array event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateUpdate {
    pub position: String,
    pub state: GateState,
}

impl GateUpdate {
    pub fn new(position: impl Into<String>, state: GateState) -> Self {
        Self {
            position: position.into(),
            state,
        }
    }
}

/// What a gate-array batch did to the queue.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct GateBatchOutcome {
    /// Entries removed by this batch, in removal order.
    pub removed: Vec<PlayerEntry>,
    /// Every gate reported ready, so the whole queue was cleared.
    pub cleared: bool,
}

impl GateBatchOutcome {
    /// Returns `true` if the queue changed.
    pub fn changed_queue(&self) -> bool {
        !self.removed.is_empty()
    }
}

// ── Queue ───────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct PlayerQueue {
    entries: Vec<PlayerEntry>,
    gate_states: HashMap<String, GateState>,
}

impl PlayerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `entry` unless its player is already queued.
    ///
    /// Returns `false` for a duplicate; the existing entry is left untouched.
    pub fn enqueue(&mut self, entry: PlayerEntry) -> bool {
        if self.contains(entry.player_id) {
            debug!(
                player_id = entry.player_id,
                position = %entry.position,
                "duplicate player arrival dropped"
            );
            return false;
        }
        self.entries.push(entry);
        true
    }

    /// Entry currently eligible for accept/deny.
    pub fn head(&self) -> Option<&PlayerEntry> {
        self.entries.first()
    }

    pub fn contains(&self, player_id: PlayerId) -> bool {
        self.entries.iter().any(|e| e.player_id == player_id)
    }

    /// Remove every entry waiting at `position`. Removing from a position
    /// with nobody queued is a no-op.
    pub fn remove_by_position(&mut self, position: &str) -> Vec<PlayerEntry> {
        let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.entries)
            .into_iter()
            .partition(|e| e.position == position);
        self.entries = kept;
        removed
    }

    /// Drop every entry. Gate-state records are kept.
    pub fn clear(&mut self) -> Vec<PlayerEntry> {
        std::mem::take(&mut self.entries)
    }

    /// Fold a gate-array batch into the queue.
    ///
    /// Per update: a state equal to the last one recorded for that position
    /// is skipped. A changed state is recorded and, if it
    /// [resolves](GateState::resolves_position) the position, the entries at
    /// that position are removed.
    ///
    /// After the batch: if every update in a non-empty batch reports
    /// [`GateState::ReadyForUse`] the whole queue is cleared, whether or not
    /// those positions had anyone queued and whether or not their states
    /// changed.
    pub fn apply_gate_updates(&mut self, updates: &[GateUpdate]) -> GateBatchOutcome {
        let mut outcome = GateBatchOutcome::default();

        for update in updates {
            if self.gate_states.get(&update.position) == Some(&update.state) {
                trace!(position = %update.position, state = %update.state, "gate state unchanged");
                continue;
            }
            self.gate_states.insert(update.position.clone(), update.state);

            if update.state.resolves_position() {
                let removed = self.remove_by_position(&update.position);
                if !removed.is_empty() {
                    debug!(
                        position = %update.position,
                        state = %update.state,
                        count = removed.len(),
                        "gate resolved queued player"
                    );
                }
                outcome.removed.extend(removed);
            }
        }

        // Vacuously true for an empty batch.
        let all_ready = updates.iter().all(|u| u.state == GateState::ReadyForUse);
        if all_ready {
            let removed = self.clear();
            if !removed.is_empty() {
                debug!(count = removed.len(), "all gates ready, queue cleared");
            }
            outcome.removed.extend(removed);
            outcome.cleared = true;
        }

        outcome
    }

    /// Last state recorded for `position`.
    pub fn gate_state(&self, position: &str) -> Option<GateState> {
        self.gate_states.get(position).copied()
    }

    pub fn entries(&self) -> &[PlayerEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
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

    fn player(player_id: PlayerId, position: &str) -> PlayerEntry {
        PlayerEntry {
            position: position.into(),
            player_id,
            first_name: "Ann".into(),
            second_name: String::new(),
            last_name: "Smith".into(),
            last_name2: String::new(),
            photo: None,
            is_blacklisted: false,
        }
    }

    fn ids(queue: &PlayerQueue) -> Vec<PlayerId> {
        queue.entries().iter().map(|e| e.player_id).collect()
    }

    #[test]
    fn enqueue_keeps_arrival_order() {
        let mut queue = PlayerQueue::new();
        assert!(queue.enqueue(player(3, "A1")));
        assert!(queue.enqueue(player(1, "A2")));
        assert!(queue.enqueue(player(2, "A3")));
        assert_eq!(ids(&queue), vec![3, 1, 2]);
        assert_eq!(queue.head().unwrap().player_id, 3);
    }

    #[test]
    fn duplicate_player_is_dropped_not_replaced() {
        let mut queue = PlayerQueue::new();
        assert!(queue.enqueue(player(7, "A1")));
        assert!(!queue.enqueue(player(7, "B2")));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.head().unwrap().position, "A1");
    }

    #[test]
    fn remove_by_position_is_idempotent() {
        let mut queue = PlayerQueue::new();
        queue.enqueue(player(1, "A1"));
        queue.enqueue(player(2, "A2"));
        assert_eq!(queue.remove_by_position("A1").len(), 1);
        assert!(queue.remove_by_position("A1").is_empty());
        assert_eq!(ids(&queue), vec![2]);
    }

    #[test]
    fn resolving_state_removes_position() {
        let mut queue = PlayerQueue::new();
        queue.enqueue(player(7, "A1"));
        queue.enqueue(player(8, "A2"));

        let outcome =
            queue.apply_gate_updates(&[GateUpdate::new("A1", GateState::AccessGranted)]);
        assert_eq!(outcome.removed.len(), 1);
        assert!(!outcome.cleared);
        assert_eq!(ids(&queue), vec![8]);
    }

    #[test]
    fn repeated_state_has_no_further_effect() {
        let mut queue = PlayerQueue::new();
        queue.enqueue(player(7, "A1"));
        let update = [GateUpdate::new("A1", GateState::AccessDenied)];

        assert_eq!(queue.apply_gate_updates(&update).removed.len(), 1);

        // Same player scans again at the same gate while the gate still
        // reports the old state: no edge, no removal.
        queue.enqueue(player(7, "A1"));
        let outcome = queue.apply_gate_updates(&update);
        assert!(outcome.removed.is_empty());
        assert_eq!(ids(&queue), vec![7]);
    }

    #[test]
    fn non_resolving_states_are_recorded_only() {
        let mut queue = PlayerQueue::new();
        queue.enqueue(player(7, "A1"));
        let outcome = queue.apply_gate_updates(&[
            GateUpdate::new("A1", GateState::AwaitingApproval),
            GateUpdate::new("A2", GateState::Printing),
        ]);
        assert!(outcome.removed.is_empty());
        assert_eq!(queue.gate_state("A1"), Some(GateState::AwaitingApproval));
        assert_eq!(queue.gate_state("A2"), Some(GateState::Printing));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn only_transition_edges_remove() {
        let mut queue = PlayerQueue::new();
        queue.apply_gate_updates(&[GateUpdate::new("A1", GateState::AccessGranted)]);
        queue.enqueue(player(7, "A1"));

        // Still AccessGranted: steady state, player stays.
        queue.apply_gate_updates(&[GateUpdate::new("A1", GateState::AccessGranted)]);
        assert_eq!(queue.len(), 1);

        queue.apply_gate_updates(&[GateUpdate::new("A1", GateState::AwaitingApproval)]);
        queue.apply_gate_updates(&[GateUpdate::new("A1", GateState::AccessGranted)]);
        assert!(queue.is_empty());
    }

    #[test]
    fn all_ready_batch_clears_everything() {
        let mut queue = PlayerQueue::new();
        queue.enqueue(player(1, "A1"));
        queue.enqueue(player(2, "A2"));
        queue.enqueue(player(3, "C9"));

        let outcome = queue.apply_gate_updates(&[
            GateUpdate::new("B1", GateState::ReadyForUse),
            GateUpdate::new("B2", GateState::ReadyForUse),
        ]);
        assert!(outcome.cleared);
        assert_eq!(outcome.removed.len(), 3);
        assert!(queue.is_empty());
    }

    #[test]
    fn all_ready_clears_even_when_states_are_unchanged() {
        let mut queue = PlayerQueue::new();
        let ready = [GateUpdate::new("A1", GateState::ReadyForUse)];
        queue.apply_gate_updates(&ready);

        queue.enqueue(player(4, "Z9"));
        let outcome = queue.apply_gate_updates(&ready);
        assert!(outcome.cleared);
        assert!(queue.is_empty());
    }

    #[test]
    fn mixed_batch_does_not_clear() {
        let mut queue = PlayerQueue::new();
        queue.enqueue(player(1, "A1"));
        queue.enqueue(player(2, "A2"));

        let outcome = queue.apply_gate_updates(&[
            GateUpdate::new("A1", GateState::ReadyForUse),
            GateUpdate::new("A2", GateState::AwaitingApproval),
        ]);
        assert!(!outcome.cleared);
        assert_eq!(ids(&queue), vec![2]);
    }

    #[test]
    fn empty_batch_clears_queue() {
        let mut queue = PlayerQueue::new();
        queue.enqueue(player(1, "A1"));
        queue.enqueue(player(2, "A2"));
        let outcome = queue.apply_gate_updates(&[]);
        assert!(outcome.cleared);
        assert_eq!(outcome.removed.len(), 2);
        assert!(queue.is_empty());
    }

    #[test]
    fn unknown_state_never_removes_or_clears() {
        let mut queue = PlayerQueue::new();
        queue.enqueue(player(1, "A1"));
        let outcome = queue.apply_gate_updates(&[
            GateUpdate::new("A1", GateState::Unknown),
            GateUpdate::new("A2", GateState::ReadyForUse),
        ]);
        assert!(!outcome.cleared);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn display_name_trims_missing_parts() {
        let mut entry = player(1, "A1");
        entry.last_name = String::new();
        assert_eq!(entry.display_name(), "Ann");
    }
}
