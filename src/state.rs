//! Observable state for the presentation layer.
//!
//! The client actor owns the canonical state and publishes snapshots into
//! `tokio::sync::watch` channels. [`StateView`] is the read-only side: it can
//! read the latest snapshot or subscribe to changes, and it has no way to
//! mutate anything.

use std::sync::Arc;

use tokio::sync::watch;

use crate::queue::PlayerEntry;
use crate::session::ConnectionState;

/// Transient border/feedback indicator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum FeedbackState {
    #[default]
    Neutral,
    Positive,
    Negative,
}

/// The player a decision was last completed for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastHandled {
    /// `"first last"`.
    pub full_name: String,
    pub is_blacklisted: bool,
    pub accepted: bool,
}

/// Current feedback value. Reverts to [`Feedback::neutral`] after a dwell.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Feedback {
    pub state: FeedbackState,
    /// Operator-facing text, e.g. `"Accepted Ann Smith"`.
    pub message: Option<String>,
    pub last_handled: Option<LastHandled>,
}

impl Feedback {
    pub fn neutral() -> Self {
        Self::default()
    }

    pub(crate) fn decision(entry: &PlayerEntry, accepted: bool) -> Self {
        let full_name = entry.display_name();
        let (state, verb) = if accepted {
            (FeedbackState::Positive, "Accepted")
        } else {
            (FeedbackState::Negative, "Denied")
        };
        Self {
            state,
            message: Some(format!("{verb} {full_name}")),
            last_handled: Some(LastHandled {
                full_name,
                is_blacklisted: entry.is_blacklisted,
                accepted,
            }),
        }
    }

    pub(crate) fn negative(message: impl Into<String>) -> Self {
        Self {
            state: FeedbackState::Negative,
            message: Some(message.into()),
            last_handled: None,
        }
    }

    /// Blacklisted arrival warning; carries no message.
    pub(crate) fn blacklisted() -> Self {
        Self {
            state: FeedbackState::Negative,
            message: None,
            last_handled: None,
        }
    }
}

// ── Publisher ───────────────────────────────────────────────────────

/// Write side, held by the client actor.
#[derive(Debug)]
pub(crate) struct StateSurface {
    session_id: watch::Sender<String>,
    connection: watch::Sender<ConnectionState>,
    queue: watch::Sender<Vec<PlayerEntry>>,
    feedback: watch::Sender<Feedback>,
}

impl StateSurface {
    pub(crate) fn new() -> Arc<Self> {
        let (session_id, _rx) = watch::channel(String::new());
        let (connection, _rx) = watch::channel(ConnectionState::Connecting);
        let (queue, _rx) = watch::channel(Vec::new());
        let (feedback, _rx) = watch::channel(Feedback::neutral());
        Arc::new(Self {
            session_id,
            connection,
            queue,
            feedback,
        })
    }

    pub(crate) fn publish_session_id(&self, id: &str) {
        self.session_id.send_if_modified(|current| {
            if current.as_str() == id {
                false
            } else {
                *current = id.to_string();
                true
            }
        });
    }

    pub(crate) fn publish_connection(&self, state: ConnectionState) {
        self.connection.send_if_modified(|current| {
            let changed = *current != state;
            *current = state;
            changed
        });
    }

    pub(crate) fn publish_queue(&self, entries: &[PlayerEntry]) {
        self.queue.send_replace(entries.to_vec());
    }

    pub(crate) fn publish_feedback(&self, feedback: Feedback) {
        self.feedback.send_replace(feedback);
    }
}

// ── Read side ───────────────────────────────────────────────────────

/// Read-only view of the client state. Cheap to clone.
///
/// # Example
///
/// ```rust,no_run
/// # async fn example(client: waggle_gate_client::GateClient) {
/// let view = client.state();
/// let mut queue = view.subscribe_queue();
/// while queue.changed().await.is_ok() {
///     let waiting = queue.borrow_and_update().len();
///     println!("{waiting} player(s) waiting");
/// }
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct StateView {
    surface: Arc<StateSurface>,
}

impl StateView {
    pub(crate) fn new(surface: Arc<StateSurface>) -> Self {
        Self { surface }
    }

    /// Current session id, empty until the first acquisition succeeds.
    pub fn session_id(&self) -> String {
        self.surface.session_id.borrow().clone()
    }

    pub fn connection(&self) -> ConnectionState {
        *self.surface.connection.borrow()
    }

    /// Snapshot of the queue, head first.
    pub fn queue(&self) -> Vec<PlayerEntry> {
        self.surface.queue.borrow().clone()
    }

    pub fn head(&self) -> Option<PlayerEntry> {
        self.surface.queue.borrow().first().cloned()
    }

    pub fn feedback(&self) -> Feedback {
        self.surface.feedback.borrow().clone()
    }

    pub fn subscribe_session_id(&self) -> watch::Receiver<String> {
        self.surface.session_id.subscribe()
    }

    pub fn subscribe_connection(&self) -> watch::Receiver<ConnectionState> {
        self.surface.connection.subscribe()
    }

    pub fn subscribe_queue(&self) -> watch::Receiver<Vec<PlayerEntry>> {
        self.surface.queue.subscribe()
    }

    pub fn subscribe_feedback(&self) -> watch::Receiver<Feedback> {
        self.surface.feedback.subscribe()
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

    fn entry(first: &str, last: &str, blacklisted: bool) -> PlayerEntry {
        PlayerEntry {
            position: "A1".into(),
            player_id: 1,
            first_name: first.into(),
            second_name: String::new(),
            last_name: last.into(),
            last_name2: String::new(),
            photo: None,
            is_blacklisted: blacklisted,
        }
    }

    #[test]
    fn initial_snapshot() {
        let view = StateView::new(StateSurface::new());
        assert_eq!(view.session_id(), "");
        assert_eq!(view.connection(), ConnectionState::Connecting);
        assert!(view.queue().is_empty());
        assert_eq!(view.feedback(), Feedback::neutral());
    }

    #[test]
    fn decision_feedback_messages() {
        let accepted = Feedback::decision(&entry("Ann", "Smith", false), true);
        assert_eq!(accepted.state, FeedbackState::Positive);
        assert_eq!(accepted.message.as_deref(), Some("Accepted Ann Smith"));
        assert!(accepted.last_handled.unwrap().accepted);

        let denied = Feedback::decision(&entry("Bo", "", true), false);
        assert_eq!(denied.state, FeedbackState::Negative);
        assert_eq!(denied.message.as_deref(), Some("Denied Bo"));
        let last = denied.last_handled.unwrap();
        assert_eq!(last.full_name, "Bo");
        assert!(last.is_blacklisted);
        assert!(!last.accepted);
    }

    #[tokio::test]
    async fn subscribers_see_changes_only() {
        let surface = StateSurface::new();
        let view = StateView::new(Arc::clone(&surface));
        let mut connection = view.subscribe_connection();
        let mut session = view.subscribe_session_id();

        surface.publish_connection(ConnectionState::Connecting);
        assert!(!connection.has_changed().unwrap());
        surface.publish_connection(ConnectionState::Connected);
        assert!(connection.has_changed().unwrap());
        assert_eq!(*connection.borrow_and_update(), ConnectionState::Connected);

        surface.publish_session_id("s-1");
        assert!(session.has_changed().unwrap());
        assert_eq!(*session.borrow_and_update(), "s-1");
        surface.publish_session_id("s-1");
        assert!(!session.has_changed().unwrap());
    }

    #[test]
    fn queue_snapshot_is_a_copy() {
        let surface = StateSurface::new();
        let view = StateView::new(Arc::clone(&surface));
        surface.publish_queue(&[entry("Ann", "Smith", false)]);
        let mut snapshot = view.queue();
        snapshot.clear();
        assert_eq!(view.queue().len(), 1);
        assert_eq!(view.head().unwrap().first_name, "Ann");
    }
}
