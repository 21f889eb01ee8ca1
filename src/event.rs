//! Events emitted by the [`GateClient`](crate::client::GateClient) to the host.
//!
//! Events are delivered on the bounded channel returned by
//! [`GateClient::start`](crate::client::GateClient::start). Delivery is
//! fire-and-forget: when the host falls behind, events are dropped with a
//! warning rather than stalling the client. [`GateEvent::Stopped`] is the
//! exception and is always delivered last.
//!
//! Events describe *changes*. The current values (queue, connection, feedback)
//! are always available from the [`StateView`](crate::state::StateView).

use crate::protocol::PlayerId;
use crate::session::ConnectionState;

/// An event emitted by the gate client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateEvent {
    /// A new session id was acquired (first time or after a retry).
    SessionEstablished { session_id: String },

    /// The backend accepted the event stream for the current session.
    StreamOpened,

    /// The derived connection state changed.
    ConnectionChanged(ConnectionState),

    /// A player was added to the queue. Intended for local notifications;
    /// duplicates and filtered arrivals never produce this event.
    PlayerWaiting {
        player_id: PlayerId,
        display_name: String,
    },

    /// The backend acknowledged an access decision.
    DecisionCompleted {
        player_id: PlayerId,
        position: String,
        granted: bool,
    },

    /// An access decision was not acknowledged. The queue is unchanged and
    /// the decision is not retried.
    DecisionFailed {
        player_id: PlayerId,
        position: String,
        granted: bool,
        /// HTTP status, when the backend answered at all.
        status: Option<u16>,
        reason: String,
    },

    /// The client stopped. Always the last event on the channel.
    Stopped,
}
