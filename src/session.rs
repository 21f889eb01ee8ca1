//! Session acquisition, retry, and stream liveness supervision.
//!
//! [`SessionManager`] is a pure state machine: it performs no I/O and reads
//! no clock. Every input carries the current time and every method returns
//! the [`SessionAction`]s the caller must carry out (start a session
//! request, arm or cancel the retry timer, replace the stream). The
//! [client](crate::client) actor is the only caller in production; tests
//! drive it with synthetic instants.
//!
//! ```text
//! Uninitialized ──start──▶ Acquiring ──ok──▶ Active ──stream lost──▶ Retrying
//!                              │                ▲                      │  ▲
//!                              └──err──▶ Retrying ─────────ok──────────┘  │
//!                                           └────────err (every interval)─┘
//! ```
//!
//! [`ConnectionState`] is derived, never set directly: it is recomputed from
//! the stream status and the time the last frame arrived. Entering
//! `Disconnected` starts the retry loop unless one is already running;
//! entering `Connected` stops it.
//!
//! Session requests are paced: two attempts are never closer than
//! `retry_interval`, whether they come from the retry timer or from a lost
//! stream. A backend that hands out sessions but refuses their streams is
//! asked at most once per interval.

use std::fmt;
use std::ops::Sub;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::GateClientError;

/// Default pause between session acquisition attempts while retrying.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(10);

/// Default silence after which an open stream counts as dead.
pub const DEFAULT_LIVENESS_TIMEOUT: Duration = Duration::from_secs(10);

// ── Public state ────────────────────────────────────────────────────

/// Lifecycle phase of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Uninitialized,
    /// First acquisition in flight.
    Acquiring,
    /// A session id is held and its stream is supervised.
    Active,
    /// The retry loop is running.
    Retrying,
}

/// Liveness of the event stream as seen by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

/// A server-issued session. Replaced wholesale on every acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session<I> {
    pub id: String,
    pub established_at: I,
}

/// Side effects requested by the [`SessionManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAction {
    /// Issue one session-creation request and report the result through
    /// [`SessionManager::acquisition_finished`].
    Acquire,
    /// Arm the retry timer; report expiry through
    /// [`SessionManager::retry_due`].
    ScheduleRetry(Duration),
    /// Disarm the retry timer.
    CancelRetry,
    /// Replace any running stream and liveness monitor with a new stream for
    /// `session_id`. Stream inputs must carry `generation`.
    OpenStream { session_id: String, generation: u64 },
    /// The derived connection state changed.
    ConnectionChanged(ConnectionState),
    /// A new session id was acquired.
    SessionEstablished(String),
}

/// Timing knobs of the [`SessionManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    pub retry_interval: Duration,
    pub liveness_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            retry_interval: DEFAULT_RETRY_INTERVAL,
            liveness_timeout: DEFAULT_LIVENESS_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamStatus<I> {
    Idle,
    Opening { since: I },
    Open { last_seen: I },
    Lost,
}

// ── State machine ───────────────────────────────────────────────────

/// Session lifecycle state machine.
///
/// Generic over the instant type so tests can use `std::time::Instant`
/// while the client uses `tokio::time::Instant` (and so paused tokio time).
#[derive(Debug)]
pub struct SessionManager<I = tokio::time::Instant> {
    config: SessionConfig,
    phase: SessionPhase,
    session: Option<Session<I>>,
    connection: ConnectionState,
    stream: StreamStatus<I>,
    /// Incremented on every `OpenStream`; stale stream inputs are ignored.
    generation: u64,
    /// The retry loop is running. At most one loop exists.
    retrying: bool,
    /// A session request is in flight. At most one request exists.
    acquiring: bool,
    /// When the last session request was issued.
    last_attempt: Option<I>,
}

impl<I> SessionManager<I>
where
    I: Copy + Sub<Output = Duration>,
{
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            phase: SessionPhase::Uninitialized,
            session: None,
            connection: ConnectionState::Disconnected,
            stream: StreamStatus::Idle,
            generation: 0,
            retrying: false,
            acquiring: false,
            last_attempt: None,
        }
    }

    /// Begin the first acquisition. A second call is a no-op.
    pub fn start(&mut self, now: I) -> Vec<SessionAction> {
        if self.phase != SessionPhase::Uninitialized {
            return Vec::new();
        }
        self.phase = SessionPhase::Acquiring;
        let mut actions = vec![self.acquire(now)];
        actions.extend(self.update_connection(now));
        actions
    }

    /// Report the outcome of a request started by [`SessionAction::Acquire`].
    ///
    /// Failures never escape: they are logged and routed into the retry loop.
    pub fn acquisition_finished(
        &mut self,
        result: Result<String, GateClientError>,
        now: I,
    ) -> Vec<SessionAction> {
        self.acquiring = false;
        match result {
            Ok(id) => self.established(id, now),
            Err(e) => {
                warn!(error = %e, retrying = self.retrying, "session acquisition failed");
                let mut actions = Vec::new();
                if !self.retrying {
                    self.retrying = true;
                    debug!("session retry loop started");
                }
                self.phase = SessionPhase::Retrying;
                actions.push(SessionAction::ScheduleRetry(self.config.retry_interval));
                actions.extend(self.update_connection(now));
                actions
            }
        }
    }

    /// The retry timer fired.
    pub fn retry_due(&mut self, now: I) -> Vec<SessionAction> {
        if !self.retrying {
            return Vec::new();
        }
        let mut actions = self.update_connection(now);
        if !self.retrying || self.acquiring {
            return actions;
        }
        if self.connection == ConnectionState::Connected {
            self.retrying = false;
            return actions;
        }
        if let Some(wait) = self.pacing_delay(now) {
            actions.push(SessionAction::ScheduleRetry(wait));
            return actions;
        }
        debug!("retrying session acquisition");
        actions.push(self.acquire(now));
        actions
    }

    /// The stream for `generation` has been accepted by the backend.
    pub fn stream_opened(&mut self, generation: u64, now: I) -> Vec<SessionAction> {
        if generation != self.generation {
            return Vec::new();
        }
        self.stream = StreamStatus::Open { last_seen: now };
        self.update_connection(now)
    }

    /// Any frame arrived on the stream for `generation`. Every frame counts
    /// as liveness evidence, heartbeat or not.
    pub fn frame_received(&mut self, generation: u64, now: I) -> Vec<SessionAction> {
        if generation != self.generation {
            return Vec::new();
        }
        self.stream = StreamStatus::Open { last_seen: now };
        self.update_connection(now)
    }

    /// The stream for `generation` ended, failed, or could not be opened.
    pub fn stream_ended(&mut self, generation: u64, now: I) -> Vec<SessionAction> {
        if generation != self.generation {
            return Vec::new();
        }
        self.stream = StreamStatus::Lost;
        self.update_connection(now)
    }

    /// Periodic liveness check.
    pub fn monitor_tick(&mut self, now: I) -> Vec<SessionAction> {
        let mut actions = self.update_connection(now);
        if self.connection == ConnectionState::Disconnected && !self.retrying {
            actions.extend(self.enter_retry(now));
        }
        actions
    }

    // ── Accessors ───────────────────────────────────────────────────

    pub fn connection_state(&self) -> ConnectionState {
        self.connection
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn session(&self) -> Option<&Session<I>> {
        self.session.as_ref()
    }

    /// Current session id, or `""` before the first acquisition.
    pub fn session_id(&self) -> &str {
        self.session.as_ref().map_or("", |s| s.id.as_str())
    }

    pub fn is_retrying(&self) -> bool {
        self.retrying
    }

    pub fn is_acquiring(&self) -> bool {
        self.acquiring
    }

    /// Generation of the current stream.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    // ── Internals ───────────────────────────────────────────────────

    fn established(&mut self, id: String, now: I) -> Vec<SessionAction> {
        info!(session_id = %id, "session established");
        let mut actions = Vec::new();
        if self.retrying {
            self.retrying = false;
            actions.push(SessionAction::CancelRetry);
        }
        self.phase = SessionPhase::Active;
        self.session = Some(Session {
            id: id.clone(),
            established_at: now,
        });
        self.generation = self.generation.wrapping_add(1);
        self.stream = StreamStatus::Opening { since: now };
        actions.push(SessionAction::SessionEstablished(id.clone()));
        actions.push(SessionAction::OpenStream {
            session_id: id,
            generation: self.generation,
        });
        actions.extend(self.update_connection(now));
        actions
    }

    /// Start the retry loop. The first attempt is immediate unless the last
    /// one was less than `retry_interval` ago, in which case the timer is
    /// armed for the remainder.
    fn enter_retry(&mut self, now: I) -> Vec<SessionAction> {
        if self.retrying {
            return Vec::new();
        }
        debug!("session retry loop started");
        self.retrying = true;
        self.phase = SessionPhase::Retrying;
        if self.acquiring {
            return Vec::new();
        }
        match self.pacing_delay(now) {
            Some(wait) => {
                debug!(?wait, "session request paced");
                vec![SessionAction::ScheduleRetry(wait)]
            }
            None => vec![self.acquire(now)],
        }
    }

    fn acquire(&mut self, now: I) -> SessionAction {
        self.acquiring = true;
        self.last_attempt = Some(now);
        SessionAction::Acquire
    }

    /// Time left before another session request may be issued.
    fn pacing_delay(&self, now: I) -> Option<Duration> {
        let last = self.last_attempt?;
        let elapsed = now - last;
        (elapsed < self.config.retry_interval).then(|| self.config.retry_interval - elapsed)
    }

    fn derive_connection(&self, now: I) -> ConnectionState {
        let timeout = self.config.liveness_timeout;
        match self.stream {
            StreamStatus::Idle => match self.phase {
                SessionPhase::Uninitialized | SessionPhase::Acquiring => {
                    ConnectionState::Connecting
                }
                SessionPhase::Active | SessionPhase::Retrying => ConnectionState::Disconnected,
            },
            StreamStatus::Opening { since } if now - since < timeout => {
                ConnectionState::Connecting
            }
            StreamStatus::Open { last_seen } if now - last_seen < timeout => {
                ConnectionState::Connected
            }
            StreamStatus::Opening { .. } | StreamStatus::Open { .. } | StreamStatus::Lost => {
                ConnectionState::Disconnected
            }
        }
    }

    fn update_connection(&mut self, now: I) -> Vec<SessionAction> {
        let derived = self.derive_connection(now);
        if derived == self.connection {
            return Vec::new();
        }
        debug!(from = %self.connection, to = %derived, "connection state changed");
        self.connection = derived;

        let mut actions = vec![SessionAction::ConnectionChanged(derived)];
        match derived {
            ConnectionState::Connected => {
                if self.retrying {
                    self.retrying = false;
                    actions.push(SessionAction::CancelRetry);
                }
                self.phase = SessionPhase::Active;
            }
            ConnectionState::Disconnected => actions.extend(self.enter_retry(now)),
            ConnectionState::Connecting => {}
        }
        actions
    }
}

impl<I> Default for SessionManager<I>
where
    I: Copy + Sub<Output = Duration>,
{
    fn default() -> Self {
        Self::new(SessionConfig::default())
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
    use std::time::Instant;

    const SECOND: Duration = Duration::from_secs(1);

    fn manager() -> SessionManager<Instant> {
        SessionManager::new(SessionConfig {
            retry_interval: 10 * SECOND,
            liveness_timeout: 10 * SECOND,
        })
    }

    fn failure() -> Result<String, GateClientError> {
        Err(GateClientError::TransportRequest("connection refused".into()))
    }

    fn open_stream(actions: &[SessionAction]) -> Option<(String, u64)> {
        actions.iter().find_map(|a| match a {
            SessionAction::OpenStream {
                session_id,
                generation,
            } => Some((session_id.clone(), *generation)),
            _ => None,
        })
    }

    /// Drive a manager to an open, connected stream.
    fn connected(t0: Instant) -> (SessionManager<Instant>, u64) {
        let mut m = manager();
        m.start(t0);
        let actions = m.acquisition_finished(Ok("s-1".into()), t0);
        let (_, generation) = open_stream(&actions).unwrap();
        m.stream_opened(generation, t0);
        (m, generation)
    }

    #[test]
    fn start_requests_acquisition_once() {
        let t0 = Instant::now();
        let mut m = manager();
        let actions = m.start(t0);
        assert_eq!(
            actions,
            vec![
                SessionAction::Acquire,
                SessionAction::ConnectionChanged(ConnectionState::Connecting)
            ]
        );
        assert_eq!(m.phase(), SessionPhase::Acquiring);
        assert!(m.start(t0).is_empty());
        assert_eq!(m.session_id(), "");
    }

    #[test]
    fn successful_acquisition_opens_stream() {
        let t0 = Instant::now();
        let mut m = manager();
        m.start(t0);
        let actions = m.acquisition_finished(Ok("s-1".into()), t0);
        assert_eq!(
            actions,
            vec![
                SessionAction::SessionEstablished("s-1".into()),
                SessionAction::OpenStream {
                    session_id: "s-1".into(),
                    generation: 1
                },
            ]
        );
        assert_eq!(m.phase(), SessionPhase::Active);
        assert_eq!(m.session_id(), "s-1");
        assert_eq!(m.session().unwrap().established_at, t0);
        assert_eq!(m.connection_state(), ConnectionState::Connecting);

        let actions = m.stream_opened(1, t0);
        assert_eq!(
            actions,
            vec![SessionAction::ConnectionChanged(ConnectionState::Connected)]
        );
    }

    #[test]
    fn failed_acquisition_enters_retry_loop() {
        let t0 = Instant::now();
        let mut m = manager();
        m.start(t0);
        let actions = m.acquisition_finished(failure(), t0);
        assert_eq!(
            actions,
            vec![
                SessionAction::ScheduleRetry(10 * SECOND),
                SessionAction::ConnectionChanged(ConnectionState::Disconnected),
            ]
        );
        assert_eq!(m.phase(), SessionPhase::Retrying);
        assert!(m.is_retrying());
        assert!(!m.is_acquiring());
    }

    #[test]
    fn retry_converges_after_repeated_failures() {
        let t0 = Instant::now();
        let mut m = manager();
        m.start(t0);
        m.acquisition_finished(failure(), t0);

        let mut now = t0;
        for _ in 0..5 {
            now += 10 * SECOND;
            assert_eq!(m.retry_due(now), vec![SessionAction::Acquire]);
            assert_eq!(
                m.acquisition_finished(failure(), now),
                vec![SessionAction::ScheduleRetry(10 * SECOND)]
            );
            assert!(m.is_retrying());
        }

        now += 10 * SECOND;
        assert_eq!(m.retry_due(now), vec![SessionAction::Acquire]);
        let actions = m.acquisition_finished(Ok("s-ok".into()), now);
        assert_eq!(actions.first(), Some(&SessionAction::CancelRetry));
        assert_eq!(open_stream(&actions), Some(("s-ok".into(), 1)));
        assert!(actions.contains(&SessionAction::ConnectionChanged(
            ConnectionState::Connecting
        )));
        assert_eq!(m.phase(), SessionPhase::Active);
        assert!(!m.is_retrying());
        assert!(!m.is_acquiring());
        assert_eq!(m.generation(), 1);
    }

    #[test]
    fn retry_timer_does_not_overlap_in_flight_request() {
        let t0 = Instant::now();
        let mut m = manager();
        m.start(t0);
        m.acquisition_finished(failure(), t0);
        assert_eq!(m.retry_due(t0 + 10 * SECOND), vec![SessionAction::Acquire]);
        assert!(m.retry_due(t0 + 20 * SECOND).is_empty());
    }

    #[test]
    fn stale_retry_timer_is_ignored() {
        let t0 = Instant::now();
        let (mut m, _) = connected(t0);
        assert!(m.retry_due(t0 + SECOND).is_empty());
    }

    #[test]
    fn stream_loss_starts_immediate_retry() {
        let t0 = Instant::now();
        let (mut m, generation) = connected(t0);
        let actions = m.stream_ended(generation, t0 + 30 * SECOND);
        assert_eq!(
            actions,
            vec![
                SessionAction::ConnectionChanged(ConnectionState::Disconnected),
                SessionAction::Acquire,
            ]
        );
        assert_eq!(m.phase(), SessionPhase::Retrying);
        assert!(m.is_retrying());

        let actions = m.acquisition_finished(Ok("s-2".into()), t0 + 31 * SECOND);
        assert_eq!(open_stream(&actions), Some(("s-2".into(), 2)));
        assert_eq!(m.session_id(), "s-2");
    }

    #[test]
    fn early_stream_loss_waits_out_the_retry_interval() {
        let t0 = Instant::now();
        let (mut m, generation) = connected(t0);
        let actions = m.stream_ended(generation, t0 + 3 * SECOND);
        assert_eq!(
            actions,
            vec![
                SessionAction::ConnectionChanged(ConnectionState::Disconnected),
                SessionAction::ScheduleRetry(7 * SECOND),
            ]
        );
        assert!(m.is_retrying());
        assert!(!m.is_acquiring());
        assert_eq!(m.retry_due(t0 + 10 * SECOND), vec![SessionAction::Acquire]);
    }

    #[test]
    fn refused_streams_pace_session_requests() {
        let t0 = Instant::now();
        let mut m = manager();
        m.start(t0);

        // Every session is granted, every stream is refused at once.
        let mut now = t0;
        let mut requests: u64 = 1;
        let mut timer: Option<Instant> = None;
        for _ in 0..200 {
            let actions = if m.is_acquiring() {
                let actions = m.acquisition_finished(Ok(format!("s-{requests}")), now);
                let (_, generation) = open_stream(&actions).unwrap();
                m.stream_ended(generation, now)
            } else {
                now = timer.take().unwrap();
                m.retry_due(now)
            };
            for action in actions {
                match action {
                    SessionAction::Acquire => requests += 1,
                    SessionAction::ScheduleRetry(wait) => timer = Some(now + wait),
                    _ => {}
                }
            }
            now += Duration::from_millis(1);
        }

        let elapsed = now - t0;
        let bound = elapsed.as_secs() / 10 + 1;
        assert!(requests <= bound, "{requests} requests in {elapsed:?}");
        assert!(requests > 1);
    }

    #[test]
    fn stale_generation_inputs_are_ignored() {
        let t0 = Instant::now();
        let (mut m, generation) = connected(t0);
        m.stream_ended(generation, t0 + SECOND);
        m.acquisition_finished(Ok("s-2".into()), t0 + SECOND);
        assert_eq!(m.generation(), generation + 1);

        assert!(m.stream_ended(generation, t0 + 2 * SECOND).is_empty());
        assert!(m.frame_received(generation, t0 + 2 * SECOND).is_empty());
        assert!(m.stream_opened(generation, t0 + 2 * SECOND).is_empty());
        assert_eq!(m.connection_state(), ConnectionState::Connecting);
    }

    #[test]
    fn silence_past_liveness_timeout_disconnects() {
        let t0 = Instant::now();
        let (mut m, _) = connected(t0);
        assert!(m.monitor_tick(t0 + 5 * SECOND).is_empty());
        let actions = m.monitor_tick(t0 + 10 * SECOND);
        assert_eq!(
            actions,
            vec![
                SessionAction::ConnectionChanged(ConnectionState::Disconnected),
                SessionAction::Acquire,
            ]
        );
        // Subsequent ticks do not start a second loop.
        assert!(m.monitor_tick(t0 + 15 * SECOND).is_empty());
    }

    #[test]
    fn frames_keep_the_connection_alive() {
        let t0 = Instant::now();
        let (mut m, generation) = connected(t0);
        for step in 1..=5 {
            let now = t0 + step * 6 * SECOND;
            assert!(m.frame_received(generation, now).is_empty());
            assert!(m.monitor_tick(now).is_empty());
        }
        assert_eq!(m.connection_state(), ConnectionState::Connected);
    }

    #[test]
    fn stream_that_never_opens_times_out() {
        let t0 = Instant::now();
        let mut m = manager();
        m.start(t0);
        m.acquisition_finished(Ok("s-1".into()), t0);
        assert!(m.monitor_tick(t0 + 9 * SECOND).is_empty());
        let actions = m.monitor_tick(t0 + 10 * SECOND);
        assert!(actions.contains(&SessionAction::Acquire));
        assert_eq!(m.connection_state(), ConnectionState::Disconnected);
    }

    #[test]
    fn reconnect_while_retrying_cancels_retry() {
        let t0 = Instant::now();
        let (mut m, generation) = connected(t0);
        m.stream_ended(generation, t0);
        // Acquisition fails once, then the next attempt succeeds.
        m.acquisition_finished(failure(), t0);
        m.retry_due(t0 + 10 * SECOND);
        let actions = m.acquisition_finished(Ok("s-3".into()), t0 + 10 * SECOND);
        assert_eq!(actions.first(), Some(&SessionAction::CancelRetry));
        let (_, generation) = open_stream(&actions).unwrap();
        let actions = m.stream_opened(generation, t0 + 11 * SECOND);
        assert_eq!(
            actions,
            vec![SessionAction::ConnectionChanged(ConnectionState::Connected)]
        );
        assert!(!m.is_retrying());
    }
}
