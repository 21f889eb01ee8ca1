//! Async gate client.
//!
//! [`GateClient`] is a thin handle to a background actor task. The actor is
//! the only owner of the session state machine, the player queue, and the
//! gate-state records, and it handles one message at a time: stream frames,
//! operator decisions, and timer expiries are all serialized through its
//! mailbox. Network round-trips and timers run in helper tasks that post
//! their results back into that mailbox, so nothing blocks event processing.
//!
//! State is observed through a [`StateView`]; changes are also announced as
//! [`GateEvent`]s on a bounded channel returned from [`GateClient::start`].
//!
//! # Example
//!
//! ```rust,no_run
//! use waggle_gate_client::{GateClient, GateClientConfig, GateEvent};
//! use waggle_gate_client::{HttpTransport, HttpTransportConfig};
//!
//! # async fn run() -> Result<(), waggle_gate_client::GateClientError> {
//! let transport = HttpTransport::new(HttpTransportConfig::new("http://10.0.0.5:5050"))?;
//! let (mut client, mut events) = GateClient::start(transport, GateClientConfig::new());
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         GateEvent::PlayerWaiting { display_name, .. } => {
//!             println!("{display_name} is waiting");
//!             client.accept_head()?;
//!         }
//!         GateEvent::Stopped => break,
//!         _ => {}
//!     }
//! }
//! client.shutdown().await;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::decoder::{self, PlayerArrival, StreamEvent};
use crate::error::{GateClientError, Result};
use crate::event::GateEvent;
use crate::protocol::{AccessDecision, PlayerId};
use crate::queue::{GateUpdate, PlayerEntry, PlayerQueue};
use crate::session::{
    ConnectionState, SessionAction, SessionConfig, SessionManager, DEFAULT_LIVENESS_TIMEOUT,
    DEFAULT_RETRY_INTERVAL,
};
use crate::state::{Feedback, StateSurface, StateView};
use crate::transport::{EventStream, Transport};

/// Default capacity of the bounded event channel.
const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 256;

/// Default timeout for the graceful shutdown.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_ACCEPT_DWELL: Duration = Duration::from_secs(3);
const DEFAULT_DENY_DWELL: Duration = Duration::from_secs(5);

/// Shortest period the liveness monitor will tick at.
const MIN_MONITOR_INTERVAL: Duration = Duration::from_millis(1);

// ── Configuration ───────────────────────────────────────────────────

/// Configuration for a [`GateClient`].
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use waggle_gate_client::GateClientConfig;
///
/// let config = GateClientConfig::new()
///     .with_retry_interval(Duration::from_secs(3))
///     .with_event_channel_capacity(64);
/// assert_eq!(config.retry_interval, Duration::from_secs(3));
/// assert_eq!(config.liveness_timeout, Duration::from_secs(10));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateClientConfig {
    /// Pause between session acquisition attempts while retrying.
    ///
    /// Defaults to **10 seconds**.
    pub retry_interval: Duration,
    /// Period of the liveness check.
    ///
    /// Defaults to **5 seconds**.
    pub monitor_interval: Duration,
    /// Silence on the event stream after which the connection counts as
    /// lost. Any frame resets it, heartbeat or not.
    ///
    /// Defaults to **10 seconds**.
    pub liveness_timeout: Duration,
    /// How long positive feedback stays up after an accept.
    ///
    /// Defaults to **3 seconds**.
    pub accept_dwell: Duration,
    /// How long negative feedback (deny, failure, blacklist warning) stays
    /// up.
    ///
    /// Defaults to **5 seconds**.
    pub deny_dwell: Duration,
    /// Capacity of the bounded event channel.
    ///
    /// When the host cannot keep up, events are dropped (with a warning
    /// logged) instead of stalling the client. [`GateEvent::Stopped`] is
    /// always delivered.
    ///
    /// Defaults to **256**. Values below 1 are clamped to 1.
    pub event_channel_capacity: usize,
    /// Timeout for the graceful shutdown.
    ///
    /// Defaults to **1 second**. A zero timeout aborts the actor immediately.
    pub shutdown_timeout: Duration,
}

impl GateClientConfig {
    pub fn new() -> Self {
        Self {
            retry_interval: DEFAULT_RETRY_INTERVAL,
            monitor_interval: DEFAULT_MONITOR_INTERVAL,
            liveness_timeout: DEFAULT_LIVENESS_TIMEOUT,
            accept_dwell: DEFAULT_ACCEPT_DWELL,
            deny_dwell: DEFAULT_DENY_DWELL,
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    #[must_use]
    pub fn with_monitor_interval(mut self, interval: Duration) -> Self {
        self.monitor_interval = interval;
        self
    }

    #[must_use]
    pub fn with_liveness_timeout(mut self, timeout: Duration) -> Self {
        self.liveness_timeout = timeout;
        self
    }

    /// Set both feedback dwell times.
    #[must_use]
    pub fn with_feedback_dwell(mut self, accept: Duration, deny: Duration) -> Self {
        self.accept_dwell = accept;
        self.deny_dwell = deny;
        self
    }

    /// Set the capacity of the bounded event channel. Values below 1 are
    /// clamped to 1.
    #[must_use]
    pub fn with_event_channel_capacity(mut self, capacity: usize) -> Self {
        self.event_channel_capacity = capacity.max(1);
        self
    }

    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    fn session_config(&self) -> SessionConfig {
        SessionConfig {
            retry_interval: self.retry_interval,
            liveness_timeout: self.liveness_timeout,
        }
    }
}

impl Default for GateClientConfig {
    fn default() -> Self {
        Self::new()
    }
}

// ── Client handle ───────────────────────────────────────────────────

/// Operator intents sent from the handle to the actor.
#[derive(Debug)]
enum Command {
    Decide {
        granted: bool,
        /// Only act if the head still has this id.
        expected: Option<PlayerId>,
    },
}

/// Handle to a running gate client.
///
/// Created via [`GateClient::start`]. Decision methods queue a command for
/// the actor and return immediately; the outcome arrives as a
/// [`GateEvent`] and as a change of the [`StateView`] feedback.
pub struct GateClient {
    cmd_tx: mpsc::UnboundedSender<Command>,
    state: StateView,
    task: Option<JoinHandle<()>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    shutdown_timeout: Duration,
}

impl GateClient {
    /// Spawn the client actor and begin acquiring a session.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Returns
    ///
    /// A tuple of `(client_handle, event_receiver)`. The receiver yields
    /// [`GateEvent`]s until [`GateEvent::Stopped`].
    #[must_use = "the event receiver must be used to receive events"]
    pub fn start(
        transport: impl Transport,
        config: GateClientConfig,
    ) -> (Self, mpsc::Receiver<GateEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<Command>();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel::<Internal>();
        // tokio panics on a zero capacity.
        let capacity = config.event_channel_capacity.max(1);
        let (event_tx, event_rx) = mpsc::channel::<GateEvent>(capacity);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let surface = StateSurface::new();
        let state = StateView::new(Arc::clone(&surface));
        let shutdown_timeout = config.shutdown_timeout;

        let actor = GateActor {
            transport: Arc::new(transport),
            session: SessionManager::new(config.session_config()),
            queue: PlayerQueue::new(),
            config,
            surface,
            event_tx,
            internal_tx,
            stream: None,
            monitor: None,
            retry_timer: None,
            retry_token: 0,
            acquisition: None,
            decision: None,
            feedback_timer: None,
            feedback_token: 0,
        };
        let task = tokio::spawn(actor.run(cmd_rx, internal_rx, shutdown_rx));

        let client = Self {
            cmd_tx,
            state,
            task: Some(task),
            shutdown_tx: Some(shutdown_tx),
            shutdown_timeout,
        };
        (client, event_rx)
    }

    // ── Decisions ───────────────────────────────────────────────────

    /// Grant access to whoever is at the head of the queue.
    ///
    /// A no-op when the queue is empty, no session is held yet, or another
    /// decision is still in flight.
    ///
    /// # Errors
    ///
    /// Returns [`GateClientError::NotRunning`] after shutdown.
    pub fn accept_head(&self) -> Result<()> {
        self.send(Command::Decide {
            granted: true,
            expected: None,
        })
    }

    /// Deny access to whoever is at the head of the queue.
    ///
    /// # Errors
    ///
    /// Returns [`GateClientError::NotRunning`] after shutdown.
    pub fn deny_head(&self) -> Result<()> {
        self.send(Command::Decide {
            granted: false,
            expected: None,
        })
    }

    /// Grant access to `player_id`, but only if that player is still at the
    /// head of the queue when the actor handles the command.
    ///
    /// Use this from a UI that shows the head entry: if a gate event
    /// removed the player the operator was looking at, nothing is sent.
    ///
    /// # Errors
    ///
    /// Returns [`GateClientError::NotRunning`] after shutdown.
    pub fn accept(&self, player_id: PlayerId) -> Result<()> {
        self.send(Command::Decide {
            granted: true,
            expected: Some(player_id),
        })
    }

    /// Deny access to `player_id` if it is still at the head of the queue.
    ///
    /// # Errors
    ///
    /// Returns [`GateClientError::NotRunning`] after shutdown.
    pub fn deny(&self, player_id: PlayerId) -> Result<()> {
        self.send(Command::Decide {
            granted: false,
            expected: Some(player_id),
        })
    }

    // ── State ───────────────────────────────────────────────────────

    /// Read-only view of session, connection, queue, and feedback.
    pub fn state(&self) -> StateView {
        self.state.clone()
    }

    /// Returns `true` until [`shutdown`](Self::shutdown) has been called.
    pub fn is_running(&self) -> bool {
        self.task.is_some()
    }

    /// Stop the client: close the stream, cancel timers, and end the actor.
    ///
    /// The event receiver yields [`GateEvent::Stopped`] and then `None`.
    /// Calling it twice is a no-op.
    pub async fn shutdown(&mut self) {
        debug!("GateClient: shutdown requested");

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        if let Some(mut task) = self.task.take() {
            match tokio::time::timeout(self.shutdown_timeout, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(join_err)) => {
                    warn!("client actor terminated with join error: {join_err}");
                }
                Err(_) => {
                    warn!("client actor did not exit within timeout; aborting task");
                    task.abort();
                    if let Err(join_err) = task.await {
                        debug!("client actor aborted: {join_err}");
                    }
                }
            }
        }
    }

    fn send(&self, cmd: Command) -> Result<()> {
        if self.task.is_none() {
            return Err(GateClientError::NotRunning);
        }
        self.cmd_tx
            .send(cmd)
            .map_err(|_| GateClientError::NotRunning)
    }
}

impl std::fmt::Debug for GateClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GateClient")
            .field("connection", &self.state.connection())
            .field("session_id", &self.state.session_id())
            .field("running", &self.is_running())
            .finish()
    }
}

impl Drop for GateClient {
    fn drop(&mut self) {
        // No executor is available to drive a graceful close here. Aborting
        // drops the actor, which drops the stream worker's stop signal.
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// ── Actor ───────────────────────────────────────────────────────────

/// Results posted back to the actor by its helper tasks.
#[derive(Debug)]
enum Internal {
    SessionResult(std::result::Result<String, GateClientError>),
    RetryDue {
        token: u64,
    },
    StreamOpened {
        generation: u64,
    },
    StreamFrame {
        generation: u64,
        text: String,
    },
    StreamEnded {
        generation: u64,
        reason: Option<String>,
    },
    MonitorTick,
    DecisionFinished {
        entry: PlayerEntry,
        granted: bool,
        result: std::result::Result<u16, GateClientError>,
    },
    FeedbackExpired {
        token: u64,
    },
}

/// A running stream consumer.
struct StreamWorker {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl StreamWorker {
    /// Ask the worker to close its stream and exit, without waiting.
    fn cancel(self) {
        let _ = self.stop.send(());
    }

    /// Ask the worker to close its stream and wait until it has. If the
    /// wait is cancelled (the actor was aborted) the worker is aborted too,
    /// so a stream stuck in `close()` is still dropped.
    async fn stop(self) {
        let _ = self.stop.send(());
        let _guard = AbortOnDrop(self.task.abort_handle());
        if let Err(join_err) = self.task.await {
            debug!("stream worker ended with join error: {join_err}");
        }
    }
}

struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

struct GateActor {
    transport: Arc<dyn Transport>,
    config: GateClientConfig,
    session: SessionManager,
    queue: PlayerQueue,
    surface: Arc<StateSurface>,
    event_tx: mpsc::Sender<GateEvent>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    stream: Option<StreamWorker>,
    monitor: Option<JoinHandle<()>>,
    retry_timer: Option<JoinHandle<()>>,
    retry_token: u64,
    acquisition: Option<JoinHandle<()>>,
    /// In-flight access decision. At most one at a time.
    decision: Option<JoinHandle<()>>,
    feedback_timer: Option<JoinHandle<()>>,
    feedback_token: u64,
}

impl GateActor {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<Command>,
        mut internal_rx: mpsc::UnboundedReceiver<Internal>,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) {
        debug!("client actor started");
        let actions = self.session.start(Instant::now());
        self.apply(actions);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => self.on_command(cmd),
                    None => {
                        debug!("command channel closed, stopping client actor");
                        break;
                    }
                },

                _ = &mut shutdown_rx => {
                    debug!("shutdown signal received");
                    break;
                }

                // The actor holds a sender, so this never yields `None`.
                Some(msg) = internal_rx.recv() => self.on_internal(msg),
            }
        }

        self.teardown().await;
        debug!("client actor exited");
    }

    // ── Dispatch ────────────────────────────────────────────────────

    fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Decide { granted, expected } => self.decide(granted, expected),
        }
    }

    fn on_internal(&mut self, msg: Internal) {
        match msg {
            Internal::SessionResult(result) => {
                self.acquisition = None;
                let actions = self.session.acquisition_finished(result, Instant::now());
                self.apply(actions);
            }
            Internal::RetryDue { token } => {
                if token != self.retry_token {
                    trace!(token, "stale retry timer ignored");
                    return;
                }
                self.retry_timer = None;
                let actions = self.session.retry_due(Instant::now());
                self.apply(actions);
            }
            Internal::StreamOpened { generation } => {
                if generation == self.session.generation() {
                    info!(generation, "event stream opened");
                    self.emit(GateEvent::StreamOpened);
                }
                let actions = self.session.stream_opened(generation, Instant::now());
                self.apply(actions);
            }
            Internal::StreamFrame { generation, text } => {
                if generation != self.session.generation() {
                    trace!(generation, "frame from replaced stream dropped");
                    return;
                }
                let actions = self.session.frame_received(generation, Instant::now());
                self.apply(actions);
                self.on_frame(&text);
            }
            Internal::StreamEnded { generation, reason } => {
                if generation == self.session.generation() {
                    match &reason {
                        Some(reason) => warn!(generation, %reason, "event stream failed"),
                        None => info!(generation, "event stream closed by server"),
                    }
                }
                let actions = self.session.stream_ended(generation, Instant::now());
                self.apply(actions);
            }
            Internal::MonitorTick => {
                let actions = self.session.monitor_tick(Instant::now());
                self.apply(actions);
            }
            Internal::DecisionFinished {
                entry,
                granted,
                result,
            } => {
                self.decision = None;
                self.decision_finished(entry, granted, result);
            }
            Internal::FeedbackExpired { token } => {
                if token == self.feedback_token {
                    self.feedback_timer = None;
                    self.surface.publish_feedback(Feedback::neutral());
                }
            }
        }
    }

    fn apply(&mut self, actions: Vec<SessionAction>) {
        for action in actions {
            match action {
                SessionAction::Acquire => self.spawn_acquisition(),
                SessionAction::ScheduleRetry(delay) => self.arm_retry(delay),
                SessionAction::CancelRetry => self.disarm_retry(),
                SessionAction::OpenStream {
                    session_id,
                    generation,
                } => self.replace_stream(session_id, generation),
                SessionAction::ConnectionChanged(state) => {
                    self.surface.publish_connection(state);
                    self.emit(GateEvent::ConnectionChanged(state));
                }
                SessionAction::SessionEstablished(session_id) => {
                    self.surface.publish_session_id(&session_id);
                    self.emit(GateEvent::SessionEstablished { session_id });
                }
            }
        }
    }

    // ── Stream events ───────────────────────────────────────────────

    fn on_frame(&mut self, text: &str) {
        match decoder::decode(text) {
            Ok(StreamEvent::PlayerData(arrival)) => self.on_player(arrival),
            Ok(StreamEvent::GateArray(updates)) => self.on_gates(&updates),
            Ok(StreamEvent::Heartbeat) => trace!("heartbeat"),
            Ok(StreamEvent::Unrecognized) => trace!("unrecognized event ignored"),
            Err(e) => warn!(error = %e, "dropping undecodable event"),
        }
    }

    fn on_player(&mut self, arrival: PlayerArrival) {
        if !arrival.is_gate_arrival() {
            trace!(kind = %arrival.kind, has_data = arrival.has_data, "player event filtered");
            return;
        }
        let entry = arrival.entry;
        let player_id = entry.player_id;
        let display_name = entry.display_name();
        let blacklisted = entry.is_blacklisted;
        let position = entry.position.clone();

        if !self.queue.enqueue(entry) {
            return;
        }
        debug!(player_id, %position, blacklisted, "player queued");
        self.surface.publish_queue(self.queue.entries());
        self.emit(GateEvent::PlayerWaiting {
            player_id,
            display_name,
        });
        if blacklisted {
            self.show_feedback(Feedback::blacklisted(), self.config.deny_dwell);
        }
    }

    fn on_gates(&mut self, updates: &[GateUpdate]) {
        let outcome = self.queue.apply_gate_updates(updates);
        if outcome.changed_queue() {
            self.surface.publish_queue(self.queue.entries());
        }
    }

    // ── Decisions ───────────────────────────────────────────────────

    fn decide(&mut self, granted: bool, expected: Option<PlayerId>) {
        let session_id = self.session.session_id().to_string();
        if session_id.is_empty() {
            debug!("decision ignored: no session");
            return;
        }
        let Some(head) = self.queue.head() else {
            debug!("decision ignored: queue is empty");
            return;
        };
        if let Some(expected) = expected {
            if head.player_id != expected {
                debug!(
                    expected,
                    head = head.player_id,
                    "decision ignored: head changed"
                );
                return;
            }
        }
        if self.decision.is_some() {
            debug!("decision ignored: another decision is in flight");
            return;
        }

        let entry = head.clone();
        debug!(
            player_id = entry.player_id,
            position = %entry.position,
            granted,
            "sending access decision"
        );
        let transport = Arc::clone(&self.transport);
        let tx = self.internal_tx.clone();
        self.decision = Some(tokio::spawn(async move {
            let decision = AccessDecision::new(entry.position.clone(), granted);
            let result = transport
                .send_access_decision(&session_id, &decision)
                .await;
            let _ = tx.send(Internal::DecisionFinished {
                entry,
                granted,
                result,
            });
        }));
    }

    fn decision_finished(
        &mut self,
        entry: PlayerEntry,
        granted: bool,
        result: std::result::Result<u16, GateClientError>,
    ) {
        let verb = if granted { "accept" } else { "deny" };
        let (status, reason, message) = match result {
            Ok(status) if (200..300).contains(&status) => {
                let removed = self.queue.remove_by_position(&entry.position);
                if !removed.is_empty() {
                    self.surface.publish_queue(self.queue.entries());
                }
                let dwell = if granted {
                    self.config.accept_dwell
                } else {
                    self.config.deny_dwell
                };
                info!(
                    player_id = entry.player_id,
                    position = %entry.position,
                    granted,
                    "access decision acknowledged"
                );
                self.show_feedback(Feedback::decision(&entry, granted), dwell);
                self.emit(GateEvent::DecisionCompleted {
                    player_id: entry.player_id,
                    position: entry.position,
                    granted,
                });
                return;
            }
            Ok(status) => (
                Some(status),
                format!("server responded with HTTP {status}"),
                format!("Failed to {verb}: HTTP {status}"),
            ),
            Err(e) => {
                let noun = if granted { "acceptance" } else { "denial" };
                (None, e.to_string(), format!("Error sending {noun}"))
            }
        };

        warn!(
            player_id = entry.player_id,
            position = %entry.position,
            granted,
            %reason,
            "access decision failed"
        );
        self.show_feedback(Feedback::negative(message), self.config.deny_dwell);
        self.emit(GateEvent::DecisionFailed {
            player_id: entry.player_id,
            position: entry.position,
            granted,
            status,
            reason,
        });
    }

    // ── Helper tasks ────────────────────────────────────────────────

    fn spawn_acquisition(&mut self) {
        let transport = Arc::clone(&self.transport);
        let tx = self.internal_tx.clone();
        self.acquisition = Some(tokio::spawn(async move {
            let result = transport.create_session().await;
            let _ = tx.send(Internal::SessionResult(result));
        }));
    }

    fn arm_retry(&mut self, delay: Duration) {
        self.disarm_retry();
        let token = self.retry_token;
        let tx = self.internal_tx.clone();
        self.retry_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Internal::RetryDue { token });
        }));
    }

    fn disarm_retry(&mut self) {
        self.retry_token = self.retry_token.wrapping_add(1);
        if let Some(timer) = self.retry_timer.take() {
            timer.abort();
        }
    }

    /// Cancel the current stream consumer and liveness monitor, then start
    /// fresh ones for `generation`.
    fn replace_stream(&mut self, session_id: String, generation: u64) {
        if let Some(previous) = self.stream.take() {
            previous.cancel();
        }
        if let Some(previous) = self.monitor.take() {
            previous.abort();
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(stream_worker(
            Arc::clone(&self.transport),
            session_id,
            generation,
            self.internal_tx.clone(),
            stop_rx,
        ));
        self.stream = Some(StreamWorker {
            stop: stop_tx,
            task,
        });
        self.monitor = Some(tokio::spawn(monitor_loop(
            self.config.monitor_interval,
            self.internal_tx.clone(),
        )));
    }

    fn show_feedback(&mut self, feedback: Feedback, dwell: Duration) {
        self.feedback_token = self.feedback_token.wrapping_add(1);
        if let Some(timer) = self.feedback_timer.take() {
            timer.abort();
        }
        self.surface.publish_feedback(feedback);

        let token = self.feedback_token;
        let tx = self.internal_tx.clone();
        self.feedback_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(dwell).await;
            let _ = tx.send(Internal::FeedbackExpired { token });
        }));
    }

    fn emit(&self, event: GateEvent) {
        emit_event(&self.event_tx, event);
    }

    async fn teardown(&mut self) {
        for task in [
            self.monitor.take(),
            self.retry_timer.take(),
            self.acquisition.take(),
            self.decision.take(),
            self.feedback_timer.take(),
        ]
        .into_iter()
        .flatten()
        {
            task.abort();
        }
        if let Some(worker) = self.stream.take() {
            worker.stop().await;
        }

        self.surface.publish_connection(ConnectionState::Disconnected);
        // Always delivered, and always last.
        if self.event_tx.send(GateEvent::Stopped).await.is_err() {
            debug!("event channel closed, receiver dropped");
        }
    }
}

// ── Helper task bodies ──────────────────────────────────────────────

/// Open the stream for one session and forward its frames until it ends or
/// `stop` fires. The stream is closed on every exit path that opened it.
async fn stream_worker(
    transport: Arc<dyn Transport>,
    session_id: String,
    generation: u64,
    tx: mpsc::UnboundedSender<Internal>,
    mut stop: oneshot::Receiver<()>,
) {
    let opened = tokio::select! {
        result = transport.open_stream(&session_id) => result,
        _ = &mut stop => return,
    };
    let mut stream: Box<dyn EventStream> = match opened {
        Ok(stream) => stream,
        Err(e) => {
            let _ = tx.send(Internal::StreamEnded {
                generation,
                reason: Some(format!("could not open stream: {e}")),
            });
            return;
        }
    };

    if tx.send(Internal::StreamOpened { generation }).is_ok() {
        loop {
            tokio::select! {
                // Also fires when the actor drops the worker handle.
                _ = &mut stop => break,

                incoming = stream.recv() => match incoming {
                    Some(Ok(text)) => {
                        if tx.send(Internal::StreamFrame { generation, text }).is_err() {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        let _ = tx.send(Internal::StreamEnded {
                            generation,
                            reason: Some(e.to_string()),
                        });
                        break;
                    }
                    None => {
                        let _ = tx.send(Internal::StreamEnded {
                            generation,
                            reason: None,
                        });
                        break;
                    }
                },
            }
        }
    }

    if let Err(e) = stream.close().await {
        debug!(generation, error = %e, "error while closing event stream");
    }
}

/// Post a [`Internal::MonitorTick`] every `period`, starting one period from
/// now. Exits once the actor is gone.
async fn monitor_loop(period: Duration, tx: mpsc::UnboundedSender<Internal>) {
    let period = period.max(MIN_MONITOR_INTERVAL);
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if tx.send(Internal::MonitorTick).is_err() {
            break;
        }
    }
}

/// Emit an event to the host. If the channel is full, log a warning and drop
/// the event so the actor never blocks on a slow consumer.
fn emit_event(event_tx: &mpsc::Sender<GateEvent>, event: GateEvent) {
    match event_tx.try_send(event) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(dropped)) => {
            warn!("event channel full, dropping event: {dropped:?}");
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            trace!("event channel closed, receiver dropped");
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Transport whose session request never succeeds.
    struct RefusingTransport {
        attempts: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Transport for RefusingTransport {
        async fn create_session(&self) -> std::result::Result<String, GateClientError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(GateClientError::TransportRequest("refused".into()))
        }

        async fn open_stream(
            &self,
            _session_id: &str,
        ) -> std::result::Result<Box<dyn EventStream>, GateClientError> {
            unimplemented!("never reached without a session")
        }

        async fn send_access_decision(
            &self,
            _session_id: &str,
            _decision: &AccessDecision,
        ) -> std::result::Result<u16, GateClientError> {
            unimplemented!("never reached without a session")
        }
    }

    /// Stream that never yields and hangs forever in `close()`.
    struct HangingStream {
        dropped: Arc<AtomicBool>,
    }

    impl Drop for HangingStream {
        fn drop(&mut self) {
            self.dropped.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl EventStream for HangingStream {
        async fn recv(&mut self) -> Option<std::result::Result<String, GateClientError>> {
            std::future::pending().await
        }

        async fn close(&mut self) -> std::result::Result<(), GateClientError> {
            std::future::pending().await
        }
    }

    struct HangingTransport {
        dropped: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Transport for HangingTransport {
        async fn create_session(&self) -> std::result::Result<String, GateClientError> {
            Ok("s-1".into())
        }

        async fn open_stream(
            &self,
            _session_id: &str,
        ) -> std::result::Result<Box<dyn EventStream>, GateClientError> {
            Ok(Box::new(HangingStream {
                dropped: Arc::clone(&self.dropped),
            }))
        }

        async fn send_access_decision(
            &self,
            _session_id: &str,
            _decision: &AccessDecision,
        ) -> std::result::Result<u16, GateClientError> {
            Ok(200)
        }
    }

    fn refusing() -> (RefusingTransport, Arc<AtomicUsize>) {
        let attempts = Arc::new(AtomicUsize::new(0));
        (
            RefusingTransport {
                attempts: Arc::clone(&attempts),
            },
            attempts,
        )
    }

    #[test]
    fn config_defaults() {
        let config = GateClientConfig::new();
        assert_eq!(config.retry_interval, Duration::from_secs(10));
        assert_eq!(config.monitor_interval, Duration::from_secs(5));
        assert_eq!(config.liveness_timeout, Duration::from_secs(10));
        assert_eq!(config.accept_dwell, Duration::from_secs(3));
        assert_eq!(config.deny_dwell, Duration::from_secs(5));
        assert_eq!(config.event_channel_capacity, 256);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(1));
        assert_eq!(config, GateClientConfig::default());
    }

    #[test]
    fn config_builder_methods() {
        let config = GateClientConfig::new()
            .with_retry_interval(Duration::from_millis(100))
            .with_monitor_interval(Duration::from_millis(20))
            .with_liveness_timeout(Duration::from_millis(300))
            .with_feedback_dwell(Duration::from_millis(30), Duration::from_millis(50))
            .with_shutdown_timeout(Duration::from_secs(5));
        assert_eq!(config.retry_interval, Duration::from_millis(100));
        assert_eq!(config.monitor_interval, Duration::from_millis(20));
        assert_eq!(config.liveness_timeout, Duration::from_millis(300));
        assert_eq!(config.accept_dwell, Duration::from_millis(30));
        assert_eq!(config.deny_dwell, Duration::from_millis(50));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(5));
    }

    #[test]
    fn event_channel_capacity_is_clamped_to_one() {
        let config = GateClientConfig::new().with_event_channel_capacity(0);
        assert_eq!(config.event_channel_capacity, 1);
    }

    #[tokio::test]
    async fn failing_acquisition_keeps_retrying() {
        let (transport, attempts) = refusing();
        let config = GateClientConfig::new().with_retry_interval(Duration::from_millis(20));
        let (mut client, mut events) = GateClient::start(transport, config);

        assert_eq!(
            events.recv().await.unwrap(),
            GateEvent::ConnectionChanged(ConnectionState::Connecting)
        );
        assert_eq!(
            events.recv().await.unwrap(),
            GateEvent::ConnectionChanged(ConnectionState::Disconnected)
        );

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(attempts.load(Ordering::SeqCst) >= 3);
        assert_eq!(client.state().session_id(), "");
        assert_eq!(client.state().connection(), ConnectionState::Disconnected);

        client.shutdown().await;
    }

    #[tokio::test]
    async fn decisions_without_session_are_ignored() {
        let (transport, _attempts) = refusing();
        let (mut client, _events) = GateClient::start(transport, GateClientConfig::new());
        client.accept_head().unwrap();
        client.deny(3).unwrap();
        client.shutdown().await;
    }

    #[tokio::test]
    async fn not_running_after_shutdown() {
        let (transport, _attempts) = refusing();
        let (mut client, mut events) = GateClient::start(transport, GateClientConfig::new());
        assert!(client.is_running());

        client.shutdown().await;
        assert!(!client.is_running());
        assert!(matches!(
            client.accept_head(),
            Err(GateClientError::NotRunning)
        ));
        assert!(matches!(client.deny(1), Err(GateClientError::NotRunning)));

        let mut last = None;
        while let Some(event) = events.recv().await {
            last = Some(event);
        }
        assert_eq!(last, Some(GateEvent::Stopped));
    }

    #[tokio::test]
    async fn double_shutdown_does_not_panic() {
        let (transport, _attempts) = refusing();
        let (mut client, _events) = GateClient::start(transport, GateClientConfig::new());
        client.shutdown().await;
        client.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_timeout_aborts_stuck_stream_close() {
        let dropped = Arc::new(AtomicBool::new(false));
        let transport = HangingTransport {
            dropped: Arc::clone(&dropped),
        };
        let config = GateClientConfig::new().with_shutdown_timeout(Duration::from_millis(20));
        let (mut client, mut events) = GateClient::start(transport, config);

        // Wait until the stream is open.
        loop {
            if events.recv().await.unwrap() == GateEvent::StreamOpened {
                break;
            }
        }

        let started = std::time::Instant::now();
        client.shutdown().await;
        assert!(started.elapsed() < Duration::from_millis(500));
        assert!(!client.is_running());

        // The stuck stream is released once its worker is aborted.
        for _ in 0..100 {
            if dropped.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn drop_without_explicit_shutdown() {
        let (transport, _attempts) = refusing();
        let (client, mut events) = GateClient::start(transport, GateClientConfig::new());
        let _ = events.recv().await;
        drop(client);
        // The actor is aborted; the channel closes without hanging.
        while events.recv().await.is_some() {}
    }

    #[tokio::test]
    async fn debug_impl_for_client() {
        let (transport, _attempts) = refusing();
        let (mut client, _events) = GateClient::start(transport, GateClientConfig::new());
        let debug_str = format!("{client:?}");
        assert!(debug_str.contains("GateClient"));
        assert!(debug_str.contains("connection"));
        client.shutdown().await;
    }
}
