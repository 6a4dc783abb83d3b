mod backoff;
mod heartbeat;
pub mod protocol;
mod ws;

pub use backoff::ReconnectPolicy;
pub use heartbeat::Heartbeat;
pub use ws::WsConnector;

use crate::error::{ErrorKind, SyncError};
use async_trait::async_trait;
use futures::{Sink, SinkExt, Stream, StreamExt};
use log::{debug, info, warn};
use protocol::{ABNORMAL_CLOSURE, ClientMessage, Frame, NORMAL_CLOSURE, ServerMessage};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = SyncError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame, SyncError>> + Send>>;

// Opens the persistent connection for one poll
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn open(&self, poll_id: &str) -> Result<(FrameSink, FrameStream), SyncError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closed,
    Failed,
}

impl ConnectionState {
    fn can_become(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (Idle | Closed | Failed, Connecting) => true,
            (Connecting, Open | Failed | Closed) => true,
            (Open, Closed | Failed) => true,
            (Closed | Failed, Idle) => true,
            // Disconnect is accepted from anywhere
            (_, Closed) => true,
            _ => false,
        }
    }

    pub fn is_live(self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Open)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closed => "closed",
            ConnectionState::Failed => "failed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    PhaseChange,
    PollNotFound,
    Shutdown,
}

impl DisconnectReason {
    fn as_str(self) -> &'static str {
        match self {
            DisconnectReason::PhaseChange => "phase-change",
            DisconnectReason::PollNotFound => "poll-not-found",
            DisconnectReason::Shutdown => "shutdown",
        }
    }
}

// Delivered to observers in the exact order the transitions happen
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub from: ConnectionState,
    pub to: ConnectionState,
    pub error: Option<ErrorKind>,
    // Set when an automatic reconnect is pending
    pub retry_in: Option<Duration>,
}

// Reported by the session and timer tasks back to the owning loop
#[derive(Debug)]
pub struct TransportEvent {
    epoch: u64,
    kind: TransportEventKind,
}

#[derive(Debug)]
enum TransportEventKind {
    Opened,
    Received(String),
    Closed { code: u16, reason: String },
    Failed(SyncError),
    RetryDue,
    // The heartbeat is about to ping
    Beat,
}

type StateHandler = Box<dyn Fn(&StateChange) + Send + Sync>;
type MessageHandler = Box<dyn Fn(&ServerMessage) + Send + Sync>;

struct Session {
    outbound: UnboundedSender<Frame>,
    task: JoinHandle<()>,
    _heartbeat: Option<Heartbeat>,
}

/// Owns the one push connection for a poll.
///
/// All I/O runs in spawned tasks that report back as [`TransportEvent`]s; the
/// owner feeds those to [`PushChannel::handle_transport_event`] from its own
/// loop, so every state mutation happens on that loop. Events from a session
/// or timer that has since been cancelled carry an old epoch and are dropped.
pub struct PushChannel<C: Connector> {
    poll_id: String,
    connector: Arc<C>,
    policy: ReconnectPolicy,
    heartbeat_period: Duration,
    connect_timeout: Duration,
    state: ConnectionState,
    attempt: u32,
    epoch: u64,
    // True between connect() and disconnect(); gates automatic reconnects
    wanted: bool,
    session: Option<Session>,
    retry_timer: Option<JoinHandle<()>>,
    // Heartbeat bookkeeping for the open session
    last_ping: Option<Instant>,
    last_pong: Option<Instant>,
    stale: bool,
    events: UnboundedSender<TransportEvent>,
    state_handlers: Vec<StateHandler>,
    message_handlers: Vec<MessageHandler>,
}

impl<C: Connector> PushChannel<C> {
    pub fn new(
        poll_id: impl Into<String>,
        connector: Arc<C>,
        policy: ReconnectPolicy,
        heartbeat_period: Duration,
        connect_timeout: Duration,
    ) -> (Self, UnboundedReceiver<TransportEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let channel = Self {
            poll_id: poll_id.into(),
            connector,
            policy,
            heartbeat_period,
            connect_timeout,
            state: ConnectionState::Idle,
            attempt: 0,
            epoch: 0,
            wanted: false,
            session: None,
            retry_timer: None,
            last_ping: None,
            last_pong: None,
            stale: false,
            events,
            state_handlers: Vec::new(),
            message_handlers: Vec::new(),
        };
        (channel, events_rx)
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    // True while the last ping went a full period without a pong; informational only
    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn on_state_change(&mut self, handler: impl Fn(&StateChange) + Send + Sync + 'static) {
        self.state_handlers.push(Box::new(handler));
    }

    pub fn on_message(&mut self, handler: impl Fn(&ServerMessage) + Send + Sync + 'static) {
        self.message_handlers.push(Box::new(handler));
    }

    pub fn connect(&mut self) {
        if self.state.is_live() {
            debug!("Push channel for poll {} already {}", self.poll_id, self.state);
            return;
        }
        self.wanted = true;
        self.cancel_retry();
        self.open_session();
    }

    // Idempotent; after it returns no event from the old session or timer is acted on
    pub fn disconnect(&mut self, reason: DisconnectReason) {
        self.wanted = false;
        self.epoch += 1;
        self.cancel_retry();
        self.close_session(reason.as_str());

        if self.state != ConnectionState::Closed {
            info!("Push channel for poll {} disconnected ({})", self.poll_id, reason.as_str());
            self.transition(ConnectionState::Closed, None, None);
        }
    }

    // Manual reset: a fresh attempt budget and back to Idle; a live connection only gets its budget reset
    pub fn reset(&mut self) {
        self.attempt = 0;
        if self.state.is_live() {
            return;
        }
        self.epoch += 1;
        self.cancel_retry();
        self.close_session(DisconnectReason::Shutdown.as_str());
        if self.state != ConnectionState::Idle {
            self.transition(ConnectionState::Idle, None, None);
        }
    }

    // Asks the server to push a snapshot now; false when the channel is not open
    pub fn request_update(&self) -> bool {
        if self.state != ConnectionState::Open {
            return false;
        }
        let message = ClientMessage::RequestUpdate {
            poll_id: self.poll_id.clone(),
        };
        self.send(message)
    }

    pub fn handle_transport_event(&mut self, event: TransportEvent) {
        if event.epoch != self.epoch {
            debug!("Dropping {:?} from a superseded connection", event.kind);
            return;
        }

        match event.kind {
            TransportEventKind::Opened => {
                self.attempt = 0;
                self.last_ping = None;
                self.last_pong = None;
                self.stale = false;
                let beats = self.events.clone();
                let epoch = self.epoch;
                if let Some(session) = self.session.as_mut() {
                    session._heartbeat = Some(Heartbeat::start(
                        self.heartbeat_period,
                        session.outbound.clone(),
                        move || {
                            let _ = beats.send(TransportEvent {
                                epoch,
                                kind: TransportEventKind::Beat,
                            });
                        },
                    ));
                }
                info!("Push channel for poll {} open", self.poll_id);
                self.transition(ConnectionState::Open, None, None);
            }
            TransportEventKind::Received(text) => self.dispatch(&text),
            TransportEventKind::Closed { code, reason } => {
                self.session = None;
                if code == NORMAL_CLOSURE {
                    info!("Push channel for poll {} closed by server: {}", self.poll_id, reason);
                    self.transition(ConnectionState::Closed, None, None);
                } else {
                    warn!(
                        "Push channel for poll {} closed unexpectedly ({} {})",
                        self.poll_id, code, reason
                    );
                    self.recover(ConnectionState::Closed, None);
                }
            }
            TransportEventKind::Failed(error) => {
                self.session = None;
                warn!("Push channel for poll {} failed: {}", self.poll_id, error);
                self.recover(ConnectionState::Failed, Some(error.kind()));
            }
            TransportEventKind::Beat => self.check_liveness(),
            TransportEventKind::RetryDue => {
                self.retry_timer = None;
                if self.wanted && !self.state.is_live() {
                    info!(
                        "Reconnecting push channel for poll {} (attempt {}/{})",
                        self.poll_id,
                        self.attempt,
                        self.policy.max_attempts()
                    );
                    self.open_session();
                }
            }
        }
    }

    // Runs once per heartbeat, before its ping goes out
    fn check_liveness(&mut self) {
        if self.state != ConnectionState::Open {
            return;
        }
        let now = Instant::now();
        if let Some(pinged) = self.last_ping {
            let answered = self.last_pong.is_some_and(|pong| pong >= pinged);
            if !answered && !self.stale {
                warn!(
                    "No pong from server for poll {} in {:?}, keeping connection open",
                    self.poll_id,
                    now - pinged
                );
                self.stale = true;
            }
        }
        self.last_ping = Some(now);
    }

    fn record_pong(&mut self) {
        self.last_pong = Some(Instant::now());
        if self.stale {
            info!("Server for poll {} is answering pings again", self.poll_id);
            self.stale = false;
        }
    }

    // Schedules a reconnect if allowed, otherwise gives up with Failed
    fn recover(&mut self, state: ConnectionState, error: Option<ErrorKind>) {
        if self.wanted && self.policy.has_attempts_remaining(self.attempt) {
            let delay = self.policy.next_delay(self.attempt);
            self.attempt += 1;
            warn!(
                "Reconnecting push channel for poll {} in {:?} (attempt {}/{})",
                self.poll_id,
                delay,
                self.attempt,
                self.policy.max_attempts()
            );
            self.schedule_retry(delay);
            self.transition(state, error, Some(delay));
        } else {
            if self.wanted {
                warn!(
                    "Push channel for poll {} gave up after {} attempts",
                    self.poll_id, self.attempt
                );
            }
            self.wanted = false;
            self.transition(ConnectionState::Failed, Some(ErrorKind::Channel), None);
        }
    }

    fn open_session(&mut self) {
        self.epoch += 1;
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_session(
            self.connector.clone(),
            self.poll_id.clone(),
            self.connect_timeout,
            self.epoch,
            self.events.clone(),
            outbound_rx,
        ));
        self.session = Some(Session {
            outbound,
            task,
            _heartbeat: None,
        });
        self.transition(ConnectionState::Connecting, None, None);
    }

    fn close_session(&mut self, reason: &str) {
        let Some(session) = self.session.take() else {
            return;
        };
        if self.state == ConnectionState::Open {
            // The session task sends the close frame and ends on its own
            let _ = session.outbound.send(Frame::Close {
                code: NORMAL_CLOSURE,
                reason: reason.to_string(),
            });
        } else {
            session.task.abort();
        }
    }

    fn schedule_retry(&mut self, delay: Duration) {
        self.cancel_retry();
        let events = self.events.clone();
        let epoch = self.epoch;
        self.retry_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(TransportEvent {
                epoch,
                kind: TransportEventKind::RetryDue,
            });
        }));
    }

    fn cancel_retry(&mut self) {
        if let Some(timer) = self.retry_timer.take() {
            timer.abort();
        }
    }

    fn send(&self, message: ClientMessage) -> bool {
        let Some(session) = self.session.as_ref() else {
            return false;
        };
        match message.to_frame() {
            Some(frame) => session.outbound.send(frame).is_ok(),
            None => false,
        }
    }

    fn dispatch(&mut self, text: &str) {
        let message: ServerMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("Ignoring unparsable push message: {}", e);
                return;
            }
        };

        match &message {
            ServerMessage::Ping => {
                self.send(ClientMessage::Pong);
            }
            ServerMessage::Pong => {
                debug!("Received pong for poll {}", self.poll_id);
                self.record_pong();
            }
            ServerMessage::Unknown => debug!("Ignoring push message of unknown type"),
            ServerMessage::PollResults { .. } | ServerMessage::Error { .. } => {
                for handler in &self.message_handlers {
                    handler(&message);
                }
            }
        }
    }

    fn transition(
        &mut self,
        to: ConnectionState,
        error: Option<ErrorKind>,
        retry_in: Option<Duration>,
    ) {
        let from = self.state;
        if from == to && error.is_none() && retry_in.is_none() {
            return;
        }
        if from != to && !from.can_become(to) {
            debug!("Ignoring illegal transition {} -> {}", from, to);
            return;
        }
        self.state = to;
        let change = StateChange {
            from,
            to,
            error,
            retry_in,
        };
        for handler in &self.state_handlers {
            handler(&change);
        }
    }
}

impl<C: Connector> Drop for PushChannel<C> {
    fn drop(&mut self) {
        self.cancel_retry();
        if let Some(session) = self.session.take() {
            session.task.abort();
        }
    }
}

async fn run_session<C: Connector>(
    connector: Arc<C>,
    poll_id: String,
    connect_timeout: Duration,
    epoch: u64,
    events: UnboundedSender<TransportEvent>,
    mut outbound: UnboundedReceiver<Frame>,
) {
    let report = |kind| {
        let _ = events.send(TransportEvent { epoch, kind });
    };

    let opened = tokio::time::timeout(connect_timeout, connector.open(&poll_id)).await;
    let (mut sink, mut stream) = match opened {
        Ok(Ok(pair)) => pair,
        Ok(Err(e)) => {
            report(TransportEventKind::Failed(e));
            return;
        }
        Err(_) => {
            report(TransportEventKind::Failed(SyncError::Channel(format!(
                "Connection timeout ({:?})",
                connect_timeout
            ))));
            return;
        }
    };
    report(TransportEventKind::Opened);

    loop {
        tokio::select! {
            frame = outbound.recv() => match frame {
                Some(Frame::Close { code, reason }) => {
                    let _ = sink.send(Frame::Close { code, reason }).await;
                    let _ = sink.close().await;
                    return;
                }
                Some(frame) => {
                    if let Err(e) = sink.send(frame).await {
                        report(TransportEventKind::Failed(e));
                        return;
                    }
                }
                None => {
                    let _ = sink.close().await;
                    return;
                }
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Frame::Text(text))) => report(TransportEventKind::Received(text)),
                Some(Ok(Frame::Close { code, reason })) => {
                    report(TransportEventKind::Closed { code, reason });
                    return;
                }
                Some(Err(e)) => {
                    report(TransportEventKind::Failed(e));
                    return;
                }
                None => {
                    report(TransportEventKind::Closed {
                        code: ABNORMAL_CLOSURE,
                        reason: "stream ended".to_string(),
                    });
                    return;
                }
            },
        }
    }
}
