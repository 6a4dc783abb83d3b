mod view;

pub use view::SyncView;

use crate::api::PollSource;
use crate::channel::protocol::ServerMessage;
use crate::channel::{
    ConnectionState, Connector, DisconnectReason, PushChannel, StateChange, TransportEvent,
};
use crate::config::SyncConfig;
use crate::error::{ErrorKind, SyncError};
use crate::models::{PollMetadata, PollPhase, PollRecord, PollSnapshot, ResultsBreakdown};
use crate::tasks::poller::{FallbackPoller, PollerTick};
use chrono::{DateTime, TimeDelta, Utc};
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

// Lets the server's clock pass a start/end time before we re-check the phase
const BOUNDARY_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug)]
enum Command {
    RetryConnection,
    ForceRefresh,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchOrigin {
    Load,
    Manual,
    Boundary,
    Poller,
}

#[derive(Debug)]
enum Event {
    Fetched {
        origin: FetchOrigin,
        result: Result<PollSnapshot, SyncError>,
    },
    Polled(PollerTick),
    Results {
        seq: u64,
        result: Result<ResultsBreakdown, SyncError>,
    },
    Push(StateChange),
    Pushed(ServerMessage),
    Boundary {
        generation: u64,
    },
    LoadRetryDue,
}

/// Cheap to clone; every clone talks to the same controller.
#[derive(Clone)]
pub struct SyncHandle {
    commands: UnboundedSender<Command>,
    view: watch::Receiver<SyncView>,
}

impl SyncHandle {
    // Fresh attempt budget for the push channel, then connect
    pub fn retry_connection(&self) {
        let _ = self.commands.send(Command::RetryConnection);
    }

    // One-off pull, plus a push-side update request when the channel is open
    pub fn force_refresh(&self) {
        let _ = self.commands.send(Command::ForceRefresh);
    }

    pub fn get_view(&self) -> SyncView {
        self.view.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncView> {
        self.view.clone()
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

/// Keeps one poll's tally current from the push channel and pull fallbacks.
///
/// Runs as a single task; every input (commands, fetch results, push events,
/// timers) arrives on a channel and is handled one at a time, so merges never
/// interleave.
pub struct SyncController<S: PollSource, C: Connector> {
    poll_id: String,
    config: SyncConfig,
    source: Arc<S>,
    push: PushChannel<C>,
    poller: FallbackPoller<S>,
    view: SyncView,
    view_tx: watch::Sender<SyncView>,
    events: UnboundedSender<Event>,
    events_rx: UnboundedReceiver<Event>,
    transport_rx: UnboundedReceiver<TransportEvent>,
    commands: UnboundedReceiver<Command>,
    // Set by NotFound: nothing runs until a manual refresh or retry
    terminal: bool,
    load_attempt: u32,
    load_timer: Option<JoinHandle<()>>,
    boundary_generation: u64,
    boundary_timer: Option<JoinHandle<()>>,
    results_requested: u64,
    results_applied: u64,
    // Wall time at `started`; phase checks advance it on the timer clock
    started: Instant,
    started_utc: DateTime<Utc>,
}

impl<S: PollSource, C: Connector> SyncController<S, C> {
    pub fn new(
        poll_id: impl Into<String>,
        config: SyncConfig,
        source: Arc<S>,
        connector: Arc<C>,
    ) -> (Self, SyncHandle) {
        let poll_id = poll_id.into();
        let (events, events_rx) = mpsc::unbounded_channel();
        let (command_tx, commands) = mpsc::unbounded_channel();
        let (view_tx, view_rx) = watch::channel(SyncView::default());

        let (mut push, transport_rx) = PushChannel::new(
            poll_id.clone(),
            connector,
            config.reconnect,
            config.heartbeat_period,
            config.connect_timeout,
        );
        let state_events = events.clone();
        push.on_state_change(move |change| {
            let _ = state_events.send(Event::Push(change.clone()));
        });
        let message_events = events.clone();
        push.on_message(move |message| {
            let _ = message_events.send(Event::Pushed(message.clone()));
        });

        let tick_events = events.clone();
        let poller = FallbackPoller::new(source.clone(), move |tick| {
            let _ = tick_events.send(Event::Polled(tick));
        });

        let controller = Self {
            poll_id,
            config,
            source,
            push,
            poller,
            view: SyncView::default(),
            view_tx,
            events,
            events_rx,
            transport_rx,
            commands,
            terminal: false,
            load_attempt: 0,
            load_timer: None,
            boundary_generation: 0,
            boundary_timer: None,
            results_requested: 0,
            results_applied: 0,
            started: Instant::now(),
            started_utc: Utc::now(),
        };
        let handle = SyncHandle {
            commands: command_tx,
            view: view_rx,
        };
        (controller, handle)
    }

    pub fn spawn(
        poll_id: impl Into<String>,
        config: SyncConfig,
        source: Arc<S>,
        connector: Arc<C>,
    ) -> (SyncHandle, JoinHandle<()>) {
        let (controller, handle) = Self::new(poll_id, config, source, connector);
        (handle, tokio::spawn(controller.run()))
    }

    pub async fn run(mut self) {
        info!("Following results for poll {}", self.poll_id);
        self.fetch(FetchOrigin::Load);

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                Some(event) = self.events_rx.recv() => self.handle_event(event),
                Some(event) = self.transport_rx.recv() => self.push.handle_transport_event(event),
            }
        }

        info!("Stopping results sync for poll {}", self.poll_id);
        if self.push.state() != ConnectionState::Idle {
            self.push.disconnect(DisconnectReason::Shutdown);
        }
        self.poller.stop();
        cancel(&mut self.load_timer);
        cancel(&mut self.boundary_timer);
        self.view.connectivity = self.push.state();
        self.publish();
    }

    fn handle_command(&mut self, command: Command) {
        debug!("Command {:?} for poll {}", command, self.poll_id);
        match command {
            Command::RetryConnection => self.retry_connection(),
            Command::ForceRefresh => {
                self.fetch(FetchOrigin::Manual);
                self.push.request_update();
            }
            Command::Shutdown => {}
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Fetched { origin, result } => self.on_fetched(origin, result),
            Event::Polled(tick) => {
                if !self.poller.is_current(tick.generation) {
                    debug!("Dropping result from a stopped poller run");
                    return;
                }
                self.on_fetched(FetchOrigin::Poller, tick.result);
            }
            Event::Results { seq, result } => self.on_results(seq, result),
            Event::Push(change) => self.on_push_state(change),
            Event::Pushed(message) => self.on_push_message(message),
            Event::Boundary { generation } => {
                if generation == self.boundary_generation {
                    self.boundary_timer = None;
                    self.on_boundary();
                }
            }
            Event::LoadRetryDue => {
                self.load_timer = None;
                if !self.view.is_loaded() && !self.terminal {
                    self.fetch(FetchOrigin::Load);
                }
            }
        }
    }

    fn retry_connection(&mut self) {
        if self.terminal || !self.view.is_loaded() {
            // Nothing to connect to yet: start over from a load
            self.load_attempt = 0;
            cancel(&mut self.load_timer);
            self.fetch(FetchOrigin::Manual);
            return;
        }
        if self.view.phase != PollPhase::Active {
            info!("Poll {} is {}, not connecting", self.poll_id, self.view.phase);
            return;
        }
        self.push.reset();
        self.push.connect();
        if self.view.last_error == Some(ErrorKind::Channel) {
            self.view.last_error = None;
            self.publish();
        }
    }

    fn fetch(&mut self, origin: FetchOrigin) {
        let source = self.source.clone();
        let events = self.events.clone();
        let poll_id = self.poll_id.clone();
        tokio::spawn(async move {
            let result = source.fetch_poll_snapshot(&poll_id).await;
            let _ = events.send(Event::Fetched { origin, result });
        });

        if matches!(origin, FetchOrigin::Load | FetchOrigin::Manual) {
            self.fetch_results();
        }
    }

    fn fetch_results(&mut self) {
        self.results_requested += 1;
        let seq = self.results_requested;
        let source = self.source.clone();
        let events = self.events.clone();
        let poll_id = self.poll_id.clone();
        tokio::spawn(async move {
            let result = source.fetch_results(&poll_id).await;
            let _ = events.send(Event::Results { seq, result });
        });
    }

    fn on_fetched(&mut self, origin: FetchOrigin, result: Result<PollSnapshot, SyncError>) {
        match result {
            Ok(snapshot) => {
                self.load_attempt = 0;
                self.apply_snapshot(snapshot);
            }
            Err(e) => self.on_fetch_error(origin, e),
        }
    }

    fn apply_snapshot(&mut self, snapshot: PollSnapshot) {
        let PollSnapshot { metadata, tally } = snapshot;
        // A stale tally means stale metadata too
        if let Err(stale) = self.view.merge_tally(tally) {
            debug!("Discarding snapshot for poll {}: {}", self.poll_id, stale);
            return;
        }

        let recovering = self.terminal || !self.view.is_loaded();
        self.terminal = false;
        cancel(&mut self.load_timer);
        self.view.clear_fetch_error();
        self.apply_metadata(metadata, recovering);
        self.publish();
    }

    fn on_fetch_error(&mut self, origin: FetchOrigin, error: SyncError) {
        if let SyncError::NotFound(_) = error {
            error!("Poll {} not found, stopping sync", self.poll_id);
            self.terminal = true;
            if self.push.state() != ConnectionState::Idle {
                self.push.disconnect(DisconnectReason::PollNotFound);
            }
            self.poller.stop();
            cancel(&mut self.load_timer);
            cancel(&mut self.boundary_timer);
            self.view.last_error = Some(ErrorKind::NotFound);
            self.publish();
            return;
        }

        warn!("Fetching poll {} failed ({:?}): {}", self.poll_id, origin, error);
        self.view.last_error = Some(error.kind());
        if !self.view.is_loaded() && error.is_retryable() {
            self.schedule_load_retry();
        }
        self.publish();
    }

    fn schedule_load_retry(&mut self) {
        if self.load_timer.is_some() {
            return;
        }
        let policy = self.config.reconnect;
        if !policy.has_attempts_remaining(self.load_attempt) {
            error!(
                "Giving up loading poll {} after {} attempts",
                self.poll_id, self.load_attempt
            );
            return;
        }
        let delay = policy.next_delay(self.load_attempt);
        self.load_attempt += 1;
        info!("Retrying load of poll {} in {:?}", self.poll_id, delay);

        let events = self.events.clone();
        self.load_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(Event::LoadRetryDue);
        }));
    }

    // Same clock the boundary timers sleep on, so a fired timer always sees its boundary passed
    fn now(&self) -> DateTime<Utc> {
        let elapsed = TimeDelta::from_std(self.started.elapsed()).unwrap_or(TimeDelta::zero());
        self.started_utc + elapsed
    }

    fn apply_metadata(&mut self, metadata: PollMetadata, force: bool) {
        let phase = PollPhase::at(&metadata, self.now());
        self.arm_boundary(&metadata);
        self.view.poll = Some(metadata);
        self.enter_phase(phase, force);
    }

    fn enter_phase(&mut self, phase: PollPhase, force: bool) {
        let changed = force || self.view.phase != phase;
        if changed {
            info!("Poll {} is {}", self.poll_id, phase);
        }
        self.view.phase = phase;

        if phase == PollPhase::Active {
            // Only on entry: an exhausted channel stays down until a manual retry
            if changed {
                self.push.connect();
            }
        } else if self.push.state() != ConnectionState::Idle
            && (changed || self.push.state().is_live())
        {
            self.push.disconnect(DisconnectReason::PhaseChange);
        }
        self.sync_cadence();
    }

    // Picks the pull interval for the current phase and channel state
    fn sync_cadence(&mut self) {
        let desired = if self.terminal {
            None
        } else {
            match (self.view.phase, self.push.state()) {
                (PollPhase::Active, ConnectionState::Closed | ConnectionState::Failed) => {
                    Some(self.config.fast_poll)
                }
                // A reconnect in progress is still an outage
                (PollPhase::Active, ConnectionState::Connecting) if self.push.attempt() > 0 => {
                    Some(self.config.fast_poll)
                }
                (PollPhase::Active, _) => Some(self.config.slow_poll),
                (PollPhase::Ended, _) => Some(self.config.ended_poll),
                (PollPhase::Upcoming, _) => None,
            }
        };

        if desired == self.poller.period() {
            return;
        }
        match desired {
            Some(period) => self.poller.start(&self.poll_id, period),
            None => {
                info!("Polling stopped for poll {}", self.poll_id);
                self.poller.stop();
            }
        }
    }

    fn arm_boundary(&mut self, metadata: &PollMetadata) {
        cancel(&mut self.boundary_timer);
        self.boundary_generation += 1;

        let now = self.now();
        let Some(at) = metadata.next_boundary(now) else {
            return;
        };
        let wait = (at - now).to_std().unwrap_or_default() + BOUNDARY_GRACE;
        debug!("Poll {} changes phase in {:?}", self.poll_id, wait);

        let events = self.events.clone();
        let generation = self.boundary_generation;
        self.boundary_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            let _ = events.send(Event::Boundary { generation });
        }));
    }

    fn on_boundary(&mut self) {
        let Some(metadata) = self.view.poll.clone() else {
            return;
        };
        let phase = PollPhase::at(&metadata, self.now());
        self.arm_boundary(&metadata);
        self.enter_phase(phase, false);
        self.publish();
        // The server has the final word on the flag
        self.fetch(FetchOrigin::Boundary);
    }

    fn on_results(&mut self, seq: u64, result: Result<ResultsBreakdown, SyncError>) {
        if seq <= self.results_applied {
            debug!("Dropping results response #{} (have #{})", seq, self.results_applied);
            return;
        }
        match result {
            Ok(results) => {
                self.results_applied = seq;
                self.view.results = Some(Arc::new(results));
                self.publish();
            }
            Err(e) => warn!("Fetching results breakdown for poll {} failed: {}", self.poll_id, e),
        }
    }

    fn on_push_state(&mut self, change: StateChange) {
        debug!("Push channel {} -> {}", change.from, change.to);
        self.view.connectivity = change.to;
        match change.to {
            ConnectionState::Open => {
                self.view.server_notice = None;
                if self.view.last_error == Some(ErrorKind::Channel) {
                    self.view.last_error = None;
                }
            }
            // No retry pending means the attempt ceiling was hit
            ConnectionState::Failed if change.retry_in.is_none() => {
                self.view.last_error = Some(ErrorKind::Channel);
            }
            _ => {}
        }
        self.sync_cadence();
        self.publish();
    }

    fn on_push_message(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::PollResults { poll_results } => {
                let tally = poll_results.tally(Utc::now());
                if let Err(stale) = self.view.merge_tally(tally) {
                    debug!("Discarding pushed snapshot for poll {}: {}", self.poll_id, stale);
                    return;
                }
                let metadata = self.pushed_metadata(&poll_results);
                self.view.clear_fetch_error();
                self.apply_metadata(metadata, false);
                self.publish();
                // The breakdown moved along with the tally
                self.fetch_results();
            }
            ServerMessage::Error { message } => {
                warn!("Server reported for poll {}: {}", self.poll_id, message);
                self.view.server_notice = Some(message);
                self.publish();
            }
            other => debug!("Ignoring push message {:?}", other),
        }
    }

    // Pushed records carry the flag but may omit the schedule; keep what we know
    fn pushed_metadata(&self, record: &PollRecord) -> PollMetadata {
        let pushed = record.metadata(&self.poll_id);
        match &self.view.poll {
            Some(held) => PollMetadata {
                id: held.id.clone(),
                title: pushed.title.or_else(|| held.title.clone()),
                active: pushed.active,
                start_time: pushed.start_time.or(held.start_time),
                end_time: pushed.end_time.or(held.end_time),
            },
            None => pushed,
        }
    }

    fn publish(&self) {
        self.view_tx.send_replace(self.view.clone());
    }
}

fn cancel(timer: &mut Option<JoinHandle<()>>) {
    if let Some(timer) = timer.take() {
        timer.abort();
    }
}
