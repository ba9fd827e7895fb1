//! Session orchestrator
//!
//! One actor owns the session lifecycle. It starts sessions through the session
//! service, spawns a [`ProtocolClient`] per session, plays idle clips while
//! offline and restarts the session under the session retry policy. Restart
//! triggers (network back, unrecoverable connection) pass through a debounce so
//! near-simultaneous signals start a single retry sequence.
//!
//! Status is published on a watch channel; everything else the host may care
//! about goes out as a [`SessionEvent`] on a broadcast channel.

use futures::{Stream, StreamExt};
use parking_lot::RwLock;
use std::future::pending;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior, interval, sleep, timeout};
use tokio_stream::wrappers::{UnboundedReceiverStream, WatchStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::PlaybackTracker;
use super::offline::{OfflinePlayer, body_record};
use crate::cache::FrameStore;
use crate::config::SessionConfig;
use crate::decode::{DecodePool, PoolContext, PoolSnapshot, SegmentDecoder};
use crate::error::{Result, SessionError};
use crate::protocol::{
    ClientChannels, ClientParams, FrameClock, ProtocolClient, ProtocolEvent, ProtocolHandle,
    RestartReason,
};
use crate::resource::{AssetCache, ResourceFetcher, SessionService, Signer};
use crate::retry::{RetryDecision, RetryState};
use crate::stream::{Debounce, DebounceExt};
use crate::transport::Connector;
use crate::types::{
    AnimationFrame, ResumeParams, Session, SessionStatus, StartRequest, StopReason, VisualFrame,
};

const EVENT_CAPACITY: usize = 256;
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Notification published by an [`AvatarSession`].
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Lifecycle status change, including network on/off reports
    Status(SessionStatus),
    /// A handshake completed; the render clock restarts at `clock`
    Ready { resumed: bool, clock: FrameClock },
    /// Server-side avatar state change
    ServerState(String),
    /// One inbound message was dropped
    FrameDropped { event: String, reason: String },
    /// Non-fatal server error report
    ServerError { code: i32, message: String },
    /// A session start failed and will be retried after `delay`
    Restarting { round: u32, attempt: u32, delay: Duration },
    /// An idle clip was scheduled while offline
    OfflineClip { name: Arc<str>, start: u32 },
    /// The session closed on an unrecoverable error
    Fatal(Arc<SessionError>),
}

#[derive(Debug)]
enum SessionCommand {
    Start(oneshot::Sender<Result<()>>),
    SetInvisible(bool),
    NetworkChanged(bool),
    RenderStarted,
    RenderStopped,
    Destroy(oneshot::Sender<()>),
}

#[derive(Debug, Clone)]
enum RestartTrigger {
    NetworkOn,
    Connection(RestartReason),
}

/// Builder for [`AvatarSession`].
pub struct AvatarSessionBuilder {
    config: SessionConfig,
    connector: Option<Arc<dyn Connector>>,
    fetcher: Option<Arc<dyn ResourceFetcher>>,
    decoder: Option<Arc<dyn SegmentDecoder>>,
}

impl AvatarSessionBuilder {
    /// Realtime transport factory.
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// HTTP client for the session service and the resource store.
    pub fn fetcher(mut self, fetcher: Arc<dyn ResourceFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Segment decoder.
    pub fn decoder(mut self, decoder: Arc<dyn SegmentDecoder>) -> Self {
        self.decoder = Some(decoder);
        self
    }

    /// Validate and spawn the session actor. Must be called inside a Tokio
    /// runtime.
    pub fn build(self) -> Result<AvatarSession> {
        self.config.validate()?;
        let missing = |part: &str| SessionError::invalid_config(format!("no {part}"));
        let connector = self.connector.ok_or_else(|| missing("connector"))?;
        let fetcher = self.fetcher.ok_or_else(|| missing("resource fetcher"))?;
        let decoder = self.decoder.ok_or_else(|| missing("segment decoder"))?;
        Ok(AvatarSession::spawn(Arc::new(self.config), connector, fetcher, decoder))
    }
}

/// Handle to a running avatar session.
///
/// Cheap to clone. The session keeps running until [`destroy`](Self::destroy)
/// or a fatal error; dropping every handle closes it as well.
#[derive(Clone)]
pub struct AvatarSession {
    commands: mpsc::UnboundedSender<SessionCommand>,
    status: watch::Receiver<Option<SessionStatus>>,
    events: broadcast::Sender<SessionEvent>,
    client: Arc<RwLock<Option<ProtocolHandle>>>,
    clock: Arc<RwLock<Option<FrameClock>>>,
    store: Arc<FrameStore>,
    tracker: Arc<PlaybackTracker>,
    pool: DecodePool,
}

impl std::fmt::Debug for AvatarSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AvatarSession").field("status", &self.status()).finish_non_exhaustive()
    }
}

impl AvatarSession {
    pub fn builder(config: SessionConfig) -> AvatarSessionBuilder {
        AvatarSessionBuilder { config, connector: None, fetcher: None, decoder: None }
    }

    fn spawn(
        config: Arc<SessionConfig>,
        connector: Arc<dyn Connector>,
        fetcher: Arc<dyn ResourceFetcher>,
        decoder: Arc<dyn SegmentDecoder>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let store = Arc::new(FrameStore::new());
        let tracker = Arc::new(PlaybackTracker::new());
        let assets = Arc::new(AssetCache::new(
            Arc::clone(&fetcher),
            config.cache.clone(),
            config.decode.fetch_timeout(),
            cancel.child_token(),
        ));
        let pool = DecodePool::spawn(
            config.decode.clone(),
            config.device_class.clip_ceiling(),
            PoolContext {
                assets: Arc::clone(&assets),
                decoder,
                store: Arc::clone(&store),
                tracker: Arc::clone(&tracker),
            },
            cancel.child_token(),
        );
        let service = Arc::new(SessionService::new(
            fetcher,
            Signer::new(config.app_id.clone(), config.app_secret.clone()),
            config.base_url.clone(),
        ));

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(None);
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let (restart_tx, restart_rx) = mpsc::unbounded_channel();
        let triggers =
            Box::pin(UnboundedReceiverStream::new(restart_rx).debounce(config.restart_debounce()));

        let client = Arc::new(RwLock::new(None));
        let clock = Arc::new(RwLock::new(None));

        let orchestrator = Orchestrator {
            offline: OfflinePlayer::new(config.idle_clips.clone(), config.fps),
            restart: RetryState::new(config.retry.session),
            config,
            connector,
            service,
            assets,
            store: Arc::clone(&store),
            tracker: Arc::clone(&tracker),
            pool: pool.clone(),
            client: Arc::clone(&client),
            clock: Arc::clone(&clock),
            status: status_tx,
            events: event_tx.clone(),
            cancel,
            restart_tx,
            offline_ticker: None,
            client_events: None,
            attempt: None,
            session: None,
            session_stopped: false,
            resume: None,
            pending_start: Vec::new(),
            started: false,
            online: false,
            rendering: false,
            invisible: false,
            network_up: true,
            closed: false,
        };
        tokio::spawn(orchestrator.run(command_rx, triggers));

        Self {
            commands: command_tx,
            status: status_rx,
            events: event_tx,
            client,
            clock,
            store,
            tracker,
            pool,
        }
    }

    /// Start the session and wait until it is online.
    ///
    /// Failed starts are retried under the session retry policy; the error is
    /// returned once the policy is exhausted or a fatal error occurs.
    pub async fn start(&self) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.commands.send(SessionCommand::Start(reply)).map_err(|_| SessionError::Closed)?;
        response.await.map_err(|_| SessionError::Closed)?
    }

    /// Send a complete utterance. Returns its speak id.
    pub fn speak(&self, text: impl Into<String>) -> Result<u64> {
        self.with_client(|client| client.speak(text))
    }

    /// Send one chunk of a multi-chunk utterance.
    pub fn speak_chunk(&self, text: impl Into<String>, start: bool, end: bool) -> Result<u64> {
        self.with_client(|client| client.speak_chunk(text, start, end))
    }

    /// Ask the server to move the avatar to `state`. The state is remembered
    /// for resuming even when the request cannot be sent.
    pub fn change_state(&self, state: impl Into<String>) -> Result<()> {
        let state = state.into();
        self.tracker.set_next_state(state.clone());
        self.with_client(|client| client.change_state(state))
    }

    /// Pause or resume real-time stream processing.
    pub fn set_invisible(&self, enabled: bool) {
        let _ = self.commands.send(SessionCommand::SetInvisible(enabled));
    }

    /// Report host network availability.
    pub fn network_changed(&self, up: bool) {
        let _ = self.commands.send(SessionCommand::NetworkChanged(up));
    }

    /// The renderer started presenting frames.
    pub fn render_started(&self) {
        let _ = self.commands.send(SessionCommand::RenderStarted);
    }

    /// The renderer stopped presenting frames.
    pub fn render_stopped(&self) {
        let _ = self.commands.send(SessionCommand::RenderStopped);
    }

    /// Visual frame for render index `index`, pruning older frames.
    pub fn next_visual_frame(&self, index: u32) -> Option<VisualFrame> {
        let frame = self.store.next_visual_frame(index)?;
        self.tracker.record_rendered(index, &frame.clip, frame.local_index);
        Some(frame)
    }

    /// Animation data for render index `index`, pruning older records.
    pub fn next_animation_frame(&self, index: u32) -> Option<AnimationFrame> {
        self.store.next_animation_frame(index)
    }

    /// Frame reference of the current connection.
    pub fn frame_clock(&self) -> Option<FrameClock> {
        *self.clock.read()
    }

    /// Render index for now on the current frame clock.
    pub fn current_frame(&self) -> Option<u32> {
        self.frame_clock().map(|clock| clock.frame_at(Instant::now()))
    }

    /// Current status; `None` before the first start.
    pub fn status(&self) -> Option<SessionStatus> {
        *self.status.borrow()
    }

    /// Stream of status changes.
    pub fn status_updates(&self) -> impl Stream<Item = SessionStatus> + Send + 'static {
        WatchStream::new(self.status.clone()).filter_map(|status| async move { status })
    }

    /// Subscribe to session events.
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Frame caches.
    pub fn frames(&self) -> &Arc<FrameStore> {
        &self.store
    }

    /// Decode pool progress.
    pub fn decode_snapshot(&self) -> PoolSnapshot {
        self.pool.snapshot()
    }

    /// Close the session. Idempotent.
    pub async fn destroy(&self) {
        let (ack, done) = oneshot::channel();
        if self.commands.send(SessionCommand::Destroy(ack)).is_ok() {
            let _ = done.await;
        }
    }

    fn with_client<T>(&self, f: impl FnOnce(&ProtocolHandle) -> Result<T>) -> Result<T> {
        if self.status() == Some(SessionStatus::Close) {
            return Err(SessionError::Closed);
        }
        match self.client.read().as_ref() {
            Some(client) => f(client),
            None => {
                warn!("No active connection");
                Err(SessionError::NotConnected)
            }
        }
    }
}

/// A session that completed its handshake.
struct Established {
    session: Session,
    handle: ProtocolHandle,
    events: mpsc::UnboundedReceiver<ProtocolEvent>,
    /// Client events seen before the handshake completed
    backlog: Vec<ProtocolEvent>,
    resumed: bool,
    clock: FrameClock,
}

/// What a start attempt needs, detached from the actor.
struct AttemptContext {
    config: Arc<SessionConfig>,
    connector: Arc<dyn Connector>,
    service: Arc<SessionService>,
    assets: Arc<AssetCache>,
    store: Arc<FrameStore>,
    tracker: Arc<PlaybackTracker>,
    pool: DecodePool,
    previous_session_id: Option<String>,
    resume: Option<ResumeParams>,
    invisible: bool,
    network_up: bool,
    cancel: CancellationToken,
}

type Triggers = Pin<Box<Debounce<UnboundedReceiverStream<RestartTrigger>>>>;

struct Orchestrator {
    config: Arc<SessionConfig>,
    connector: Arc<dyn Connector>,
    service: Arc<SessionService>,
    assets: Arc<AssetCache>,
    store: Arc<FrameStore>,
    tracker: Arc<PlaybackTracker>,
    pool: DecodePool,
    client: Arc<RwLock<Option<ProtocolHandle>>>,
    clock: Arc<RwLock<Option<FrameClock>>>,
    status: watch::Sender<Option<SessionStatus>>,
    events: broadcast::Sender<SessionEvent>,
    cancel: CancellationToken,
    restart: RetryState,
    restart_tx: mpsc::UnboundedSender<RestartTrigger>,
    offline: OfflinePlayer,
    offline_ticker: Option<Interval>,
    client_events: Option<mpsc::UnboundedReceiver<ProtocolEvent>>,
    attempt: Option<JoinHandle<Result<Established>>>,
    session: Option<Session>,
    /// The server session was already asked to stop
    session_stopped: bool,
    /// Progress of the abandoned session, captured before the restart resets the pool
    resume: Option<ResumeParams>,
    pending_start: Vec<oneshot::Sender<Result<()>>>,
    started: bool,
    /// A handshake completed and the transport has not dropped since
    online: bool,
    rendering: bool,
    invisible: bool,
    network_up: bool,
    closed: bool,
}

impl Orchestrator {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<SessionCommand>,
        mut triggers: Triggers,
    ) {
        info!(avatar_id = %self.config.avatar_id, "Session orchestrator started");

        while !self.closed {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                command = commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => {
                        debug!("All session handles dropped");
                        self.shutdown(StopReason::ClientClose);
                    }
                },
                Some(trigger) = triggers.next() => self.on_restart_trigger(trigger),
                event = next_client_event(&mut self.client_events) => match event {
                    Some(event) => self.on_client_event(event),
                    None => self.client_events = None,
                },
                result = join_attempt(&mut self.attempt) => {
                    self.attempt = None;
                    self.on_attempt_finished(result);
                }
                _ = tick(&mut self.offline_ticker) => self.on_offline_tick(),
            }
        }

        // Late commands get a definite answer
        commands.close();
        while let Ok(command) = commands.try_recv() {
            match command {
                SessionCommand::Start(reply) => {
                    let _ = reply.send(Err(SessionError::Closed));
                }
                SessionCommand::Destroy(ack) => {
                    let _ = ack.send(());
                }
                _ => {}
            }
        }
        info!("Session orchestrator stopped");
    }

    fn on_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Start(reply) => {
                if self.online && self.client.read().is_some() {
                    let _ = reply.send(Ok(()));
                    return;
                }
                self.pending_start.push(reply);
                if !self.started {
                    self.started = true;
                    self.begin_attempt(Duration::ZERO);
                }
            }
            SessionCommand::SetInvisible(enabled) => {
                if self.invisible == enabled {
                    return;
                }
                self.invisible = enabled;
                match self.client.read().as_ref() {
                    Some(client) => client.set_invisible(enabled),
                    None => {
                        self.store.clear_animation();
                        if enabled {
                            self.pool.reset();
                        }
                    }
                }
                self.refresh_status();
            }
            SessionCommand::NetworkChanged(up) => {
                self.network_up = up;
                info!(up, "Network changed");
                self.emit(SessionEvent::Status(if up {
                    SessionStatus::NetworkOn
                } else {
                    SessionStatus::NetworkOff
                }));

                let connected = match self.client.read().as_ref() {
                    Some(client) => {
                        client.network_changed(up);
                        client.is_connected()
                    }
                    None => false,
                };

                if !up {
                    self.online = false;
                } else if connected {
                    self.online = true;
                } else if self.started {
                    self.trigger_restart(RestartTrigger::NetworkOn);
                }
                self.refresh_status();
            }
            SessionCommand::RenderStarted => {
                self.rendering = true;
                self.refresh_status();
            }
            SessionCommand::RenderStopped => {
                self.rendering = false;
                self.refresh_status();
            }
            SessionCommand::Destroy(ack) => {
                self.shutdown(StopReason::ClientClose);
                let _ = ack.send(());
            }
        }
    }

    fn on_client_event(&mut self, event: ProtocolEvent) {
        match event {
            ProtocolEvent::Ready { resumed, clock } => {
                *self.clock.write() = Some(clock);
                if let Some(session) = &self.session {
                    self.tracker.set_session_id(session.session_id.clone());
                }
                self.online = true;
                self.refresh_status();
                self.emit(SessionEvent::Ready { resumed, clock });
            }
            ProtocolEvent::StateChanged { state } => self.emit(SessionEvent::ServerState(state)),
            ProtocolEvent::FrameDropped { event, error } => {
                self.emit(SessionEvent::FrameDropped { event, reason: error.to_string() })
            }
            ProtocolEvent::ServerError { code, message } => {
                self.emit(SessionEvent::ServerError { code, message })
            }
            ProtocolEvent::Kicked { code, message } => {
                self.fail(SessionError::Kicked { code, message })
            }
            ProtocolEvent::Disconnected { reason } => {
                debug!(?reason, "Connection dropped, client is reconnecting");
                self.online = false;
                self.refresh_status();
            }
            ProtocolEvent::RestartRequired { reason } => {
                self.online = false;
                self.refresh_status();
                self.trigger_restart(RestartTrigger::Connection(reason));
            }
            ProtocolEvent::Closed => {
                debug!("Protocol client closed");
                *self.client.write() = None;
                self.client_events = None;
            }
        }
    }

    fn trigger_restart(&self, trigger: RestartTrigger) {
        debug!(?trigger, "Restart requested");
        let _ = self.restart_tx.send(trigger);
    }

    fn on_restart_trigger(&mut self, trigger: RestartTrigger) {
        if self.closed || !self.started {
            return;
        }
        if self.attempt.is_some() {
            debug!(?trigger, "Restart already in progress, ignoring");
            return;
        }
        if self.online {
            debug!(?trigger, "Session recovered before restart, ignoring");
            return;
        }

        let stop_reason = match trigger {
            RestartTrigger::Connection(RestartReason::Inactivity) => StopReason::Inactivity,
            _ => StopReason::Restart,
        };
        info!(?trigger, "Restarting session");
        self.resume = Some(self.tracker.resume_params());
        self.retire_client(stop_reason);
        self.begin_attempt(Duration::ZERO);
    }

    /// Close the current client and stop its server session.
    fn retire_client(&mut self, reason: StopReason) {
        if let Some(client) = self.client.write().take() {
            client.close();
        }
        self.client_events = None;
        *self.clock.write() = None;
        if self.session_stopped {
            return;
        }
        if let Some(session) = &self.session {
            self.spawn_stop(session.session_id.clone(), reason);
            self.session_stopped = true;
        }
    }

    fn begin_attempt(&mut self, delay: Duration) {
        let context = AttemptContext {
            config: Arc::clone(&self.config),
            connector: Arc::clone(&self.connector),
            service: Arc::clone(&self.service),
            assets: Arc::clone(&self.assets),
            store: Arc::clone(&self.store),
            tracker: Arc::clone(&self.tracker),
            pool: self.pool.clone(),
            previous_session_id: self.session.as_ref().map(|s| s.session_id.clone()),
            resume: self.resume.clone(),
            invisible: self.invisible,
            network_up: self.network_up,
            cancel: self.cancel.child_token(),
        };
        self.attempt = Some(tokio::spawn(establish(context, delay)));
    }

    fn on_attempt_finished(&mut self, result: Result<Established>) {
        if self.closed {
            return;
        }

        match result {
            Ok(established) => {
                self.restart.reset();
                info!(
                    session_id = %established.session.session_id,
                    resumed = established.resumed,
                    "Session online"
                );

                self.tracker.set_session_id(established.session.session_id.clone());
                *self.client.write() = Some(established.handle);
                *self.clock.write() = Some(established.clock);
                self.client_events = Some(established.events);
                self.session = Some(established.session);
                self.session_stopped = false;
                self.resume = None;
                self.online = true;
                self.refresh_status();
                let (resumed, clock) = (established.resumed, established.clock);
                self.emit(SessionEvent::Ready { resumed, clock });

                for event in established.backlog {
                    self.on_client_event(event);
                }
                for reply in self.pending_start.drain(..) {
                    let _ = reply.send(Ok(()));
                }
            }
            Err(error) if error.is_fatal() => self.fail(error),
            Err(error) => match self.restart.on_failure() {
                RetryDecision::Retry { round, attempt, delay } => {
                    warn!(round, attempt, ?delay, %error, "Session start failed");
                    self.emit(SessionEvent::Restarting { round, attempt, delay });
                    self.begin_attempt(delay);
                }
                RetryDecision::Exhausted { rounds } => {
                    error!(rounds, %error, "Session restart exhausted");
                    self.fail(SessionError::RetriesExhausted { rounds });
                }
            },
        }
    }

    fn on_offline_tick(&mut self) {
        let playhead = self.tracker.last_rendered_frame().map_or(0, |f| f.saturating_add(1));
        let earliest = self.store.last_visual_index().map_or(0, |f| f.saturating_add(1));
        let assets = &self.assets;

        let Some(task) =
            self.offline.next_task(playhead, earliest, |name| assets.is_preloaded(name))
        else {
            return;
        };

        debug!(clip = %task.name, start = task.global_start, "Offline clip");
        self.store.append_body(vec![body_record(&task)]);
        let (name, start) = (Arc::clone(&task.name), task.global_start);
        self.emit(SessionEvent::OfflineClip { name, start });
        self.pool.enqueue(vec![task]);
    }

    /// Derive the status from the current flags. Nothing is reported before
    /// the first session is established.
    fn refresh_status(&mut self) {
        if self.closed || self.session.is_none() {
            return;
        }
        let next = if self.invisible {
            SessionStatus::Invisible
        } else if !self.online {
            SessionStatus::Offline
        } else if self.rendering {
            SessionStatus::Visible
        } else {
            SessionStatus::Online
        };
        self.set_status(next);
    }

    fn set_status(&mut self, next: SessionStatus) {
        let current = *self.status.borrow();
        if current == Some(next) {
            return;
        }
        info!(from = ?current, to = ?next, "Session status changed");
        self.status.send_replace(Some(next));
        self.emit(SessionEvent::Status(next));

        if next == SessionStatus::Offline {
            self.start_offline();
        } else {
            self.offline_ticker = None;
        }
    }

    fn start_offline(&mut self) {
        if self.offline_ticker.is_some() {
            return;
        }
        self.offline.restart();
        let mut ticker = interval(self.config.offline_tick());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        self.offline_ticker = Some(ticker);
    }

    fn fail(&mut self, error: SessionError) {
        error!(%error, "Session failed");
        self.emit(SessionEvent::Fatal(Arc::new(error.detached())));
        for reply in self.pending_start.drain(..) {
            let _ = reply.send(Err(error.detached()));
        }
        self.shutdown(StopReason::Failure);
    }

    /// Enter `Close`: cancel timers, stop the client, reset retry state and
    /// clear the caches.
    fn shutdown(&mut self, reason: StopReason) {
        if self.closed {
            return;
        }
        info!(?reason, "Closing session");

        self.offline_ticker = None;
        if let Some(attempt) = self.attempt.take() {
            attempt.abort();
        }
        self.retire_client(reason);
        self.session = None;
        self.cancel.cancel();
        self.pool.shutdown();
        self.restart.reset();

        self.store.clear_all();
        self.assets.clear();
        self.tracker.reset();

        for reply in self.pending_start.drain(..) {
            let _ = reply.send(Err(SessionError::Closed));
        }
        self.status.send_replace(Some(SessionStatus::Close));
        self.emit(SessionEvent::Status(SessionStatus::Close));
        self.closed = true;
    }

    fn spawn_stop(&self, session_id: String, reason: StopReason) {
        let service = Arc::clone(&self.service);
        tokio::spawn(async move {
            match timeout(STOP_TIMEOUT, service.stop(&session_id, reason)).await {
                Ok(Ok(())) => debug!(%session_id, "Stopped session"),
                Ok(Err(e)) => warn!(%session_id, error = %e, "Failed to stop session"),
                Err(_) => warn!(%session_id, "Stopping session timed out"),
            }
        });
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

/// Start a session and wait for its handshake.
async fn establish(context: AttemptContext, delay: Duration) -> Result<Established> {
    if !delay.is_zero() {
        tokio::select! {
            _ = context.cancel.cancelled() => return Err(SessionError::Closed),
            _ = sleep(delay) => {}
        }
    }

    let config = &context.config;
    let request = StartRequest {
        avatar_id: config.avatar_id.clone(),
        previous_session_id: context.previous_session_id.clone(),
    };
    let response = timeout(config.handshake_timeout(), context.service.start(&request))
        .await
        .map_err(|_| SessionError::Timeout { duration: config.handshake_timeout() })??;
    let session = Session::from_start(response);
    debug!(session_id = %session.session_id, "Session started");

    context.assets.set_base_url(&session.resource_pack);
    if !config.idle_clips.iter().all(|clip| context.assets.is_preloaded(&clip.name)) {
        let loaded = context.assets.preload_idle_clips(&config.idle_clips).await;
        debug!(loaded, total = config.idle_clips.len(), "Preloaded idle clips");
    }

    // Frame indices restart with every session
    context.pool.reset();
    context.store.clear_all();

    let ClientChannels { handle, mut events } = ProtocolClient::spawn(
        ClientParams {
            connector: Arc::clone(&context.connector),
            session: session.clone(),
            config: config.client_config(),
            store: Arc::clone(&context.store),
            pool: context.pool.clone(),
            tracker: Arc::clone(&context.tracker),
            resume: context.resume,
            invisible: context.invisible,
            network_up: context.network_up,
        },
        context.cancel.clone(),
    );

    let mut backlog = Vec::new();
    let ready = tokio::select! {
        _ = context.cancel.cancelled() => Err(SessionError::Closed),
        ready = timeout(config.handshake_timeout(), wait_ready(&mut events, &mut backlog)) => {
            ready.unwrap_or_else(|_| {
                Err(SessionError::Handshake {
                    reason: format!("no time sync within {:?}", config.handshake_timeout()),
                })
            })
        }
    };

    match ready {
        Ok((resumed, clock)) => {
            Ok(Established { session, handle, events, backlog, resumed, clock })
        }
        Err(error) => {
            handle.abort();
            if let Err(e) = context.service.stop(&session.session_id, StopReason::Failure).await {
                debug!(
                    session_id = %session.session_id,
                    error = %e,
                    "Failed to stop abandoned session"
                );
            }
            Err(error)
        }
    }
}

async fn wait_ready(
    events: &mut mpsc::UnboundedReceiver<ProtocolEvent>,
    backlog: &mut Vec<ProtocolEvent>,
) -> Result<(bool, FrameClock)> {
    while let Some(event) = events.recv().await {
        match event {
            ProtocolEvent::Ready { resumed, clock } => return Ok((resumed, clock)),
            ProtocolEvent::Kicked { code, message } => {
                return Err(SessionError::Kicked { code, message });
            }
            ProtocolEvent::RestartRequired { reason: RestartReason::ConnectFailed(reason) } => {
                return Err(SessionError::connection_failed(reason));
            }
            ProtocolEvent::RestartRequired { reason } => {
                return Err(SessionError::Handshake { reason: reason.to_string() });
            }
            ProtocolEvent::Closed => break,
            other => backlog.push(other),
        }
    }
    Err(SessionError::Handshake { reason: "client stopped before time sync".to_string() })
}

async fn next_client_event(
    events: &mut Option<mpsc::UnboundedReceiver<ProtocolEvent>>,
) -> Option<ProtocolEvent> {
    match events {
        Some(events) => events.recv().await,
        None => pending().await,
    }
}

async fn join_attempt(
    attempt: &mut Option<JoinHandle<Result<Established>>>,
) -> Result<Established> {
    match attempt {
        Some(handle) => match handle.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(SessionError::Closed),
            Err(e) => Err(SessionError::Handshake { reason: format!("start task failed: {}", e) }),
        },
        None => pending().await,
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => pending().await,
    }
}
