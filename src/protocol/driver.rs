//! Protocol client actor

use parking_lot::Mutex;
use std::future::pending;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, sleep, sleep_until, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::handshake::{self, FrameClock};
use super::{ConnectionState, ProtocolEvent, RestartReason};
use crate::cache::FrameStore;
use crate::codec::face;
use crate::codec::wire::{self, AudioMessage, BodyMessage, Command, EventMessage, InboundMessage};
use crate::decode::DecodePool;
use crate::error::{Result, SessionError};
use crate::retry::{RetryDecision, RetryPolicy, RetryState};
use crate::session::PlaybackTracker;
use crate::transport::{CloseReason, Connector, Transport, TransportEvent};
use crate::types::{ResumeParams, Session};

/// Connection tuning.
#[derive(Debug, Clone, Copy)]
pub struct ClientConfig {
    /// Render frame rate announced in the sync ack
    pub fps: u32,
    /// Restart when nothing arrives for this long
    pub inactivity_timeout: Duration,
    /// Bound on a single connect attempt
    pub connect_timeout: Duration,
    /// Transport reconnect policy
    pub retry: RetryPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            fps: 25,
            inactivity_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
        }
    }
}

/// Everything a client needs to serve one session.
pub struct ClientParams {
    pub connector: Arc<dyn Connector>,
    pub session: Session,
    pub config: ClientConfig,
    pub store: Arc<FrameStore>,
    pub pool: DecodePool,
    pub tracker: Arc<PlaybackTracker>,
    /// Resume parameters for the first handshake. Later reconnects read the
    /// tracker directly.
    pub resume: Option<ResumeParams>,
    /// Start with real-time streams paused
    pub invisible: bool,
    /// Host-reported network state at spawn
    pub network_up: bool,
}

/// Result of spawning a client
pub struct ClientChannels {
    /// Command handle
    pub handle: ProtocolHandle,
    /// Notifications for the owner
    pub events: mpsc::UnboundedReceiver<ProtocolEvent>,
}

#[derive(Debug)]
enum ClientCommand {
    Send(Command),
    SetInvisible(bool),
    NetworkChanged(bool),
    Close,
}

#[derive(Debug, Default)]
struct SpeakIds {
    last: u64,
    /// Utterance still waiting for its end chunk
    open: Option<u64>,
}

/// Handle to a running protocol client.
#[derive(Debug, Clone)]
pub struct ProtocolHandle {
    commands: mpsc::UnboundedSender<ClientCommand>,
    state: watch::Receiver<ConnectionState>,
    speak_ids: Arc<Mutex<SpeakIds>>,
    cancel: CancellationToken,
}

impl ProtocolHandle {
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_open()
    }

    /// Watch connection state changes.
    pub fn state_updates(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Queue a command. Commands that need a live transport are refused while
    /// disconnected.
    pub fn send(&self, command: Command) -> Result<()> {
        if command.requires_connection() && !self.is_connected() {
            warn!(event = command.event(), "Dropping command while disconnected");
            return Err(SessionError::NotConnected);
        }
        self.commands.send(ClientCommand::Send(command)).map_err(|_| SessionError::Closed)
    }

    /// Send a complete utterance. Returns its speak id.
    pub fn speak(&self, text: impl Into<String>) -> Result<u64> {
        self.speak_chunk(text, true, true)
    }

    /// Send one chunk of a multi-chunk utterance.
    ///
    /// A chunk with `start` opens a new speak id; later chunks reuse it until a
    /// chunk with `end` closes it.
    pub fn speak_chunk(&self, text: impl Into<String>, start: bool, end: bool) -> Result<u64> {
        if !self.is_connected() {
            warn!("Dropping speak while disconnected");
            return Err(SessionError::NotConnected);
        }

        let speak_id = {
            let mut ids = self.speak_ids.lock();
            let id = match ids.open {
                Some(open) if !start => open,
                _ => {
                    ids.last += 1;
                    ids.last
                }
            };
            ids.open = if end { None } else { Some(id) };
            id
        };

        self.send(Command::Speak { speak_id, text: text.into(), start, end })?;
        Ok(speak_id)
    }

    pub fn change_state(&self, state: impl Into<String>) -> Result<()> {
        self.send(Command::StateChange { state: state.into() })
    }

    /// Pause or resume real-time streams.
    pub fn set_invisible(&self, enabled: bool) {
        let _ = self.commands.send(ClientCommand::SetInvisible(enabled));
    }

    pub fn network_changed(&self, up: bool) {
        let _ = self.commands.send(ClientCommand::NetworkChanged(up));
    }

    /// Leave the session and stop.
    pub fn close(&self) {
        let _ = self.commands.send(ClientCommand::Close);
    }

    /// Stop immediately without a leave message.
    pub fn abort(&self) {
        self.cancel.cancel();
    }
}

/// Spawns protocol client actors
pub struct ProtocolClient;

impl ProtocolClient {
    /// Spawn a client for an established session.
    ///
    /// The client stops when `cancel` fires, when closed through its handle, or
    /// after it reports [`ProtocolEvent::RestartRequired`] or
    /// [`ProtocolEvent::Kicked`]. [`ProtocolEvent::Closed`] is always last.
    pub fn spawn(params: ClientParams, cancel: CancellationToken) -> ClientChannels {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);

        let actor = ClientActor {
            query: handshake::connect_query(&params.session),
            retry: RetryState::new(params.config.retry),
            connector: params.connector,
            session: params.session,
            config: params.config,
            store: params.store,
            pool: params.pool,
            tracker: params.tracker,
            resume_next: params.resume.is_some(),
            first_resume: params.resume,
            invisible: params.invisible,
            network_up: params.network_up,
            events: event_tx,
            state: state_tx,
            cancel: cancel.clone(),
        };
        tokio::spawn(actor.run(command_rx));

        let handle = ProtocolHandle {
            commands: command_tx,
            state: state_rx,
            speak_ids: Arc::new(Mutex::new(SpeakIds::default())),
            cancel,
        };
        ClientChannels { handle, events: event_rx }
    }
}

/// How one connection ended
#[derive(Debug)]
enum ConnectionEnd {
    Closed,
    Kicked,
    Restart(RestartReason),
    Lost(CloseReason),
}

struct ClientActor {
    connector: Arc<dyn Connector>,
    session: Session,
    query: Vec<(String, String)>,
    config: ClientConfig,
    store: Arc<FrameStore>,
    pool: DecodePool,
    tracker: Arc<PlaybackTracker>,
    retry: RetryState,
    resume_next: bool,
    first_resume: Option<ResumeParams>,
    invisible: bool,
    network_up: bool,
    events: mpsc::UnboundedSender<ProtocolEvent>,
    state: watch::Sender<ConnectionState>,
    cancel: CancellationToken,
}

impl ClientActor {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<ClientCommand>) {
        info!(session_id = %self.session.session_id, "Protocol client started");

        if let Some(mut transport) = self.connect_initial().await {
            loop {
                match self.serve(transport.as_mut(), &mut commands).await {
                    ConnectionEnd::Lost(reason) => {
                        transport.close().await;
                        warn!(?reason, "Transport lost");
                        self.set_state(ConnectionState::Disconnected);
                        self.emit(ProtocolEvent::Disconnected { reason });
                        self.resume_next = true;

                        match self.reconnect(&mut commands).await {
                            Some(next) => transport = next,
                            None => break,
                        }
                    }
                    ConnectionEnd::Restart(reason) => {
                        transport.close().await;
                        warn!(%reason, "Connection needs a restart");
                        self.emit(ProtocolEvent::RestartRequired { reason });
                        break;
                    }
                    ConnectionEnd::Kicked | ConnectionEnd::Closed => {
                        transport.close().await;
                        break;
                    }
                }
            }
        }

        self.set_state(ConnectionState::Closed);
        self.emit(ProtocolEvent::Closed);
        info!(session_id = %self.session.session_id, "Protocol client stopped");
    }

    async fn connect_initial(&mut self) -> Option<Box<dyn Transport>> {
        self.set_state(ConnectionState::Connecting);
        match self.connect_once().await? {
            Ok(transport) => {
                self.set_state(ConnectionState::Open);
                Some(transport)
            }
            Err(reason) => {
                warn!(%reason, "Connect failed");
                let reason = RestartReason::ConnectFailed(reason);
                self.emit(ProtocolEvent::RestartRequired { reason });
                None
            }
        }
    }

    /// One bounded connect attempt. `None` when cancelled.
    async fn connect_once(&self) -> Option<std::result::Result<Box<dyn Transport>, String>> {
        let url = &self.session.transport_url;
        let connect =
            timeout(self.config.connect_timeout, self.connector.connect(url, &self.query));
        let attempt = tokio::select! {
            _ = self.cancel.cancelled() => return None,
            result = connect => result,
        };
        Some(match attempt {
            Ok(Ok(transport)) => Ok(transport),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("timed out after {:?}", self.config.connect_timeout)),
        })
    }

    async fn serve(
        &mut self,
        transport: &mut dyn Transport,
        commands: &mut mpsc::UnboundedReceiver<ClientCommand>,
    ) -> ConnectionEnd {
        self.send(transport, handshake::enter_command(&self.session)).await;
        if self.invisible {
            self.send(transport, Command::Invisible { enabled: true }).await;
        }

        let inactivity = sleep(self.config.inactivity_timeout);
        tokio::pin!(inactivity);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("Protocol client cancelled");
                    return ConnectionEnd::Closed;
                }
                _ = &mut inactivity => {
                    warn!(timeout = ?self.config.inactivity_timeout, "No inbound traffic");
                    return ConnectionEnd::Restart(RestartReason::Inactivity);
                }
                command = commands.recv() => match command {
                    None | Some(ClientCommand::Close) => {
                        self.send(transport, Command::Leave).await;
                        return ConnectionEnd::Closed;
                    }
                    Some(ClientCommand::Send(command)) => self.send(transport, command).await,
                    Some(ClientCommand::SetInvisible(enabled)) => {
                        if self.apply_invisible(enabled) {
                            self.send(transport, Command::Invisible { enabled }).await;
                        }
                    }
                    Some(ClientCommand::NetworkChanged(up)) => self.network_up = up,
                },
                event = transport.recv() => match event {
                    None => return ConnectionEnd::Lost(CloseReason::Lost),
                    Some(TransportEvent::Closed(reason)) if reason.is_manual() => {
                        return ConnectionEnd::Closed;
                    }
                    Some(TransportEvent::Closed(reason)) => return ConnectionEnd::Lost(reason),
                    Some(TransportEvent::Error(message)) => {
                        warn!(error = %message, "Transport error");
                    }
                    Some(TransportEvent::Message { event, payload }) => {
                        inactivity.as_mut().reset(Instant::now() + self.config.inactivity_timeout);
                        match wire::parse_inbound(&event, payload) {
                            Ok(message) => {
                                if let Some(end) = self.dispatch(transport, message).await {
                                    return end;
                                }
                            }
                            Err(error) => {
                                warn!(%event, %error, "Dropping inbound message");
                                self.emit(ProtocolEvent::FrameDropped { event, error });
                            }
                        }
                    }
                },
            }
        }
    }

    async fn dispatch(
        &mut self,
        transport: &mut dyn Transport,
        message: InboundMessage,
    ) -> Option<ConnectionEnd> {
        trace!(kind = message.kind(), "Inbound message");

        match message {
            InboundMessage::TimeSync { server_time } => {
                let clock = FrameClock::new(server_time, Instant::now(), self.config.fps);
                let resume = match self.first_resume.take() {
                    Some(params) => Some(params),
                    None => self.resume_next.then(|| self.tracker.resume_params()),
                };
                let resumed = resume.is_some();

                self.send(transport, handshake::sync_ack(&clock, resume)).await;
                self.retry.reset();
                info!(server_time, resumed, "Handshake complete");
                self.emit(ProtocolEvent::Ready { resumed, clock });
            }
            InboundMessage::Body(batch) => {
                if self.invisible {
                    trace!(units = batch.len(), "Invisible, dropping body units");
                    return None;
                }
                let (records, tasks): (Vec<_>, Vec<_>) =
                    batch.into_iter().map(BodyMessage::into_parts).unzip();
                let outcome = self.store.append_body(records);
                if outcome.rejected > 0 {
                    debug!(rejected = outcome.rejected, "Stale body units rejected");
                }
                self.pool.enqueue(tasks);
            }
            InboundMessage::Face(bytes) => {
                if self.invisible {
                    trace!("Invisible, dropping face batch");
                    return None;
                }
                match face::decode_batch(&bytes) {
                    Ok(records) => {
                        self.store.append_face(records);
                    }
                    Err(error) => {
                        warn!(%error, "Dropping face batch");
                        self.emit(ProtocolEvent::FrameDropped { event: "face".to_string(), error });
                    }
                }
            }
            InboundMessage::Audio(batch) => {
                self.store.append_audio(batch.into_iter().map(AudioMessage::into_record).collect());
            }
            InboundMessage::Event(batch) => {
                let records = batch.into_iter().map(EventMessage::into_record).collect();
                self.store.append_events(records);
            }
            InboundMessage::StateChange { state } => {
                debug!(%state, "Server state changed");
                self.emit(ProtocolEvent::StateChanged { state });
            }
            InboundMessage::Error(report) if report.is_kick() => {
                warn!(code = report.code, reason = %report.message, "Kicked by server");
                self.emit(ProtocolEvent::Kicked { code: report.code, message: report.message });
                return Some(ConnectionEnd::Kicked);
            }
            InboundMessage::Error(report) => {
                warn!(code = report.code, reason = %report.message, "Server error");
                let (code, message) = (report.code, report.message);
                self.emit(ProtocolEvent::ServerError { code, message });
            }
            InboundMessage::Pong => {}
        }
        None
    }

    /// Reconnect under the transport retry policy. `None` when the client
    /// should stop.
    async fn reconnect(
        &mut self,
        commands: &mut mpsc::UnboundedReceiver<ClientCommand>,
    ) -> Option<Box<dyn Transport>> {
        let budget = self.session.reconnect_client_timeout();
        // The reconnect budget only runs while the host reports no network
        let mut deadline = (!self.network_up).then(|| Instant::now() + budget);

        loop {
            let delay = match self.retry.on_failure() {
                RetryDecision::Retry { round, attempt, delay } => {
                    self.set_state(ConnectionState::Reconnecting);
                    info!(round, attempt, ?delay, "Reconnecting");
                    delay
                }
                RetryDecision::Exhausted { rounds } => {
                    warn!(rounds, "Reconnect attempts exhausted");
                    self.emit(ProtocolEvent::RestartRequired {
                        reason: RestartReason::ReconnectExhausted { rounds },
                    });
                    return None;
                }
            };

            let wake = Instant::now() + delay;
            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => return None,
                    _ = sleep_until(wake) => break,
                    _ = expire(deadline) => {
                        warn!(?budget, "Reconnect budget spent while offline");
                        let reason = RestartReason::ReconnectTimeout;
                        self.emit(ProtocolEvent::RestartRequired { reason });
                        return None;
                    }
                    command = commands.recv() => match command {
                        None | Some(ClientCommand::Close) => return None,
                        Some(ClientCommand::NetworkChanged(true)) => {
                            self.network_up = true;
                            deadline = None;
                            break;
                        }
                        Some(ClientCommand::NetworkChanged(false)) => {
                            self.network_up = false;
                            if deadline.is_none() {
                                deadline = Some(Instant::now() + budget);
                            }
                        }
                        Some(ClientCommand::SetInvisible(enabled)) => {
                            self.apply_invisible(enabled);
                        }
                        Some(ClientCommand::Send(command)) => {
                            warn!(event = command.event(), "Dropping command while reconnecting");
                        }
                    },
                }
            }

            match self.connect_once().await? {
                Ok(transport) => {
                    info!("Transport reconnected");
                    self.set_state(ConnectionState::Open);
                    return Some(transport);
                }
                Err(reason) => warn!(%reason, "Reconnect failed"),
            }
        }
    }

    /// Returns whether the mode changed.
    fn apply_invisible(&mut self, enabled: bool) -> bool {
        if self.invisible == enabled {
            return false;
        }
        info!(paused = enabled, "Real-time streams toggled");
        self.invisible = enabled;
        self.store.clear_animation();
        if enabled {
            self.pool.reset();
        }
        true
    }

    async fn send(&self, transport: &mut dyn Transport, command: Command) {
        if command.requires_connection() && !transport.is_connected() {
            warn!(event = command.event(), "Dropping command while disconnected");
            return;
        }
        trace!(event = command.event(), "Sending command");
        if let Err(e) = transport.send(command.event(), command.payload()).await {
            warn!(event = command.event(), error = %e, "Failed to send command");
        }
    }

    fn emit(&self, event: ProtocolEvent) {
        if self.events.send(event).is_err() {
            trace!("Protocol event receiver dropped");
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }
}

async fn expire(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::face::encode_batch;
    use crate::decode::{DecodePoolConfig, PoolContext};
    use crate::resource::{AssetCache, AssetCacheConfig};
    use crate::test_utils::{MockConnector, MockDecoder, MockFetcher, MockServer};
    use crate::types::{FaceFrame, StartResponse};
    use bytes::Bytes;
    use serde_json::json;

    const PACK: &str = "https://cdn.example.test/pack";

    struct Fixture {
        store: Arc<FrameStore>,
        tracker: Arc<PlaybackTracker>,
        pool: DecodePool,
        connector: Arc<MockConnector>,
        servers: mpsc::UnboundedReceiver<MockServer>,
    }

    fn fixture() -> Fixture {
        let fetcher = Arc::new(MockFetcher::new());
        fetcher.respond_bytes(&format!("{PACK}/idle01"), vec![0u8; 16]);
        let assets = AssetCache::new(
            fetcher,
            AssetCacheConfig::default(),
            Duration::from_secs(2),
            CancellationToken::new(),
        );
        assets.set_base_url(PACK);

        let store = Arc::new(FrameStore::new());
        let tracker = Arc::new(PlaybackTracker::new());
        let context = PoolContext {
            assets: Arc::new(assets),
            decoder: Arc::new(MockDecoder::new(24)),
            store: Arc::clone(&store),
            tracker: Arc::clone(&tracker),
        };
        let pool =
            DecodePool::spawn(DecodePoolConfig::default(), 4, context, CancellationToken::new());
        let (connector, servers) = MockConnector::new();
        Fixture { store, tracker, pool, connector, servers }
    }

    fn session() -> Session {
        Session::from_start(StartResponse {
            session_id: "s-1".into(),
            room: "r-1".into(),
            token: "t-1".into(),
            transport_url: "wss://rt.example.test/ws".into(),
            resource_pack: PACK.into(),
            reconnect_timeout: 60,
            reconnect_client_timeout: 20,
            config: serde_json::Value::Null,
        })
    }

    fn params(fx: &Fixture, config: ClientConfig) -> ClientParams {
        ClientParams {
            connector: fx.connector.clone(),
            session: session(),
            config,
            store: Arc::clone(&fx.store),
            pool: fx.pool.clone(),
            tracker: Arc::clone(&fx.tracker),
            resume: None,
            invisible: false,
            network_up: true,
        }
    }

    fn spawn(fx: &Fixture, config: ClientConfig) -> ClientChannels {
        ProtocolClient::spawn(params(fx, config), CancellationToken::new())
    }

    async fn next_event(events: &mut mpsc::UnboundedReceiver<ProtocolEvent>) -> ProtocolEvent {
        tokio::time::timeout(Duration::from_secs(60), events.recv())
            .await
            .expect("no protocol event")
            .expect("event channel closed")
    }

    /// Accept a connection and complete the handshake.
    async fn handshake(
        fx: &mut Fixture,
        events: &mut mpsc::UnboundedReceiver<ProtocolEvent>,
    ) -> MockServer {
        let mut server = fx.servers.recv().await.expect("client connects");
        let enter = server.expect("enter").await;
        assert_eq!(enter["session_id"], "s-1");

        server.send_json("time_sync", json!({ "server_time": 100.0 }));
        server.expect("sync_ack").await;
        assert!(matches!(next_event(events).await, ProtocolEvent::Ready { .. }));
        server
    }

    #[tokio::test]
    async fn handshake_sends_enter_then_sync_ack() {
        let mut fx = fixture();
        let ClientChannels { handle, mut events } = spawn(&fx, ClientConfig::default());

        let mut server = fx.servers.recv().await.unwrap();
        let enter = server.expect("enter").await;
        assert_eq!(enter["room"], "r-1");
        assert_eq!(enter["token"], "t-1");

        server.send_json("time_sync", json!({ "server_time": 100.0 }));
        let ack = server.expect("sync_ack").await;
        assert_eq!(ack["server_time"], 100.0);
        assert_eq!(ack["fps"], 25);
        assert!(ack["resume"].is_null());

        match next_event(&mut events).await {
            ProtocolEvent::Ready { resumed, clock } => {
                assert!(!resumed);
                assert_eq!(clock.server_time(), 100.0);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(handle.is_connected());

        let query = fx.connector.connects();
        assert!(query[0].query.contains(&("session_id".to_string(), "s-1".to_string())));
        handle.close();
    }

    #[tokio::test]
    async fn body_and_face_reach_the_caches() {
        let mut fx = fixture();
        let ClientChannels { handle, mut events } = spawn(&fx, ClientConfig::default());
        let server = handshake(&mut fx, &mut events).await;

        server.send_json("body", json!({ "n": "idle01", "sf": 0, "ef": 24, "body_id": 1 }));
        let face = encode_batch(0, &vec![FaceFrame::default(); 24]).unwrap();
        server.send_binary("face", Bytes::from(face));

        let mut snapshots = fx.pool.snapshots();
        let decoded = snapshots.wait_for(|s| s.last_decoded == Some(23));
        tokio::time::timeout(Duration::from_secs(5), decoded).await.unwrap().unwrap();

        assert_eq!(fx.store.body().len(), 1);
        tokio::time::timeout(Duration::from_secs(5), async {
            while fx.store.face().len() < 24 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        let frame = fx.store.next_animation_frame(3).unwrap();
        assert!(frame.face.is_some());
        assert_eq!(frame.body.unwrap().body_id, 1);
        handle.close();
    }

    #[tokio::test]
    async fn malformed_message_is_dropped_and_connection_survives() {
        let mut fx = fixture();
        let ClientChannels { handle, mut events } = spawn(&fx, ClientConfig::default());
        let mut server = handshake(&mut fx, &mut events).await;

        server.send_binary("face", Bytes::from_static(b"not deflate"));
        match next_event(&mut events).await {
            ProtocolEvent::FrameDropped { event, .. } => assert_eq!(event, "face"),
            other => panic!("unexpected event {other:?}"),
        }

        let overflowing = json!({ "n": "x", "ls": u32::MAX, "sf": 0, "ef": 3, "body_id": 1 });
        server.send_json("body", overflowing);
        match next_event(&mut events).await {
            ProtocolEvent::FrameDropped { event, .. } => assert_eq!(event, "body"),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(fx.store.body().is_empty());

        server.send_json("state", json!({ "state": "listening" }));
        match next_event(&mut events).await {
            ProtocolEvent::StateChanged { state } => assert_eq!(state, "listening"),
            other => panic!("unexpected event {other:?}"),
        }

        handle.speak("hello").unwrap();
        let speak = server.expect("speak").await;
        assert_eq!(speak["text"], "hello");
        handle.close();
    }

    #[tokio::test]
    async fn kick_stops_the_client() {
        let mut fx = fixture();
        let ClientChannels { handle, mut events } = spawn(&fx, ClientConfig::default());
        let server = handshake(&mut fx, &mut events).await;

        server.send_json("error", json!({ "code": 4001, "message": "replaced" }));
        match next_event(&mut events).await {
            ProtocolEvent::Kicked { code, .. } => assert_eq!(code, 4001),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(matches!(next_event(&mut events).await, ProtocolEvent::Closed));
        assert_eq!(handle.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn invisible_mode_drops_body_units() {
        let mut fx = fixture();
        let ClientChannels { handle, mut events } = spawn(&fx, ClientConfig::default());
        let mut server = handshake(&mut fx, &mut events).await;

        handle.set_invisible(true);
        let notice = server.expect("invisible").await;
        assert_eq!(notice["enabled"], true);

        server.send_json("body", json!({ "n": "idle01", "sf": 0, "ef": 24, "body_id": 1 }));
        server.send_json("state", json!({ "state": "idle" }));
        assert!(matches!(next_event(&mut events).await, ProtocolEvent::StateChanged { .. }));
        assert!(fx.store.body().is_empty());
        handle.close();
    }

    #[tokio::test(start_paused = true)]
    async fn unexpected_close_reconnects_with_resume() {
        let mut fx = fixture();
        fx.tracker.set_session_id("s-1");
        fx.tracker.record_decoded(42);
        let ClientChannels { handle, mut events } = spawn(&fx, ClientConfig::default());
        let server = handshake(&mut fx, &mut events).await;

        server.drop_connection();
        match next_event(&mut events).await {
            ProtocolEvent::Disconnected { reason } => assert_eq!(reason, CloseReason::Lost),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(handle.speak("too early").is_err());

        let mut server = fx.servers.recv().await.expect("client reconnects");
        server.expect("enter").await;
        server.send_json("time_sync", json!({ "server_time": 130.0 }));
        let ack = server.expect("sync_ack").await;
        assert_eq!(ack["resume"]["last_session_id"], "s-1");
        assert_eq!(ack["resume"]["last_decoded_frame"], 42);

        match next_event(&mut events).await {
            ProtocolEvent::Ready { resumed, .. } => assert!(resumed),
            other => panic!("unexpected event {other:?}"),
        }
        handle.close();
    }

    #[tokio::test(start_paused = true)]
    async fn first_handshake_reports_the_resume_snapshot() {
        let mut fx = fixture();
        let snapshot = ResumeParams {
            last_decoded_frame: Some(57),
            current_clip_name: Some("idle01".into()),
            last_session_id: Some("s-0".into()),
            ..ResumeParams::default()
        };
        let params =
            ClientParams { resume: Some(snapshot), ..params(&fx, ClientConfig::default()) };
        let ClientChannels { handle, mut events } =
            ProtocolClient::spawn(params, CancellationToken::new());

        let mut server = fx.servers.recv().await.expect("client connects");
        server.expect("enter").await;
        server.send_json("time_sync", json!({ "server_time": 100.0 }));
        let ack = server.expect("sync_ack").await;
        assert_eq!(ack["resume"]["last_decoded_frame"], 57);
        assert_eq!(ack["resume"]["current_clip_name"], "idle01");
        assert_eq!(ack["resume"]["last_session_id"], "s-0");
        let ready = next_event(&mut events).await;
        assert!(matches!(ready, ProtocolEvent::Ready { resumed: true, .. }));

        // Reconnects report live progress instead
        fx.tracker.set_session_id("s-1");
        fx.tracker.record_decoded(3);
        server.drop_connection();
        assert!(matches!(next_event(&mut events).await, ProtocolEvent::Disconnected { .. }));

        let mut server = fx.servers.recv().await.expect("client reconnects");
        server.expect("enter").await;
        server.send_json("time_sync", json!({ "server_time": 120.0 }));
        let ack = server.expect("sync_ack").await;
        assert_eq!(ack["resume"]["last_decoded_frame"], 3);
        assert_eq!(ack["resume"]["last_session_id"], "s-1");
        handle.close();
    }

    #[tokio::test(start_paused = true)]
    async fn silence_requires_restart() {
        let mut fx = fixture();
        let config =
            ClientConfig { inactivity_timeout: Duration::from_secs(30), ..ClientConfig::default() };
        let ClientChannels { handle: _handle, mut events } = spawn(&fx, config);
        let _server = handshake(&mut fx, &mut events).await;

        match next_event(&mut events).await {
            ProtocolEvent::RestartRequired { reason } => {
                assert_eq!(reason, RestartReason::Inactivity)
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(matches!(next_event(&mut events).await, ProtocolEvent::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn offline_reconnect_budget_expires() {
        let mut fx = fixture();
        let ClientChannels { handle, mut events } = spawn(&fx, ClientConfig::default());
        let server = handshake(&mut fx, &mut events).await;

        handle.network_changed(false);
        fx.connector.fail_next(u32::MAX);
        server.drop_connection();
        assert!(matches!(next_event(&mut events).await, ProtocolEvent::Disconnected { .. }));

        let started = Instant::now();
        match next_event(&mut events).await {
            ProtocolEvent::RestartRequired { reason } => {
                assert_eq!(reason, RestartReason::ReconnectTimeout)
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(started.elapsed() <= Duration::from_secs(21));
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_exhaustion_requires_restart() {
        let mut fx = fixture();
        let retry =
            RetryPolicy { max_attempts_per_round: 2, max_rounds: 1, ..RetryPolicy::default() };
        let config = ClientConfig { retry, ..ClientConfig::default() };
        let ClientChannels { handle: _handle, mut events } = spawn(&fx, config);
        let server = handshake(&mut fx, &mut events).await;

        fx.connector.fail_next(u32::MAX);
        server.drop_connection();
        assert!(matches!(next_event(&mut events).await, ProtocolEvent::Disconnected { .. }));
        match next_event(&mut events).await {
            ProtocolEvent::RestartRequired { reason } => {
                assert_eq!(reason, RestartReason::ReconnectExhausted { rounds: 1 })
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn speak_ids_increase_across_utterances() {
        let mut fx = fixture();
        let ClientChannels { handle, mut events } = spawn(&fx, ClientConfig::default());
        let _server = handshake(&mut fx, &mut events).await;

        let first = handle.speak_chunk("Hel", true, false).unwrap();
        let second = handle.speak_chunk("lo", false, true).unwrap();
        let third = handle.speak("again").unwrap();
        assert_eq!(first, second);
        assert!(third > first);
        handle.close();
    }
}
