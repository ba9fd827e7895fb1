//! Test doubles for the host-supplied edges
//!
//! In-memory implementations of [`ResourceFetcher`], [`SegmentDecoder`] and
//! [`Connector`]/[`Transport`] used by unit tests, the integration tests and the
//! benches. A [`MockServer`] is the far end of each [`MockTransport`]: tests
//! script the server by sending events through it and inspect what the client
//! sent.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::decode::SegmentDecoder;
use crate::resource::{ProgressFn, ResourceFetcher};
use crate::transport::{CloseReason, Connector, Payload, Transport, TransportEvent};
use crate::types::DecodedImage;
use crate::{Result, SessionError};

/// Install a test-friendly tracing subscriber honouring `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// One recorded `post_json` call.
#[derive(Debug, Clone)]
pub struct PostRecord {
    pub url: String,
    pub body: Value,
    pub headers: Vec<(String, String)>,
}

#[derive(Debug, Default)]
struct FetcherState {
    bytes: HashMap<String, Bytes>,
    json: HashMap<String, Value>,
    fetches: HashMap<String, usize>,
    posts: Vec<PostRecord>,
    delay: Option<Duration>,
}

/// URL-keyed canned responses.
#[derive(Debug, Default)]
pub struct MockFetcher {
    state: Mutex<FetcherState>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `bytes` for GETs of `url`.
    pub fn respond_bytes(&self, url: &str, bytes: Vec<u8>) {
        self.state.lock().bytes.insert(url.to_string(), Bytes::from(bytes));
    }

    /// Answer POSTs to `url` with `body`.
    pub fn respond_json(&self, url: &str, body: Value) {
        self.state.lock().json.insert(url.to_string(), body);
    }

    /// Delay every byte fetch.
    pub fn set_delay(&self, delay: Duration) {
        self.state.lock().delay = Some(delay);
    }

    /// Byte fetches issued for `url`, including failed ones.
    pub fn fetch_count(&self, url: &str) -> usize {
        self.state.lock().fetches.get(url).copied().unwrap_or(0)
    }

    pub fn posts(&self) -> Vec<PostRecord> {
        self.state.lock().posts.clone()
    }
}

#[async_trait::async_trait]
impl ResourceFetcher for MockFetcher {
    async fn fetch_bytes(&self, url: &str, progress: Option<&ProgressFn>) -> Result<Bytes> {
        let delay = {
            let mut state = self.state.lock();
            *state.fetches.entry(url.to_string()).or_default() += 1;
            state.delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let bytes = self.state.lock().bytes.get(url).cloned();
        match bytes {
            Some(bytes) => {
                if let Some(progress) = progress {
                    progress(bytes.len() as u64, Some(bytes.len() as u64));
                }
                Ok(bytes)
            }
            None => Err(SessionError::fetch_failed(url, "404 not found")),
        }
    }

    async fn post_json(
        &self,
        url: &str,
        body: Value,
        headers: &[(String, String)],
    ) -> Result<Value> {
        let mut state = self.state.lock();
        state.posts.push(PostRecord { url: url.to_string(), body, headers: headers.to_vec() });
        state
            .json
            .get(url)
            .cloned()
            .ok_or_else(|| SessionError::fetch_failed(url, "no response configured"))
    }
}

/// Decodes any segment into `frames` 1x1 images whose single byte is the
/// local frame index.
#[derive(Debug, Clone)]
pub struct MockDecoder {
    frames: u32,
}

impl MockDecoder {
    pub fn new(frames: u32) -> Self {
        Self { frames }
    }
}

#[async_trait::async_trait]
impl SegmentDecoder for MockDecoder {
    async fn decode(&self, _name: &str, _bytes: Bytes) -> Result<Vec<DecodedImage>> {
        Ok((0..self.frames).map(|i| DecodedImage::new(1, 1, vec![i as u8; 4])).collect())
    }
}

/// Client half of an in-memory connection.
#[derive(Debug)]
pub struct MockTransport {
    inbound: mpsc::UnboundedReceiver<TransportEvent>,
    outbound: mpsc::UnboundedSender<(String, Value)>,
    connected: Arc<AtomicBool>,
}

/// Server half of an in-memory connection.
#[derive(Debug)]
pub struct MockServer {
    inbound: mpsc::UnboundedSender<TransportEvent>,
    outbound: mpsc::UnboundedReceiver<(String, Value)>,
    connected: Arc<AtomicBool>,
}

/// A connected transport and its server end.
pub fn mock_pair() -> (MockTransport, MockServer) {
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let connected = Arc::new(AtomicBool::new(true));
    (
        MockTransport {
            inbound: inbound_rx,
            outbound: outbound_tx,
            connected: Arc::clone(&connected),
        },
        MockServer { inbound: inbound_tx, outbound: outbound_rx, connected },
    )
}

#[async_trait::async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, event: &str, payload: Value) -> Result<()> {
        if !self.is_connected() {
            return Err(SessionError::NotConnected);
        }
        self.outbound.send((event.to_string(), payload)).map_err(|_| SessionError::NotConnected)
    }

    async fn recv(&mut self) -> Option<TransportEvent> {
        self.inbound.recv().await
    }

    async fn close(&mut self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl MockServer {
    pub fn send_json(&self, event: &str, body: Value) {
        let payload = Payload::Json(body);
        self.push(TransportEvent::Message { event: event.to_string(), payload });
    }

    pub fn send_binary(&self, event: &str, bytes: Bytes) {
        let payload = Payload::Binary(bytes);
        self.push(TransportEvent::Message { event: event.to_string(), payload });
    }

    /// Close from the server side.
    pub fn close(&self, reason: CloseReason) {
        self.connected.store(false, Ordering::SeqCst);
        self.push(TransportEvent::Closed(reason));
    }

    /// Drop the connection without a close handshake.
    pub fn drop_connection(&self) {
        self.close(CloseReason::Lost);
    }

    pub fn is_client_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Next message the client sent.
    pub async fn next_sent(&mut self) -> Option<(String, Value)> {
        self.outbound.recv().await
    }

    /// Skip ahead to the next `event` the client sent and return its payload.
    ///
    /// # Panics
    ///
    /// Panics if the client goes away first.
    pub async fn expect(&mut self, event: &str) -> Value {
        while let Some((sent, payload)) = self.outbound.recv().await {
            if sent == event {
                return payload;
            }
        }
        panic!("client closed before sending '{event}'");
    }

    fn push(&self, event: TransportEvent) {
        // The client may already be gone
        let _ = self.inbound.send(event);
    }
}

/// One recorded connect call.
#[derive(Debug, Clone)]
pub struct ConnectRecord {
    pub url: String,
    pub query: Vec<(String, String)>,
}

/// Hands every successful connection's [`MockServer`] to the test.
#[derive(Debug)]
pub struct MockConnector {
    servers: mpsc::UnboundedSender<MockServer>,
    failures: Mutex<u32>,
    connects: Mutex<Vec<ConnectRecord>>,
}

impl MockConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<MockServer>) {
        let (servers_tx, servers_rx) = mpsc::unbounded_channel();
        let connector =
            Self { servers: servers_tx, failures: Mutex::new(0), connects: Mutex::new(Vec::new()) };
        (Arc::new(connector), servers_rx)
    }

    /// Refuse the next `count` connects.
    pub fn fail_next(&self, count: u32) {
        *self.failures.lock() = count;
    }

    /// Every connect attempt so far, failed ones included.
    pub fn connects(&self) -> Vec<ConnectRecord> {
        self.connects.lock().clone()
    }
}

#[async_trait::async_trait]
impl Connector for MockConnector {
    async fn connect(&self, url: &str, query: &[(String, String)]) -> Result<Box<dyn Transport>> {
        self.connects.lock().push(ConnectRecord { url: url.to_string(), query: query.to_vec() });

        {
            let mut failures = self.failures.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(SessionError::connection_failed("connection refused"));
            }
        }

        let (transport, server) = mock_pair();
        let _ = self.servers.send(server);
        Ok(Box::new(transport))
    }
}
