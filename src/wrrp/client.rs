//! WRRP Client
//!
//! One upgraded stream to the relay, multiplexed across every remote
//! session this node talks to.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use super::codec::{Frame, WrrpCodec};
use super::protocol::Command;
use super::{read_http_head, UPGRADE_PATH};
use crate::config::RelayConfig;
use crate::error::{Error, Result};
use crate::peer::{PeerId, PeerRegistry, PublicKey, SessionId};
use crate::signal::SignalSender;

type FrameSink = SplitSink<Framed<TcpStream, WrrpCodec>, Frame>;
type FrameStream = SplitStream<Framed<TcpStream, WrrpCodec>>;

const ROUTE_CAPACITY: usize = 256;
const SIGNAL_CAPACITY: usize = 256;

/// Inbound signaling payloads, tagged with the source session
pub type SignalInbox = mpsc::Receiver<(SessionId, Bytes)>;

/// Inbound half of one remote session's forwarded traffic
pub struct RelayRoute {
    pub remote: SessionId,
    pub id: u64,
    pub rx: mpsc::Receiver<Bytes>,
}

/// Relay client session
pub struct WrrpClient {
    relay_addr: String,
    local_session: SessionId,
    sink: Mutex<FrameSink>,
    routes: RwLock<HashMap<SessionId, (u64, mpsc::Sender<Bytes>)>>,
    next_route: AtomicU64,
    last_seen: StdMutex<Instant>,
    liveness_timeout: Duration,
    closed: CancellationToken,
}

impl WrrpClient {
    /// Connect, upgrade and register with the relay at `relay_addr`
    pub async fn connect(
        relay_addr: &str,
        local_key: &PublicKey,
        config: &RelayConfig,
    ) -> Result<(Arc<Self>, SignalInbox)> {
        let mut stream = tokio::time::timeout(config.connect_timeout(), TcpStream::connect(relay_addr))
            .await
            .map_err(|_| Error::DialFailed {
                kind: "relay".into(),
                reason: format!("connect to {} timed out", relay_addr),
            })??;
        stream.set_nodelay(true)?;

        let request = format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nUpgrade: wrrp\r\nConnection: Upgrade\r\n\r\n",
            UPGRADE_PATH, relay_addr
        );
        stream.write_all(request.as_bytes()).await?;

        let head = tokio::time::timeout(config.connect_timeout(), read_http_head(&mut stream))
            .await
            .map_err(|_| Error::DialFailed {
                kind: "relay".into(),
                reason: "upgrade response timed out".into(),
            })??;
        let status = head.lines().next().unwrap_or_default();
        if !status.contains(" 101") {
            return Err(Error::DialFailed {
                kind: "relay".into(),
                reason: format!("upgrade refused: {}", status),
            });
        }

        let local_session = SessionId::from_public_key(local_key);
        let (mut sink, stream) = Framed::new(stream, WrrpCodec::new(config.max_frame_size)).split();
        sink.send(Frame::register(local_session)).await?;
        tracing::info!("Registered relay session {} at {}", local_session, relay_addr);

        let client = Arc::new(Self {
            relay_addr: relay_addr.to_string(),
            local_session,
            sink: Mutex::new(sink),
            routes: RwLock::new(HashMap::new()),
            next_route: AtomicU64::new(1),
            last_seen: StdMutex::new(Instant::now()),
            liveness_timeout: config.liveness_timeout(),
            closed: CancellationToken::new(),
        });

        let (signal_tx, signal_rx) = mpsc::channel(SIGNAL_CAPACITY);
        tokio::spawn(Arc::clone(&client).read_loop(stream, signal_tx));
        tokio::spawn(Arc::clone(&client).keepalive_loop(config.keepalive_interval()));

        Ok((client, signal_rx))
    }

    pub fn local_session(&self) -> SessionId {
        self.local_session
    }

    pub fn relay_addr(&self) -> &str {
        &self.relay_addr
    }

    /// Whether the session is open and a frame arrived within the liveness window
    pub fn is_alive(&self) -> bool {
        if self.closed.is_cancelled() {
            return false;
        }
        match self.last_seen.lock() {
            Ok(seen) => seen.elapsed() <= self.liveness_timeout,
            Err(_) => false,
        }
    }

    /// Token cancelled when the relay session ends
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Start receiving forwarded payloads from `remote`, replacing any
    /// previous route for it
    pub async fn register_route(&self, remote: SessionId) -> RelayRoute {
        let (tx, rx) = mpsc::channel(ROUTE_CAPACITY);
        let id = self.next_route.fetch_add(1, Ordering::Relaxed);
        self.routes.write().await.insert(remote, (id, tx));
        RelayRoute { remote, id, rx }
    }

    /// Remove a route, unless it was replaced since
    pub async fn unregister_route(&self, remote: &SessionId, id: u64) {
        let mut routes = self.routes.write().await;
        if routes.get(remote).map_or(false, |(current, _)| *current == id) {
            routes.remove(remote);
        }
    }

    pub async fn send_forward(&self, remote: SessionId, payload: Bytes) -> Result<()> {
        self.send_frame(Frame::forward(remote, payload)).await
    }

    pub async fn send_probe(&self, remote: SessionId, payload: Bytes) -> Result<()> {
        self.send_frame(Frame::probe(remote, payload)).await
    }

    async fn send_frame(&self, frame: Frame) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(Error::TransportClosed);
        }
        self.sink.lock().await.send(frame).await
    }

    pub async fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        let _ = self.sink.lock().await.close().await;
        tracing::info!("Relay session {} closed", self.local_session);
    }

    fn touch(&self) {
        if let Ok(mut seen) = self.last_seen.lock() {
            *seen = Instant::now();
        }
    }

    async fn read_loop(self: Arc<Self>, mut stream: FrameStream, signal_tx: mpsc::Sender<(SessionId, Bytes)>) {
        loop {
            let next = tokio::select! {
                _ = self.closed.cancelled() => break,
                next = stream.next() => next,
            };

            match next {
                Some(Ok(frame)) => {
                    self.touch();
                    match frame.cmd() {
                        Command::Forward => {
                            let route = self
                                .routes
                                .read()
                                .await
                                .get(&frame.session_id())
                                .map(|(_, tx)| tx.clone());
                            match route {
                                Some(tx) => {
                                    if tx.try_send(frame.payload).is_err() {
                                        tracing::trace!("Relay route {} full, dropping payload", frame.header.session_id);
                                    }
                                }
                                None => tracing::trace!("No relay route for session {}", frame.header.session_id),
                            }
                        }
                        Command::Probe => {
                            if signal_tx.send((frame.session_id(), frame.payload)).await.is_err() {
                                tracing::debug!("Relay signal inbox dropped");
                            }
                        }
                        Command::Ping | Command::Register => {}
                    }
                }
                Some(Err(e)) => {
                    tracing::warn!("Relay {} read error: {}", self.relay_addr, e);
                    break;
                }
                None => {
                    tracing::info!("Relay {} closed the session", self.relay_addr);
                    break;
                }
            }
        }
        self.closed.cancel();
    }

    async fn keepalive_loop(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.closed.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if !self.is_alive() {
                tracing::warn!(
                    "Relay session {} silent for over {:?}, disconnecting",
                    self.local_session,
                    self.liveness_timeout
                );
                self.closed.cancel();
                break;
            }

            if let Err(e) = self.send_frame(Frame::ping(self.local_session)).await {
                tracing::warn!("Relay ping failed: {}", e);
                self.closed.cancel();
                break;
            }
        }
    }
}

/// Signaling over the relay: packets travel as `Probe` frames
pub struct RelaySignaler {
    client: Arc<WrrpClient>,
    registry: Arc<PeerRegistry>,
}

impl RelaySignaler {
    pub fn new(client: Arc<WrrpClient>, registry: Arc<PeerRegistry>) -> Self {
        Self { client, registry }
    }
}

#[async_trait]
impl SignalSender for RelaySignaler {
    async fn send(&self, peer: PeerId, payload: Bytes) -> Result<()> {
        let key = self
            .registry
            .public_key(&peer)
            .await
            .ok_or(Error::PeerNotFound(peer))?;
        self.client
            .send_probe(SessionId::from_public_key(&key), payload)
            .await
    }
}
