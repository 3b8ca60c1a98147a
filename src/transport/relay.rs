//! Relay dialer
//!
//! Runs the same SYN/ACK handshake as the direct dialer. After the ACK
//! the initiator sends a bare OFFER through the relay as a `Probe` frame.
//! Either side is ready once that OFFER went out or came in, and `dial`
//! hands back a transport multiplexed over the shared relay session.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::handshake::Handshake;
use super::{Dialer, SharedTransport, Transport, TransportKind};
use crate::config::ProbeConfig;
use crate::error::{Error, Result};
use crate::latch::Latch;
use crate::peer::{PeerId, PublicKey, SessionId, SessionTable};
use crate::signal::{PacketType, SignalPacket, SignalSender};
use crate::wrrp::{RelayRoute, WrrpClient};

pub struct RelayDialer {
    local: PeerId,
    remote: PeerId,
    remote_key: PublicKey,
    client: Arc<WrrpClient>,
    sessions: Arc<SessionTable>,
    handshake: Arc<Handshake>,
    ready: Latch,
    route: Mutex<Option<RelayRoute>>,
}

impl RelayDialer {
    pub fn new(
        local: PeerId,
        remote_key: PublicKey,
        client: Arc<WrrpClient>,
        signal: Arc<dyn SignalSender>,
        sessions: Arc<SessionTable>,
        probe_config: &ProbeConfig,
    ) -> Self {
        let remote = remote_key.peer_id();
        let handshake = Handshake::new(
            local,
            remote,
            TransportKind::Relay,
            signal,
            probe_config.syn_interval(),
            probe_config.handshake_timeout(),
        );
        Self {
            local,
            remote,
            remote_key,
            client,
            sessions,
            handshake,
            ready: Latch::new(),
            route: Mutex::new(None),
        }
    }

    pub fn handshake(&self) -> &Arc<Handshake> {
        &self.handshake
    }

    fn remote_session(&self) -> SessionId {
        SessionId::from_public_key(&self.remote_key)
    }

    async fn send_offer(&self) -> Result<()> {
        let offer = SignalPacket::bare_offer(TransportKind::Relay, self.local);
        self.client
            .send_probe(self.remote_session(), Bytes::from(offer.serialize()?))
            .await
    }
}

#[async_trait]
impl Dialer for RelayDialer {
    fn kind(&self) -> TransportKind {
        TransportKind::Relay
    }

    async fn prepare(&self, cancel: &CancellationToken, remote: PeerId) -> Result<()> {
        if remote != self.remote {
            return Err(Error::AgentNotFound(remote));
        }
        if !self.client.is_alive() {
            return Err(Error::DialFailed {
                kind: TransportKind::Relay.to_string(),
                reason: format!("relay {} is not connected", self.client.relay_addr()),
            });
        }

        let mut route = self.route.lock().await;
        if route.is_none() {
            *route = Some(self.client.register_route(self.remote_session()).await);
        }
        drop(route);

        self.handshake.start(cancel);
        Ok(())
    }

    async fn handle(&self, _cancel: &CancellationToken, remote: PeerId, packet: SignalPacket) -> Result<()> {
        if remote != self.remote {
            return Err(Error::AgentNotFound(remote));
        }

        match packet.packet_type {
            PacketType::HandshakeSyn => {
                self.handshake.on_syn().await?;
            }
            PacketType::HandshakeAck => {
                if self.handshake.on_ack() {
                    self.send_offer().await?;
                    self.ready.fire();
                }
            }
            PacketType::Offer | PacketType::Answer => {
                if self.ready.fire() {
                    tracing::debug!("Relay offer from {} received", self.remote);
                }
            }
        }
        Ok(())
    }

    async fn dial(&self, cancel: &CancellationToken) -> Result<SharedTransport> {
        self.handshake.wait_ready(cancel, &self.ready).await?;

        let route = self.route.lock().await.take().ok_or_else(|| Error::DialFailed {
            kind: TransportKind::Relay.to_string(),
            reason: "relay route already taken".into(),
        })?;
        let session = self.sessions.insert(self.remote_key).await;
        tracing::info!("Relay path to {} via session {}", self.remote, session);

        Ok(Arc::new(RelayTransport::new(
            Arc::clone(&self.client),
            self.remote_key,
            route,
            Arc::clone(&self.sessions),
        )))
    }

    async fn abort(&self) {
        if let Some(route) = self.route.lock().await.take() {
            self.client.unregister_route(&route.remote, route.id).await;
        }
    }
}

/// Datagram path through the relay, addressed by the remote session id
pub struct RelayTransport {
    client: Arc<WrrpClient>,
    remote_key: PublicKey,
    remote_session: SessionId,
    route_id: u64,
    rx: Mutex<tokio::sync::mpsc::Receiver<Bytes>>,
    sessions: Arc<SessionTable>,
    closed: CancellationToken,
}

impl RelayTransport {
    pub fn new(client: Arc<WrrpClient>, remote_key: PublicKey, route: RelayRoute, sessions: Arc<SessionTable>) -> Self {
        Self {
            client,
            remote_key,
            remote_session: route.remote,
            route_id: route.id,
            rx: Mutex::new(route.rx),
            sessions,
            closed: CancellationToken::new(),
        }
    }

    pub fn remote_session(&self) -> SessionId {
        self.remote_session
    }
}

#[async_trait]
impl Transport for RelayTransport {
    async fn read(&self) -> Result<Bytes> {
        let relay_closed = self.client.closed_token();
        let mut rx = self.rx.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Err(Error::TransportClosed),
            _ = relay_closed.cancelled() => Err(Error::TransportClosed),
            next = rx.recv() => next.ok_or(Error::TransportClosed),
        }
    }

    async fn write(&self, data: &[u8]) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(Error::TransportClosed);
        }
        self.client
            .send_forward(self.remote_session, Bytes::copy_from_slice(data))
            .await
    }

    async fn close(&self) -> Result<()> {
        if self.closed.is_cancelled() {
            return Ok(());
        }
        self.closed.cancel();
        self.client.unregister_route(&self.remote_session, self.route_id).await;
        self.sessions.remove(&self.remote_key).await;
        Ok(())
    }

    fn remote_addr(&self) -> String {
        format!("relay://{}/{}", self.client.relay_addr(), self.remote_session)
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Relay
    }

    fn is_alive(&self) -> bool {
        !self.closed.is_cancelled() && self.client.is_alive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;
    use crate::peer::PrivateKey;
    use crate::signal::MemorySignalBus;
    use crate::wrrp::{SignalInbox, WrrpServer};
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    async fn spawn_relay() -> (Arc<WrrpServer>, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = Arc::new(WrrpServer::new(addr.clone(), 65535));
        let serving = Arc::clone(&server);
        tokio::spawn(async move { serving.serve(listener).await });
        (server, addr)
    }

    /// Feed packets from both the signaling bus and the relay inbox
    fn pump(
        dialer: Arc<RelayDialer>,
        mut bus_inbox: mpsc::Receiver<Bytes>,
        mut relay_inbox: SignalInbox,
        cancel: CancellationToken,
    ) {
        tokio::spawn(async move {
            loop {
                let bytes = tokio::select! {
                    Some(bytes) = bus_inbox.recv() => bytes,
                    Some((_, bytes)) = relay_inbox.recv() => bytes,
                    else => break,
                };
                let packet = SignalPacket::deserialize(&bytes).unwrap();
                let sender = packet.sender_id;
                dialer.handle(&cancel, sender, packet).await.unwrap();
            }
        });
    }

    #[tokio::test]
    async fn test_peers_connect_through_relay() {
        let (server, addr) = spawn_relay().await;
        let config = RelayConfig::default();
        let probe_config = ProbeConfig::default();
        let bus = MemorySignalBus::new();

        let key_a = PrivateKey::generate().public_key();
        let key_b = PrivateKey::generate().public_key();
        let (id_a, id_b) = (key_a.peer_id(), key_b.peer_id());

        let (client_a, relay_inbox_a) = WrrpClient::connect(&addr, &key_a, &config).await.unwrap();
        let (client_b, relay_inbox_b) = WrrpClient::connect(&addr, &key_b, &config).await.unwrap();
        for _ in 0..50 {
            if server.session_count().await == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let (signal_a, bus_inbox_a) = bus.join(id_a).await;
        let (signal_b, bus_inbox_b) = bus.join(id_b).await;
        let sessions_a = Arc::new(SessionTable::new());
        let sessions_b = Arc::new(SessionTable::new());

        let dialer_a = Arc::new(RelayDialer::new(
            id_a,
            key_b,
            Arc::clone(&client_a),
            signal_a,
            Arc::clone(&sessions_a),
            &probe_config,
        ));
        let dialer_b = Arc::new(RelayDialer::new(
            id_b,
            key_a,
            Arc::clone(&client_b),
            signal_b,
            Arc::clone(&sessions_b),
            &probe_config,
        ));

        let cancel = CancellationToken::new();
        pump(Arc::clone(&dialer_a), bus_inbox_a, relay_inbox_a, cancel.clone());
        pump(Arc::clone(&dialer_b), bus_inbox_b, relay_inbox_b, cancel.clone());

        dialer_a.prepare(&cancel, id_b).await.unwrap();
        dialer_b.prepare(&cancel, id_a).await.unwrap();

        let (ta, tb) = tokio::time::timeout(Duration::from_secs(10), async {
            tokio::join!(dialer_a.dial(&cancel), dialer_b.dial(&cancel))
        })
        .await
        .unwrap();
        let (ta, tb) = (ta.unwrap(), tb.unwrap());

        assert_eq!(ta.kind(), TransportKind::Relay);
        assert!(ta.remote_addr().starts_with("relay://"));
        assert_eq!(sessions_a.session(&key_b).await, Some(SessionId::from_public_key(&key_b)));

        ta.write(b"relayed").await.unwrap();
        let got = tokio::time::timeout(Duration::from_secs(2), tb.read())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&got[..], b"relayed");

        ta.close().await.unwrap();
        assert!(!ta.is_alive());
        assert!(sessions_a.session(&key_b).await.is_none());
        assert!(matches!(ta.write(b"late").await, Err(Error::TransportClosed)));

        tb.close().await.unwrap();
        server.stop();
    }

    #[tokio::test]
    async fn test_prepare_fails_without_relay() {
        let (server, addr) = spawn_relay().await;
        let key_a = PrivateKey::generate().public_key();
        let key_b = PrivateKey::generate().public_key();
        let (client, _inbox) = WrrpClient::connect(&addr, &key_a, &RelayConfig::default()).await.unwrap();
        client.close().await;

        let bus = MemorySignalBus::new();
        let (signal, _bus_inbox) = bus.join(key_a.peer_id()).await;
        let dialer = RelayDialer::new(
            key_a.peer_id(),
            key_b,
            client,
            signal,
            Arc::new(SessionTable::new()),
            &ProbeConfig::default(),
        );
        let cancel = CancellationToken::new();
        assert!(matches!(
            dialer.prepare(&cancel, key_b.peer_id()).await,
            Err(Error::DialFailed { .. })
        ));
        server.stop();
    }
}
