//! Wireflow Agent
//!
//! Owns the peer registry, session table, one probe per remote peer and
//! the tunnel device. Inbound signaling is decoded here and routed to the
//! probe of the sending peer; adopted transports are installed on the
//! device.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use crate::config::AgentConfig;
use crate::device::{DevicePeer, TunnelDevice};
use crate::error::{Error, Result};
use crate::peer::{ConnectType, Peer, PeerId, PeerRegistry, PrivateKey, PublicKey, SessionId, SessionTable};
use crate::probe::{DialerFactory, FailureHandler, Probe, RetryPolicy, SuccessHandler};
use crate::signal::{PacketType, PeerSnapshot, SignalPacket, SignalSender};
use crate::transport::{
    CloseHandler, ConnectionState, DirectDialer, Dialer, RelayDialer, SharedTransport, TransportKind,
};
use crate::wrrp::{SignalInbox, WrrpClient};

/// Status of one remote peer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerStatus {
    pub id: PeerId,
    pub public_key: PublicKey,
    pub connect_type: ConnectType,
    pub state: ConnectionState,
    pub transport: Option<TransportKind>,
    pub endpoint: Option<String>,
}

/// Agent status snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStatus {
    pub interface: String,
    pub public_key: PublicKey,
    pub relay: Option<String>,
    pub peers: Vec<PeerStatus>,
}

pub struct Agent {
    config: AgentConfig,
    local: Peer,
    registry: Arc<PeerRegistry>,
    sessions: Arc<SessionTable>,
    probes: RwLock<HashMap<PeerId, Arc<Probe>>>,
    signal: Arc<dyn SignalSender>,
    relay: Option<Arc<WrrpClient>>,
    device: Arc<dyn TunnelDevice>,
    cancel: CancellationToken,
}

impl Agent {
    /// Build the agent and register the configured peers
    pub async fn new(
        config: AgentConfig,
        registry: Arc<PeerRegistry>,
        signal: Arc<dyn SignalSender>,
        relay: Option<Arc<WrrpClient>>,
        device: Arc<dyn TunnelDevice>,
    ) -> Result<Arc<Self>> {
        let private_key: PrivateKey = config.private_key()?;
        let mut local = Peer::local(private_key);
        local.address = config.node.address.clone();
        local.allowed_ips = config.node.address.iter().cloned().collect();

        for peer in &config.peers {
            registry.upsert(peer.to_peer()?).await;
        }

        tracing::info!(
            "Agent {} ({}) ready with {} peers",
            local.id(),
            config.node.interface,
            registry.len().await
        );

        Ok(Arc::new(Self {
            config,
            local,
            registry,
            sessions: Arc::new(SessionTable::new()),
            probes: RwLock::new(HashMap::new()),
            signal,
            relay,
            device,
            cancel: CancellationToken::new(),
        }))
    }

    pub fn local_id(&self) -> PeerId {
        self.local.id()
    }

    pub fn public_key(&self) -> PublicKey {
        self.local.public_key
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    pub fn sessions(&self) -> &Arc<SessionTable> {
        &self.sessions
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Register a new remote peer
    pub async fn add_peer(&self, peer: Peer) -> Result<PeerId> {
        let id = self.registry.add(peer).await?;
        tracing::info!("Peer {} added", id);
        Ok(id)
    }

    /// Tear down everything held for a peer
    pub async fn remove_peer(&self, id: PeerId) -> Result<()> {
        let peer = self.registry.remove(&id).await.ok_or(Error::PeerNotFound(id))?;
        if let Some(probe) = self.probes.write().await.remove(&id) {
            probe.close().await;
        }
        self.sessions.remove(&peer.public_key).await;
        self.device.remove_peer(&peer.public_key).await?;
        tracing::info!("Peer {} removed", id);
        Ok(())
    }

    /// The probe for a registered peer, created on first use
    pub async fn probe(&self, id: PeerId) -> Result<Arc<Probe>> {
        if let Some(probe) = self.probes.read().await.get(&id) {
            return Ok(Arc::clone(probe));
        }

        let peer = self.registry.get(&id).await.ok_or(Error::AgentNotFound(id))?;
        let mut probes = self.probes.write().await;
        if let Some(probe) = probes.get(&id) {
            return Ok(Arc::clone(probe));
        }

        let probe = Arc::new(
            Probe::new(
                self.local_id(),
                id,
                Arc::clone(&self.registry),
                self.config.probe.clone(),
                self.dialer_factory(peer.public_key),
            )
            .with_force_relay(self.config.node.force_relay)
            .with_on_success(self.success_handler())
            .with_on_failure(failure_handler()),
        );
        probes.insert(id, Arc::clone(&probe));
        Ok(probe)
    }

    fn snapshot(&self) -> PeerSnapshot {
        PeerSnapshot {
            public_key: self.local.public_key,
            address: self.local.address.clone(),
            allowed_ips: self.local.allowed_ips.clone(),
        }
    }

    fn dialer_factory(&self, remote_key: PublicKey) -> DialerFactory {
        let local = self.local_id();
        let remote = remote_key.peer_id();
        let snapshot = self.snapshot();
        let signal = Arc::clone(&self.signal);
        let relay = self.relay.clone();
        let sessions = Arc::clone(&self.sessions);
        let listen_address = self.config.node.listen_address.clone();
        let nat_config = self.config.nat.clone();
        let probe_config = self.config.probe.clone();

        let registry = Arc::clone(&self.registry);
        let on_close: CloseHandler = Arc::new(move |peer: PeerId| {
            tracing::warn!("Direct path to {} closed", peer);
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                let _ = registry.set_endpoint(&peer, None).await;
            });
        });

        Arc::new(move |kind: TransportKind| -> Option<Arc<dyn Dialer>> {
            match kind {
                TransportKind::Direct => {
                    let dialer = DirectDialer::new(
                        local,
                        remote,
                        Some(snapshot.clone()),
                        Arc::clone(&signal),
                        listen_address.clone(),
                        nat_config.clone(),
                        &probe_config,
                    )
                    .with_on_close(Arc::clone(&on_close));
                    Some(Arc::new(dialer))
                }
                TransportKind::Relay => {
                    let client = relay.as_ref().filter(|client| client.is_alive())?;
                    Some(Arc::new(RelayDialer::new(
                        local,
                        remote_key,
                        Arc::clone(client),
                        Arc::clone(&signal),
                        Arc::clone(&sessions),
                        &probe_config,
                    )))
                }
            }
        })
    }

    /// Peer-add callback: install the adopted transport on the device
    fn success_handler(&self) -> SuccessHandler {
        let device = Arc::clone(&self.device);
        let registry = Arc::clone(&self.registry);
        Arc::new(
            move |peer: PeerId, transport: SharedTransport| -> Pin<Box<dyn Future<Output = Result<()>> + Send>> {
                let device = Arc::clone(&device);
                let registry = Arc::clone(&registry);
                Box::pin(async move {
                    let info = registry.get(&peer).await.ok_or(Error::PeerNotFound(peer))?;
                    let endpoint = transport.remote_addr();
                    registry.set_endpoint(&peer, Some(endpoint.clone())).await?;
                    let config = DevicePeer {
                        public_key: info.public_key,
                        allowed_ips: info.allowed_ips,
                        endpoint: Some(endpoint),
                    };
                    device.add_peer(config, Some(transport)).await
                })
            },
        )
    }

    /// Decode an inbound signaling payload and route it
    pub async fn handle_signal(&self, payload: &[u8]) -> Result<()> {
        let packet = SignalPacket::deserialize(payload)?;
        let sender = packet.sender_id;
        if !self.registry.contains(&sender).await {
            return Err(Error::AgentNotFound(sender));
        }
        tracing::debug!("{} {} from {}", packet.dialer, packet.type_name(), sender);

        let probe = self.probe(sender).await?;
        if packet.packet_type == PacketType::HandshakeSyn {
            let state = probe.state();
            if !state.is_active() && !state.is_connected() {
                probe.start(&self.cancel, sender).await?;
            }
        }
        probe.handle(&self.cancel, sender, packet).await
    }

    /// Signaling that came through the relay. The source session must
    /// belong to the claimed sender.
    pub async fn handle_relay_signal(&self, source: SessionId, payload: &[u8]) -> Result<()> {
        let packet = SignalPacket::deserialize(payload)?;
        let key = self
            .registry
            .public_key(&packet.sender_id)
            .await
            .ok_or(Error::AgentNotFound(packet.sender_id))?;
        if SessionId::from_public_key(&key) != source {
            tracing::warn!("Dropping relayed signal: session {} is not peer {}", source, packet.sender_id);
            return Ok(());
        }
        self.handle_signal(payload).await
    }

    /// Run the retry orchestrator for one peer
    pub async fn connect(&self, id: PeerId) -> Result<()> {
        let probe = self.probe(id).await?;
        RetryPolicy::from_config(&self.config.probe)
            .run(&probe, &self.cancel)
            .await
    }

    fn spawn_connect(self: &Arc<Self>, id: PeerId) {
        let agent = Arc::clone(self);
        tokio::spawn(async move {
            match agent.connect(id).await {
                Ok(()) => {}
                Err(Error::Cancelled) | Err(Error::ShuttingDown) => {}
                Err(e) => tracing::warn!("Peer {} unreachable: {}", id, e),
            }
        });
    }

    /// Ping every connected probe and reconnect the ones that lost their transport
    async fn check_transports(self: &Arc<Self>) {
        let probes: Vec<Arc<Probe>> = self.probes.read().await.values().cloned().collect();
        for probe in probes {
            if !probe.state().is_connected() {
                continue;
            }
            if probe.ping(&self.cancel).await.is_err() {
                tracing::info!("Reconnecting {}", probe.remote());
                self.spawn_connect(probe.remote());
            }
        }
    }

    /// Daemon loop: connect to every known peer, dispatch inbound
    /// signaling and watch transport liveness until shutdown
    pub async fn run(
        self: Arc<Self>,
        mut signals: Option<mpsc::Receiver<Bytes>>,
        mut relay_signals: Option<SignalInbox>,
    ) -> Result<()> {
        self.device.up().await?;
        for peer in self.registry.list().await {
            self.spawn_connect(peer.id());
        }

        let mut ticker = tokio::time::interval(self.config.probe.ping_interval());
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                Some(payload) = recv_optional(&mut signals) => {
                    if let Err(e) = self.handle_signal(&payload).await {
                        tracing::warn!("Signal dispatch failed: {}", e);
                    }
                }
                Some((source, payload)) = recv_optional(&mut relay_signals) => {
                    if let Err(e) = self.handle_relay_signal(source, &payload).await {
                        tracing::warn!("Relayed signal dispatch failed: {}", e);
                    }
                }
                _ = ticker.tick() => self.check_transports().await,
            }
        }

        self.shutdown().await;
        Ok(())
    }

    pub async fn status(&self) -> AgentStatus {
        let probes = self.probes.read().await.clone();
        let mut peers = Vec::new();
        for peer in self.registry.list().await {
            let id = peer.id();
            let (state, transport) = match probes.get(&id) {
                Some(probe) => (probe.state(), probe.transport().await.map(|t| t.kind())),
                None => (ConnectionState::New, None),
            };
            peers.push(PeerStatus {
                id,
                public_key: peer.public_key,
                connect_type: peer.connect_type,
                state,
                transport,
                endpoint: peer.endpoint,
            });
        }
        peers.sort_by_key(|p| p.id);

        AgentStatus {
            interface: self.config.node.interface.clone(),
            public_key: self.local.public_key,
            relay: self.relay.as_ref().map(|r| r.relay_addr().to_string()),
            peers,
        }
    }

    /// Stop all probes, the device and the relay session
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let probes: Vec<Arc<Probe>> = self.probes.write().await.drain().map(|(_, p)| p).collect();
        for probe in probes {
            probe.close().await;
        }
        if let Err(e) = self.device.close().await {
            tracing::warn!("Closing device failed: {}", e);
        }
        if let Some(relay) = &self.relay {
            relay.close().await;
        }
        tracing::info!("Agent {} stopped", self.local_id());
    }
}

fn failure_handler() -> FailureHandler {
    Arc::new(|peer: PeerId, err: &Error| {
        tracing::warn!("Discovery for {} failed: {}", peer, err);
    })
}

async fn recv_optional<T>(rx: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NatConfig, NodeConfig, RelayConfig};
    use crate::device::MemoryDevice;
    use crate::signal::MemorySignalBus;
    use crate::wrrp::{RelaySignaler, WrrpServer};
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn test_config(private_key: &PrivateKey, peer: &PublicKey) -> AgentConfig {
        let mut node = NodeConfig::new(private_key);
        node.listen_address = "127.0.0.1:0".into();
        let mut config = AgentConfig::new(node);
        config.nat = NatConfig {
            stun_servers: Vec::new(),
            check_interval_ms: 20,
            check_timeout_ms: 5_000,
            keepalive_interval_ms: 200,
            liveness_timeout_ms: 5_000,
            stun_timeout_ms: 100,
        };
        config.probe.initial_backoff_ms = 200;
        config.probe.retry_interval_ms = 500;
        config.probe.syn_interval_ms = 200;
        config.probe.handshake_timeout_ms = 5_000;
        config.peers.push(crate::config::PeerConfig {
            public_key: peer.to_base64(),
            allowed_ips: vec!["10.10.0.2/32".into()],
            endpoint: None,
            connect_type: ConnectType::Direct,
        });
        config
    }

    async fn wait_for_transport(device: &MemoryDevice, key: &PublicKey) -> Option<TransportKind> {
        for _ in 0..200 {
            if let Some(kind) = device.transport_kind(key).await {
                return Some(kind);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        None
    }

    #[tokio::test]
    async fn test_agents_connect_directly() {
        let bus = MemorySignalBus::new();
        let (key_a, key_b) = (PrivateKey::generate(), PrivateKey::generate());
        let (pub_a, pub_b) = (key_a.public_key(), key_b.public_key());

        let (signal_a, inbox_a) = bus.join(pub_a.peer_id()).await;
        let (signal_b, inbox_b) = bus.join(pub_b.peer_id()).await;
        let device_a = Arc::new(MemoryDevice::new("wf-a", Some(key_a.clone())));
        let device_b = Arc::new(MemoryDevice::new("wf-b", Some(key_b.clone())));

        let agent_a = Agent::new(
            test_config(&key_a, &pub_b),
            Arc::new(PeerRegistry::new()),
            signal_a,
            None,
            device_a.clone(),
        )
        .await
        .unwrap();
        let agent_b = Agent::new(
            test_config(&key_b, &pub_a),
            Arc::new(PeerRegistry::new()),
            signal_b,
            None,
            device_b.clone(),
        )
        .await
        .unwrap();

        tokio::spawn(Arc::clone(&agent_a).run(Some(inbox_a), None));
        tokio::spawn(Arc::clone(&agent_b).run(Some(inbox_b), None));

        assert_eq!(wait_for_transport(&device_a, &pub_b).await, Some(TransportKind::Direct));
        assert_eq!(wait_for_transport(&device_b, &pub_a).await, Some(TransportKind::Direct));

        let status = agent_a.status().await;
        assert_eq!(status.peers.len(), 1);
        assert_eq!(status.peers[0].state, ConnectionState::Connected);
        assert_eq!(status.peers[0].transport, Some(TransportKind::Direct));
        assert!(status.peers[0].endpoint.is_some());

        let probe = agent_a.probe(pub_b.peer_id()).await.unwrap();
        probe.send(b"hello b").await.unwrap();
        let transport = agent_b.probe(pub_a.peer_id()).await.unwrap().transport().await.unwrap();
        let got = tokio::time::timeout(Duration::from_secs(2), transport.read())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&got[..], b"hello b");

        agent_a.remove_peer(pub_b.peer_id()).await.unwrap();
        assert_eq!(device_a.peer_count().await, 0);
        assert!(matches!(
            agent_a.remove_peer(pub_b.peer_id()).await,
            Err(Error::PeerNotFound(_))
        ));

        agent_a.shutdown().await;
        agent_b.shutdown().await;
    }

    #[tokio::test]
    async fn test_agents_connect_through_relay() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let relay_addr = listener.local_addr().unwrap().to_string();
        let server = Arc::new(WrrpServer::new(relay_addr.clone(), 65535));
        let serving = Arc::clone(&server);
        tokio::spawn(async move { serving.serve(listener).await });

        let (key_a, key_b) = (PrivateKey::generate(), PrivateKey::generate());
        let (pub_a, pub_b) = (key_a.public_key(), key_b.public_key());

        let mut agents = Vec::new();
        let mut devices = Vec::new();
        for (key, peer) in [(&key_a, &pub_b), (&key_b, &pub_a)] {
            let mut config = test_config(key, peer);
            config.node.force_relay = true;
            config.relay.url = Some(relay_addr.clone());

            let (client, relay_inbox) = WrrpClient::connect(&relay_addr, &key.public_key(), &RelayConfig::default())
                .await
                .unwrap();
            let registry = Arc::new(PeerRegistry::new());
            let signal = Arc::new(RelaySignaler::new(Arc::clone(&client), Arc::clone(&registry)));
            let device = Arc::new(MemoryDevice::new("wf", None));
            let agent = Agent::new(config, registry, signal, Some(client), device.clone())
                .await
                .unwrap();
            agents.push(agent);
            devices.push((device, relay_inbox));
        }
        for _ in 0..50 {
            if server.session_count().await == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let mut watched = Vec::new();
        for (agent, (device, relay_inbox)) in agents.iter().zip(devices) {
            tokio::spawn(Arc::clone(agent).run(None, Some(relay_inbox)));
            watched.push(device);
        }

        assert_eq!(wait_for_transport(&watched[0], &pub_b).await, Some(TransportKind::Relay));
        assert_eq!(wait_for_transport(&watched[1], &pub_a).await, Some(TransportKind::Relay));
        assert!(agents[0].sessions().session(&pub_b).await.is_some());

        let status = agents[1].status().await;
        assert_eq!(status.relay.as_deref(), Some(relay_addr.as_str()));
        assert!(status.peers[0].endpoint.as_deref().unwrap_or_default().starts_with("relay://"));

        for agent in &agents {
            agent.shutdown().await;
        }
        server.stop();
    }

    #[tokio::test]
    async fn test_unknown_sender_is_rejected() {
        let bus = MemorySignalBus::new();
        let key = PrivateKey::generate();
        let stranger = PrivateKey::generate().public_key();
        let (signal, _inbox) = bus.join(key.public_key().peer_id()).await;
        let device = Arc::new(MemoryDevice::new("wf", None));
        let config = AgentConfig::new(NodeConfig::new(&key));
        let agent = Agent::new(config, Arc::new(PeerRegistry::new()), signal, None, device)
            .await
            .unwrap();

        let packet = SignalPacket::syn(TransportKind::Direct, stranger.peer_id());
        let payload = packet.serialize().unwrap();
        assert!(matches!(
            agent.handle_signal(&payload).await,
            Err(Error::AgentNotFound(_))
        ));
        assert!(matches!(agent.connect(stranger.peer_id()).await, Err(Error::AgentNotFound(_))));

        agent.add_peer(Peer::new(stranger)).await.unwrap();
        assert!(matches!(
            agent.add_peer(Peer::new(stranger)).await,
            Err(Error::PeerExists(_))
        ));
    }
}
