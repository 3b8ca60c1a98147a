//! Direct dialer (NAT traversal)
//!
//! After the SYN/ACK handshake both sides trickle their candidates as
//! OFFER packets. The first remote OFFER also pins the remote's ufrag,
//! password and tie-breaker. Once an OFFER has arrived, `dial` resolves
//! the role from the tie-breakers and connects or accepts.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

use super::handshake::Handshake;
use super::role::{resolve_role, Role};
use super::{Dialer, SharedTransport, Transport, TransportKind};
use crate::config::{NatConfig, ProbeConfig};
use crate::error::{Error, Result};
use crate::latch::Latch;
use crate::nat::{Candidate, NatAgent};
use crate::peer::PeerId;
use crate::signal::{OfferPayload, PacketType, PeerSnapshot, SignalPacket, SignalSender};

/// Invoked with the remote peer id when a direct path fails or is lost
pub type CloseHandler = Arc<dyn Fn(PeerId) + Send + Sync>;

#[derive(Debug, Clone)]
struct RemoteCredentials {
    ufrag: String,
    pwd: String,
    tie_breaker: u64,
}

pub struct DirectDialer {
    local: PeerId,
    remote: PeerId,
    snapshot: Option<PeerSnapshot>,
    signal: Arc<dyn SignalSender>,
    handshake: Arc<Handshake>,
    listen_address: String,
    nat_config: NatConfig,
    agent: OnceCell<Arc<NatAgent>>,
    remote_credentials: OnceLock<RemoteCredentials>,
    offer_ready: Latch,
    gathering: Latch,
    handed_off: AtomicBool,
    on_close: Option<CloseHandler>,
}

impl DirectDialer {
    pub fn new(
        local: PeerId,
        remote: PeerId,
        snapshot: Option<PeerSnapshot>,
        signal: Arc<dyn SignalSender>,
        listen_address: String,
        nat_config: NatConfig,
        probe_config: &ProbeConfig,
    ) -> Self {
        let handshake = Handshake::new(
            local,
            remote,
            TransportKind::Direct,
            Arc::clone(&signal),
            probe_config.syn_interval(),
            probe_config.handshake_timeout(),
        );
        Self {
            local,
            remote,
            snapshot,
            signal,
            handshake,
            listen_address,
            nat_config,
            agent: OnceCell::new(),
            remote_credentials: OnceLock::new(),
            offer_ready: Latch::new(),
            gathering: Latch::new(),
            handed_off: AtomicBool::new(false),
            on_close: None,
        }
    }

    pub fn with_on_close(mut self, handler: CloseHandler) -> Self {
        self.on_close = Some(handler);
        self
    }

    pub fn handshake(&self) -> &Arc<Handshake> {
        &self.handshake
    }

    async fn agent(&self) -> Result<Arc<NatAgent>> {
        let agent = self
            .agent
            .get_or_try_init(|| async {
                let agent = NatAgent::bind(&self.listen_address, self.nat_config.clone()).await?;
                if let Some(handler) = self.on_close.clone() {
                    let remote = self.remote;
                    agent.set_on_close(Arc::new(move || handler(remote)));
                }
                Ok::<_, Error>(agent)
            })
            .await?;
        Ok(Arc::clone(agent))
    }

    /// Trickle local candidates as OFFERs. Runs once.
    async fn start_gathering(&self, cancel: &CancellationToken) -> Result<()> {
        if !self.gathering.fire() {
            return Ok(());
        }

        let agent = self.agent().await?;
        let mut candidates = agent.gather();
        let signal = Arc::clone(&self.signal);
        let (local, remote) = (self.local, self.remote);
        let snapshot = self.snapshot.clone();
        let cancel = cancel.clone();

        tokio::spawn(async move {
            loop {
                let candidate = tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = candidates.recv() => match next {
                        Some(candidate) => candidate,
                        None => break,
                    },
                };

                let offer = SignalPacket::offer(
                    TransportKind::Direct,
                    local,
                    OfferPayload {
                        ufrag: agent.ufrag().to_string(),
                        pwd: agent.pwd().to_string(),
                        tie_breaker: agent.tie_breaker(),
                        candidate: candidate.marshal(),
                        current_peer: snapshot.clone(),
                    },
                );
                if let Err(e) = signal.send_packet(remote, &offer).await {
                    tracing::warn!("Sending candidate to {} failed: {}", remote, e);
                }
            }
        });
        Ok(())
    }

    fn notify_close(&self) {
        if let Some(handler) = &self.on_close {
            handler(self.remote);
        }
    }
}

#[async_trait]
impl Dialer for DirectDialer {
    fn kind(&self) -> TransportKind {
        TransportKind::Direct
    }

    async fn prepare(&self, cancel: &CancellationToken, remote: PeerId) -> Result<()> {
        if remote != self.remote {
            return Err(Error::AgentNotFound(remote));
        }
        self.agent().await?;
        self.handshake.start(cancel);
        Ok(())
    }

    async fn handle(&self, cancel: &CancellationToken, remote: PeerId, packet: SignalPacket) -> Result<()> {
        if remote != self.remote {
            return Err(Error::AgentNotFound(remote));
        }

        match packet.packet_type {
            PacketType::HandshakeSyn => {
                if self.handshake.on_syn().await? {
                    self.start_gathering(cancel).await?;
                }
            }
            PacketType::HandshakeAck => {
                if self.handshake.on_ack() {
                    self.start_gathering(cancel).await?;
                }
            }
            PacketType::Offer | PacketType::Answer => {
                let offer = packet
                    .offer_payload()
                    .ok_or_else(|| Error::InvalidCandidate("offer without payload".into()))?;

                let recorded = self.remote_credentials.set(RemoteCredentials {
                    ufrag: offer.ufrag.clone(),
                    pwd: offer.pwd.clone(),
                    tie_breaker: offer.tie_breaker,
                });
                if recorded.is_ok() {
                    tracing::debug!("Recorded credentials of {}", self.remote);
                }

                let agent = self.agent().await?;
                if !offer.candidate.is_empty() {
                    agent.add_remote_candidate(Candidate::unmarshal(&offer.candidate)?).await;
                }
                self.offer_ready.fire();
                self.start_gathering(cancel).await?;
            }
        }
        Ok(())
    }

    async fn dial(&self, cancel: &CancellationToken) -> Result<SharedTransport> {
        self.handshake.wait_ready(cancel, &self.offer_ready).await?;

        let credentials = self
            .remote_credentials
            .get()
            .cloned()
            .ok_or(Error::AgentNotFound(self.remote))?;
        let agent = self.agent().await?;

        let role = resolve_role(agent.tie_breaker(), self.local, credentials.tie_breaker, self.remote);
        tracing::info!("Direct dial to {} as {:?}", self.remote, role);
        let result = match role {
            Role::Controlling => agent.dial(cancel, &credentials.ufrag, &credentials.pwd).await,
            Role::Controlled => agent.accept(cancel, &credentials.ufrag, &credentials.pwd).await,
        };

        if let Err(e) = result {
            agent.close();
            if !matches!(e, Error::Cancelled) {
                self.notify_close();
            }
            return Err(e);
        }

        self.handed_off.store(true, Ordering::SeqCst);
        Ok(Arc::new(DirectTransport::new(self.remote, agent)))
    }

    async fn abort(&self) {
        if self.handed_off.load(Ordering::SeqCst) {
            return;
        }
        if let Some(agent) = self.agent.get() {
            agent.close();
        }
    }
}

/// Datagram path over a selected candidate pair
pub struct DirectTransport {
    remote: PeerId,
    agent: Arc<NatAgent>,
}

impl DirectTransport {
    pub fn new(remote: PeerId, agent: Arc<NatAgent>) -> Self {
        Self { remote, agent }
    }

    pub fn remote(&self) -> PeerId {
        self.remote
    }
}

#[async_trait]
impl Transport for DirectTransport {
    async fn read(&self) -> Result<Bytes> {
        self.agent.recv().await
    }

    async fn write(&self, data: &[u8]) -> Result<()> {
        self.agent.send(data).await
    }

    async fn close(&self) -> Result<()> {
        self.agent.close();
        Ok(())
    }

    fn remote_addr(&self) -> String {
        self.agent
            .selected_addr()
            .map(|a| a.to_string())
            .unwrap_or_default()
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Direct
    }

    fn is_alive(&self) -> bool {
        self.agent.is_connected()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::MemorySignalBus;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn nat_config() -> NatConfig {
        NatConfig {
            stun_servers: Vec::new(),
            check_interval_ms: 20,
            check_timeout_ms: 5000,
            keepalive_interval_ms: 100,
            liveness_timeout_ms: 2000,
            stun_timeout_ms: 100,
        }
    }

    fn pump(dialer: Arc<DirectDialer>, mut inbox: mpsc::Receiver<Bytes>, cancel: CancellationToken) {
        tokio::spawn(async move {
            while let Some(bytes) = inbox.recv().await {
                let packet = SignalPacket::deserialize(&bytes).unwrap();
                let sender = packet.sender_id;
                dialer.handle(&cancel, sender, packet).await.unwrap();
            }
        });
    }

    #[tokio::test]
    async fn test_peers_connect_directly() {
        let bus = MemorySignalBus::new();
        let (a, b) = (PeerId::from_u64(10), PeerId::from_u64(20));
        let (signal_a, inbox_a) = bus.join(a).await;
        let (signal_b, inbox_b) = bus.join(b).await;
        let probe_config = ProbeConfig::default();

        let dialer_a = Arc::new(DirectDialer::new(
            a,
            b,
            None,
            signal_a,
            "127.0.0.1:0".into(),
            nat_config(),
            &probe_config,
        ));
        let dialer_b = Arc::new(DirectDialer::new(
            b,
            a,
            None,
            signal_b,
            "127.0.0.1:0".into(),
            nat_config(),
            &probe_config,
        ));

        let cancel = CancellationToken::new();
        pump(Arc::clone(&dialer_a), inbox_a, cancel.clone());
        pump(Arc::clone(&dialer_b), inbox_b, cancel.clone());

        dialer_a.prepare(&cancel, b).await.unwrap();
        dialer_b.prepare(&cancel, a).await.unwrap();

        let (ta, tb) = tokio::time::timeout(Duration::from_secs(10), async {
            tokio::join!(dialer_a.dial(&cancel), dialer_b.dial(&cancel))
        })
        .await
        .unwrap();
        let (ta, tb) = (ta.unwrap(), tb.unwrap());

        assert_eq!(ta.kind(), TransportKind::Direct);
        assert!(ta.is_alive() && tb.is_alive());
        assert!(dialer_b.handshake().is_initiator());
        assert_eq!(dialer_b.handshake().syn_cancellations(), 1);

        ta.write(b"over the hole").await.unwrap();
        let got = tokio::time::timeout(Duration::from_secs(2), tb.read())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&got[..], b"over the hole");

        ta.close().await.unwrap();
        tb.close().await.unwrap();
        assert!(!ta.is_alive());
    }

    #[tokio::test]
    async fn test_first_offer_credentials_are_kept() {
        let bus = MemorySignalBus::new();
        let (a, b) = (PeerId::from_u64(1), PeerId::from_u64(2));
        let (signal_a, _inbox_a) = bus.join(a).await;
        let (_signal_b, _inbox_b) = bus.join(b).await;
        let dialer = DirectDialer::new(
            a,
            b,
            None,
            signal_a,
            "127.0.0.1:0".into(),
            nat_config(),
            &ProbeConfig::default(),
        );
        let cancel = CancellationToken::new();

        for (ufrag, port) in [("first", 4001), ("second", 4002)] {
            let offer = SignalPacket::offer(
                TransportKind::Direct,
                b,
                OfferPayload {
                    ufrag: ufrag.into(),
                    pwd: "pw".into(),
                    tie_breaker: 7,
                    candidate: Candidate::host(format!("127.0.0.1:{}", port).parse().unwrap()).marshal(),
                    current_peer: None,
                },
            );
            dialer.handle(&cancel, b, offer).await.unwrap();
        }

        assert_eq!(dialer.remote_credentials.get().unwrap().ufrag, "first");
        assert_eq!(dialer.agent().await.unwrap().remote_candidate_count().await, 2);
        assert!(dialer.offer_ready.is_fired());
        dialer.abort().await;
    }

    #[tokio::test]
    async fn test_packets_for_other_peer_are_rejected() {
        let bus = MemorySignalBus::new();
        let (signal, _inbox) = bus.join(PeerId::from_u64(1)).await;
        let dialer = DirectDialer::new(
            PeerId::from_u64(1),
            PeerId::from_u64(2),
            None,
            signal,
            "127.0.0.1:0".into(),
            nat_config(),
            &ProbeConfig::default(),
        );
        let cancel = CancellationToken::new();
        let packet = SignalPacket::syn(TransportKind::Direct, PeerId::from_u64(3));
        assert!(matches!(
            dialer.handle(&cancel, PeerId::from_u64(3), packet).await,
            Err(Error::AgentNotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dial_gives_up_at_handshake_deadline_without_offer() {
        let bus = MemorySignalBus::new();
        let (local, remote) = (PeerId::from_u64(20), PeerId::from_u64(10));
        let (signal, _inbox) = bus.join(local).await;
        let (_remote_signal, _remote_inbox) = bus.join(remote).await;
        let dialer = DirectDialer::new(
            local,
            remote,
            None,
            signal,
            "127.0.0.1:0".into(),
            nat_config(),
            &ProbeConfig::default(),
        );
        assert!(dialer.handshake().is_initiator());

        let cancel = CancellationToken::new();
        let started = tokio::time::Instant::now();
        dialer.prepare(&cancel, remote).await.unwrap();

        // The ACK comes late and no OFFER ever follows
        tokio::time::sleep(Duration::from_secs(30)).await;
        let ack = SignalPacket::ack(TransportKind::Direct, remote);
        dialer.handle(&cancel, remote, ack).await.unwrap();
        assert!(dialer.handshake().is_established());

        let err = dialer.dial(&cancel).await.err().unwrap();
        assert!(matches!(err, Error::HandshakeTimeout(_)));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(60));
        assert!(elapsed < Duration::from_secs(61));
        dialer.abort().await;
    }
}
