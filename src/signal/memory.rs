//! In-process signaling bus
//!
//! Delivers payloads between agents living in the same process. Used by
//! tests and by embedders that bring their own delivery.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, RwLock};

use super::SignalSender;
use crate::error::{Error, Result};
use crate::peer::PeerId;

const INBOX_CAPACITY: usize = 1024;

/// Hub connecting in-process signalers
#[derive(Default, Clone)]
pub struct MemorySignalBus {
    inboxes: Arc<RwLock<HashMap<PeerId, mpsc::Sender<Bytes>>>>,
}

impl MemorySignalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a peer, returning its sender and inbox
    pub async fn join(&self, id: PeerId) -> (Arc<MemorySignaler>, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        self.inboxes.write().await.insert(id, tx);
        let signaler = Arc::new(MemorySignaler {
            bus: self.clone(),
            sent: AtomicUsize::new(0),
        });
        (signaler, rx)
    }

    pub async fn leave(&self, id: &PeerId) {
        self.inboxes.write().await.remove(id);
    }
}

/// Sender half handed to one peer
pub struct MemorySignaler {
    bus: MemorySignalBus,
    sent: AtomicUsize,
}

impl MemorySignaler {
    /// Number of payloads sent so far
    pub fn sent_count(&self) -> usize {
        self.sent.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SignalSender for MemorySignaler {
    async fn send(&self, peer: PeerId, payload: Bytes) -> Result<()> {
        let inbox = self
            .bus
            .inboxes
            .read()
            .await
            .get(&peer)
            .cloned()
            .ok_or(Error::PeerNotFound(peer))?;
        inbox.send(payload).await.map_err(|_| Error::PeerNotFound(peer))?;
        self.sent.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::{DialerKind, SignalPacket};

    #[tokio::test]
    async fn test_deliver_between_peers() {
        let bus = MemorySignalBus::new();
        let a = PeerId::from_u64(10);
        let b = PeerId::from_u64(20);
        let (sender_a, _inbox_a) = bus.join(a).await;
        let (_sender_b, mut inbox_b) = bus.join(b).await;

        let packet = SignalPacket::syn(DialerKind::Direct, a);
        sender_a.send_packet(b, &packet).await.unwrap();

        let received = SignalPacket::deserialize(&inbox_b.recv().await.unwrap()).unwrap();
        assert_eq!(received, packet);
        assert_eq!(sender_a.sent_count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_peer() {
        let bus = MemorySignalBus::new();
        let (sender, _inbox) = bus.join(PeerId::from_u64(1)).await;
        let err = sender
            .send(PeerId::from_u64(2), Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PeerNotFound(_)));
    }
}
