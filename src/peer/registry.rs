//! Peer Registry
//!
//! Concurrent map from peer id to peer metadata. Readers never block
//! each other.

use std::collections::HashMap;

use tokio::sync::RwLock;

use super::{ConnectType, Peer, PeerId, PublicKey};
use crate::error::{Error, Result};

/// Registry of known peers, keyed by their compact id
#[derive(Default)]
pub struct PeerRegistry {
    peers: RwLock<HashMap<PeerId, Peer>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new peer, failing if the id is already taken
    pub async fn add(&self, peer: Peer) -> Result<PeerId> {
        let id = peer.id();
        let mut peers = self.peers.write().await;
        if peers.contains_key(&id) {
            return Err(Error::PeerExists(id));
        }
        tracing::debug!("Registered peer {} ({})", id, peer.public_key);
        peers.insert(id, peer);
        Ok(id)
    }

    /// Insert or replace a peer
    pub async fn upsert(&self, peer: Peer) -> PeerId {
        let id = peer.id();
        self.peers.write().await.insert(id, peer);
        id
    }

    pub async fn get(&self, id: &PeerId) -> Option<Peer> {
        self.peers.read().await.get(id).cloned()
    }

    pub async fn contains(&self, id: &PeerId) -> bool {
        self.peers.read().await.contains_key(id)
    }

    /// Full public key for a compact id
    pub async fn public_key(&self, id: &PeerId) -> Option<PublicKey> {
        self.peers.read().await.get(id).map(|p| p.public_key)
    }

    pub async fn remove(&self, id: &PeerId) -> Option<Peer> {
        let removed = self.peers.write().await.remove(id);
        if removed.is_some() {
            tracing::debug!("Removed peer {}", id);
        }
        removed
    }

    pub async fn connect_type(&self, id: &PeerId) -> Option<ConnectType> {
        self.peers.read().await.get(id).map(|p| p.connect_type)
    }

    /// Change the connect type hint of a registered peer
    pub async fn set_connect_type(&self, id: &PeerId, connect_type: ConnectType) -> Result<()> {
        let mut peers = self.peers.write().await;
        let peer = peers.get_mut(id).ok_or(Error::PeerNotFound(*id))?;
        peer.connect_type = connect_type;
        Ok(())
    }

    /// Record the underlay endpoint a peer was last reached on
    pub async fn set_endpoint(&self, id: &PeerId, endpoint: Option<String>) -> Result<()> {
        let mut peers = self.peers.write().await;
        let peer = peers.get_mut(id).ok_or(Error::PeerNotFound(*id))?;
        peer.endpoint = endpoint;
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.peers.read().await.is_empty()
    }

    /// Snapshot of all peers (unordered)
    pub async fn list(&self) -> Vec<Peer> {
        self.peers.read().await.values().cloned().collect()
    }
}
