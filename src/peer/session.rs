//! Session Table
//!
//! Bidirectional map between a peer's public key and the relay session id
//! derived from it.

use std::collections::HashMap;
use std::fmt;

use sha2::{Digest, Sha224};
use tokio::sync::RwLock;

use super::PublicKey;

/// Length of a relay session id (SHA-224 digest)
pub const SESSION_ID_LEN: usize = 28;

/// Relay session identifier
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId([u8; SESSION_ID_LEN]);

impl SessionId {
    /// SHA-224 of the owning peer's public key
    pub fn from_public_key(key: &PublicKey) -> Self {
        let digest = Sha224::digest(key.as_bytes());
        let mut id = [0u8; SESSION_ID_LEN];
        id.copy_from_slice(&digest);
        Self(id)
    }

    pub fn from_bytes(bytes: [u8; SESSION_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SESSION_ID_LEN] {
        &self.0
    }

    pub fn zero() -> Self {
        Self([0u8; SESSION_ID_LEN])
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0[..8]))
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", hex::encode(self.0))
    }
}

#[derive(Default)]
struct Maps {
    by_key: HashMap<PublicKey, SessionId>,
    by_session: HashMap<SessionId, PublicKey>,
}

/// Bidirectional key <-> session map used for relay routing
#[derive(Default)]
pub struct SessionTable {
    maps: RwLock<Maps>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert the session for a key, returning its id
    pub async fn insert(&self, key: PublicKey) -> SessionId {
        let session = SessionId::from_public_key(&key);
        let mut maps = self.maps.write().await;
        maps.by_key.insert(key, session);
        maps.by_session.insert(session, key);
        session
    }

    pub async fn session(&self, key: &PublicKey) -> Option<SessionId> {
        self.maps.read().await.by_key.get(key).copied()
    }

    pub async fn key(&self, session: &SessionId) -> Option<PublicKey> {
        self.maps.read().await.by_session.get(session).copied()
    }

    pub async fn remove(&self, key: &PublicKey) -> Option<SessionId> {
        let mut maps = self.maps.write().await;
        let session = maps.by_key.remove(key)?;
        maps.by_session.remove(&session);
        Some(session)
    }

    pub async fn len(&self) -> usize {
        self.maps.read().await.by_key.len()
    }
}
