//! Peer Identity
//!
//! Keys, compact peer identifiers and the peer metadata held by the
//! registry.

mod registry;
mod session;

pub use registry::PeerRegistry;
pub use session::{SessionId, SessionTable, SESSION_ID_LEN};

use std::fmt;
use std::str::FromStr;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use x25519_dalek::StaticSecret;

use crate::error::{Error, Result};

/// Length of a WireGuard key in bytes
pub const KEY_LEN: usize = 32;

/// Compact 8-byte peer identifier (first 8 bytes of the public key)
///
/// Ordering follows the big-endian numeric value, which is what the
/// handshake uses to pick an initiator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId([u8; 8]);

impl PeerId {
    /// Derive the id from a public key
    pub fn from_public_key(key: &PublicKey) -> Self {
        let mut id = [0u8; 8];
        id.copy_from_slice(&key.0[..8]);
        Self(id)
    }

    pub fn from_u64(value: u64) -> Self {
        Self(value.to_be_bytes())
    }

    pub fn as_u64(&self) -> u64 {
        u64::from_be_bytes(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u64())
    }
}

/// WireGuard public key
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicKey([u8; KEY_LEN]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Parse a base64 encoded key
    pub fn from_base64(encoded: &str) -> Result<Self> {
        decode_key(encoded).map(Self)
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }

    /// Hex form used by the UAPI protocol
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(encoded: &str) -> Result<Self> {
        decode_hex_key(encoded).map(Self)
    }

    pub fn peer_id(&self) -> PeerId {
        PeerId::from_public_key(self)
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_base64())
    }
}

impl FromStr for PublicKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_base64(s)
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        Self::from_base64(&encoded).map_err(serde::de::Error::custom)
    }
}

/// WireGuard private key (local peer only)
#[derive(Clone, PartialEq, Eq)]
pub struct PrivateKey([u8; KEY_LEN]);

impl PrivateKey {
    /// Generate a fresh random key
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        Self(secret.to_bytes())
    }

    pub fn from_base64(encoded: &str) -> Result<Self> {
        decode_key(encoded).map(Self)
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(encoded: &str) -> Result<Self> {
        decode_hex_key(encoded).map(Self)
    }

    /// Derive the matching public key (X25519)
    pub fn public_key(&self) -> PublicKey {
        let secret = StaticSecret::from(self.0);
        PublicKey(*x25519_dalek::PublicKey::from(&secret).as_bytes())
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey(..)")
    }
}

fn decode_key(encoded: &str) -> Result<[u8; KEY_LEN]> {
    let bytes = BASE64
        .decode(encoded.trim())
        .map_err(|e| Error::InvalidKey(e.to_string()))?;
    to_key_bytes(bytes)
}

fn decode_hex_key(encoded: &str) -> Result<[u8; KEY_LEN]> {
    let bytes = hex::decode(encoded.trim()).map_err(|e| Error::InvalidKey(e.to_string()))?;
    to_key_bytes(bytes)
}

fn to_key_bytes(bytes: Vec<u8>) -> Result<[u8; KEY_LEN]> {
    bytes.try_into().map_err(|b: Vec<u8>| {
        Error::InvalidKey(format!("expected {} bytes, got {}", KEY_LEN, b.len()))
    })
}

/// How a peer should be reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectType {
    #[default]
    Direct,
    Relay,
    ServerRelay,
}

impl ConnectType {
    /// Whether only the relay path may be used
    pub fn relay_only(&self) -> bool {
        !matches!(self, ConnectType::Direct)
    }
}

impl fmt::Display for ConnectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectType::Direct => write!(f, "direct"),
            ConnectType::Relay => write!(f, "relay"),
            ConnectType::ServerRelay => write!(f, "server_relay"),
        }
    }
}

/// Peer metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Peer {
    pub public_key: PublicKey,
    /// Only set for the local peer
    #[serde(skip)]
    pub private_key: Option<PrivateKey>,
    /// Tunnel address
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub allowed_ips: Vec<String>,
    /// Last known underlay endpoint
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub connect_type: ConnectType,
}

impl Peer {
    pub fn new(public_key: PublicKey) -> Self {
        Self {
            public_key,
            private_key: None,
            address: None,
            allowed_ips: Vec::new(),
            endpoint: None,
            connect_type: ConnectType::Direct,
        }
    }

    /// Build the local peer from its private key
    pub fn local(private_key: PrivateKey) -> Self {
        let mut peer = Self::new(private_key.public_key());
        peer.private_key = Some(private_key);
        peer
    }

    pub fn id(&self) -> PeerId {
        self.public_key.peer_id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_with_prefix(prefix: [u8; 8]) -> PublicKey {
        let mut bytes = [0xAAu8; KEY_LEN];
        bytes[..8].copy_from_slice(&prefix);
        PublicKey::from_bytes(bytes)
    }

    #[test]
    fn test_peer_id_from_key() {
        let key = key_with_prefix([0, 0, 0, 0, 0, 0, 0, 20]);
        let id = key.peer_id();
        assert_eq!(id.as_u64(), 20);
        assert_eq!(id, PeerId::from_u64(20));
        assert_eq!(id.to_string(), "20");
    }

    #[test]
    fn test_peer_id_ordering_is_numeric() {
        let small = PeerId::from_u64(10);
        let big = PeerId::from_u64(20);
        assert!(big > small);
        assert!(PeerId::from_u64(256) > PeerId::from_u64(255));
    }

    #[test]
    fn test_key_encodings() {
        let private = PrivateKey::generate();
        let public = private.public_key();

        let parsed = PublicKey::from_base64(&public.to_base64()).unwrap();
        assert_eq!(parsed, public);
        assert_eq!(PublicKey::from_hex(&public.to_hex()).unwrap(), public);

        let restored = PrivateKey::from_base64(&private.to_base64()).unwrap();
        assert_eq!(restored.public_key(), public);
    }

    #[test]
    fn test_invalid_key_length() {
        let err = PublicKey::from_base64("AAAA").unwrap_err();
        assert!(matches!(err, Error::InvalidKey(_)));
    }

    #[test]
    fn test_connect_type_serde() {
        #[derive(Deserialize)]
        struct Wrapper {
            connect_type: ConnectType,
        }
        let w: Wrapper = toml::from_str("connect_type = \"server_relay\"").unwrap();
        assert_eq!(w.connect_type, ConnectType::ServerRelay);
        assert!(w.connect_type.relay_only());
        assert!(!ConnectType::Direct.relay_only());
    }
}
