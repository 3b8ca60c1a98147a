//! Signal packet model

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::peer::{PeerId, PublicKey};

pub use crate::transport::TransportKind as DialerKind;

/// Signal packet type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PacketType {
    HandshakeSyn,
    HandshakeAck,
    Offer,
    Answer,
}

/// Handshake payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakePayload {
    /// Sender wall clock, unix milliseconds
    pub timestamp: i64,
}

/// Public view of the sending peer carried in offers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSnapshot {
    pub public_key: PublicKey,
    pub address: Option<String>,
    pub allowed_ips: Vec<String>,
}

/// Offer payload: credentials, tie-breaker and one trickled candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferPayload {
    pub ufrag: String,
    pub pwd: String,
    pub tie_breaker: u64,
    /// Serialized candidate descriptor
    pub candidate: String,
    pub current_peer: Option<PeerSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    Empty,
    Handshake(HandshakePayload),
    Offer(OfferPayload),
}

/// A signaling message. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalPacket {
    pub packet_type: PacketType,
    pub dialer: DialerKind,
    pub sender_id: PeerId,
    pub payload: Payload,
}

impl SignalPacket {
    fn handshake(packet_type: PacketType, dialer: DialerKind, sender_id: PeerId) -> Self {
        Self {
            packet_type,
            dialer,
            sender_id,
            payload: Payload::Handshake(HandshakePayload {
                timestamp: chrono::Utc::now().timestamp_millis(),
            }),
        }
    }

    pub fn syn(dialer: DialerKind, sender_id: PeerId) -> Self {
        Self::handshake(PacketType::HandshakeSyn, dialer, sender_id)
    }

    pub fn ack(dialer: DialerKind, sender_id: PeerId) -> Self {
        Self::handshake(PacketType::HandshakeAck, dialer, sender_id)
    }

    pub fn offer(dialer: DialerKind, sender_id: PeerId, offer: OfferPayload) -> Self {
        Self {
            packet_type: PacketType::Offer,
            dialer,
            sender_id,
            payload: Payload::Offer(offer),
        }
    }

    /// Offer carrying only the sender id
    pub fn bare_offer(dialer: DialerKind, sender_id: PeerId) -> Self {
        Self {
            packet_type: PacketType::Offer,
            dialer,
            sender_id,
            payload: Payload::Empty,
        }
    }

    pub fn offer_payload(&self) -> Option<&OfferPayload> {
        match &self.payload {
            Payload::Offer(offer) => Some(offer),
            _ => None,
        }
    }

    /// Serialize for transit
    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize from transit
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }

    /// Get the packet type name for logging
    pub fn type_name(&self) -> &'static str {
        match self.packet_type {
            PacketType::HandshakeSyn => "HANDSHAKE_SYN",
            PacketType::HandshakeAck => "HANDSHAKE_ACK",
            PacketType::Offer => "OFFER",
            PacketType::Answer => "ANSWER",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::PrivateKey;

    #[test]
    fn test_offer_survives_transit() {
        let offer = OfferPayload {
            ufrag: "abcd1234".into(),
            pwd: "p".repeat(24),
            tie_breaker: u64::MAX - 3,
            candidate: "candidate:1 1 udp 2130706431 127.0.0.1 5000 typ host".into(),
            current_peer: Some(PeerSnapshot {
                public_key: PrivateKey::generate().public_key(),
                address: Some("10.0.0.1/24".into()),
                allowed_ips: vec!["10.0.0.1/32".into()],
            }),
        };
        let packet = SignalPacket::offer(DialerKind::Direct, PeerId::from_u64(20), offer);

        let bytes = packet.serialize().unwrap();
        let decoded = SignalPacket::deserialize(&bytes).unwrap();
        assert_eq!(decoded, packet);
        assert_eq!(decoded.type_name(), "OFFER");
        assert_eq!(decoded.offer_payload().unwrap().tie_breaker, u64::MAX - 3);
    }

    #[test]
    fn test_handshake_carries_timestamp() {
        let packet = SignalPacket::syn(DialerKind::Relay, PeerId::from_u64(10));
        match packet.payload {
            Payload::Handshake(ref h) => assert!(h.timestamp > 0),
            _ => panic!("expected handshake payload"),
        }
        assert!(packet.offer_payload().is_none());
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(SignalPacket::deserialize(&[0xFF, 0xFF, 0xFF]).is_err());
    }
}
