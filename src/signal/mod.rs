//! Signaling
//!
//! Packets exchanged between peers before a transport exists, and the
//! seam to whatever delivers them.

mod memory;
mod packet;

pub use memory::{MemorySignalBus, MemorySignaler};
pub use packet::{DialerKind, HandshakePayload, OfferPayload, PacketType, Payload, PeerSnapshot, SignalPacket};

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;
use crate::peer::PeerId;

/// Delivers opaque signaling payloads to a peer
#[async_trait]
pub trait SignalSender: Send + Sync {
    /// Send raw bytes to `peer`
    async fn send(&self, peer: PeerId, payload: Bytes) -> Result<()>;

    /// Serialize and send a packet
    async fn send_packet(&self, peer: PeerId, packet: &SignalPacket) -> Result<()> {
        let bytes = packet.serialize()?;
        tracing::trace!("Signal {} -> {}: {}", packet.sender_id, peer, packet.type_name());
        self.send(peer, Bytes::from(bytes)).await
    }
}
