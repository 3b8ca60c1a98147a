//! Transports and Dialers
//!
//! A `Dialer` runs the signaling handshake for one remote peer over one
//! path and yields a `Transport`. Direct transports outrank relay
//! transports.

mod direct;
mod handshake;
mod relay;
mod role;
mod state;

pub use direct::{CloseHandler, DirectDialer, DirectTransport};
pub use handshake::Handshake;
pub use relay::{RelayDialer, RelayTransport};
pub use role::{resolve_role, Role, MAX_REROLL_ROUNDS};
pub use state::ConnectionState;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::peer::PeerId;
use crate::signal::SignalPacket;

/// Priority of a relay transport
pub const PRIORITY_RELAY: u8 = 1;

/// Priority of a direct transport
pub const PRIORITY_DIRECT: u8 = 2;

/// Path a transport or dialer uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportKind {
    Direct,
    Relay,
}

impl TransportKind {
    pub fn priority(&self) -> u8 {
        match self {
            TransportKind::Direct => PRIORITY_DIRECT,
            TransportKind::Relay => PRIORITY_RELAY,
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Direct => write!(f, "direct"),
            TransportKind::Relay => write!(f, "relay"),
        }
    }
}

/// Established datagram path to a peer
#[async_trait]
pub trait Transport: Send + Sync {
    /// Receive the next datagram
    async fn read(&self) -> Result<Bytes>;

    /// Send one datagram
    async fn write(&self, data: &[u8]) -> Result<()>;

    async fn close(&self) -> Result<()>;

    /// Underlay address of the remote end
    fn remote_addr(&self) -> String;

    fn kind(&self) -> TransportKind;

    fn priority(&self) -> u8 {
        self.kind().priority()
    }

    /// False once liveness was lost or the transport was closed
    fn is_alive(&self) -> bool;
}

pub type SharedTransport = Arc<dyn Transport>;

/// Establishes a transport to one remote peer
#[async_trait]
pub trait Dialer: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Begin the handshake with `remote`
    async fn prepare(&self, cancel: &CancellationToken, remote: PeerId) -> Result<()>;

    /// Feed an inbound signaling packet from `remote`
    async fn handle(&self, cancel: &CancellationToken, remote: PeerId, packet: SignalPacket) -> Result<()>;

    /// Wait for the handshake and connect
    async fn dial(&self, cancel: &CancellationToken) -> Result<SharedTransport>;

    /// Release resources not handed to a transport
    async fn abort(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_outranks_relay() {
        assert!(TransportKind::Direct.priority() > TransportKind::Relay.priority());
        assert_eq!(TransportKind::Relay.to_string(), "relay");
    }
}
