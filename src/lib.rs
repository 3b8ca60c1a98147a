//! Wireflow - Mesh VPN Data-Plane Agent
//!
//! Establishes authenticated point-to-point tunnels between peers behind
//! NATs. Each remote peer gets a probe that races a direct (ICE-style)
//! dialer against a relay dialer and hands the winning transport to a
//! WireGuard-compatible tunnel device.
//!
//! # Architecture
//!
//! Peers decide who initiates with a SYN/ACK handshake keyed on their
//! ids, trickle candidates as OFFERs, and resolve the active side of the
//! connectivity checks with random tie-breakers. A relay transport is
//! adopted when the direct path is slow or impossible and is upgraded
//! live once a direct path appears.
//!
//! # Features
//!
//! - Direct NAT traversal with host and server-reflexive candidates
//! - WRRP relay protocol (client and server) with a 40-byte binary header
//! - Live transport upgrade from relay to direct
//! - Bounded retries with automatic fallback to relay
//! - UAPI control socket for the tunnel device

pub mod agent;
pub mod config;
pub mod device;
pub mod error;
pub mod latch;
pub mod nat;
pub mod peer;
pub mod probe;
pub mod signal;
pub mod transport;
pub mod wrrp;

pub use agent::Agent;
pub use config::AgentConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::agent::{Agent, AgentStatus};
    pub use crate::config::AgentConfig;
    pub use crate::error::{Error, Result};
    pub use crate::latch::Latch;
    pub use crate::peer::{ConnectType, Peer, PeerId, PeerRegistry, PrivateKey, PublicKey, SessionId, SessionTable};
    pub use crate::probe::{Probe, RetryPolicy};
    pub use crate::signal::{SignalPacket, SignalSender};
    pub use crate::transport::{ConnectionState, Dialer, Transport, TransportKind};
    pub use crate::wrrp::{WrrpClient, WrrpServer};
}
