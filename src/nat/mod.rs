//! NAT Traversal
//!
//! Candidate gathering (host and STUN server-reflexive), authenticated
//! connectivity checks and the resulting direct datagram path.

mod agent;
mod candidate;
mod check;
pub mod stun;

pub use agent::{AgentCloseHandler, NatAgent};
pub use candidate::{Candidate, CandidateKind};
pub use check::{CheckKind, CheckMessage};
