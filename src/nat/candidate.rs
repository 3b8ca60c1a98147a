//! ICE-style candidates

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Component id; tunnels only carry one
const COMPONENT: u32 = 1;

const LOCAL_PREFERENCE: u32 = 65535;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidateKind {
    Host,
    ServerReflexive,
}

impl CandidateKind {
    fn type_preference(&self) -> u32 {
        match self {
            CandidateKind::Host => 126,
            CandidateKind::ServerReflexive => 100,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            CandidateKind::Host => "host",
            CandidateKind::ServerReflexive => "srflx",
        }
    }
}

/// A transport address the remote may be reachable on
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Candidate {
    pub kind: CandidateKind,
    pub address: SocketAddr,
    pub priority: u32,
    pub foundation: String,
}

impl Candidate {
    pub fn new(kind: CandidateKind, address: SocketAddr) -> Self {
        Self {
            kind,
            address,
            priority: priority(kind),
            foundation: foundation(kind, address.ip()),
        }
    }

    pub fn host(address: SocketAddr) -> Self {
        Self::new(CandidateKind::Host, address)
    }

    pub fn server_reflexive(address: SocketAddr) -> Self {
        Self::new(CandidateKind::ServerReflexive, address)
    }

    /// Text form carried in OFFER packets
    pub fn marshal(&self) -> String {
        self.to_string()
    }

    pub fn unmarshal(text: &str) -> Result<Self> {
        text.parse()
    }
}

/// RFC 8445 priority
fn priority(kind: CandidateKind) -> u32 {
    (kind.type_preference() << 24) + (LOCAL_PREFERENCE << 8) + (256 - COMPONENT)
}

fn foundation(kind: CandidateKind, ip: IpAddr) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kind.as_str().as_bytes());
    hasher.update(ip.to_string().as_bytes());
    let digest = hasher.finalize();
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]).to_string()
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "candidate:{} {} udp {} {} {} typ {}",
            self.foundation,
            COMPONENT,
            self.priority,
            self.address.ip(),
            self.address.port(),
            self.kind.as_str()
        )
    }
}

impl FromStr for Candidate {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidCandidate(s.to_string());

        let body = s.trim().strip_prefix("candidate:").ok_or_else(invalid)?;
        let fields: Vec<&str> = body.split_whitespace().collect();
        if fields.len() < 8 || !fields[2].eq_ignore_ascii_case("udp") || fields[6] != "typ" {
            return Err(invalid());
        }

        let priority: u32 = fields[3].parse().map_err(|_| invalid())?;
        let ip: IpAddr = fields[4].parse().map_err(|_| invalid())?;
        let port: u16 = fields[5].parse().map_err(|_| invalid())?;
        let kind = match fields[7] {
            "host" => CandidateKind::Host,
            "srflx" => CandidateKind::ServerReflexive,
            _ => return Err(invalid()),
        };

        Ok(Self {
            kind,
            address: SocketAddr::new(ip, port),
            priority,
            foundation: fields[0].to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_form() {
        let candidate = Candidate::host("192.168.1.20:51820".parse().unwrap());
        let text = candidate.marshal();
        assert!(text.starts_with("candidate:"));
        assert!(text.ends_with("192.168.1.20 51820 typ host"));
        assert_eq!(Candidate::unmarshal(&text).unwrap(), candidate);
    }

    #[test]
    fn test_host_preferred_over_srflx() {
        let addr: SocketAddr = "203.0.113.9:4000".parse().unwrap();
        assert!(Candidate::host(addr).priority > Candidate::server_reflexive(addr).priority);
        assert_eq!(Candidate::host(addr).priority, 2130706431);
    }

    #[test]
    fn test_reject_malformed() {
        for text in [
            "",
            "candidate:1 1 tcp 1 1.2.3.4 5 typ host",
            "candidate:1 1 udp x 1.2.3.4 5 typ host",
            "candidate:1 1 udp 1 1.2.3.4 5 typ relay",
            "1 1 udp 1 1.2.3.4 5 typ host",
        ] {
            assert!(matches!(
                Candidate::unmarshal(text),
                Err(Error::InvalidCandidate(_))
            ));
        }
    }
}
