//! Tie-breaker role resolution
//!
//! The side with the larger tie-breaker actively connects. Equal values
//! are re-rolled deterministically from `SHA-256(tie_breaker || owner id
//! || round)`; both peers compute the same sequence for both sides, so no
//! extra signaling is needed. If every round collides the larger peer id
//! wins.

use sha2::{Digest, Sha256};

use crate::peer::PeerId;

/// Re-roll rounds before falling back to peer id order
pub const MAX_REROLL_ROUNDS: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Performs the active connect
    Controlling,
    /// Accepts the remote's connect
    Controlled,
}

/// Decide the local role from both tie-breakers
pub fn resolve_role(local_tb: u64, local: PeerId, remote_tb: u64, remote: PeerId) -> Role {
    let (mut ours, mut theirs) = (local_tb, remote_tb);
    for round in 0..MAX_REROLL_ROUNDS {
        if ours != theirs {
            return if ours > theirs {
                Role::Controlling
            } else {
                Role::Controlled
            };
        }
        tracing::debug!("Tie-breaker collision with {} (round {}), re-rolling", remote, round);
        ours = reroll(ours, local, round);
        theirs = reroll(theirs, remote, round);
    }

    if local > remote {
        Role::Controlling
    } else {
        Role::Controlled
    }
}

fn reroll(tie_breaker: u64, owner: PeerId, round: u32) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(tie_breaker.to_be_bytes());
    hasher.update(owner.as_bytes());
    hasher.update(round.to_be_bytes());
    let digest = hasher.finalize();
    let mut value = [0u8; 8];
    value.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn roles(a_tb: u64, a: PeerId, b_tb: u64, b: PeerId) -> (Role, Role) {
        (resolve_role(a_tb, a, b_tb, b), resolve_role(b_tb, b, a_tb, a))
    }

    #[test]
    fn test_larger_tie_breaker_controls() {
        let (a, b) = (PeerId::from_u64(10), PeerId::from_u64(20));
        // Tie-breaker beats peer id order
        assert_eq!(roles(900, a, 100, b), (Role::Controlling, Role::Controlled));
    }

    #[test]
    fn test_exactly_one_side_controls() {
        let mut rng = rand::thread_rng();
        for _ in 0..1000 {
            let a = PeerId::from_u64(rng.gen());
            let b = PeerId::from_u64(rng.gen());
            if a == b {
                continue;
            }
            let (ra, rb) = roles(rng.gen(), a, rng.gen(), b);
            assert_ne!(ra, rb);
        }
    }

    #[test]
    fn test_forced_collision_still_resolves() {
        let (a, b) = (PeerId::from_u64(10), PeerId::from_u64(20));
        for tb in [0, 42, u64::MAX] {
            let (ra, rb) = roles(tb, a, tb, b);
            assert_ne!(ra, rb);
        }
    }

    #[test]
    fn test_collision_resolution_is_deterministic() {
        let (a, b) = (PeerId::from_u64(7), PeerId::from_u64(8));
        let first = resolve_role(5, a, 5, b);
        for _ in 0..10 {
            assert_eq!(resolve_role(5, a, 5, b), first);
        }
    }
}
