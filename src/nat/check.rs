//! Connectivity check messages
//!
//! ```text
//! "WFIC"(4) | kind(1) | flags(1) | txn(12) | username_len(2) | username | integrity(32)
//! ```
//!
//! The username is `<receiver ufrag>:<sender ufrag>`. Integrity is
//! HMAC-SHA256 keyed with the receiver's password over every field after
//! the magic, so only a peer that learned the password through signaling
//! can produce it.

use byteorder::{BigEndian, ByteOrder};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

const CHECK_MAGIC: &[u8; 4] = b"WFIC";
const FLAG_NOMINATE: u8 = 0x01;
const FIXED_LEN: usize = 4 + 1 + 1 + 12 + 2;
const INTEGRITY_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CheckKind {
    Request = 1,
    Response = 2,
}

/// Binding request or response on a candidate pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckMessage {
    pub kind: CheckKind,
    pub nominate: bool,
    pub txn: [u8; 12],
    pub username: String,
}

impl CheckMessage {
    pub fn request(txn: [u8; 12], username: String, nominate: bool) -> Self {
        Self {
            kind: CheckKind::Request,
            nominate,
            txn,
            username,
        }
    }

    /// Response echoing a request
    pub fn response_to(request: &CheckMessage) -> Self {
        Self {
            kind: CheckKind::Response,
            nominate: request.nominate,
            txn: request.txn,
            username: request.username.clone(),
        }
    }

    fn flags(&self) -> u8 {
        if self.nominate {
            FLAG_NOMINATE
        } else {
            0
        }
    }

    /// HMAC accepts keys of any length, so this is always `Some`
    fn mac(&self, pwd: &str) -> Option<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(pwd.as_bytes()).ok()?;
        let mut user_len = [0u8; 2];
        BigEndian::write_u16(&mut user_len, self.username.len() as u16);
        mac.update(&[self.kind as u8, self.flags()]);
        mac.update(&self.txn);
        mac.update(&user_len);
        mac.update(self.username.as_bytes());
        Some(mac)
    }

    /// Encode, authenticated with `pwd`
    pub fn encode(&self, pwd: &str) -> Vec<u8> {
        let user = self.username.as_bytes();
        let mut buf = vec![0u8; FIXED_LEN];
        buf[0..4].copy_from_slice(CHECK_MAGIC);
        buf[4] = self.kind as u8;
        buf[5] = self.flags();
        buf[6..18].copy_from_slice(&self.txn);
        BigEndian::write_u16(&mut buf[18..20], user.len() as u16);
        buf.extend_from_slice(user);
        match self.mac(pwd) {
            Some(mac) => buf.extend_from_slice(&mac.finalize().into_bytes()),
            None => buf.extend_from_slice(&[0u8; INTEGRITY_LEN]),
        }
        buf
    }

    /// Decode without verifying; returns the carried integrity tag
    pub fn decode(data: &[u8]) -> Option<(Self, [u8; INTEGRITY_LEN])> {
        if data.len() < FIXED_LEN + INTEGRITY_LEN || &data[0..4] != CHECK_MAGIC {
            return None;
        }

        let kind = match data[4] {
            1 => CheckKind::Request,
            2 => CheckKind::Response,
            _ => return None,
        };
        let user_len = BigEndian::read_u16(&data[18..20]) as usize;
        if data.len() != FIXED_LEN + user_len + INTEGRITY_LEN {
            return None;
        }

        let mut txn = [0u8; 12];
        txn.copy_from_slice(&data[6..18]);
        let username = String::from_utf8(data[FIXED_LEN..FIXED_LEN + user_len].to_vec()).ok()?;
        let mut integrity = [0u8; INTEGRITY_LEN];
        integrity.copy_from_slice(&data[FIXED_LEN + user_len..]);

        Some((
            Self {
                kind,
                nominate: data[5] & FLAG_NOMINATE != 0,
                txn,
                username,
            },
            integrity,
        ))
    }

    /// Constant-time check of `integrity` against `pwd`
    pub fn verify(&self, integrity: &[u8; INTEGRITY_LEN], pwd: &str) -> bool {
        self.mac(pwd)
            .map_or(false, |mac| mac.verify_slice(integrity).is_ok())
    }
}
