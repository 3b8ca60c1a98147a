//! WRRP Header
//!
//! Fixed 40-byte big-endian frame header:
//!
//! ```text
//! Magic(4) | Version(2) | Cmd(1) | Reserved(1) | PayloadLen(4) | SessionID(28)
//! ```

use byteorder::{BigEndian, ByteOrder};

use crate::error::FrameError;
use crate::peer::{SessionId, SESSION_ID_LEN};

/// "WRRP" in ASCII
pub const MAGIC: u32 = 0x5752_5250;

/// Current protocol version
pub const VERSION: u16 = 1;

/// Encoded header size
pub const HEADER_LEN: usize = 40;

/// Frame command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    /// Identifies the session right after the stream upgrade
    Register = 0x01,
    /// Tunnel payload for another session
    Forward = 0x02,
    /// Keepalive, no payload
    Ping = 0x03,
    /// Signaling packet for another session
    Probe = 0x04,
}

impl TryFrom<u8> for Command {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, FrameError> {
        match value {
            0x01 => Ok(Command::Register),
            0x02 => Ok(Command::Forward),
            0x03 => Ok(Command::Ping),
            0x04 => Ok(Command::Probe),
            other => Err(FrameError::UnknownCommand(other)),
        }
    }
}

/// Decoded frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u16,
    pub cmd: Command,
    pub reserved: u8,
    pub payload_len: u32,
    pub session_id: SessionId,
}

impl Header {
    pub fn new(cmd: Command, payload_len: u32, session_id: SessionId) -> Self {
        Self {
            version: VERSION,
            cmd,
            reserved: 0,
            payload_len,
            session_id,
        }
    }

    pub fn marshal(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        BigEndian::write_u32(&mut buf[0..4], MAGIC);
        BigEndian::write_u16(&mut buf[4..6], self.version);
        buf[6] = self.cmd as u8;
        buf[7] = self.reserved;
        BigEndian::write_u32(&mut buf[8..12], self.payload_len);
        buf[12..].copy_from_slice(self.session_id.as_bytes());
        buf
    }

    /// Decode a header from the front of `buf`. Trailing bytes are ignored.
    pub fn unmarshal(buf: &[u8]) -> Result<Self, FrameError> {
        if buf.len() < HEADER_LEN {
            return Err(FrameError::HeaderTooShort(buf.len()));
        }

        let magic = BigEndian::read_u32(&buf[0..4]);
        if magic != MAGIC {
            return Err(FrameError::InvalidMagic(magic));
        }

        let cmd = Command::try_from(buf[6])?;
        let mut session = [0u8; SESSION_ID_LEN];
        session.copy_from_slice(&buf[12..HEADER_LEN]);

        Ok(Self {
            version: BigEndian::read_u16(&buf[4..6]),
            cmd,
            reserved: buf[7],
            payload_len: BigEndian::read_u32(&buf[8..12]),
            session_id: SessionId::from_bytes(session),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::PrivateKey;

    fn sample_header() -> Header {
        let key = PrivateKey::generate().public_key();
        Header::new(Command::Forward, 1420, SessionId::from_public_key(&key))
    }

    #[test]
    fn test_header_round_trip() {
        let header = sample_header();
        let bytes = header.marshal();
        assert_eq!(bytes.len(), HEADER_LEN);
        assert_eq!(&bytes[0..4], b"WRRP");
        assert_eq!(Header::unmarshal(&bytes).unwrap(), header);
    }

    #[test]
    fn test_header_layout() {
        let header = Header {
            version: 0x0102,
            cmd: Command::Ping,
            reserved: 0,
            payload_len: 0x0A0B0C0D,
            session_id: SessionId::from_bytes([0xEE; SESSION_ID_LEN]),
        };
        let bytes = header.marshal();
        assert_eq!(&bytes[4..6], &[0x01, 0x02]);
        assert_eq!(bytes[6], 0x03);
        assert_eq!(&bytes[8..12], &[0x0A, 0x0B, 0x0C, 0x0D]);
        assert!(bytes[12..].iter().all(|b| *b == 0xEE));
    }

    #[test]
    fn test_header_too_short() {
        let bytes = sample_header().marshal();
        assert_eq!(
            Header::unmarshal(&bytes[..39]),
            Err(FrameError::HeaderTooShort(39))
        );
    }

    #[test]
    fn test_invalid_magic() {
        let mut bytes = sample_header().marshal();
        bytes[0] = b'X';
        assert!(matches!(
            Header::unmarshal(&bytes),
            Err(FrameError::InvalidMagic(_))
        ));
    }

    #[test]
    fn test_unknown_command() {
        let mut bytes = sample_header().marshal();
        bytes[6] = 0x7F;
        assert_eq!(
            Header::unmarshal(&bytes),
            Err(FrameError::UnknownCommand(0x7F))
        );
    }
}
