//! WRRP Relay Protocol
//!
//! Binary relay protocol used when peers cannot reach each other
//! directly. A client upgrades a plain TCP stream with an HTTP/1.1
//! `Upgrade: wrrp` request, registers its session, then exchanges
//! 40-byte-header frames with the relay server.

pub mod protocol;
mod codec;
mod client;
mod server;

pub use codec::{Frame, WrrpCodec};
pub use client::{RelayRoute, RelaySignaler, SignalInbox, WrrpClient};
pub use protocol::{Command, Header, HEADER_LEN, MAGIC, VERSION};
pub use server::WrrpServer;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};

/// Path of the upgrade endpoint
pub const UPGRADE_PATH: &str = "/wrrp/v1/upgrade";

const MAX_HTTP_HEAD: usize = 8192;

/// Read an HTTP head up to and including the blank line.
///
/// Reads byte by byte so nothing past the head is consumed.
pub(crate) async fn read_http_head<R: AsyncRead + Unpin>(reader: &mut R) -> Result<String> {
    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_HTTP_HEAD {
            return Err(Error::DialFailed {
                kind: "relay".into(),
                reason: "upgrade head too large".into(),
            });
        }
        let n = reader.read(&mut byte).await?;
        if n == 0 {
            return Err(Error::Io(std::io::ErrorKind::UnexpectedEof.into()));
        }
        head.push(byte[0]);
    }
    Ok(String::from_utf8_lossy(&head).into_owned())
}

/// Case-insensitive header lookup in an HTTP head
pub(crate) fn header_value<'a>(head: &'a str, name: &str) -> Option<&'a str> {
    head.lines().skip(1).find_map(|line| {
        let (key, value) = line.split_once(':')?;
        key.trim().eq_ignore_ascii_case(name).then(|| value.trim())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_http_head_stops_at_blank_line() {
        let raw = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: wrrp\r\n\r\nWRRP".to_vec();
        let mut reader = &raw[..];
        let head = read_http_head(&mut reader).await.unwrap();

        assert!(head.starts_with("HTTP/1.1 101"));
        assert_eq!(header_value(&head, "upgrade"), Some("wrrp"));
        assert_eq!(reader, b"WRRP");
    }
}
