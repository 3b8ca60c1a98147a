//! STUN binding messages (RFC 5389) for server-reflexive discovery

use std::net::{IpAddr, SocketAddr};

use byteorder::{BigEndian, ByteOrder};

use crate::error::{Error, Result};

const STUN_BINDING_REQUEST: u16 = 0x0001;
const STUN_BINDING_RESPONSE: u16 = 0x0101;

const STUN_MAGIC_COOKIE: u32 = 0x2112_A442;

const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

const STUN_HEADER_LEN: usize = 20;

pub type TransactionId = [u8; 12];

/// Build a binding request with no attributes
pub fn binding_request(transaction_id: &TransactionId) -> Vec<u8> {
    let mut request = vec![0u8; STUN_HEADER_LEN];
    BigEndian::write_u16(&mut request[0..2], STUN_BINDING_REQUEST);
    BigEndian::write_u16(&mut request[2..4], 0);
    BigEndian::write_u32(&mut request[4..8], STUN_MAGIC_COOKIE);
    request[8..20].copy_from_slice(transaction_id);
    request
}

/// Transaction id of a datagram that looks like a STUN binding response
pub fn response_transaction(data: &[u8]) -> Option<TransactionId> {
    if data.len() < STUN_HEADER_LEN
        || BigEndian::read_u16(&data[0..2]) != STUN_BINDING_RESPONSE
        || BigEndian::read_u32(&data[4..8]) != STUN_MAGIC_COOKIE
    {
        return None;
    }
    let mut txn = [0u8; 12];
    txn.copy_from_slice(&data[8..20]);
    Some(txn)
}

/// Extract the mapped address from a binding response
pub fn parse_binding_response(data: &[u8], expected: &TransactionId) -> Result<SocketAddr> {
    let txn = response_transaction(data)
        .ok_or_else(|| Error::Stun("not a binding response".into()))?;
    if &txn != expected {
        return Err(Error::Stun("transaction id mismatch".into()));
    }

    let msg_len = BigEndian::read_u16(&data[2..4]) as usize;
    if data.len() < STUN_HEADER_LEN + msg_len {
        return Err(Error::Stun("response truncated".into()));
    }

    let mut offset = STUN_HEADER_LEN;
    while offset + 4 <= STUN_HEADER_LEN + msg_len {
        let attr_type = BigEndian::read_u16(&data[offset..offset + 2]);
        let attr_len = BigEndian::read_u16(&data[offset + 2..offset + 4]) as usize;
        offset += 4;
        if offset + attr_len > data.len() {
            break;
        }

        let attr = &data[offset..offset + attr_len];
        match attr_type {
            ATTR_XOR_MAPPED_ADDRESS => return parse_address(attr, Some(expected)),
            ATTR_MAPPED_ADDRESS => return parse_address(attr, None),
            _ => {}
        }

        // Attributes are padded to 4-byte boundaries
        offset += (attr_len + 3) & !3;
    }

    Err(Error::Stun("no address attribute in response".into()))
}

/// Parse (XOR-)MAPPED-ADDRESS; `xor` carries the transaction id when XORed
fn parse_address(data: &[u8], xor: Option<&TransactionId>) -> Result<SocketAddr> {
    if data.len() < 8 {
        return Err(Error::Stun("address attribute too short".into()));
    }

    let family = data[1];
    let mut port = BigEndian::read_u16(&data[2..4]);
    if xor.is_some() {
        port ^= (STUN_MAGIC_COOKIE >> 16) as u16;
    }

    let ip = match family {
        0x01 => {
            let mut addr = BigEndian::read_u32(&data[4..8]);
            if xor.is_some() {
                addr ^= STUN_MAGIC_COOKIE;
            }
            IpAddr::from(addr.to_be_bytes())
        }
        0x02 => {
            if data.len() < 20 {
                return Err(Error::Stun("IPv6 address too short".into()));
            }
            let mut addr = [0u8; 16];
            addr.copy_from_slice(&data[4..20]);
            if let Some(txn) = xor {
                let mut key = [0u8; 16];
                key[0..4].copy_from_slice(&STUN_MAGIC_COOKIE.to_be_bytes());
                key[4..16].copy_from_slice(txn);
                for (byte, k) in addr.iter_mut().zip(key.iter()) {
                    *byte ^= k;
                }
            }
            IpAddr::from(addr)
        }
        other => return Err(Error::Stun(format!("unknown address family {}", other))),
    };

    Ok(SocketAddr::new(ip, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn xor_response(txn: &TransactionId, addr: SocketAddr) -> Vec<u8> {
        let SocketAddr::V4(v4) = addr else {
            panic!("ipv4 only")
        };
        let mut msg = vec![0u8; STUN_HEADER_LEN];
        BigEndian::write_u16(&mut msg[0..2], STUN_BINDING_RESPONSE);
        BigEndian::write_u16(&mut msg[2..4], 12);
        BigEndian::write_u32(&mut msg[4..8], STUN_MAGIC_COOKIE);
        msg[8..20].copy_from_slice(txn);

        let mut attr = [0u8; 12];
        BigEndian::write_u16(&mut attr[0..2], ATTR_XOR_MAPPED_ADDRESS);
        BigEndian::write_u16(&mut attr[2..4], 8);
        attr[5] = 0x01;
        BigEndian::write_u16(&mut attr[6..8], v4.port() ^ (STUN_MAGIC_COOKIE >> 16) as u16);
        BigEndian::write_u32(&mut attr[8..12], u32::from(*v4.ip()) ^ STUN_MAGIC_COOKIE);
        msg.extend_from_slice(&attr);
        msg
    }

    #[test]
    fn test_request_layout() {
        let txn = [9u8; 12];
        let request = binding_request(&txn);
        assert_eq!(request.len(), 20);
        assert_eq!(&request[0..2], &[0x00, 0x01]);
        assert_eq!(&request[4..8], &STUN_MAGIC_COOKIE.to_be_bytes());
        assert_eq!(&request[8..], &txn);
    }

    #[test]
    fn test_parse_xor_mapped() {
        let txn = [1u8; 12];
        let mapped: SocketAddr = "198.51.100.7:40000".parse().unwrap();
        let response = xor_response(&txn, mapped);

        assert_eq!(response_transaction(&response), Some(txn));
        assert_eq!(parse_binding_response(&response, &txn).unwrap(), mapped);
    }

    #[test]
    fn test_transaction_mismatch() {
        let response = xor_response(&[1u8; 12], "198.51.100.7:1".parse().unwrap());
        assert!(parse_binding_response(&response, &[2u8; 12]).is_err());
        assert!(response_transaction(b"short").is_none());
    }
}
