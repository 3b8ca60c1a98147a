//! WRRP framing codec for `tokio_util::codec::Framed`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::protocol::{Command, Header, HEADER_LEN};
use crate::error::{Error, FrameError};
use crate::peer::SessionId;

/// A header plus its payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: Header,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(cmd: Command, session_id: SessionId, payload: Bytes) -> Self {
        Self {
            header: Header::new(cmd, payload.len() as u32, session_id),
            payload,
        }
    }

    pub fn register(session_id: SessionId) -> Self {
        Self::new(Command::Register, session_id, Bytes::new())
    }

    pub fn ping(session_id: SessionId) -> Self {
        Self::new(Command::Ping, session_id, Bytes::new())
    }

    pub fn forward(session_id: SessionId, payload: Bytes) -> Self {
        Self::new(Command::Forward, session_id, payload)
    }

    pub fn probe(session_id: SessionId, payload: Bytes) -> Self {
        Self::new(Command::Probe, session_id, payload)
    }

    pub fn cmd(&self) -> Command {
        self.header.cmd
    }

    pub fn session_id(&self) -> SessionId {
        self.header.session_id
    }
}

/// Length-bounded WRRP codec
#[derive(Debug, Clone)]
pub struct WrrpCodec {
    max_frame_size: usize,
}

impl WrrpCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Decoder for WrrpCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let header = Header::unmarshal(&src[..HEADER_LEN])?;
        let len = header.payload_len as usize;
        if len > self.max_frame_size {
            return Err(FrameError::PayloadTooLarge {
                len,
                max: self.max_frame_size,
            }
            .into());
        }

        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(len).freeze();
        Ok(Some(Frame { header, payload }))
    }
}

impl Encoder<Frame> for WrrpCodec {
    type Error = Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Error> {
        let len = frame.payload.len();
        if len > self.max_frame_size {
            return Err(FrameError::PayloadTooLarge {
                len,
                max: self.max_frame_size,
            }
            .into());
        }

        let mut header = frame.header;
        header.payload_len = len as u32;
        dst.reserve(HEADER_LEN + len);
        dst.put_slice(&header.marshal());
        dst.put_slice(&frame.payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> SessionId {
        SessionId::from_bytes([3u8; 28])
    }

    #[test]
    fn test_decode_partial_then_complete() {
        let mut codec = WrrpCodec::new(1024);
        let mut buf = BytesMut::new();
        codec
            .encode(Frame::forward(session(), Bytes::from_static(b"hello")), &mut buf)
            .unwrap();

        let mut partial = buf.split_to(42);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.unsplit(buf);
        let frame = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(frame.cmd(), Command::Forward);
        assert_eq!(frame.payload, Bytes::from_static(b"hello"));
        assert!(partial.is_empty());
    }

    #[test]
    fn test_refuse_oversized_payload() {
        let mut codec = WrrpCodec::new(4);
        let header = Header::new(Command::Forward, 5, session());
        let mut buf = BytesMut::from(&header.marshal()[..]);

        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidFrame(FrameError::PayloadTooLarge { len: 5, max: 4 })
        ));

        let mut out = BytesMut::new();
        assert!(codec
            .encode(Frame::forward(session(), Bytes::from_static(b"12345")), &mut out)
            .is_err());
    }

    #[test]
    fn test_ping_has_no_payload() {
        let mut codec = WrrpCodec::new(16);
        let mut buf = BytesMut::new();
        codec.encode(Frame::ping(session()), &mut buf).unwrap();
        assert_eq!(buf.len(), HEADER_LEN);
    }
}
