//! Unencrypted codec for lab setups
//!
//! Layout: `session_id (4, BE) | action (1) | payload`.

use bytes::{BufMut, Bytes, BytesMut};

use super::{check_payload_len, Action, Codec, Decoded};
use crate::error::Result;

pub const NAME: &str = "plain";

const HEADER_LEN: usize = 5;

#[derive(Debug, Default)]
pub struct PlainCodec;

impl PlainCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Codec for PlainCodec {
    fn name(&self) -> &'static str {
        NAME
    }

    fn encode(&mut self, session_id: u32, action: Action, payload: &[u8]) -> Result<Vec<Bytes>> {
        check_payload_len(payload)?;
        let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
        buf.put_u32(session_id);
        buf.put_u8(action as u8);
        buf.put_slice(payload);
        Ok(vec![buf.freeze()])
    }

    fn decode(&mut self, datagram: &[u8]) -> Option<Decoded> {
        if datagram.len() < HEADER_LEN {
            return None;
        }
        let session_id = u32::from_be_bytes([datagram[0], datagram[1], datagram[2], datagram[3]]);
        Some(Decoded {
            session_id,
            action: datagram[4],
            payload: Bytes::copy_from_slice(&datagram[HEADER_LEN..]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let mut codec = PlainCodec::new();
        let out = codec.encode(0x01020304, Action::Ping, b"hi").unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(&out[0][..], &[1, 2, 3, 4, 3, b'h', b'i']);

        let decoded = codec.decode(&out[0]).unwrap();
        assert_eq!(decoded.session_id, 0x01020304);
        assert_eq!(decoded.action, Action::Ping as u8);
        assert_eq!(&decoded.payload[..], b"hi");
    }

    #[test]
    fn test_short_datagram() {
        assert!(PlainCodec::new().decode(&[0, 0, 0, 1]).is_none());
    }
}
