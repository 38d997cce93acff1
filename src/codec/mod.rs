//! Tunnel Codec
//!
//! Builds outer tunnel datagrams from `(session id, action, payload)` and
//! parses them back. The session only sees this trait; the envelope layout
//! belongs to each implementation.

pub mod chacha;
pub mod plain;

use bytes::Bytes;

use crate::config::CodecConfig;
use crate::error::{Error, Result};

pub use chacha::ChaChaCodec;
pub use plain::PlainCodec;

/// Largest payload a codec accepts
pub const MAX_PAYLOAD_LEN: usize = 65_000;

/// Tunnel message kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Action {
    /// Inner IPv4 packet
    Data = 1,
    /// Authentication request or response
    Auth = 2,
    /// Keep-alive probe
    Ping = 3,
    /// Keep-alive answer
    Pong = 4,
    /// Peer is tearing the session down
    Close = 5,
    /// DNS message (gateway tunnels)
    Dns = 6,
}

impl TryFrom<u8> for Action {
    type Error = Error;

    fn try_from(code: u8) -> Result<Self> {
        match code {
            1 => Ok(Action::Data),
            2 => Ok(Action::Auth),
            3 => Ok(Action::Ping),
            4 => Ok(Action::Pong),
            5 => Ok(Action::Close),
            6 => Ok(Action::Dns),
            other => Err(Error::Codec(format!("unknown action code {}", other))),
        }
    }
}

/// A parsed tunnel datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    pub session_id: u32,
    /// Raw action code, validated by the session
    pub action: u8,
    pub payload: Bytes,
}

/// Outer datagram encoder/decoder
pub trait Codec: Send {
    /// Codec name as used in configuration
    fn name(&self) -> &'static str;

    /// Build the datagrams carrying one message
    fn encode(&mut self, session_id: u32, action: Action, payload: &[u8]) -> Result<Vec<Bytes>>;

    /// Parse a datagram, `None` on any integrity or framing failure
    fn decode(&mut self, datagram: &[u8]) -> Option<Decoded>;
}

/// Select a codec by configured name
pub fn from_config(config: &CodecConfig) -> Result<Box<dyn Codec>> {
    match config.name.as_str() {
        chacha::NAME => Ok(Box::new(ChaChaCodec::new(config.key.as_bytes()))),
        plain::NAME => Ok(Box::new(PlainCodec::new())),
        other => Err(Error::Config(format!("unknown codec '{}'", other))),
    }
}

pub(crate) fn check_payload_len(payload: &[u8]) -> Result<()> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(Error::Codec(format!(
            "payload of {} bytes exceeds {}",
            payload.len(),
            MAX_PAYLOAD_LEN
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_codes() {
        for code in 1..=6u8 {
            let action = Action::try_from(code).unwrap();
            assert_eq!(action as u8, code);
        }
        assert!(Action::try_from(0).is_err());
        assert!(Action::try_from(7).is_err());
    }

    #[test]
    fn test_from_config() {
        let chacha = from_config(&CodecConfig {
            name: "chacha20poly1305".into(),
            key: "k".into(),
        })
        .unwrap();
        assert_eq!(chacha.name(), "chacha20poly1305");

        let plain = from_config(&CodecConfig { name: "plain".into(), key: String::new() }).unwrap();
        assert_eq!(plain.name(), "plain");

        assert!(matches!(
            from_config(&CodecConfig { name: "rot13".into(), key: String::new() }),
            Err(Error::Config(_))
        ));
    }
}
