//! ChaCha20-Poly1305 codec
//!
//! Layout: `session_id (4, BE) | nonce (12) | sealed(action (1) | payload)`.
//! The key is the SHA-256 digest of the shared secret and the session id is
//! bound as associated data, so a datagram re-labelled with another session
//! id fails to open.

use bytes::{BufMut, Bytes, BytesMut};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;
use sha2::{Digest, Sha256};

use super::{check_payload_len, Action, Codec, Decoded};
use crate::error::{Error, Result};

pub const NAME: &str = "chacha20poly1305";

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const HEADER_LEN: usize = 4 + NONCE_LEN;

pub struct ChaChaCodec {
    cipher: ChaCha20Poly1305,
}

impl ChaChaCodec {
    /// Derive the cipher key from a shared secret
    pub fn new(secret: &[u8]) -> Self {
        let digest = Sha256::digest(secret);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(digest.as_slice()));
        Self { cipher }
    }
}

impl std::fmt::Debug for ChaChaCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChaChaCodec").finish_non_exhaustive()
    }
}

impl Codec for ChaChaCodec {
    fn name(&self) -> &'static str {
        NAME
    }

    fn encode(&mut self, session_id: u32, action: Action, payload: &[u8]) -> Result<Vec<Bytes>> {
        check_payload_len(payload)?;

        let sid = session_id.to_be_bytes();
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let mut plaintext = Vec::with_capacity(1 + payload.len());
        plaintext.push(action as u8);
        plaintext.extend_from_slice(payload);

        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), Payload { msg: &plaintext, aad: &sid })
            .map_err(|_| Error::Codec("encryption failed".into()))?;

        let mut buf = BytesMut::with_capacity(HEADER_LEN + sealed.len());
        buf.put_slice(&sid);
        buf.put_slice(&nonce);
        buf.put_slice(&sealed);
        Ok(vec![buf.freeze()])
    }

    fn decode(&mut self, datagram: &[u8]) -> Option<Decoded> {
        if datagram.len() < HEADER_LEN + TAG_LEN + 1 {
            return None;
        }

        let (sid, rest) = datagram.split_at(4);
        let (nonce, sealed) = rest.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), Payload { msg: sealed, aad: sid })
            .ok()?;

        let (action, payload) = plaintext.split_first()?;
        Some(Decoded {
            session_id: u32::from_be_bytes([sid[0], sid[1], sid[2], sid[3]]),
            action: *action,
            payload: Bytes::copy_from_slice(payload),
        })
    }
}
