//! Tunnel Variants
//!
//! A variant supplies the authentication exchange and the framing flags of
//! one kind of tunnel endpoint. The session is generic over them through
//! [`TunnelVariant`].

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::net::Ipv4Addr;

use crate::config::{TunnelConfig, VariantKind};
use crate::error::{Error, Result};

/// Minimum number of virtual addresses a grant must carry
pub const MIN_GRANTED_ADDRESSES: usize = 2;

/// Outcome of a successful authentication
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthGrant {
    /// Virtual addresses leased to this endpoint
    pub virtual_addresses: Vec<Ipv4Addr>,
}

/// Variant hooks used by the session state machine
pub trait TunnelVariant: Send {
    /// Variant name for logging
    fn name(&self) -> &'static str;

    /// Prepare the variant, returning the initial session id
    fn initialize(&mut self) -> Result<u32>;

    /// Payload of an AUTH request
    fn auth_request(&self) -> Result<Vec<u8>>;

    /// Check an AUTH response; an error means the server rejected us
    fn verify_auth_response(&self, payload: &[u8]) -> Result<AuthGrant>;

    /// Require the declared inner length to equal the received size
    fn strict_length(&self) -> bool;

    /// Whether the DNS action is carried over this tunnel
    fn carries_dns(&self) -> bool;
}

/// Build the variant selected in configuration
pub fn from_config(config: &TunnelConfig) -> Box<dyn TunnelVariant> {
    let username = config.tunnel.username.clone();
    let password = config.tunnel.password.clone();
    match config.tunnel.variant {
        VariantKind::Client => Box::new(ClientVariant::new(username, password)),
        VariantKind::Gateway => Box::new(GatewayVariant::new(username, password)),
    }
}

/// Hex SHA-256 of `username:password`
fn credential_token(username: &str, password: &str) -> String {
    hex::encode(credential_digest(username, password))
}

fn credential_digest(username: &str, password: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(username.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    hasher.finalize().into()
}

#[derive(Debug, Serialize)]
struct ClientAuthRequest<'a> {
    username: &'a str,
    token: String,
}

#[derive(Debug, Serialize)]
struct GatewayAuthRequest {
    session_id: u32,
    role: &'static str,
    token: String,
}

#[derive(Debug, Deserialize)]
struct AuthResponse {
    status: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    virtual_addresses: Vec<Ipv4Addr>,
}

/// Parse the response format shared by both variants
fn parse_grant(payload: &[u8]) -> Result<AuthGrant> {
    let response: AuthResponse = serde_json::from_slice(payload)
        .map_err(|e| Error::Codec(format!("bad auth response: {}", e)))?;

    if response.status != "ok" {
        return Err(Error::InvalidArgument(format!(
            "server rejected credentials: {}",
            response.message.unwrap_or(response.status)
        )));
    }

    if response.virtual_addresses.len() < MIN_GRANTED_ADDRESSES {
        return Err(Error::InvalidArgument(format!(
            "grant carries {} virtual addresses, need at least {}",
            response.virtual_addresses.len(),
            MIN_GRANTED_ADDRESSES
        )));
    }

    Ok(AuthGrant { virtual_addresses: response.virtual_addresses })
}

/// Client endpoint: the server assigns the session id
#[derive(Debug, Clone)]
pub struct ClientVariant {
    username: String,
    password: String,
}

impl ClientVariant {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self { username: username.into(), password: password.into() }
    }
}

impl TunnelVariant for ClientVariant {
    fn name(&self) -> &'static str {
        "client"
    }

    fn initialize(&mut self) -> Result<u32> {
        Ok(0)
    }

    fn auth_request(&self) -> Result<Vec<u8>> {
        let request = ClientAuthRequest {
            username: &self.username,
            token: credential_token(&self.username, &self.password),
        };
        serde_json::to_vec(&request).map_err(|e| Error::Codec(e.to_string()))
    }

    fn verify_auth_response(&self, payload: &[u8]) -> Result<AuthGrant> {
        parse_grant(payload)
    }

    fn strict_length(&self) -> bool {
        false
    }

    fn carries_dns(&self) -> bool {
        false
    }
}

/// Gateway endpoint: the session id is derived from the credentials
#[derive(Debug, Clone)]
pub struct GatewayVariant {
    username: String,
    password: String,
    session_id: u32,
}

impl GatewayVariant {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self { username: username.into(), password: password.into(), session_id: 0 }
    }

    /// First four bytes of SHA-256(`username:password`)
    pub fn derive_session_id(username: &str, password: &str) -> u32 {
        let digest = credential_digest(username, password);
        u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
    }
}

impl TunnelVariant for GatewayVariant {
    fn name(&self) -> &'static str {
        "gateway"
    }

    fn initialize(&mut self) -> Result<u32> {
        self.session_id = Self::derive_session_id(&self.username, &self.password);
        tracing::debug!("Gateway session id {:08x}", self.session_id);
        Ok(self.session_id)
    }

    fn auth_request(&self) -> Result<Vec<u8>> {
        let request = GatewayAuthRequest {
            session_id: self.session_id,
            role: "gateway",
            token: credential_token(&self.username, &self.password),
        };
        serde_json::to_vec(&request).map_err(|e| Error::Codec(e.to_string()))
    }

    fn verify_auth_response(&self, payload: &[u8]) -> Result<AuthGrant> {
        parse_grant(payload)
    }

    fn strict_length(&self) -> bool {
        true
    }

    fn carries_dns(&self) -> bool {
        true
    }
}
