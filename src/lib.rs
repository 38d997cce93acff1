//! WolfTunnel - Encrypted Tunnel Endpoint
//!
//! Endpoint logic of an encrypted tunnel overlay. LAN traffic is carried
//! through an authenticated, keep-alive-monitored session over UDP; LAN
//! sources share the tunnel identity through leased virtual addresses, and
//! UDP flows to whitelisted networks bypass the tunnel.
//!
//! # Architecture
//!
//! Each tunnel connection is one [`session::TunnelSession`] owned by a
//! tokio task ([`session::driver::run`]). The session talks to its
//! collaborators (traffic device, DNS helper, UDP bypass proxy) over typed
//! mpsc channels and to the tunnel server through a [`codec::Codec`].
//!
//! # Features
//!
//! - Authentication with bounded retries and soft recovery on liveness loss
//! - Address leasing with TTL-based reclamation and incremental checksums
//! - CIDR whitelist router with a time-bounded decision cache
//! - ChaCha20-Poly1305 datagram codec

pub mod codec;
pub mod config;
pub mod device;
pub mod dns;
pub mod error;
pub mod nat;
pub mod packet;
pub mod proxy;
pub mod session;
pub mod timer;
pub mod whitelist;

pub use config::TunnelConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::codec::{Action, Codec};
    pub use crate::config::TunnelConfig;
    pub use crate::error::{Error, Result};
    pub use crate::nat::AddressLeaseTable;
    pub use crate::session::{
        AuthState, SessionInput, SessionLinks, SessionSettings, TunnelSession, TunnelVariant,
    };
    pub use crate::whitelist::WhitelistRouter;
}
