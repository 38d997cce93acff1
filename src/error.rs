//! WolfTunnel Error Types

use thiserror::Error;

/// Result type alias for WolfTunnel operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfTunnel error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // Packet errors (handled locally, never cross the session boundary)
    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    #[error("Declared packet length {declared} exceeds limit")]
    PacketTooLong { declared: usize },

    #[error("Declared packet length {declared} does not match received size {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("Unsupported inner protocol: {0}")]
    UnsupportedProtocol(u8),

    // Codec errors
    #[error("Codec error: {0}")]
    Codec(String),

    // Session errors
    #[error("Authentication failed after {attempts} attempts")]
    AuthRetriesExhausted { attempts: u32 },

    #[error("Transport error: {0}")]
    Transport(String),

    // Device errors
    #[error("Device error: {0}")]
    Device(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Check if this error must terminate the owning process
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::AuthRetriesExhausted { .. } | Error::Transport(_)
        )
    }
}
