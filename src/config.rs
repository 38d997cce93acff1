//! WolfTunnel Configuration
//!
//! This module provides configuration structures for a tunnel endpoint.
//! The configuration is read once at startup and handed to the session,
//! lease table and whitelist constructors by reference.

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Main WolfTunnel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Tunnel endpoint configuration
    pub tunnel: TunnelSection,

    /// Codec (encryption) configuration
    pub codec: CodecConfig,

    /// UDP bypass configuration
    #[serde(default)]
    pub udp: UdpConfig,

    /// DNS configuration
    pub dns: DnsConfig,

    /// Timer configuration
    #[serde(default)]
    pub timeouts: TimeoutConfig,

    /// TUN device configuration
    #[serde(default)]
    pub device: DeviceConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Which side of the tunnel this endpoint plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariantKind {
    /// Client-initiated tunnel sharing one identity across a LAN
    Client,
    /// Gateway tunnel with strict framing and DNS forwarding
    Gateway,
}

/// Tunnel endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelSection {
    /// Remote tunnel server address (host:port)
    pub server_address: String,

    /// Tunnel variant
    #[serde(default = "default_variant")]
    pub variant: VariantKind,

    /// Account name used for authentication
    pub username: String,

    /// Account secret used for authentication
    pub password: String,
}

/// Codec configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodecConfig {
    /// Codec name ("chacha20poly1305" or "plain")
    #[serde(default = "default_codec_name")]
    pub name: String,

    /// Shared secret the codec key is derived from
    #[serde(default)]
    pub key: String,
}

/// UDP bypass configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UdpConfig {
    /// Send all UDP through the tunnel (disables the whitelist bypass)
    #[serde(default)]
    pub global: bool,

    /// CIDR rules ("a.b.c.d/n") whose UDP traffic bypasses the tunnel
    #[serde(default)]
    pub whitelist: Vec<String>,
}

/// DNS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsConfig {
    /// Virtual DNS resolver address reached through the tunnel
    pub virtual_resolver: Ipv4Addr,
}

/// Timer configuration, all values in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Retry interval while unauthenticated
    #[serde(default = "default_auth_secs")]
    pub auth_secs: u64,

    /// Keep-alive interval while authenticated
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,

    /// Virtual address lease lifetime
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,

    /// Whitelist decision cache lifetime
    #[serde(default = "default_whitelist_cache_secs")]
    pub whitelist_cache_secs: u64,
}

/// TUN device configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Interface name
    #[serde(default = "default_device_name")]
    pub name: String,

    /// Address assigned to the interface
    #[serde(default = "default_device_address")]
    pub address: Ipv4Addr,

    /// Prefix length of the interface address
    #[serde(default = "default_device_prefix")]
    pub prefix: u8,

    /// Interface MTU
    #[serde(default = "default_mtu")]
    pub mtu: u16,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_variant() -> VariantKind {
    VariantKind::Client
}

fn default_codec_name() -> String {
    "chacha20poly1305".to_string()
}

fn default_auth_secs() -> u64 {
    5
}

fn default_keepalive_secs() -> u64 {
    25
}

fn default_lease_ttl_secs() -> u64 {
    600
}

fn default_whitelist_cache_secs() -> u64 {
    180
}

fn default_device_name() -> String {
    "wolftun0".to_string()
}

fn default_device_address() -> Ipv4Addr {
    Ipv4Addr::new(10, 99, 0, 1)
}

fn default_device_prefix() -> u8 {
    24
}

fn default_mtu() -> u16 {
    1400
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            auth_secs: default_auth_secs(),
            keepalive_secs: default_keepalive_secs(),
            lease_ttl_secs: default_lease_ttl_secs(),
            whitelist_cache_secs: default_whitelist_cache_secs(),
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: default_device_name(),
            address: default_device_address(),
            prefix: default_device_prefix(),
            mtu: default_mtu(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl TunnelConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: TunnelConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration as TOML
    pub fn save(&self, path: &PathBuf) -> crate::Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("cannot serialize config: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// A starter configuration for `wolftunnel init`
    pub fn example() -> Self {
        Self {
            tunnel: TunnelSection {
                server_address: "203.0.113.10:8964".to_string(),
                variant: VariantKind::Client,
                username: "wolf".to_string(),
                password: "change-me".to_string(),
            },
            codec: CodecConfig {
                name: default_codec_name(),
                key: "change-me-too".to_string(),
            },
            udp: UdpConfig {
                global: false,
                whitelist: vec!["192.168.0.0/16".to_string(), "10.0.0.0/8".to_string()],
            },
            dns: DnsConfig {
                virtual_resolver: Ipv4Addr::new(10, 99, 0, 53),
            },
            timeouts: TimeoutConfig::default(),
            device: DeviceConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.tunnel.server_address.is_empty() {
            return Err(crate::Error::Config("tunnel.server_address cannot be empty".into()));
        }

        if self.tunnel.username.is_empty() {
            return Err(crate::Error::Config("tunnel.username cannot be empty".into()));
        }

        if self.codec.name != "plain" && self.codec.key.is_empty() {
            return Err(crate::Error::Config("codec.key cannot be empty".into()));
        }

        if self.timeouts.auth_secs == 0 || self.timeouts.keepalive_secs == 0 {
            return Err(crate::Error::Config("timeouts must be greater than zero".into()));
        }

        if self.device.prefix == 0 || self.device.prefix > 32 {
            return Err(crate::Error::Config(format!(
                "device.prefix {} is out of range",
                self.device.prefix
            )));
        }

        self.whitelist_rules()?;
        Ok(())
    }

    /// Resolve the tunnel server address
    pub fn server_addr(&self) -> crate::Result<SocketAddr> {
        use std::net::ToSocketAddrs;

        self.tunnel
            .server_address
            .to_socket_addrs()?
            .find(|a| a.is_ipv4())
            .ok_or_else(|| {
                crate::Error::Config(format!(
                    "cannot resolve an IPv4 address for {}",
                    self.tunnel.server_address
                ))
            })
    }

    /// Parse the UDP whitelist into (network, mask length) pairs
    pub fn whitelist_rules(&self) -> crate::Result<Vec<(Ipv4Addr, u8)>> {
        self.udp.whitelist.iter().map(|r| parse_cidr(r)).collect()
    }

    /// Get the unauthenticated retry interval as Duration
    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.auth_secs)
    }

    /// Get the keep-alive interval as Duration
    pub fn keepalive_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.keepalive_secs)
    }

    /// Get the lease lifetime as Duration
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.timeouts.lease_ttl_secs)
    }

    /// Get the whitelist cache lifetime as Duration
    pub fn whitelist_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.timeouts.whitelist_cache_secs)
    }
}

/// Parse "a.b.c.d/n" into its network address and mask length
pub fn parse_cidr(rule: &str) -> crate::Result<(Ipv4Addr, u8)> {
    let net: Ipv4Net = rule.trim().parse().map_err(|e| {
        crate::Error::Config(format!("whitelist rule '{}' is not a CIDR block: {}", rule, e))
    })?;

    if net.prefix_len() == 0 {
        return Err(crate::Error::Config(format!(
            "whitelist rule '{}' mask must be within 1..=32",
            rule
        )));
    }

    Ok((net.network(), net.prefix_len()))
}
