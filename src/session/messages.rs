//! Session Messages
//!
//! Typed messages exchanged between a session and its collaborators: the
//! traffic device, the DNS helper and the local UDP proxy.

use bytes::Bytes;
use std::fmt;
use std::net::{SocketAddr, SocketAddrV4};
use tokio::sync::mpsc;

/// Identifier of a bypassed UDP flow
pub type FlowId = u64;

/// Identifier of one packet-capture activation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CaptureId(pub u64);

impl fmt::Display for CaptureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "capture-{}", self.0)
    }
}

/// Messages delivered to a session's inbox
#[derive(Debug, Clone)]
pub enum SessionInput {
    /// IPv4 packet captured on the LAN side
    LanPacket(Bytes),
    /// Packet produced by the DNS helper
    DnsPacket(Bytes),
    /// Reply packet built by the UDP proxy for a bypassed flow
    ProxyPacket(Bytes),
    /// The proxy retired a flow
    UdpNatDel { flow: FlowId, lan: SocketAddrV4 },
    /// DNS message to forward to the tunnel server
    RequestDns(Bytes),
    /// Close the tunnel and stop the session task
    Shutdown,
}

/// Messages sent to the traffic device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrafficEvent {
    /// Start capturing LAN traffic, excluding traffic to the tunnel server
    StartCapture {
        capture: CaptureId,
        tunnel_server: SocketAddr,
    },
    /// Stop capturing LAN traffic
    StopCapture,
    /// Write a packet to the LAN side
    Inject(Bytes),
}

/// Messages sent to the DNS helper
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DnsEvent {
    TunnelOpen,
    TunnelClose,
    /// Capture the helper should inject through
    SetFilterDevice(CaptureId),
    /// DNS reply packet that came through the tunnel
    Packet(Bytes),
    /// DNS action payload from the tunnel server
    Response(Bytes),
}

/// Messages sent to the UDP bypass proxy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyCommand {
    /// Create a flow for a LAN endpoint
    Open { flow: FlowId, lan: SocketAddrV4 },
    /// Relay a LAN packet through a flow
    Packet { flow: FlowId, packet: Bytes },
    /// Non-first fragment of a bypassed datagram, source address zeroed
    Fragment(Bytes),
}

/// Outgoing channels of a session
#[derive(Debug, Clone)]
pub struct SessionLinks {
    pub traffic: mpsc::UnboundedSender<TrafficEvent>,
    pub dns: mpsc::UnboundedSender<DnsEvent>,
    pub proxy: mpsc::UnboundedSender<ProxyCommand>,
}

/// Receiving ends matching a [`SessionLinks`]
#[derive(Debug)]
pub struct SessionEndpoints {
    pub traffic: mpsc::UnboundedReceiver<TrafficEvent>,
    pub dns: mpsc::UnboundedReceiver<DnsEvent>,
    pub proxy: mpsc::UnboundedReceiver<ProxyCommand>,
}

impl SessionLinks {
    /// Create the collaborator channels
    pub fn channel() -> (SessionLinks, SessionEndpoints) {
        let (traffic_tx, traffic_rx) = mpsc::unbounded_channel();
        let (dns_tx, dns_rx) = mpsc::unbounded_channel();
        let (proxy_tx, proxy_rx) = mpsc::unbounded_channel();
        (
            SessionLinks { traffic: traffic_tx, dns: dns_tx, proxy: proxy_tx },
            SessionEndpoints { traffic: traffic_rx, dns: dns_rx, proxy: proxy_rx },
        )
    }

    pub(crate) fn traffic(&self, event: TrafficEvent) {
        if self.traffic.send(event).is_err() {
            tracing::debug!("Traffic device is gone, dropping event");
        }
    }

    pub(crate) fn dns(&self, event: DnsEvent) {
        if self.dns.send(event).is_err() {
            tracing::debug!("DNS helper is gone, dropping event");
        }
    }

    pub(crate) fn proxy(&self, command: ProxyCommand) {
        if self.proxy.send(command).is_err() {
            tracing::debug!("UDP proxy is gone, dropping command");
        }
    }
}
