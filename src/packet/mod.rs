//! Packet Module
//!
//! IPv4 field accessors and the inner-packet validation rules applied to
//! every payload that crosses the tunnel.

pub mod checksum;

use bytes::Bytes;
use std::net::{Ipv4Addr, SocketAddrV4};

use crate::error::{Error, Result};

pub use checksum::{rewrite_address, AddressField};

/// Largest inner packet accepted from the tunnel
pub const MAX_PACKET_LEN: usize = 1500;

/// Smallest IPv4 header
pub const MIN_HEADER_LEN: usize = 20;

pub const PROTO_ICMP: u8 = 1;
pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;

/// Inner protocols relayed through the tunnel
pub const FORWARDED_PROTOCOLS: [u8; 3] = [PROTO_ICMP, PROTO_TCP, PROTO_UDP];

/// IP version nibble
pub fn version(packet: &[u8]) -> u8 {
    packet[0] >> 4
}

/// Header length in bytes
pub fn header_len(packet: &[u8]) -> usize {
    ((packet[0] & 0x0f) as usize) * 4
}

/// Declared total length (bytes 2..4, big-endian)
pub fn total_len(packet: &[u8]) -> usize {
    u16::from_be_bytes([packet[2], packet[3]]) as usize
}

/// Fragment offset field (low 13 bits of bytes 6..8)
pub fn fragment_offset(packet: &[u8]) -> u16 {
    u16::from_be_bytes([packet[6] & 0x1f, packet[7]])
}

/// More-fragments flag
pub fn more_fragments(packet: &[u8]) -> bool {
    packet[6] & 0x20 != 0
}

/// Identification field (bytes 4..6)
pub fn identification(packet: &[u8]) -> u16 {
    u16::from_be_bytes([packet[4], packet[5]])
}

/// Protocol number
pub fn protocol(packet: &[u8]) -> u8 {
    packet[9]
}

pub fn src_addr(packet: &[u8]) -> Ipv4Addr {
    Ipv4Addr::new(packet[12], packet[13], packet[14], packet[15])
}

pub fn dst_addr(packet: &[u8]) -> Ipv4Addr {
    Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19])
}

/// TCP/UDP source port, if the packet is long enough to carry one
pub fn src_port(packet: &[u8]) -> Option<u16> {
    let ihl = header_len(packet);
    packet
        .get(ihl..ihl + 2)
        .map(|p| u16::from_be_bytes([p[0], p[1]]))
}

/// TCP/UDP destination port, if the packet is long enough to carry one
pub fn dst_port(packet: &[u8]) -> Option<u16> {
    let ihl = header_len(packet);
    packet
        .get(ihl + 2..ihl + 4)
        .map(|p| u16::from_be_bytes([p[0], p[1]]))
}

/// Check that the protocol is relayed through the tunnel
pub fn check_protocol(packet: &[u8]) -> Result<()> {
    let proto = protocol(packet);
    if FORWARDED_PROTOCOLS.contains(&proto) {
        Ok(())
    } else {
        Err(Error::UnsupportedProtocol(proto))
    }
}

/// Validate a DATA payload received from the tunnel
///
/// The declared length must not exceed [`MAX_PACKET_LEN`]. With `strict`
/// it must also equal the received size; otherwise the payload is truncated
/// to the declared length. Returns the inner packet.
pub fn validate_tunnel_payload(payload: &Bytes, strict: bool) -> Result<Bytes> {
    if payload.len() < 4 {
        return Err(Error::MalformedPacket(format!("{} byte payload", payload.len())));
    }

    let declared = total_len(payload);
    if declared > MAX_PACKET_LEN {
        return Err(Error::PacketTooLong { declared });
    }
    if strict && declared != payload.len() {
        return Err(Error::LengthMismatch { declared, actual: payload.len() });
    }
    if declared > payload.len() || declared < MIN_HEADER_LEN {
        return Err(Error::LengthMismatch { declared, actual: payload.len() });
    }

    let packet = payload.slice(..declared);
    check_header(&packet)?;
    check_protocol(&packet)?;
    Ok(packet)
}

/// Validate a packet captured on the LAN side
pub fn validate_lan_packet(packet: &[u8]) -> Result<()> {
    if packet.len() < MIN_HEADER_LEN + 1 {
        return Err(Error::MalformedPacket(format!("{} byte LAN packet", packet.len())));
    }
    check_header(packet)?;
    check_protocol(packet)
}

fn check_header(packet: &[u8]) -> Result<()> {
    if version(packet) != 4 {
        return Err(Error::MalformedPacket(format!("IP version {}", version(packet))));
    }
    let ihl = header_len(packet);
    if ihl < MIN_HEADER_LEN || ihl > packet.len() {
        return Err(Error::MalformedPacket(format!("header length {}", ihl)));
    }
    Ok(())
}

/// Build an IPv4/UDP packet with valid header and UDP checksums
pub fn build_udp_packet(src: SocketAddrV4, dst: SocketAddrV4, payload: &[u8], ident: u16) -> Vec<u8> {
    let udp_len = 8 + payload.len();
    let total = MIN_HEADER_LEN + udp_len;

    let mut pkt = Vec::with_capacity(total);
    pkt.push(0x45);
    pkt.push(0);
    pkt.extend_from_slice(&(total as u16).to_be_bytes());
    pkt.extend_from_slice(&ident.to_be_bytes());
    pkt.extend_from_slice(&[0x40, 0x00]); // don't fragment
    pkt.push(64);
    pkt.push(PROTO_UDP);
    pkt.extend_from_slice(&[0, 0]);
    pkt.extend_from_slice(&src.ip().octets());
    pkt.extend_from_slice(&dst.ip().octets());

    pkt.extend_from_slice(&src.port().to_be_bytes());
    pkt.extend_from_slice(&dst.port().to_be_bytes());
    pkt.extend_from_slice(&(udp_len as u16).to_be_bytes());
    pkt.extend_from_slice(&[0, 0]);
    pkt.extend_from_slice(payload);

    let ip_check = checksum::internet_checksum(&pkt[..MIN_HEADER_LEN]);
    pkt[10..12].copy_from_slice(&ip_check.to_be_bytes());

    let mut udp_check = checksum::transport_checksum(&pkt);
    if udp_check == 0 {
        udp_check = 0xFFFF;
    }
    pkt[26..28].copy_from_slice(&udp_check.to_be_bytes());
    pkt
}
