//! One's-complement checksum helpers
//!
//! Address rewrites patch the IPv4 header checksum and the TCP/UDP checksum
//! incrementally (RFC 1624) instead of re-summing the packet.

use std::net::Ipv4Addr;

use super::{header_len, fragment_offset, PROTO_TCP, PROTO_UDP};

/// Which IPv4 address field to rewrite
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressField {
    /// Bytes 12..16
    Source,
    /// Bytes 16..20
    Destination,
}

impl AddressField {
    fn offset(self) -> usize {
        match self {
            AddressField::Source => 12,
            AddressField::Destination => 16,
        }
    }
}

/// Fold a 32-bit accumulator into 16 bits
pub fn checksum_fold(mut sum: u32) -> u16 {
    while sum > 0xFFFF {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    sum as u16
}

/// Update a checksum after a 4-byte field changed from `old` to `new`
///
/// HC' = ~(~HC + ~m + m') applied to both 16-bit words of the field.
pub fn incremental_update(checksum: u16, old: [u8; 4], new: [u8; 4]) -> u16 {
    let mut sum = (!checksum) as u32;
    for i in [0, 2] {
        let m = u16::from_be_bytes([old[i], old[i + 1]]);
        let m_new = u16::from_be_bytes([new[i], new[i + 1]]);
        sum += (!m) as u32;
        sum += m_new as u32;
    }
    !checksum_fold(sum)
}

/// Full RFC 1071 checksum over a byte slice
pub fn internet_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }
    !checksum_fold(sum)
}

/// Rewrite an address field in place, patching every checksum that covers it
///
/// The caller guarantees `packet` holds at least a full IPv4 header.
pub fn rewrite_address(packet: &mut [u8], field: AddressField, new: Ipv4Addr) {
    let offset = field.offset();
    let mut old = [0u8; 4];
    old.copy_from_slice(&packet[offset..offset + 4]);
    let new = new.octets();
    if old == new {
        return;
    }

    packet[offset..offset + 4].copy_from_slice(&new);

    let ip_check = u16::from_be_bytes([packet[10], packet[11]]);
    packet[10..12].copy_from_slice(&incremental_update(ip_check, old, new).to_be_bytes());

    // Only the first fragment carries the transport header
    if fragment_offset(packet) != 0 {
        return;
    }

    let ihl = header_len(packet);
    let check_offset = match packet[9] {
        PROTO_TCP => ihl + 16,
        PROTO_UDP => ihl + 6,
        _ => return,
    };
    if packet.len() < check_offset + 2 {
        return;
    }

    let old_check = u16::from_be_bytes([packet[check_offset], packet[check_offset + 1]]);
    // UDP checksum of 0 means "no checksum"
    if packet[9] == PROTO_UDP && old_check == 0 {
        return;
    }

    let mut new_check = incremental_update(old_check, old, new);
    if packet[9] == PROTO_UDP && new_check == 0 {
        new_check = 0xFFFF;
    }
    packet[check_offset..check_offset + 2].copy_from_slice(&new_check.to_be_bytes());
}

/// Compute the TCP/UDP checksum of an unfragmented packet over its pseudo-header
pub fn transport_checksum(packet: &[u8]) -> u16 {
    let ihl = header_len(packet);
    let segment = &packet[ihl..];

    let mut pseudo = Vec::with_capacity(12 + segment.len());
    pseudo.extend_from_slice(&packet[12..20]);
    pseudo.push(0);
    pseudo.push(packet[9]);
    pseudo.extend_from_slice(&(segment.len() as u16).to_be_bytes());
    pseudo.extend_from_slice(segment);

    internet_checksum(&pseudo)
}
