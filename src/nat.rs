//! Address Lease Table
//!
//! Leases virtual addresses granted by the tunnel server to LAN sources so
//! that many LAN hosts share one tunnel identity. Outbound packets get their
//! source rewritten to the leased address, inbound packets get their
//! destination rewritten back. Leases expire after a period without traffic.

use bytes::{Bytes, BytesMut};
use std::collections::{HashMap, VecDeque};
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use crate::packet::{self, AddressField};
use crate::timer::ExpiryTimer;

/// Bidirectional LAN <-> virtual address mapping with a free pool
#[derive(Debug)]
pub struct AddressLeaseTable {
    /// Unleased virtual addresses, allocation pops the front
    pool: VecDeque<Ipv4Addr>,
    /// LAN address -> leased virtual address
    lan_to_virtual: HashMap<Ipv4Addr, Ipv4Addr>,
    /// Leased virtual address -> LAN address
    virtual_to_lan: HashMap<Ipv4Addr, Ipv4Addr>,
    /// Lease deadlines keyed by virtual address
    expiry: ExpiryTimer<Ipv4Addr>,
}

impl AddressLeaseTable {
    /// Create an empty table whose leases live for `ttl` after last use
    pub fn new(ttl: Duration) -> Self {
        Self {
            pool: VecDeque::new(),
            lan_to_virtual: HashMap::new(),
            virtual_to_lan: HashMap::new(),
            expiry: ExpiryTimer::new(ttl),
        }
    }

    /// Append granted virtual addresses to the free pool
    ///
    /// Addresses already pooled or leased are skipped.
    pub fn add_virtual_addresses<I>(&mut self, addrs: I)
    where
        I: IntoIterator<Item = Ipv4Addr>,
    {
        for addr in addrs {
            if self.virtual_to_lan.contains_key(&addr) || self.pool.contains(&addr) {
                continue;
            }
            self.pool.push_back(addr);
        }
    }

    /// Existing lease for `lan`, or a fresh one from the pool front
    pub fn lease_or_reuse(&mut self, lan: Ipv4Addr) -> Option<Ipv4Addr> {
        if let Some(virt) = self.lan_to_virtual.get(&lan) {
            return Some(*virt);
        }

        let virt = self.pool.pop_front()?;
        self.lan_to_virtual.insert(lan, virt);
        self.virtual_to_lan.insert(virt, lan);
        tracing::debug!("Leased {} to {}", virt, lan);
        Some(virt)
    }

    /// Rewrite the source of a LAN packet to its leased virtual address
    ///
    /// Returns `None` when the pool is exhausted.
    pub fn translate_outbound(&mut self, packet: &[u8], now: Instant) -> Option<Bytes> {
        let lan = packet::src_addr(packet);
        let virt = self.lease_or_reuse(lan)?;
        self.expiry.set(virt, now);

        let mut buf = BytesMut::from(packet);
        packet::rewrite_address(&mut buf, AddressField::Source, virt);
        Some(buf.freeze())
    }

    /// Rewrite the destination of a tunnel packet back to its LAN address
    ///
    /// Returns `None` when the destination is not leased.
    pub fn translate_inbound(&mut self, packet: &[u8], now: Instant) -> Option<Bytes> {
        let virt = packet::dst_addr(packet);
        let lan = *self.virtual_to_lan.get(&virt)?;
        self.expiry.set(virt, now);

        let mut buf = BytesMut::from(packet);
        packet::rewrite_address(&mut buf, AddressField::Destination, lan);
        Some(buf.freeze())
    }

    /// Return expired leases to the back of the pool
    pub fn reclaim(&mut self, now: Instant) -> usize {
        let expired = self.expiry.drain_expired(now);
        for virt in &expired {
            if let Some(lan) = self.virtual_to_lan.remove(virt) {
                self.lan_to_virtual.remove(&lan);
                tracing::debug!("Lease {} for {} expired", virt, lan);
            }
            self.pool.push_back(*virt);
        }
        expired.len()
    }

    /// Forget every lease and every pooled address
    pub fn reset_all(&mut self) {
        self.pool.clear();
        self.lan_to_virtual.clear();
        self.virtual_to_lan.clear();
        self.expiry.clear();
    }

    /// Number of active leases
    pub fn lease_count(&self) -> usize {
        self.lan_to_virtual.len()
    }

    /// Number of unleased virtual addresses
    pub fn free_count(&self) -> usize {
        self.pool.len()
    }

    /// Virtual address leased to `lan`
    pub fn lookup_lan(&self, lan: Ipv4Addr) -> Option<Ipv4Addr> {
        self.lan_to_virtual.get(&lan).copied()
    }

    /// LAN address holding `virt`
    pub fn lookup_virtual(&self, virt: Ipv4Addr) -> Option<Ipv4Addr> {
        self.virtual_to_lan.get(&virt).copied()
    }

    /// Earliest lease deadline
    pub fn next_expiry(&mut self) -> Option<Instant> {
        self.expiry.next_deadline()
    }

    /// Check if the table holds neither leases nor pooled addresses
    pub fn is_empty(&self) -> bool {
        self.lan_to_virtual.is_empty() && self.pool.is_empty()
    }
}
