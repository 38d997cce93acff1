//! Whitelist Router
//!
//! Decides whether a UDP destination may bypass the tunnel. Rules are CIDR
//! blocks stored in an octet trie; decisions are cached per address for a
//! bounded time.
//!
//! Lookup walks the trie while an exact child exists and evaluates only the
//! rules stored at the node where the walk stops. A broader rule that sits
//! higher in the trie is not consulted once a more specific branch has been
//! entered.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::timer::ExpiryTimer;

#[derive(Debug, Default)]
struct TrieNode {
    /// Child per exact octet value
    children: HashMap<u8, TrieNode>,
    /// Rules whose mask boundary falls in the next octet: (mask length, remainder byte)
    rules: Vec<(u8, u8)>,
}

/// CIDR trie plus a time-bounded decision cache
#[derive(Debug)]
pub struct WhitelistRouter {
    root: TrieNode,
    rule_count: usize,
    cache: HashMap<Ipv4Addr, bool>,
    cache_expiry: ExpiryTimer<Ipv4Addr>,
}

/// Netmask for a prefix length in 0..=32
fn prefix_mask(len: u8) -> u32 {
    if len == 0 {
        0
    } else {
        u32::MAX << (32 - len as u32)
    }
}

impl WhitelistRouter {
    /// Create an empty router whose cached decisions live for `cache_ttl`
    pub fn new(cache_ttl: Duration) -> Self {
        Self {
            root: TrieNode::default(),
            rule_count: 0,
            cache: HashMap::new(),
            cache_expiry: ExpiryTimer::new(cache_ttl),
        }
    }

    /// Build a router from (network, mask length) rules
    pub fn from_rules<I>(rules: I, cache_ttl: Duration) -> Result<Self>
    where
        I: IntoIterator<Item = (Ipv4Addr, u8)>,
    {
        let mut router = Self::new(cache_ttl);
        for (network, mask) in rules {
            router.add_rule(network, mask)?;
        }
        Ok(router)
    }

    /// Insert a CIDR rule
    pub fn add_rule(&mut self, network: Ipv4Addr, mask: u8) -> Result<()> {
        if !(1..=32).contains(&mask) {
            return Err(Error::InvalidArgument(format!(
                "mask length {} for {} is outside 1..=32",
                mask, network
            )));
        }

        let octets = network.octets();
        let boundary = ((mask - 1) / 8) as usize;

        let mut node = &mut self.root;
        for octet in &octets[..boundary] {
            node = node.children.entry(*octet).or_default();
        }

        let bits = mask - (boundary as u8) * 8;
        let remainder = octets[boundary] & (0xFFu8 << (8 - bits as u32));
        node.rules.push((mask, remainder));
        self.rule_count += 1;
        Ok(())
    }

    /// Check whether `addr` is whitelisted
    pub fn lookup(&mut self, addr: Ipv4Addr, now: Instant) -> bool {
        if let (Some(matched), Some(deadline)) =
            (self.cache.get(&addr), self.cache_expiry.deadline(&addr))
        {
            if deadline > now {
                return *matched;
            }
        }

        let matched = self.evaluate(addr);
        self.cache.insert(addr, matched);
        self.cache_expiry.set(addr, now);
        matched
    }

    fn evaluate(&self, addr: Ipv4Addr) -> bool {
        let octets = addr.octets();
        let mut node = &self.root;
        let mut depth = 0;

        while depth < 4 {
            match node.children.get(&octets[depth]) {
                Some(child) => {
                    node = child;
                    depth += 1;
                }
                None => break,
            }
        }
        if depth == 4 {
            return false;
        }

        let raw = u32::from(addr);
        node.rules.iter().any(|(mask, remainder)| {
            let mut network = [0u8; 4];
            network[..depth].copy_from_slice(&octets[..depth]);
            network[depth] = *remainder;
            let m = prefix_mask(*mask);
            u32::from_be_bytes(network) & m == raw & m
        })
    }

    /// Drop expired cache entries
    pub fn recycle(&mut self, now: Instant) -> usize {
        let expired = self.cache_expiry.drain_expired(now);
        for addr in &expired {
            self.cache.remove(addr);
        }
        expired.len()
    }

    /// Number of rules
    pub fn rule_count(&self) -> usize {
        self.rule_count
    }

    /// Number of cached decisions
    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }
}
