//! Tunnel Session
//!
//! Per-connection state machine: authentication with bounded retries,
//! keep-alive with soft recovery, and relaying of LAN traffic through the
//! address lease table or the UDP bypass.
//!
//! The session itself performs no I/O. Incoming events are fed through
//! `handle_*` methods with the current instant; outgoing tunnel datagrams
//! accumulate in an outbound queue drained by [`driver::run`], and
//! collaborator messages go out on the channels in [`SessionLinks`].

pub mod driver;
pub mod messages;
pub mod variant;

use bytes::{Bytes, BytesMut};
use std::collections::{HashMap, VecDeque};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

use crate::codec::{Action, Codec, Decoded};
use crate::config::TunnelConfig;
use crate::error::{Error, Result};
use crate::nat::AddressLeaseTable;
use crate::packet::{self, AddressField, PROTO_UDP};
use crate::whitelist::WhitelistRouter;

pub use messages::{
    CaptureId, DnsEvent, FlowId, ProxyCommand, SessionEndpoints, SessionInput, SessionLinks,
    TrafficEvent,
};
pub use variant::{AuthGrant, ClientVariant, GatewayVariant, TunnelVariant};

/// Auth requests sent without success before the session gives up
pub const MAX_AUTH_ATTEMPTS: u32 = 5;

/// Unanswered keep-alive probes tolerated before the session is reset
pub const MAX_UNANSWERED_PINGS: u32 = 5;

/// Well-known DNS port
const DNS_PORT: u16 = 53;

/// Authentication state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    /// An auth request is outstanding
    AuthPending,
    Authenticated,
}

/// Session counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub datagrams_in: u64,
    pub datagrams_out: u64,
    pub decode_failures: u64,
    pub dropped_packets: u64,
    pub bypassed_packets: u64,
}

/// Timer settings taken from configuration
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub auth_timeout: Duration,
    pub keepalive_timeout: Duration,
    pub lease_ttl: Duration,
    pub whitelist_cache_ttl: Duration,
    /// Virtual DNS resolver whose replies go to the DNS helper
    pub virtual_resolver: Ipv4Addr,
    /// Send all UDP through the tunnel
    pub udp_global: bool,
    pub whitelist: Vec<(Ipv4Addr, u8)>,
}

impl SessionSettings {
    pub fn from_config(config: &TunnelConfig) -> Result<Self> {
        Ok(Self {
            auth_timeout: config.auth_timeout(),
            keepalive_timeout: config.keepalive_timeout(),
            lease_ttl: config.lease_ttl(),
            whitelist_cache_ttl: config.whitelist_cache_ttl(),
            virtual_resolver: config.dns.virtual_resolver,
            udp_global: config.udp.global,
            whitelist: config.whitelist_rules()?,
        })
    }
}

/// One tunnel connection
pub struct TunnelSession {
    variant: Box<dyn TunnelVariant>,
    codec: Box<dyn Codec>,
    links: SessionLinks,
    settings: SessionSettings,
    /// Tunnel server address
    peer: SocketAddr,
    session_id: u32,
    state: AuthState,
    /// Auth requests sent since the last success
    auth_attempts: u32,
    /// Retry bound already reported
    auth_exhausted: bool,
    unanswered_pings: u32,
    /// Next timer tick
    deadline: Instant,
    last_activity: Instant,
    leases: AddressLeaseTable,
    whitelist: Option<WhitelistRouter>,
    /// Bypassed UDP flows keyed by LAN endpoint
    flows: HashMap<SocketAddrV4, FlowId>,
    next_flow: FlowId,
    next_capture: u64,
    outbound: VecDeque<Bytes>,
    stats: SessionStats,
    shutdown: bool,
}

impl TunnelSession {
    /// Create a session and queue its first auth request
    pub fn new(
        settings: SessionSettings,
        mut variant: Box<dyn TunnelVariant>,
        codec: Box<dyn Codec>,
        links: SessionLinks,
        peer: SocketAddr,
        now: Instant,
    ) -> Result<Self> {
        let whitelist = if settings.udp_global {
            None
        } else {
            Some(WhitelistRouter::from_rules(
                settings.whitelist.iter().copied(),
                settings.whitelist_cache_ttl,
            )?)
        };

        let session_id = variant.initialize()?;
        info!(
            "Starting {} tunnel session to {} (codec {})",
            variant.name(),
            peer,
            codec.name()
        );

        let mut session = Self {
            variant,
            codec,
            links,
            leases: AddressLeaseTable::new(settings.lease_ttl),
            whitelist,
            settings,
            peer,
            session_id,
            state: AuthState::Unauthenticated,
            auth_attempts: 0,
            auth_exhausted: false,
            unanswered_pings: 0,
            deadline: now,
            last_activity: now,
            flows: HashMap::new(),
            next_flow: 1,
            next_capture: 0,
            outbound: VecDeque::new(),
            stats: SessionStats::default(),
            shutdown: false,
        };

        session.send_auth_request(now);
        Ok(session)
    }

    pub fn state(&self) -> AuthState {
        self.state
    }

    pub fn is_authenticated(&self) -> bool {
        self.state == AuthState::Authenticated
    }

    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    /// Instant of the next timer tick
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Instant of the last datagram accepted from the peer
    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn leases(&self) -> &AddressLeaseTable {
        &self.leases
    }

    /// Number of bypassed UDP flows
    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }

    /// Whether a shutdown was requested
    pub fn is_shutdown(&self) -> bool {
        self.shutdown
    }

    pub fn has_outbound(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// Take the next queued datagram
    pub fn pop_outbound(&mut self) -> Option<Bytes> {
        self.outbound.pop_front()
    }

    /// Put back a datagram the socket could not take
    pub fn requeue_front(&mut self, datagram: Bytes) {
        self.outbound.push_front(datagram);
    }

    /// Handle one datagram received from the tunnel server
    pub fn handle_datagram(&mut self, datagram: &[u8], now: Instant) {
        self.stats.datagrams_in += 1;

        let Some(decoded) = self.codec.decode(datagram) else {
            self.stats.decode_failures += 1;
            trace!("Dropping {} byte datagram that failed to decode", datagram.len());
            return;
        };

        let action = match Action::try_from(decoded.action) {
            Ok(action) => action,
            Err(_) => {
                warn!("Dropping datagram with unknown action code {}", decoded.action);
                self.stats.dropped_packets += 1;
                return;
            }
        };

        if self.is_authenticated() && decoded.session_id != self.session_id {
            debug!(
                "Dropping {:?} for session {:08x}, ours is {:08x}",
                action, decoded.session_id, self.session_id
            );
            self.stats.dropped_packets += 1;
            return;
        }

        self.last_activity = now;

        if action == Action::Auth {
            if self.is_authenticated() {
                debug!("Ignoring AUTH while authenticated");
            } else {
                self.handle_auth_response(decoded, now);
            }
            return;
        }

        if !self.is_authenticated() {
            debug!("Dropping {:?} before authentication", action);
            self.stats.dropped_packets += 1;
            return;
        }

        match action {
            Action::Data => self.handle_data(&decoded.payload, now),
            Action::Ping => {
                self.send_message(Action::Pong, &[]);
                self.unanswered_pings = 0;
                self.arm(now + self.settings.keepalive_timeout);
            }
            Action::Pong => {
                self.unanswered_pings = 0;
            }
            Action::Close => {
                info!("Tunnel server closed session {:08x}", self.session_id);
                self.close(now);
            }
            Action::Dns => {
                if self.variant.carries_dns() {
                    self.links.dns(DnsEvent::Response(decoded.payload));
                } else {
                    warn!("Dropping DNS action on a {} tunnel", self.variant.name());
                    self.stats.dropped_packets += 1;
                }
            }
            Action::Auth => {}
        }
    }

    /// Handle one message from a collaborator
    pub fn handle_input(&mut self, input: SessionInput, now: Instant) {
        match input {
            SessionInput::LanPacket(packet) => self.handle_lan_packet(packet, now),
            SessionInput::DnsPacket(packet) => {
                if let Err(e) = packet::validate_lan_packet(&packet) {
                    debug!("Dropping DNS helper packet: {}", e);
                    self.stats.dropped_packets += 1;
                } else if self.is_authenticated() {
                    self.send_through_tunnel(&packet, now);
                } else {
                    self.links.traffic(TrafficEvent::Inject(packet));
                }
            }
            SessionInput::ProxyPacket(packet) => {
                self.links.traffic(TrafficEvent::Inject(packet));
            }
            SessionInput::UdpNatDel { flow, lan } => {
                if self.flows.get(&lan) == Some(&flow) {
                    self.flows.remove(&lan);
                    debug!("Removed bypass flow {} for {}", flow, lan);
                }
            }
            SessionInput::RequestDns(payload) => {
                if !self.variant.carries_dns() {
                    warn!("DNS requests are not carried by a {} tunnel", self.variant.name());
                } else if !self.is_authenticated() {
                    debug!("Dropping DNS request before authentication");
                } else {
                    self.send_message(Action::Dns, &payload);
                }
            }
            SessionInput::Shutdown => self.shutdown(),
        }
    }

    /// Handle a timer tick
    ///
    /// Returns an error only when the auth retry bound is exceeded.
    pub fn handle_timeout(&mut self, now: Instant) -> Result<()> {
        if now < self.deadline {
            return Ok(());
        }

        self.leases.reclaim(now);
        if let Some(whitelist) = self.whitelist.as_mut() {
            whitelist.recycle(now);
        }

        if self.is_authenticated() {
            self.keepalive_tick(now);
            return Ok(());
        }

        self.arm(now + self.settings.auth_timeout);
        if self.auth_exhausted {
            return Ok(());
        }

        if self.auth_attempts > MAX_AUTH_ATTEMPTS {
            self.auth_exhausted = true;
            error!(
                "No authentication response after {} attempts, giving up",
                self.auth_attempts
            );
            return Err(Error::AuthRetriesExhausted { attempts: self.auth_attempts });
        }

        debug!("Authentication timed out, retrying (attempt {})", self.auth_attempts + 1);
        self.send_auth_request(now);
        Ok(())
    }

    /// Send CLOSE to the peer and stop
    pub fn shutdown(&mut self) {
        if self.shutdown {
            return;
        }
        self.send_message(Action::Close, &[]);
        if self.is_authenticated() {
            self.links.traffic(TrafficEvent::StopCapture);
            self.links.dns(DnsEvent::TunnelClose);
        }
        self.state = AuthState::Unauthenticated;
        self.shutdown = true;
        info!("Session {:08x} shutting down: {:?}", self.session_id, self.stats);
    }

    fn keepalive_tick(&mut self, now: Instant) {
        if self.unanswered_pings >= MAX_UNANSWERED_PINGS {
            warn!(
                "{} keep-alive probes unanswered, resetting session {:08x}",
                self.unanswered_pings, self.session_id
            );
            self.close(now);
            return;
        }

        self.send_message(Action::Ping, &[]);
        self.unanswered_pings += 1;
        self.arm(now + self.settings.keepalive_timeout);
    }

    fn send_auth_request(&mut self, now: Instant) {
        self.auth_attempts += 1;
        match self.variant.auth_request() {
            Ok(payload) => self.send_message(Action::Auth, &payload),
            Err(e) => error!("Cannot build auth request: {}", e),
        }
        self.state = AuthState::AuthPending;
        self.arm(now + self.settings.auth_timeout);
    }

    fn handle_auth_response(&mut self, decoded: Decoded, now: Instant) {
        let grant = match self.variant.verify_auth_response(&decoded.payload) {
            Ok(grant) => grant,
            Err(e) => {
                warn!("Authentication rejected: {}", e);
                return;
            }
        };

        if decoded.session_id != 0 {
            self.session_id = decoded.session_id;
        }
        self.state = AuthState::Authenticated;
        self.auth_attempts = 0;
        self.auth_exhausted = false;
        self.unanswered_pings = 0;
        self.leases.add_virtual_addresses(grant.virtual_addresses.iter().copied());

        self.next_capture += 1;
        let capture = CaptureId(self.next_capture);
        self.links.traffic(TrafficEvent::StartCapture { capture, tunnel_server: self.peer });
        self.links.dns(DnsEvent::TunnelOpen);
        self.links.dns(DnsEvent::SetFilterDevice(capture));

        self.arm(now + self.settings.keepalive_timeout);
        info!(
            "Authenticated session {:08x} with {} virtual addresses",
            self.session_id,
            grant.virtual_addresses.len()
        );
    }

    fn handle_data(&mut self, payload: &Bytes, now: Instant) {
        let packet = match packet::validate_tunnel_payload(payload, self.variant.strict_length()) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("Dropping tunnel packet: {}", e);
                self.stats.dropped_packets += 1;
                return;
            }
        };

        let Some(translated) = self.leases.translate_inbound(&packet, now) else {
            debug!("No lease for {}, dropping tunnel packet", packet::dst_addr(&packet));
            self.stats.dropped_packets += 1;
            return;
        };
        self.arm(now + self.settings.keepalive_timeout);

        let from_resolver = packet::protocol(&translated) == PROTO_UDP
            && packet::src_addr(&translated) == self.settings.virtual_resolver
            && packet::src_port(&translated) == Some(DNS_PORT);
        if from_resolver {
            self.links.dns(DnsEvent::Packet(translated));
        } else {
            self.links.traffic(TrafficEvent::Inject(translated));
        }
    }

    fn handle_lan_packet(&mut self, packet: Bytes, now: Instant) {
        if !self.is_authenticated() {
            trace!("Dropping LAN packet before authentication");
            return;
        }

        if let Err(e) = packet::validate_lan_packet(&packet) {
            debug!("Dropping LAN packet: {}", e);
            self.stats.dropped_packets += 1;
            return;
        }

        if packet::protocol(&packet) == PROTO_UDP {
            let dst = packet::dst_addr(&packet);
            let bypass = match self.whitelist.as_mut() {
                Some(whitelist) => whitelist.lookup(dst, now),
                None => false,
            };
            if bypass {
                self.bypass_udp(packet);
                return;
            }
        }

        self.send_through_tunnel(&packet, now);
    }

    fn bypass_udp(&mut self, packet: Bytes) {
        self.stats.bypassed_packets += 1;

        if packet::fragment_offset(&packet) != 0 {
            let mut buf = BytesMut::from(&packet[..]);
            packet::rewrite_address(&mut buf, AddressField::Source, Ipv4Addr::UNSPECIFIED);
            self.links.proxy(ProxyCommand::Fragment(buf.freeze()));
            return;
        }

        let lan = SocketAddrV4::new(
            packet::src_addr(&packet),
            packet::src_port(&packet).unwrap_or(0),
        );
        let flow = match self.flows.get(&lan) {
            Some(flow) => *flow,
            None => {
                let flow = self.next_flow;
                self.next_flow += 1;
                self.flows.insert(lan, flow);
                debug!("Opening bypass flow {} for {}", flow, lan);
                self.links.proxy(ProxyCommand::Open { flow, lan });
                flow
            }
        };
        self.links.proxy(ProxyCommand::Packet { flow, packet });
    }

    fn send_through_tunnel(&mut self, packet: &[u8], now: Instant) {
        let Some(translated) = self.leases.translate_outbound(packet, now) else {
            warn!(
                "Virtual address pool exhausted, dropping packet from {}",
                packet::src_addr(packet)
            );
            self.stats.dropped_packets += 1;
            return;
        };
        self.send_message(Action::Data, &translated);
        self.arm(now + self.settings.keepalive_timeout);
    }

    /// Reset the session after a close or liveness failure and re-authenticate
    fn close(&mut self, now: Instant) {
        self.leases.reset_all();
        self.flows.clear();
        self.links.traffic(TrafficEvent::StopCapture);
        self.links.dns(DnsEvent::TunnelClose);
        self.unanswered_pings = 0;
        self.state = AuthState::Unauthenticated;
        info!("Session {:08x} closed: {:?}", self.session_id, self.stats);

        self.auth_attempts = 0;
        self.send_auth_request(now);
    }

    fn send_message(&mut self, action: Action, payload: &[u8]) {
        match self.codec.encode(self.session_id, action, payload) {
            Ok(datagrams) => {
                self.stats.datagrams_out += datagrams.len() as u64;
                self.outbound.extend(datagrams);
            }
            Err(e) => debug!("Dropping {:?} message: {}", action, e),
        }
    }

    fn arm(&mut self, deadline: Instant) {
        self.deadline = deadline;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::PlainCodec;
    use crate::packet::testutil::{fragment, raw_packet, udp_packet};
    use crate::packet::{PROTO_ICMP, PROTO_TCP};

    const SERVER: &str = "203.0.113.10:8964";
    const GRANT: &[u8] = br#"{"status":"ok","virtual_addresses":["10.1.0.2","10.1.0.3"]}"#;
    const SERVER_SID: u32 = 0x0a0b0c0d;

    fn settings() -> SessionSettings {
        SessionSettings {
            auth_timeout: Duration::from_secs(5),
            keepalive_timeout: Duration::from_secs(25),
            lease_ttl: Duration::from_secs(600),
            whitelist_cache_ttl: Duration::from_secs(180),
            virtual_resolver: Ipv4Addr::new(10, 99, 0, 53),
            udp_global: false,
            whitelist: vec![(Ipv4Addr::new(192, 168, 0, 0), 16)],
        }
    }

    fn client_session(now: Instant) -> (TunnelSession, SessionEndpoints) {
        let (links, endpoints) = SessionLinks::channel();
        let session = TunnelSession::new(
            settings(),
            Box::new(ClientVariant::new("wolf", "secret")),
            Box::new(PlainCodec::new()),
            links,
            SERVER.parse().unwrap(),
            now,
        )
        .unwrap();
        (session, endpoints)
    }

    fn gateway_session(now: Instant) -> (TunnelSession, SessionEndpoints) {
        let (links, endpoints) = SessionLinks::channel();
        let session = TunnelSession::new(
            settings(),
            Box::new(GatewayVariant::new("wolf", "secret")),
            Box::new(PlainCodec::new()),
            links,
            SERVER.parse().unwrap(),
            now,
        )
        .unwrap();
        (session, endpoints)
    }

    fn datagram(session_id: u32, action: Action, payload: &[u8]) -> Vec<u8> {
        PlainCodec::new().encode(session_id, action, payload).unwrap()[0].to_vec()
    }

    /// Drain the outbound queue into decoded messages
    fn sent(session: &mut TunnelSession) -> Vec<Decoded> {
        let mut codec = PlainCodec::new();
        std::iter::from_fn(|| session.pop_outbound())
            .map(|d| codec.decode(&d).unwrap())
            .collect()
    }

    fn actions(session: &mut TunnelSession) -> Vec<u8> {
        sent(session).into_iter().map(|d| d.action).collect()
    }

    fn authenticate(session: &mut TunnelSession, now: Instant) {
        session.handle_datagram(&datagram(SERVER_SID, Action::Auth, GRANT), now);
        assert!(session.is_authenticated());
        sent(session);
    }

    fn drain<T>(rx: &mut tokio::sync::mpsc::UnboundedReceiver<T>) -> Vec<T> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    #[test]
    fn test_construction_sends_auth() {
        let t0 = Instant::now();
        let (mut session, _ep) = client_session(t0);

        assert_eq!(session.state(), AuthState::AuthPending);
        assert_eq!(session.deadline(), t0 + Duration::from_secs(5));

        let out = sent(&mut session);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].action, Action::Auth as u8);
        let request: serde_json::Value = serde_json::from_slice(&out[0].payload).unwrap();
        assert_eq!(request["username"], "wolf");
    }

    #[test]
    fn test_auth_retry_bound() {
        let t0 = Instant::now();
        let (mut session, _ep) = client_session(t0);
        sent(&mut session);

        let mut now = t0;
        for _ in 0..5 {
            now = session.deadline();
            session.handle_timeout(now).unwrap();
            assert_eq!(actions(&mut session), vec![Action::Auth as u8]);
        }

        now = session.deadline();
        assert!(matches!(
            session.handle_timeout(now),
            Err(Error::AuthRetriesExhausted { attempts: 6 })
        ));
        assert!(!session.has_outbound());

        // Reported exactly once
        now = session.deadline();
        assert!(session.handle_timeout(now).is_ok());
        assert!(!session.has_outbound());
    }

    #[test]
    fn test_early_tick_is_ignored() {
        let t0 = Instant::now();
        let (mut session, _ep) = client_session(t0);
        sent(&mut session);

        session.handle_timeout(t0 + Duration::from_secs(1)).unwrap();
        assert!(!session.has_outbound());
    }

    #[test]
    fn test_auth_ok() {
        let t0 = Instant::now();
        let (mut session, mut ep) = client_session(t0);
        sent(&mut session);

        session.handle_datagram(&datagram(SERVER_SID, Action::Auth, GRANT), t0);

        assert_eq!(session.state(), AuthState::Authenticated);
        assert_eq!(session.session_id(), SERVER_SID);
        assert_eq!(session.leases().free_count(), 2);
        assert_eq!(session.deadline(), t0 + Duration::from_secs(25));

        let traffic = drain(&mut ep.traffic);
        assert_eq!(
            traffic,
            vec![TrafficEvent::StartCapture {
                capture: CaptureId(1),
                tunnel_server: SERVER.parse().unwrap(),
            }]
        );
        assert_eq!(
            drain(&mut ep.dns),
            vec![DnsEvent::TunnelOpen, DnsEvent::SetFilterDevice(CaptureId(1))]
        );

        // A second AUTH is ignored
        session.handle_datagram(&datagram(SERVER_SID, Action::Auth, GRANT), t0);
        assert_eq!(session.leases().free_count(), 2);
        assert!(drain(&mut ep.traffic).is_empty());
    }

    #[test]
    fn test_auth_rejected() {
        let t0 = Instant::now();
        let (mut session, mut ep) = client_session(t0);
        sent(&mut session);

        let denied = br#"{"status":"denied"}"#;
        session.handle_datagram(&datagram(0, Action::Auth, denied), t0);
        assert_eq!(session.state(), AuthState::AuthPending);

        let short = br#"{"status":"ok","virtual_addresses":["10.1.0.2"]}"#;
        session.handle_datagram(&datagram(0, Action::Auth, short), t0);
        assert_eq!(session.state(), AuthState::AuthPending);
        assert!(drain(&mut ep.traffic).is_empty());
    }

    #[test]
    fn test_non_auth_dropped_before_authentication() {
        let t0 = Instant::now();
        let (mut session, mut ep) = client_session(t0);
        sent(&mut session);

        session.handle_datagram(&datagram(0, Action::Ping, b""), t0);
        assert!(!session.has_outbound());

        let pkt = udp_packet(Ipv4Addr::new(1, 1, 1, 1), 53, Ipv4Addr::new(10, 1, 0, 2), 999, b"x");
        session.handle_datagram(&datagram(0, Action::Data, &pkt), t0);
        assert!(drain(&mut ep.traffic).is_empty());
        assert_eq!(session.stats().dropped_packets, 2);
    }

    #[test]
    fn test_keepalive_recovery() {
        let t0 = Instant::now();
        let (mut session, mut ep) = client_session(t0);
        authenticate(&mut session, t0);

        let lan = udp_packet(Ipv4Addr::new(172, 20, 0, 5), 4000, Ipv4Addr::new(8, 8, 8, 8), 53, b"q");
        session.handle_input(SessionInput::LanPacket(Bytes::from(lan)), t0);
        assert_eq!(session.leases().lease_count(), 1);
        sent(&mut session);
        drain(&mut ep.traffic);
        drain(&mut ep.dns);

        for _ in 0..MAX_UNANSWERED_PINGS {
            let now = session.deadline();
            session.handle_timeout(now).unwrap();
            assert_eq!(actions(&mut session), vec![Action::Ping as u8]);
            assert!(session.is_authenticated());
        }

        let now = session.deadline();
        session.handle_timeout(now).unwrap();

        assert_eq!(session.state(), AuthState::AuthPending);
        assert_eq!(actions(&mut session), vec![Action::Auth as u8]);
        assert!(session.leases().is_empty());
        assert_eq!(session.deadline(), now + Duration::from_secs(5));
        assert_eq!(drain(&mut ep.traffic), vec![TrafficEvent::StopCapture]);
        assert_eq!(drain(&mut ep.dns), vec![DnsEvent::TunnelClose]);
    }

    #[test]
    fn test_pong_resets_ping_counter() {
        let t0 = Instant::now();
        let (mut session, _ep) = client_session(t0);
        authenticate(&mut session, t0);

        for _ in 0..4 {
            let now = session.deadline();
            session.handle_timeout(now).unwrap();
        }
        session.handle_datagram(&datagram(SERVER_SID, Action::Pong, b""), session.deadline());
        sent(&mut session);

        // Another full round of probes is tolerated
        for _ in 0..MAX_UNANSWERED_PINGS {
            let now = session.deadline();
            session.handle_timeout(now).unwrap();
        }
        assert!(session.is_authenticated());
    }

    #[test]
    fn test_ping_answered_with_pong() {
        let t0 = Instant::now();
        let (mut session, _ep) = client_session(t0);
        authenticate(&mut session, t0);

        let later = t0 + Duration::from_secs(10);
        session.handle_datagram(&datagram(SERVER_SID, Action::Ping, b""), later);

        let out = sent(&mut session);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].action, Action::Pong as u8);
        assert_eq!(out[0].session_id, SERVER_SID);
        assert_eq!(session.deadline(), later + Duration::from_secs(25));
    }

    #[test]
    fn test_peer_close_reauthenticates() {
        let t0 = Instant::now();
        let (mut session, mut ep) = client_session(t0);
        authenticate(&mut session, t0);
        drain(&mut ep.traffic);

        session.handle_datagram(&datagram(SERVER_SID, Action::Close, b""), t0);
        assert_eq!(session.state(), AuthState::AuthPending);
        assert_eq!(actions(&mut session), vec![Action::Auth as u8]);
        assert_eq!(drain(&mut ep.traffic), vec![TrafficEvent::StopCapture]);

        // The retry budget starts over from the new request
        for _ in 0..5 {
            let now = session.deadline();
            session.handle_timeout(now).unwrap();
        }
        let now = session.deadline();
        assert!(session.handle_timeout(now).is_err());
    }

    #[test]
    fn test_foreign_session_id_dropped() {
        let t0 = Instant::now();
        let (mut session, _ep) = client_session(t0);
        authenticate(&mut session, t0);

        session.handle_datagram(&datagram(SERVER_SID + 1, Action::Ping, b""), t0);
        assert!(!session.has_outbound());
        assert_eq!(session.stats().dropped_packets, 1);
    }

    #[test]
    fn test_unknown_action_dropped() {
        let t0 = Instant::now();
        let (mut session, _ep) = client_session(t0);
        authenticate(&mut session, t0);

        let mut raw = datagram(SERVER_SID, Action::Ping, b"");
        raw[4] = 42;
        session.handle_datagram(&raw, t0);
        assert!(!session.has_outbound());
        assert_eq!(session.stats().dropped_packets, 1);
    }

    #[test]
    fn test_data_round_trip() {
        let t0 = Instant::now();
        let (mut session, mut ep) = client_session(t0);
        authenticate(&mut session, t0);
        drain(&mut ep.traffic);

        let lan = Ipv4Addr::new(172, 20, 0, 5);
        let remote = Ipv4Addr::new(93, 184, 216, 34);
        let out = raw_packet(PROTO_TCP, lan, remote, 20);
        session.handle_input(SessionInput::LanPacket(Bytes::from(out)), t0);

        let sent_data = sent(&mut session);
        assert_eq!(sent_data.len(), 1);
        assert_eq!(sent_data[0].action, Action::Data as u8);
        assert_eq!(packet::src_addr(&sent_data[0].payload), Ipv4Addr::new(10, 1, 0, 2));

        let reply = raw_packet(PROTO_TCP, remote, Ipv4Addr::new(10, 1, 0, 2), 20);
        session.handle_datagram(&datagram(SERVER_SID, Action::Data, &reply), t0);

        match drain(&mut ep.traffic).as_slice() {
            [TrafficEvent::Inject(pkt)] => assert_eq!(packet::dst_addr(pkt), lan),
            other => panic!("unexpected traffic events: {:?}", other),
        }
    }

    #[test]
    fn test_length_guard() {
        let t0 = Instant::now();
        let (mut session, mut ep) = client_session(t0);
        authenticate(&mut session, t0);
        drain(&mut ep.traffic);
        let deadline = session.deadline();

        let mut pkt = raw_packet(PROTO_TCP, Ipv4Addr::new(1, 1, 1, 1), Ipv4Addr::new(10, 1, 0, 2), 40);
        pkt[2..4].copy_from_slice(&2000u16.to_be_bytes());
        let later = t0 + Duration::from_secs(3);
        session.handle_datagram(&datagram(SERVER_SID, Action::Data, &pkt), later);

        assert!(drain(&mut ep.traffic).is_empty());
        assert_eq!(session.deadline(), deadline);
        assert_eq!(session.leases().lease_count(), 0);
        assert_eq!(session.stats().dropped_packets, 1);
    }

    #[test]
    fn test_protocol_filter() {
        let t0 = Instant::now();
        let (mut session, mut ep) = client_session(t0);
        authenticate(&mut session, t0);
        drain(&mut ep.traffic);

        let esp = raw_packet(50, Ipv4Addr::new(1, 1, 1, 1), Ipv4Addr::new(10, 1, 0, 2), 16);
        session.handle_datagram(&datagram(SERVER_SID, Action::Data, &esp), t0);
        assert!(drain(&mut ep.traffic).is_empty());

        let lan_esp = raw_packet(50, Ipv4Addr::new(172, 20, 0, 5), Ipv4Addr::new(1, 1, 1, 1), 16);
        session.handle_input(SessionInput::LanPacket(Bytes::from(lan_esp)), t0);
        assert!(!session.has_outbound());
        assert_eq!(session.leases().lease_count(), 0);
    }

    #[test]
    fn test_gateway_strict_length() {
        let t0 = Instant::now();
        let (mut session, mut ep) = gateway_session(t0);
        let sid = session.session_id();
        session.handle_datagram(&datagram(sid, Action::Auth, GRANT), t0);
        assert!(session.is_authenticated());
        sent(&mut session);
        drain(&mut ep.traffic);

        // Establish a lease so the inbound packet would otherwise be routable
        let lan = raw_packet(PROTO_ICMP, Ipv4Addr::new(172, 20, 0, 5), Ipv4Addr::new(1, 1, 1, 1), 8);
        session.handle_input(SessionInput::LanPacket(Bytes::from(lan)), t0);
        sent(&mut session);

        let mut padded = raw_packet(PROTO_ICMP, Ipv4Addr::new(1, 1, 1, 1), Ipv4Addr::new(10, 1, 0, 2), 8);
        padded.extend_from_slice(&[0, 0]);
        session.handle_datagram(&datagram(sid, Action::Data, &padded), t0);
        assert!(drain(&mut ep.traffic).is_empty());

        padded.truncate(28);
        session.handle_datagram(&datagram(sid, Action::Data, &padded), t0);
        assert_eq!(drain(&mut ep.traffic).len(), 1);
    }

    #[test]
    fn test_client_truncates_padding() {
        let t0 = Instant::now();
        let (mut session, mut ep) = client_session(t0);
        authenticate(&mut session, t0);
        drain(&mut ep.traffic);

        let lan = raw_packet(PROTO_ICMP, Ipv4Addr::new(172, 20, 0, 5), Ipv4Addr::new(1, 1, 1, 1), 8);
        session.handle_input(SessionInput::LanPacket(Bytes::from(lan)), t0);
        sent(&mut session);

        let mut padded = raw_packet(PROTO_ICMP, Ipv4Addr::new(1, 1, 1, 1), Ipv4Addr::new(10, 1, 0, 2), 8);
        padded.extend_from_slice(&[0xAA; 6]);
        session.handle_datagram(&datagram(SERVER_SID, Action::Data, &padded), t0);

        match drain(&mut ep.traffic).as_slice() {
            [TrafficEvent::Inject(pkt)] => assert_eq!(pkt.len(), 28),
            other => panic!("unexpected traffic events: {:?}", other),
        }
    }

    #[test]
    fn test_dns_reply_routed_to_helper() {
        let t0 = Instant::now();
        let (mut session, mut ep) = client_session(t0);
        authenticate(&mut session, t0);
        drain(&mut ep.traffic);
        drain(&mut ep.dns);

        let resolver = Ipv4Addr::new(10, 99, 0, 53);
        let query = udp_packet(Ipv4Addr::new(172, 20, 0, 5), 5353, resolver, 53, b"query");
        session.handle_input(SessionInput::DnsPacket(Bytes::from(query)), t0);
        let out = sent(&mut session);
        assert_eq!(out[0].action, Action::Data as u8);

        let answer = udp_packet(resolver, 53, Ipv4Addr::new(10, 1, 0, 2), 5353, b"answer");
        session.handle_datagram(&datagram(SERVER_SID, Action::Data, &answer), t0);

        match drain(&mut ep.dns).as_slice() {
            [DnsEvent::Packet(pkt)] => {
                assert_eq!(packet::dst_addr(pkt), Ipv4Addr::new(172, 20, 0, 5));
            }
            other => panic!("unexpected DNS events: {:?}", other),
        }
        assert!(drain(&mut ep.traffic).is_empty());
    }

    #[test]
    fn test_dns_packet_before_auth_is_injected() {
        let t0 = Instant::now();
        let (mut session, mut ep) = client_session(t0);
        sent(&mut session);

        let pkt = Bytes::from(udp_packet(Ipv4Addr::new(10, 99, 0, 53), 53, Ipv4Addr::new(172, 20, 0, 5), 5353, b"a"));
        session.handle_input(SessionInput::DnsPacket(pkt.clone()), t0);
        assert_eq!(drain(&mut ep.traffic), vec![TrafficEvent::Inject(pkt)]);
        assert!(!session.has_outbound());
    }

    #[test]
    fn test_short_dns_packet_dropped() {
        let t0 = Instant::now();
        let (mut session, mut ep) = client_session(t0);
        sent(&mut session);

        session.handle_input(SessionInput::DnsPacket(Bytes::from_static(&[0x45; 10])), t0);
        assert!(drain(&mut ep.traffic).is_empty());

        authenticate(&mut session, t0);
        drain(&mut ep.traffic);
        session.handle_input(SessionInput::DnsPacket(Bytes::from_static(&[0x45; 10])), t0);

        assert!(!session.has_outbound());
        assert!(drain(&mut ep.traffic).is_empty());
        assert_eq!(session.leases().lease_count(), 0);
        assert_eq!(session.stats().dropped_packets, 2);
    }

    #[test]
    fn test_ticks_reclaim_idle_leases() {
        let t0 = Instant::now();
        let (mut session, mut ep) = client_session(t0);
        authenticate(&mut session, t0);
        drain(&mut ep.traffic);

        let out = raw_packet(PROTO_TCP, Ipv4Addr::new(172, 20, 0, 5), Ipv4Addr::new(93, 184, 216, 34), 20);
        session.handle_input(SessionInput::LanPacket(Bytes::from(out)), t0);
        sent(&mut session);
        assert_eq!(session.leases().lease_count(), 1);
        assert_eq!(session.leases().free_count(), 1);

        // Keep the session alive past the lease lifetime without LAN traffic
        while session.deadline() <= t0 + Duration::from_secs(600) {
            let now = session.deadline();
            session.handle_timeout(now).unwrap();
            session.handle_datagram(&datagram(SERVER_SID, Action::Pong, b""), now);
            sent(&mut session);
        }

        assert!(session.is_authenticated());
        assert_eq!(session.leases().lease_count(), 0);
        assert_eq!(session.leases().free_count(), 2);
    }

    #[test]
    fn test_udp_bypass_flow() {
        let t0 = Instant::now();
        let (mut session, mut ep) = client_session(t0);
        authenticate(&mut session, t0);

        let lan = Ipv4Addr::new(172, 20, 0, 5);
        let dst = Ipv4Addr::new(192, 168, 1, 1);
        let first = Bytes::from(udp_packet(lan, 6000, dst, 9000, b"one"));
        let second = Bytes::from(udp_packet(lan, 6000, dst, 9000, b"two"));
        session.handle_input(SessionInput::LanPacket(first.clone()), t0);
        session.handle_input(SessionInput::LanPacket(second.clone()), t0);

        let endpoint = SocketAddrV4::new(lan, 6000);
        assert_eq!(
            drain(&mut ep.proxy),
            vec![
                ProxyCommand::Open { flow: 1, lan: endpoint },
                ProxyCommand::Packet { flow: 1, packet: first },
                ProxyCommand::Packet { flow: 1, packet: second },
            ]
        );
        assert!(!session.has_outbound());
        assert_eq!(session.leases().lease_count(), 0);
        assert_eq!(session.stats().bypassed_packets, 2);

        session.handle_input(SessionInput::UdpNatDel { flow: 1, lan: endpoint }, t0);
        assert_eq!(session.flow_count(), 0);
    }

    #[test]
    fn test_udp_outside_whitelist_is_tunnelled() {
        let t0 = Instant::now();
        let (mut session, mut ep) = client_session(t0);
        authenticate(&mut session, t0);

        let pkt = udp_packet(Ipv4Addr::new(172, 20, 0, 5), 6000, Ipv4Addr::new(9, 9, 9, 9), 53, b"q");
        session.handle_input(SessionInput::LanPacket(Bytes::from(pkt)), t0);
        assert!(drain(&mut ep.proxy).is_empty());
        assert_eq!(actions(&mut session), vec![Action::Data as u8]);
    }

    #[test]
    fn test_bypassed_fragment_goes_to_proxy() {
        let t0 = Instant::now();
        let (mut session, mut ep) = client_session(t0);
        authenticate(&mut session, t0);
        drain(&mut ep.traffic);

        let whole = udp_packet(Ipv4Addr::new(172, 20, 0, 5), 6000, Ipv4Addr::new(192, 168, 1, 1), 9000, &[5u8; 40]);
        let head = fragment(&whole, 0, 16, true);
        let tail = fragment(&whole, 16, whole.len() - 20, false);
        session.handle_input(SessionInput::LanPacket(Bytes::from(head)), t0);
        session.handle_input(SessionInput::LanPacket(Bytes::from(tail)), t0);

        match drain(&mut ep.proxy).as_slice() {
            [ProxyCommand::Open { flow, .. }, ProxyCommand::Packet { flow: first, .. }, ProxyCommand::Fragment(pkt)] => {
                assert_eq!(flow, first);
                assert_eq!(packet::src_addr(pkt), Ipv4Addr::UNSPECIFIED);
                assert_eq!(packet::fragment_offset(pkt), 2);
                assert_eq!(crate::packet::checksum::internet_checksum(&pkt[..20]), 0);
            }
            other => panic!("unexpected proxy commands: {:?}", other),
        }
        assert!(drain(&mut ep.traffic).is_empty());
        assert_eq!(session.stats().bypassed_packets, 2);
    }

    #[test]
    fn test_udp_global_disables_bypass() {
        let t0 = Instant::now();
        let (links, mut ep) = SessionLinks::channel();
        let mut cfg = settings();
        cfg.udp_global = true;
        let mut session = TunnelSession::new(
            cfg,
            Box::new(ClientVariant::new("wolf", "secret")),
            Box::new(PlainCodec::new()),
            links,
            SERVER.parse().unwrap(),
            t0,
        )
        .unwrap();
        authenticate(&mut session, t0);

        let pkt = udp_packet(Ipv4Addr::new(172, 20, 0, 5), 6000, Ipv4Addr::new(192, 168, 1, 1), 9000, b"q");
        session.handle_input(SessionInput::LanPacket(Bytes::from(pkt)), t0);
        assert!(drain(&mut ep.proxy).is_empty());
        assert_eq!(actions(&mut session), vec![Action::Data as u8]);
    }

    #[test]
    fn test_pool_exhaustion_drops() {
        let t0 = Instant::now();
        let (mut session, _ep) = client_session(t0);
        authenticate(&mut session, t0);

        for host in 1..=3u8 {
            let pkt = raw_packet(PROTO_TCP, Ipv4Addr::new(172, 20, 0, host), Ipv4Addr::new(1, 1, 1, 1), 20);
            session.handle_input(SessionInput::LanPacket(Bytes::from(pkt)), t0);
        }
        assert_eq!(actions(&mut session).len(), 2);
        assert_eq!(session.stats().dropped_packets, 1);
    }

    #[test]
    fn test_gateway_dns_action() {
        let t0 = Instant::now();
        let (mut session, mut ep) = gateway_session(t0);
        let sid = session.session_id();
        session.handle_datagram(&datagram(sid, Action::Auth, GRANT), t0);
        sent(&mut session);
        drain(&mut ep.dns);

        session.handle_input(SessionInput::RequestDns(Bytes::from_static(b"lookup")), t0);
        let out = sent(&mut session);
        assert_eq!(out[0].action, Action::Dns as u8);
        assert_eq!(&out[0].payload[..], b"lookup");

        session.handle_datagram(&datagram(sid, Action::Dns, b"answer"), t0);
        assert_eq!(drain(&mut ep.dns), vec![DnsEvent::Response(Bytes::from_static(b"answer"))]);
    }

    #[test]
    fn test_client_ignores_dns_action() {
        let t0 = Instant::now();
        let (mut session, mut ep) = client_session(t0);
        authenticate(&mut session, t0);
        drain(&mut ep.dns);

        session.handle_input(SessionInput::RequestDns(Bytes::from_static(b"lookup")), t0);
        assert!(!session.has_outbound());
        session.handle_datagram(&datagram(SERVER_SID, Action::Dns, b"answer"), t0);
        assert!(drain(&mut ep.dns).is_empty());
    }

    #[test]
    fn test_decode_failure_counted() {
        let t0 = Instant::now();
        let (mut session, _ep) = client_session(t0);
        session.handle_datagram(&[1, 2], t0);
        assert_eq!(session.stats().decode_failures, 1);
        assert_eq!(session.stats().datagrams_in, 1);
    }

    #[test]
    fn test_shutdown_sends_close() {
        let t0 = Instant::now();
        let (mut session, mut ep) = client_session(t0);
        authenticate(&mut session, t0);
        drain(&mut ep.traffic);

        session.handle_input(SessionInput::Shutdown, t0);
        assert!(session.is_shutdown());
        assert_eq!(actions(&mut session), vec![Action::Close as u8]);
        assert_eq!(drain(&mut ep.traffic), vec![TrafficEvent::StopCapture]);
    }
}
