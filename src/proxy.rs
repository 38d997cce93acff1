//! Local UDP bypass proxy
//!
//! Relays whitelisted UDP flows outside the tunnel. Each flow gets its own
//! UDP socket; datagram payloads from the LAN host are sent from it to the
//! original destination, and replies are wrapped back into IPv4/UDP packets
//! addressed to the LAN host. Flows idle for longer than the idle timeout
//! are retired and reported to the session.
//!
//! Fragmented datagrams are reassembled before they are sent. The first
//! fragment names the flow; later fragments are matched to it by
//! destination address and IP identification.

use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::error::Result;
use crate::packet::{self, PROTO_UDP};
use crate::session::{FlowId, ProxyCommand, SessionInput};
use crate::timer::ExpiryTimer;

/// Idle time after which a flow is retired
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(180);

/// Time allowed for all fragments of a datagram to arrive
pub const REASSEMBLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound on datagrams awaiting fragments
const MAX_PENDING_DATAGRAMS: usize = 256;

const UDP_HEADER_LEN: usize = 8;

/// Fragments are matched on destination address and identification
type FragmentKey = (Ipv4Addr, u16);

#[derive(Debug, Default)]
struct PendingDatagram {
    flow: Option<FlowId>,
    /// IP payload pieces by byte offset
    pieces: BTreeMap<usize, Bytes>,
    /// IP payload length, known once the last fragment arrives
    total: Option<usize>,
}

impl PendingDatagram {
    fn assemble(&self) -> Option<(FlowId, Vec<u8>)> {
        let flow = self.flow?;
        let total = self.total?;

        let mut buf = Vec::with_capacity(total);
        for (offset, piece) in &self.pieces {
            if *offset > buf.len() {
                return None;
            }
            let have = buf.len();
            if offset + piece.len() > have {
                buf.extend_from_slice(&piece[have - offset..]);
            }
        }
        if buf.len() < total {
            return None;
        }
        buf.truncate(total);
        Some((flow, buf))
    }
}

/// A reassembled UDP datagram ready to leave through its flow
#[derive(Debug, PartialEq)]
struct Datagram {
    flow: FlowId,
    dst: SocketAddrV4,
    payload: Vec<u8>,
}

/// Reassembly state for fragmented bypass datagrams
#[derive(Debug)]
struct FragmentBuffer {
    pending: HashMap<FragmentKey, PendingDatagram>,
    expiry: ExpiryTimer<FragmentKey>,
}

impl FragmentBuffer {
    fn new(timeout: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            expiry: ExpiryTimer::new(timeout),
        }
    }

    /// Add one fragment; `flow` is known only for the first one.
    /// Returns the datagram once every piece is present.
    fn push(&mut self, flow: Option<FlowId>, packet: &[u8], now: Instant) -> Option<Datagram> {
        if packet.len() < packet::MIN_HEADER_LEN {
            return None;
        }
        let ihl = packet::header_len(packet);
        let end = packet::total_len(packet).min(packet.len());
        if ihl > end {
            return None;
        }

        let key = (packet::dst_addr(packet), packet::identification(packet));
        if !self.pending.contains_key(&key) {
            if self.pending.len() >= MAX_PENDING_DATAGRAMS {
                debug!("Too many partial datagrams, dropping fragment for {}", key.0);
                return None;
            }
            self.expiry.set(key, now);
        }

        let offset = packet::fragment_offset(packet) as usize * 8;
        let data = Bytes::copy_from_slice(&packet[ihl..end]);
        let entry = self.pending.entry(key).or_default();
        if flow.is_some() {
            entry.flow = flow;
        }
        if !packet::more_fragments(packet) {
            entry.total = Some(offset + data.len());
        }
        entry.pieces.insert(offset, data);

        let (flow, udp) = entry.assemble()?;
        self.pending.remove(&key);
        self.expiry.remove(&key);

        if udp.len() < UDP_HEADER_LEN {
            return None;
        }
        let dport = u16::from_be_bytes([udp[2], udp[3]]);
        let udp_len = (u16::from_be_bytes([udp[4], udp[5]]) as usize).clamp(UDP_HEADER_LEN, udp.len());
        Some(Datagram {
            flow,
            dst: SocketAddrV4::new(key.0, dport),
            payload: udp[UDP_HEADER_LEN..udp_len].to_vec(),
        })
    }

    fn next_deadline(&mut self) -> Option<Instant> {
        self.expiry.next_deadline()
    }

    /// Discard datagrams whose fragments did not all arrive in time
    fn drain_expired(&mut self, now: Instant) -> usize {
        let expired = self.expiry.drain_expired(now);
        for key in &expired {
            self.pending.remove(key);
        }
        expired.len()
    }
}

struct Flow {
    lan: SocketAddrV4,
    socket: Arc<UdpSocket>,
    reader: JoinHandle<()>,
}

/// Reply received on a flow socket
struct Reply {
    flow: FlowId,
    from: SocketAddrV4,
    payload: Bytes,
}

/// Run the proxy until the command channel closes
pub async fn run_udp_proxy(
    mut commands: mpsc::UnboundedReceiver<ProxyCommand>,
    inbox: mpsc::UnboundedSender<SessionInput>,
    idle_timeout: Duration,
) -> Result<()> {
    let mut flows: HashMap<FlowId, Flow> = HashMap::new();
    let mut idle = ExpiryTimer::new(idle_timeout);
    let mut fragments = FragmentBuffer::new(REASSEMBLY_TIMEOUT);
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<Reply>();
    let mut ident: u16 = 0;

    loop {
        let next_expiry = match (idle.next_deadline(), fragments.next_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        let expiry = async move {
            match next_expiry {
                Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else { break };
                match command {
                    ProxyCommand::Open { flow, lan } => {
                        match open_flow(flow, lan, reply_tx.clone()).await {
                            Ok(entry) => {
                                flows.insert(flow, entry);
                                idle.set(flow, Instant::now());
                            }
                            Err(e) => {
                                warn!("Cannot open bypass flow {} for {}: {}", flow, lan, e);
                                let _ = inbox.send(SessionInput::UdpNatDel { flow, lan });
                            }
                        }
                    }
                    ProxyCommand::Packet { flow, packet } => {
                        if !flows.contains_key(&flow) {
                            debug!("Packet for unknown bypass flow {}", flow);
                            continue;
                        }
                        if packet.len() >= packet::MIN_HEADER_LEN && packet::more_fragments(&packet) {
                            if let Some(datagram) = fragments.push(Some(flow), &packet, Instant::now()) {
                                send_datagram(&flows, &mut idle, datagram).await;
                            }
                        } else if let Some((dst, payload)) = udp_payload(&packet) {
                            let datagram = Datagram { flow, dst, payload: payload.to_vec() };
                            send_datagram(&flows, &mut idle, datagram).await;
                        }
                    }
                    ProxyCommand::Fragment(packet) => {
                        if let Some(datagram) = fragments.push(None, &packet, Instant::now()) {
                            send_datagram(&flows, &mut idle, datagram).await;
                        }
                    }
                }
            }
            Some(reply) = reply_rx.recv() => {
                let Some(entry) = flows.get(&reply.flow) else { continue };
                ident = ident.wrapping_add(1);
                let packet = packet::build_udp_packet(reply.from, entry.lan, &reply.payload, ident);
                trace!("Bypass reply {} -> {} ({} bytes)", reply.from, entry.lan, reply.payload.len());
                if inbox.send(SessionInput::ProxyPacket(Bytes::from(packet))).is_err() {
                    break;
                }
                idle.set(reply.flow, Instant::now());
            }
            _ = expiry => {
                let now = Instant::now();
                let incomplete = fragments.drain_expired(now);
                if incomplete > 0 {
                    debug!("Discarded {} incomplete fragmented datagrams", incomplete);
                }
                for flow in idle.drain_expired(now) {
                    if let Some(entry) = flows.remove(&flow) {
                        entry.reader.abort();
                        debug!("Bypass flow {} for {} idle, retiring", flow, entry.lan);
                        let _ = inbox.send(SessionInput::UdpNatDel { flow, lan: entry.lan });
                    }
                }
            }
        }
    }

    for (_, entry) in flows.drain() {
        entry.reader.abort();
    }
    info!("UDP bypass proxy stopped");
    Ok(())
}

async fn send_datagram(flows: &HashMap<FlowId, Flow>, idle: &mut ExpiryTimer<FlowId>, datagram: Datagram) {
    let Some(entry) = flows.get(&datagram.flow) else {
        debug!("Datagram for retired bypass flow {}", datagram.flow);
        return;
    };
    if let Err(e) = entry.socket.send_to(&datagram.payload, SocketAddr::V4(datagram.dst)).await {
        debug!("Bypass send to {} failed: {}", datagram.dst, e);
    }
    idle.set(datagram.flow, Instant::now());
}

async fn open_flow(
    flow: FlowId,
    lan: SocketAddrV4,
    replies: mpsc::UnboundedSender<Reply>,
) -> Result<Flow> {
    let socket = Arc::new(UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?);
    debug!("Bypass flow {} for {} bound to {}", flow, lan, socket.local_addr()?);

    let reader = {
        let socket = socket.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 65536];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((n, SocketAddr::V4(from))) => {
                        let reply = Reply { flow, from, payload: Bytes::copy_from_slice(&buf[..n]) };
                        if replies.send(reply).is_err() {
                            return;
                        }
                    }
                    Ok((_, SocketAddr::V6(_))) => {}
                    Err(e) => {
                        debug!("Bypass flow {} receive failed: {}", flow, e);
                        return;
                    }
                }
            }
        })
    };

    Ok(Flow { lan, socket, reader })
}

/// Destination and payload of a LAN UDP packet
fn udp_payload(packet: &[u8]) -> Option<(SocketAddrV4, &[u8])> {
    if packet.len() < packet::MIN_HEADER_LEN || packet::protocol(packet) != PROTO_UDP {
        return None;
    }
    let start = packet::header_len(packet) + UDP_HEADER_LEN;
    let end = packet::total_len(packet).min(packet.len());
    if start > end {
        return None;
    }
    let dst = SocketAddrV4::new(packet::dst_addr(packet), packet::dst_port(packet)?);
    Some((dst, &packet[start..end]))
}
