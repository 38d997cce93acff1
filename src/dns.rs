//! DNS passthrough helper
//!
//! Minimal DNS collaborator: DNS replies arriving through the tunnel are
//! written to the LAN as-is, and the tunnel lifecycle is logged.
//!
//! This helper never issues `SessionInput::RequestDns`, so it holds no
//! record of which LAN client asked a question. A gateway `DNS` action whose
//! payload is a bare DNS message therefore has no destination and is
//! dropped; only payloads that already are IPv4 packets are injected. A
//! resolver that sends requests through the tunnel must supply its own
//! helper to route those answers.

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::packet;
use crate::session::{CaptureId, DnsEvent, TrafficEvent};

/// Forward DNS traffic to the traffic device until the event channel closes
pub async fn run_passthrough(
    mut events: mpsc::UnboundedReceiver<DnsEvent>,
    traffic: mpsc::UnboundedSender<TrafficEvent>,
) {
    let mut capture: Option<CaptureId> = None;

    while let Some(event) = events.recv().await {
        let packet = match event {
            DnsEvent::TunnelOpen => {
                info!("DNS forwarding through tunnel enabled");
                continue;
            }
            DnsEvent::TunnelClose => {
                info!("DNS forwarding through tunnel disabled");
                capture = None;
                continue;
            }
            DnsEvent::SetFilterDevice(id) => {
                debug!("DNS helper bound to {}", id);
                capture = Some(id);
                continue;
            }
            DnsEvent::Packet(packet) => packet,
            DnsEvent::Response(payload) => {
                if packet::validate_lan_packet(&payload).is_err() {
                    debug!("Dropping {} byte DNS response with no LAN destination", payload.len());
                    continue;
                }
                payload
            }
        };

        if capture.is_none() {
            debug!("No capture bound, dropping DNS packet");
            continue;
        }
        if traffic.send(TrafficEvent::Inject(packet)).is_err() {
            debug!("Traffic device is gone, DNS helper exiting");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::testutil::udp_packet;
    use bytes::Bytes;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn test_passthrough() {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (traffic_tx, mut traffic_rx) = mpsc::unbounded_channel();
        let helper = tokio::spawn(run_passthrough(event_rx, traffic_tx));

        let answer = Bytes::from(udp_packet(
            Ipv4Addr::new(10, 99, 0, 53),
            53,
            Ipv4Addr::new(172, 20, 0, 5),
            5353,
            b"answer",
        ));

        // Dropped: no capture bound yet
        event_tx.send(DnsEvent::Packet(answer.clone())).unwrap();
        event_tx.send(DnsEvent::TunnelOpen).unwrap();
        event_tx.send(DnsEvent::SetFilterDevice(CaptureId(1))).unwrap();
        // Dropped: a bare DNS message has no LAN destination
        event_tx.send(DnsEvent::Response(Bytes::from_static(b"opaque"))).unwrap();
        event_tx.send(DnsEvent::Packet(answer.clone())).unwrap();
        event_tx.send(DnsEvent::Response(answer.clone())).unwrap();
        drop(event_tx);
        helper.await.unwrap();

        let injected: Vec<_> = std::iter::from_fn(|| traffic_rx.try_recv().ok()).collect();
        assert_eq!(
            injected,
            vec![TrafficEvent::Inject(answer.clone()), TrafficEvent::Inject(answer)]
        );
    }
}
