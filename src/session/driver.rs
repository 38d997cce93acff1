//! Session Driver
//!
//! Runs a [`TunnelSession`] as a tokio task over a connected UDP socket.

use std::io::ErrorKind;
use std::time::Instant;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{SessionInput, SessionStats, TunnelSession};
use crate::error::{Error, Result};

/// Receive buffer size, larger than any codec envelope
const RECV_BUFFER: usize = 65_536;

/// Drive a session until shutdown or a fatal error
///
/// `socket` must be connected to the session's peer. Returns the session
/// counters on a clean shutdown; transport failures and an exhausted auth
/// retry budget are returned as errors.
pub async fn run(
    mut session: TunnelSession,
    socket: UdpSocket,
    mut inbox: mpsc::UnboundedReceiver<SessionInput>,
) -> Result<SessionStats> {
    let mut buf = vec![0u8; RECV_BUFFER];
    let mut inbox_open = true;

    loop {
        if session.is_shutdown() {
            flush_on_shutdown(&mut session, &socket).await;
            return Ok(session.stats());
        }

        let deadline = tokio::time::Instant::from_std(session.deadline());
        let want_write = session.has_outbound();

        tokio::select! {
            received = socket.recv(&mut buf) => {
                let n = received.map_err(|e| Error::Transport(format!("receive failed: {}", e)))?;
                session.handle_datagram(&buf[..n], Instant::now());
            }
            ready = socket.writable(), if want_write => {
                ready.map_err(|e| Error::Transport(format!("socket not writable: {}", e)))?;
                flush_outbound(&mut session, &socket)?;
            }
            input = inbox.recv(), if inbox_open => {
                match input {
                    Some(input) => session.handle_input(input, Instant::now()),
                    None => {
                        info!("Session inbox closed, shutting down");
                        inbox_open = false;
                        session.shutdown();
                    }
                }
            }
            _ = tokio::time::sleep_until(deadline) => {
                session.handle_timeout(Instant::now())?;
            }
        }
    }
}

/// Write queued datagrams until the socket would block
fn flush_outbound(session: &mut TunnelSession, socket: &UdpSocket) -> Result<()> {
    while let Some(datagram) = session.pop_outbound() {
        match socket.try_send(&datagram) {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                session.requeue_front(datagram);
                break;
            }
            Err(e) => return Err(Error::Transport(format!("send failed: {}", e))),
        }
    }
    Ok(())
}

/// Best-effort delivery of the final datagrams (CLOSE)
async fn flush_on_shutdown(session: &mut TunnelSession, socket: &UdpSocket) {
    while let Some(datagram) = session.pop_outbound() {
        if let Err(e) = socket.send(&datagram).await {
            warn!("Could not deliver final datagram: {}", e);
            break;
        }
    }
    debug!("Session driver stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Action, Codec, PlainCodec};
    use crate::session::{ClientVariant, SessionLinks, SessionSettings};
    use std::net::Ipv4Addr;
    use std::time::Duration;
    use tokio::time::timeout;

    fn settings() -> SessionSettings {
        SessionSettings {
            auth_timeout: Duration::from_secs(5),
            keepalive_timeout: Duration::from_secs(25),
            lease_ttl: Duration::from_secs(600),
            whitelist_cache_ttl: Duration::from_secs(180),
            virtual_resolver: Ipv4Addr::new(10, 99, 0, 53),
            udp_global: true,
            whitelist: Vec::new(),
        }
    }

    async fn recv_decoded(server: &UdpSocket) -> (crate::codec::Decoded, std::net::SocketAddr) {
        let mut buf = [0u8; 2048];
        let (n, from) = timeout(Duration::from_secs(5), server.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        (PlainCodec::new().decode(&buf[..n]).unwrap(), from)
    }

    #[tokio::test]
    async fn test_driver_authenticates_and_shuts_down() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect(server.local_addr().unwrap()).await.unwrap();

        let (links, mut endpoints) = SessionLinks::channel();
        let session = TunnelSession::new(
            settings(),
            Box::new(ClientVariant::new("wolf", "secret")),
            Box::new(PlainCodec::new()),
            links,
            server.local_addr().unwrap(),
            Instant::now(),
        )
        .unwrap();

        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run(session, client, inbox_rx));

        let (auth, client_addr) = recv_decoded(&server).await;
        assert_eq!(auth.action, Action::Auth as u8);

        let grant = br#"{"status":"ok","virtual_addresses":["10.1.0.2","10.1.0.3"]}"#;
        let reply = PlainCodec::new().encode(77, Action::Auth, grant).unwrap();
        server.send_to(&reply[0], client_addr).await.unwrap();

        let started = timeout(Duration::from_secs(5), endpoints.traffic.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(started, crate::session::TrafficEvent::StartCapture { .. }));

        inbox_tx.send(SessionInput::Shutdown).unwrap();
        let (close, _) = recv_decoded(&server).await;
        assert_eq!(close.action, Action::Close as u8);
        assert_eq!(close.session_id, 77);

        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.datagrams_in, 1);
        assert_eq!(stats.datagrams_out, 2);
    }

    #[tokio::test]
    async fn test_closed_inbox_stops_driver() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect(server.local_addr().unwrap()).await.unwrap();

        let (links, _endpoints) = SessionLinks::channel();
        let session = TunnelSession::new(
            settings(),
            Box::new(ClientVariant::new("wolf", "secret")),
            Box::new(PlainCodec::new()),
            links,
            server.local_addr().unwrap(),
            Instant::now(),
        )
        .unwrap();

        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        drop(inbox_tx);

        let stats = timeout(Duration::from_secs(5), run(session, client, inbox_rx))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stats.datagrams_out, 2);
    }
}
