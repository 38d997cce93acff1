//! TUN device and traffic pump
//!
//! Creates the Linux TUN interface LAN traffic is captured from, and pumps
//! packets between it and a tunnel session: a reader thread feeds captured
//! packets to the session inbox, and an async writer applies
//! [`TrafficEvent`]s coming back from the session.

use bytes::Bytes;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::DeviceConfig;
use crate::error::{Error, Result};
use crate::packet;
use crate::session::{SessionInput, TrafficEvent};

// TUNSETIFF = _IOW('T', 202, c_int); PowerPC encodes the write direction as 4
#[cfg(any(target_arch = "powerpc", target_arch = "powerpc64"))]
const TUNSETIFF: libc::c_ulong = 0x800454ca;
#[cfg(not(any(target_arch = "powerpc", target_arch = "powerpc64")))]
const TUNSETIFF: libc::c_ulong = 0x400454ca;
const IFF_TUN: libc::c_short = 0x0001;
const IFF_NO_PI: libc::c_short = 0x1000;

/// Poll interval of the reader thread when the device has nothing to read
const IDLE_POLL: Duration = Duration::from_micros(100);

/// Packet source/sink the pump runs over
pub trait PacketDevice: Send + Sync + 'static {
    /// Read one packet, `Ok(0)` when nothing is pending
    fn read_packet(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write one packet
    fn write_packet(&self, packet: &[u8]) -> io::Result<usize>;
}

/// A Linux TUN device
#[derive(Debug)]
pub struct TunDevice {
    fd: RawFd,
    name: String,
}

#[repr(C)]
struct Ifreq {
    ifr_name: [u8; 16],
    ifr_flags: libc::c_short,
    _pad: [u8; 22],
}

impl TunDevice {
    /// Create a non-blocking TUN device
    pub fn create(name: &str) -> Result<Self> {
        let fd = unsafe { libc::open(b"/dev/net/tun\0".as_ptr() as *const _, libc::O_RDWR) };
        if fd < 0 {
            return Err(Error::Device(format!(
                "cannot open /dev/net/tun: {}",
                io::Error::last_os_error()
            )));
        }

        let mut req = Ifreq {
            ifr_name: [0u8; 16],
            ifr_flags: IFF_TUN | IFF_NO_PI,
            _pad: [0u8; 22],
        };
        let name_bytes = name.as_bytes();
        let copy_len = name_bytes.len().min(15);
        req.ifr_name[..copy_len].copy_from_slice(&name_bytes[..copy_len]);

        let ret = unsafe { libc::ioctl(fd, TUNSETIFF as _, &mut req as *mut _) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(fd);
            }
            return Err(Error::Device(format!("ioctl TUNSETIFF failed: {}", err)));
        }

        unsafe { libc::fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK) };

        let actual_name = std::str::from_utf8(&req.ifr_name)
            .unwrap_or(name)
            .trim_end_matches('\0')
            .to_string();

        info!("Created TUN device {}", actual_name);
        Ok(Self { fd, name: actual_name })
    }

    /// Assign the interface address, set the MTU and bring it up
    pub fn configure(&self, config: &DeviceConfig) -> Result<()> {
        let cidr = format!("{}/{}", config.address, config.prefix);
        self.ip(&["addr", "add", &cidr, "dev", &self.name])?;

        if let Err(e) = self.ip(&["link", "set", "dev", &self.name, "mtu", &config.mtu.to_string()]) {
            warn!("Failed to set MTU on {}: {}", self.name, e);
        }

        self.ip(&["link", "set", "dev", &self.name, "up"])?;
        info!("{} is up with {} (mtu {})", self.name, cidr, config.mtu);
        Ok(())
    }

    fn ip(&self, args: &[&str]) -> Result<()> {
        let status = std::process::Command::new("ip").args(args).status()?;
        if !status.success() {
            return Err(Error::Device(format!("ip {} failed", args.join(" "))));
        }
        Ok(())
    }

    /// Interface name
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl PacketDevice for TunDevice {
    fn read_packet(&self, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut _, buf.len()) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(0);
            }
            return Err(err);
        }
        Ok(n as usize)
    }

    fn write_packet(&self, packet: &[u8]) -> io::Result<usize> {
        let n = unsafe { libc::write(self.fd, packet.as_ptr() as *const _, packet.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }
}

impl Drop for TunDevice {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// Capture switch shared with the reader thread
#[derive(Debug, Default)]
struct CaptureState {
    running: AtomicBool,
    capturing: AtomicBool,
    /// Tunnel server address excluded from capture, 0 when unset
    excluded: AtomicU32,
}

impl CaptureState {
    fn accepts(&self, packet: &[u8]) -> bool {
        if !self.capturing.load(Ordering::Relaxed) || packet.len() < packet::MIN_HEADER_LEN {
            return false;
        }
        let excluded = self.excluded.load(Ordering::Relaxed);
        excluded == 0 || u32::from(packet::dst_addr(packet)) != excluded
    }
}

/// Pump packets between a device and a session until the event channel closes
pub async fn run_traffic_pump<D: PacketDevice>(
    device: Arc<D>,
    mut events: mpsc::UnboundedReceiver<TrafficEvent>,
    inbox: mpsc::UnboundedSender<SessionInput>,
) -> Result<()> {
    let state = Arc::new(CaptureState::default());
    state.running.store(true, Ordering::Relaxed);

    let reader = {
        let device = device.clone();
        let state = state.clone();
        std::thread::Builder::new()
            .name("wolftunnel-capture".into())
            .spawn(move || capture_loop(device.as_ref(), &state, &inbox))?
    };

    while let Some(event) = events.recv().await {
        match event {
            TrafficEvent::StartCapture { capture, tunnel_server } => {
                let excluded = excluded_address(&tunnel_server).map(u32::from).unwrap_or(0);
                state.excluded.store(excluded, Ordering::Relaxed);
                state.capturing.store(true, Ordering::Relaxed);
                info!("Capturing LAN traffic ({}, excluding {})", capture, tunnel_server);
            }
            TrafficEvent::StopCapture => {
                state.capturing.store(false, Ordering::Relaxed);
                info!("Stopped capturing LAN traffic");
            }
            TrafficEvent::Inject(packet) => {
                if let Err(e) = device.write_packet(&packet) {
                    warn!("Failed to inject {} byte packet: {}", packet.len(), e);
                }
            }
        }
    }

    state.running.store(false, Ordering::Relaxed);
    match tokio::task::spawn_blocking(move || reader.join()).await {
        Ok(Ok(())) => {}
        _ => warn!("Capture thread panicked"),
    }
    debug!("Traffic pump stopped");
    Ok(())
}

fn capture_loop<D: PacketDevice>(
    device: &D,
    state: &CaptureState,
    inbox: &mpsc::UnboundedSender<SessionInput>,
) {
    let mut buf = [0u8; 65536];
    while state.running.load(Ordering::Relaxed) {
        match device.read_packet(&mut buf) {
            Ok(0) => std::thread::sleep(IDLE_POLL),
            Ok(n) => {
                if !state.accepts(&buf[..n]) {
                    continue;
                }
                let packet = Bytes::copy_from_slice(&buf[..n]);
                if inbox.send(SessionInput::LanPacket(packet)).is_err() {
                    debug!("Session inbox closed, capture thread exiting");
                    return;
                }
            }
            Err(e) => {
                debug!("TUN read error: {}", e);
                std::thread::sleep(IDLE_POLL);
            }
        }
    }
}

/// IPv4 address a `StartCapture` keeps out of the capture
fn excluded_address(tunnel_server: &SocketAddr) -> Option<Ipv4Addr> {
    match tunnel_server {
        SocketAddr::V4(addr) => Some(*addr.ip()),
        SocketAddr::V6(_) => None,
    }
}


#[cfg(test)]
mod tests {
    use super::testutil::MemoryDevice;
    use super::*;
    use crate::packet::testutil::udp_packet;
    use crate::session::CaptureId;

    #[tokio::test]
    async fn test_pump_injects_and_captures() {
        let device = Arc::new(MemoryDevice::default());
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (inbox_tx, mut inbox_rx) = mpsc::unbounded_channel();
        let pump = tokio::spawn(run_traffic_pump(device.clone(), event_rx, inbox_tx));

        let server: SocketAddr = "203.0.113.10:8964".parse().unwrap();
        event_tx
            .send(TrafficEvent::StartCapture { capture: CaptureId(1), tunnel_server: server })
            .unwrap();
        event_tx.send(TrafficEvent::Inject(Bytes::from_static(b"reply"))).unwrap();

        // Wait until the writer has applied both events
        for _ in 0..500 {
            if !device.written.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(*device.written.lock().unwrap(), vec![b"reply".to_vec()]);

        let lan = Ipv4Addr::new(172, 20, 0, 5);
        let to_server = udp_packet(lan, 5000, Ipv4Addr::new(203, 0, 113, 10), 8964, b"x");
        let to_web = udp_packet(lan, 5000, Ipv4Addr::new(93, 184, 216, 34), 443, b"y");
        {
            let mut pending = device.pending.lock().unwrap();
            pending.push_back(to_server);
            pending.push_back(to_web.clone());
        }

        let captured = tokio::time::timeout(Duration::from_secs(5), inbox_rx.recv())
            .await
            .unwrap()
            .unwrap();
        match captured {
            SessionInput::LanPacket(packet) => assert_eq!(&packet[..], &to_web[..]),
            other => panic!("unexpected input: {:?}", other),
        }

        drop(event_tx);
        tokio::time::timeout(Duration::from_secs(5), pump)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        // The capture thread has exited and released its inbox sender
        device.pending.lock().unwrap().push_back(to_web);
        assert!(inbox_rx.recv().await.is_none());
    }

    #[test]
    fn test_capture_filter() {
        let state = CaptureState::default();
        let pkt = udp_packet(Ipv4Addr::new(10, 0, 0, 1), 1, Ipv4Addr::new(1, 2, 3, 4), 2, b"z");
        assert!(!state.accepts(&pkt));

        state.capturing.store(true, Ordering::Relaxed);
        assert!(state.accepts(&pkt));

        state.excluded.store(u32::from(Ipv4Addr::new(1, 2, 3, 4)), Ordering::Relaxed);
        assert!(!state.accepts(&pkt));
        assert!(!state.accepts(&pkt[..10]));
    }
}
