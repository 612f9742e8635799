//! Multicast presence monitoring
//!
//! Watches a multicast group and records when the last datagram arrived.
//! Payloads are dropped on the floor: the capture engine consumes the real
//! stream on its own socket, this only answers "is anything arriving".

use socket2::{Domain, Protocol, Socket, Type};
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::error::{RecorderError, RecorderResult};

/// How long a blocking receive waits before re-checking the stop flag
const RECV_TIMEOUT: Duration = Duration::from_millis(250);

/// Receive buffer size, one Ethernet MTU
const DATAGRAM_BUFFER: usize = 1500;

/// Read side of a presence monitor, as seen by the detector
pub trait PresenceProbe: Send + Sync {
    /// Time the most recent datagram arrived, `None` before the first one
    fn last_receipt(&self) -> Option<Instant>;

    /// Fails once the receive loop has died
    fn check_health(&self) -> RecorderResult<()>;
}

#[derive(Default)]
struct MonitorShared {
    last_receipt: Mutex<Option<Instant>>,
    failure: Mutex<Option<String>>,
    running: AtomicBool,
}

impl MonitorShared {
    fn touch(&self) {
        if let Ok(mut last) = self.last_receipt.lock() {
            *last = Some(Instant::now());
        }
    }

    fn fail(&self, reason: String) {
        if let Ok(mut failure) = self.failure.lock() {
            *failure = Some(reason);
        }
    }
}

/// Presence monitor running its receive loop on a dedicated thread
pub struct PresenceMonitor {
    shared: Arc<MonitorShared>,
    local_addr: SocketAddr,
    thread: Option<JoinHandle<()>>,
}

impl PresenceMonitor {
    /// Bind to `address`, join its multicast group when it is one, and start
    /// the receive loop.
    ///
    /// Socket and join failures are returned here rather than logged so the
    /// owner never ends up polling a monitor that is not listening.
    pub fn start(address: SocketAddr) -> RecorderResult<Self> {
        let socket = open_socket(address)
            .map_err(|e| RecorderError::Monitor(format!("failed to listen on {}: {}", address, e)))?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| RecorderError::Monitor(e.to_string()))?;

        let shared = Arc::new(MonitorShared::default());
        shared.running.store(true, Ordering::SeqCst);

        let loop_shared = shared.clone();
        let thread = std::thread::Builder::new()
            .name("presence-monitor".to_string())
            .spawn(move || receive_loop(socket, loop_shared))
            .map_err(|e| RecorderError::Monitor(format!("failed to spawn monitor thread: {}", e)))?;

        info!("Presence monitor listening on {} (local {})", address, local_addr);

        Ok(Self {
            shared,
            local_addr,
            thread: Some(thread),
        })
    }

    /// Address the socket is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop the receive loop and wait for the thread to exit
    pub fn stop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Presence monitor thread panicked");
            }
            debug!("Presence monitor stopped");
        }
    }
}

impl PresenceProbe for PresenceMonitor {
    fn last_receipt(&self) -> Option<Instant> {
        self.shared.last_receipt.lock().ok().and_then(|last| *last)
    }

    fn check_health(&self) -> RecorderResult<()> {
        let failure = self.shared.failure.lock().ok().and_then(|f| f.clone());
        match failure {
            Some(reason) => Err(RecorderError::Monitor(reason)),
            None => Ok(()),
        }
    }
}

impl Drop for PresenceMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn open_socket(address: SocketAddr) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(address), Type::DGRAM, Some(Protocol::UDP))?;

    // The capture engine binds the same group and port
    socket.set_reuse_address(true)?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket.set_reuse_port(true)?;

    let ip = address.ip();
    let bind_ip = match ip {
        IpAddr::V4(group) if group.is_multicast() => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(group) if group.is_multicast() => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        other => other,
    };
    socket.bind(&SocketAddr::new(bind_ip, address.port()).into())?;

    match ip {
        IpAddr::V4(group) if group.is_multicast() => {
            socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
        }
        IpAddr::V6(group) if group.is_multicast() => {
            socket.join_multicast_v6(&group, 0)?;
        }
        _ => debug!("{} is not a multicast group, listening unicast", ip),
    }

    socket.set_read_timeout(Some(RECV_TIMEOUT))?;
    Ok(socket.into())
}

fn receive_loop(socket: UdpSocket, shared: Arc<MonitorShared>) {
    let mut buf = [0u8; DATAGRAM_BUFFER];

    while shared.running.load(Ordering::SeqCst) {
        match socket.recv(&mut buf) {
            Ok(_) => shared.touch(),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => {
                error!("Presence monitor receive failed: {}", e);
                shared.fail(e.to_string());
                break;
            }
        }
    }

    shared.running.store(false, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wait_for_receipt(monitor: &PresenceMonitor) -> Option<Instant> {
        for _ in 0..100 {
            if let Some(t) = monitor.last_receipt() {
                return Some(t);
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        None
    }

    #[test]
    fn test_never_before_first_datagram() {
        let mut monitor = PresenceMonitor::start("127.0.0.1:0".parse().unwrap()).unwrap();
        assert!(monitor.last_receipt().is_none());
        assert!(monitor.check_health().is_ok());
        monitor.stop();
    }

    #[test]
    fn test_datagram_updates_receipt_time() {
        let mut monitor = PresenceMonitor::start("127.0.0.1:0".parse().unwrap()).unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();

        let before = Instant::now();
        sender.send_to(b"ts-packet", monitor.local_addr()).unwrap();

        let first = wait_for_receipt(&monitor).expect("datagram should be observed");
        assert!(first >= before);

        std::thread::sleep(Duration::from_millis(10));
        sender.send_to(b"ts-packet", monitor.local_addr()).unwrap();
        let mut later = first;
        for _ in 0..100 {
            later = monitor.last_receipt().unwrap();
            if later > first {
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(later > first);

        monitor.stop();
    }

    #[test]
    fn test_bind_failure_is_surfaced() {
        // TEST-NET-1 is never assigned to a local interface
        let result = PresenceMonitor::start("192.0.2.1:5004".parse().unwrap());
        assert!(matches!(result, Err(RecorderError::Monitor(_))));
    }
}
