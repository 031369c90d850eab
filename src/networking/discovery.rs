//! UDP broadcast discovery.
//!
//! A requester broadcasts the discovery marker once on the discovery port and
//! prints every reply until the network has been quiet for one timeout
//! period. A responder answers each datagram that starts with the marker with
//! a short free-text line naming this host.
//!
//! The responder socket uses a read timeout equal to the poll interval, so its
//! loop wakes up regularly to check a shared cancellation flag. This is how
//! the transfer server stops answering queries once its single connection has
//! been accepted.

use log::{debug, error, info, warn};
use std::fmt;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::interface;
use crate::config::{Config, MARKER_MATCH_LEN};
use crate::error::{Result, TransferError};

/// Returns `true` when `datagram` starts with the discovery marker.
/// Only the first [`MARKER_MATCH_LEN`] bytes of the marker are significant and
/// anything after them is ignored.
pub fn is_discovery_query(datagram: &[u8], marker: &[u8]) -> bool {
    let significant = &marker[..marker.len().min(MARKER_MATCH_LEN)];
    datagram.starts_with(significant)
}

/// Text sent back to a requester
pub fn format_reply(hostname: &str, ip: Ipv4Addr) -> String {
    format!("hostname: {} | ip_address: {}", hostname, ip)
}

/// Returns `true` for OS timeout / would-block errors
fn is_timeout_error(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

/// Answers discovery queries on the discovery port
pub struct DiscoveryResponder {
    socket: UdpSocket,
    marker: Vec<u8>,
    hostname: String,
    local_ip: Option<Ipv4Addr>,
    buffer_size: usize,
}

impl DiscoveryResponder {
    /// Bind the discovery port on all interfaces
    pub fn bind(config: &Config) -> Result<Self> {
        let addr = SocketAddr::from(([0, 0, 0, 0], config.discovery_port));
        let socket = UdpSocket::bind(addr).map_err(|e| {
            TransferError::connection(format!("failed to bind discovery socket on {}", addr), e)
        })?;
        socket
            .set_read_timeout(Some(config.poll_interval.max(Duration::from_millis(1))))
            .map_err(|e| TransferError::connection("failed to set discovery poll interval", e))?;

        let responder = Self {
            socket,
            marker: config.discovery_marker.as_bytes().to_vec(),
            hostname: interface::local_hostname(),
            local_ip: interface::local_ipv4(),
            buffer_size: config.buffer_size,
        };

        info!(
            "Discovery responder listening on UDP {}",
            responder.local_addr().unwrap_or(addr)
        );
        Ok(responder)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Answer queries until `cancel` is set. `on_query` is told about every
    /// peer that was answered. Returns the number of replies sent.
    pub fn run<F>(&self, cancel: &AtomicBool, mut on_query: F) -> u64
    where
        F: FnMut(SocketAddr),
    {
        let mut buf = vec![0u8; self.buffer_size.max(self.marker.len())];
        let mut answered = 0u64;

        while !cancel.load(Ordering::Acquire) {
            let (len, src) = match self.socket.recv_from(&mut buf) {
                Ok(pair) => pair,
                Err(e) if is_timeout_error(&e) => continue,
                Err(e) => {
                    error!("Discovery recv error: {}", e);
                    continue;
                }
            };

            if !is_discovery_query(&buf[..len], &self.marker) {
                debug!("Ignoring {} byte datagram from {}", len, src);
                continue;
            }

            match self.answer(src) {
                Ok(()) => {
                    answered += 1;
                    on_query(src);
                }
                Err(e) => warn!("Failed to answer discovery query from {}: {}", src, e),
            }
        }

        info!("Discovery responder stopped after {} replies", answered);
        answered
    }

    /// Run the responder on a helper thread until `cancel` is set
    pub fn spawn(self, cancel: Arc<AtomicBool>) -> Result<JoinHandle<u64>> {
        thread::Builder::new()
            .name("bytevalve-discovery".to_string())
            .spawn(move || {
                self.run(&cancel, |peer| debug!("Answered discovery query from {}", peer))
            })
            .map_err(|e| TransferError::connection("failed to start discovery responder", e))
    }

    fn answer(&self, src: SocketAddr) -> io::Result<()> {
        let ip = match (self.local_ip, src) {
            (Some(ip), _) => ip,
            (None, SocketAddr::V4(peer)) => *peer.ip(),
            (None, SocketAddr::V6(_)) => Ipv4Addr::UNSPECIFIED,
        };

        let reply = format_reply(&self.hostname, ip);
        self.socket.send_to(reply.as_bytes(), src)?;
        Ok(())
    }
}

/// A peer that answered a discovery query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Neighbor {
    /// Where the reply came from
    pub addr: SocketAddr,
    /// Reply text as sent by the peer
    pub reply: String,
}

impl fmt::Display for Neighbor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (from {})", self.reply, self.addr)
    }
}

/// Broadcasts one discovery query and gathers replies
pub struct DiscoveryRequester {
    config: Config,
}

impl DiscoveryRequester {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Query the broadcast address of `interface_name`
    pub fn discover<F>(&self, interface_name: &str, on_reply: F) -> Result<Vec<Neighbor>>
    where
        F: FnMut(&Neighbor),
    {
        let broadcast = interface::resolve_interface_broadcast(interface_name)?;
        self.query(broadcast, on_reply)
    }

    /// Send the marker to `target` and collect replies until one receive
    /// times out. Zero replies is a successful, empty result.
    pub fn query<F>(&self, target: Ipv4Addr, mut on_reply: F) -> Result<Vec<Neighbor>>
    where
        F: FnMut(&Neighbor),
    {
        let socket = UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], 0)))
            .map_err(|e| TransferError::connection("failed to create the socket", e))?;
        socket
            .set_broadcast(true)
            .map_err(|e| TransferError::connection("failed to enable broadcast", e))?;
        socket
            .set_read_timeout(Some(self.config.discovery_timeout.max(Duration::from_millis(1))))
            .map_err(|e| TransferError::connection("failed to set discovery timeout", e))?;

        let dest = SocketAddrV4::new(target, self.config.discovery_port);
        socket
            .send_to(self.config.discovery_marker.as_bytes(), dest)
            .map_err(|e| TransferError::connection(format!("failed to broadcast to {}", dest), e))?;
        info!("Broadcast discovery query to {}", dest);

        let mut neighbors = Vec::new();
        let mut buf = vec![0u8; self.config.buffer_size];

        loop {
            match socket.recv_from(&mut buf) {
                Ok((len, addr)) => {
                    let reply = String::from_utf8_lossy(&buf[..len])
                        .trim_end_matches('\0')
                        .to_string();
                    let neighbor = Neighbor { addr, reply };
                    debug!("Discovery reply from {}: {}", addr, neighbor.reply);
                    on_reply(&neighbor);
                    neighbors.push(neighbor);
                }
                Err(e) if is_timeout_error(&e) => break,
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset
                    ) =>
                {
                    // ICMP unreachable surfaced by some platforms
                    debug!("Ignoring discovery receive error: {}", e);
                }
                Err(e) => {
                    return Err(TransferError::connection("failed to receive discovery reply", e))
                }
            }
        }

        info!("Discovery finished with {} replies", neighbors.len());
        Ok(neighbors)
    }
}
