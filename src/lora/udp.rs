//! UDP stand-in for the LoRa radio.
//!
//! Lets several `mesh-node` processes on one host (or one LAN) share a fake
//! channel: each frame is sent as one datagram to every configured peer. It
//! behaves like the real radio in the ways that matter to the transport. It
//! broadcasts, it can lose frames, and it delivers no more than one frame per
//! receive call.

use super::config::LORA_MTU;
use super::radio::Radio;
use log::{debug, info, warn};
use std::io;
use std::net::{AddrParseError, SocketAddr, UdpSocket};
use std::time::Duration;

/// Smallest read timeout the socket accepts (zero means "block forever").
const MIN_READ_TIMEOUT: Duration = Duration::from_millis(1);

/// Radio that exchanges frames as UDP datagrams.
pub struct UdpRadio {
    socket: UdpSocket,
    peers: Vec<SocketAddr>,
    last_rssi: Option<i32>,
}

impl UdpRadio {
    /// Bind to `bind_addr` and send to `peers`.
    pub fn bind(bind_addr: SocketAddr, peers: Vec<SocketAddr>) -> io::Result<Self> {
        let socket = UdpSocket::bind(bind_addr)?;
        info!(
            "UDP radio bound to {} with {} peer(s)",
            socket.local_addr()?,
            peers.len()
        );
        Ok(Self {
            socket,
            peers,
            last_rssi: None,
        })
    }

    /// Address the socket is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Add a peer that will hear this radio.
    pub fn add_peer(&mut self, peer: SocketAddr) {
        if !self.peers.contains(&peer) {
            self.peers.push(peer);
        }
    }
}

impl Radio for UdpRadio {
    fn send(&mut self, frame: &[u8]) -> bool {
        if frame.len() > LORA_MTU {
            warn!("Refusing {}-byte frame, MTU is {}", frame.len(), LORA_MTU);
            return false;
        }
        let mut delivered = false;
        for peer in &self.peers {
            match self.socket.send_to(frame, peer) {
                Ok(_) => delivered = true,
                Err(e) => debug!("UDP send to {} failed: {}", peer, e),
            }
        }
        delivered
    }

    fn receive(&mut self, timeout: Duration) -> Option<Vec<u8>> {
        if let Err(e) = self.socket.set_read_timeout(Some(timeout.max(MIN_READ_TIMEOUT))) {
            warn!("Failed to set UDP read timeout: {}", e);
            return None;
        }

        let mut buf = [0u8; LORA_MTU + 1];
        match self.socket.recv_from(&mut buf) {
            Ok((len, from)) => {
                if len > LORA_MTU {
                    debug!("Oversized datagram from {} ignored", from);
                    return None;
                }
                self.last_rssi = None;
                Some(buf[..len].to_vec())
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                None
            }
            Err(e) => {
                debug!("UDP receive failed: {}", e);
                None
            }
        }
    }

    fn last_rssi(&self) -> Option<i32> {
        self.last_rssi
    }
}

/// Parse a comma-separated peer list such as `127.0.0.1:7001,127.0.0.1:7002`.
///
/// Blank entries are skipped.
pub fn parse_peers(list: &str) -> Result<Vec<SocketAddr>, AddrParseError> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::parse)
        .collect()
}
