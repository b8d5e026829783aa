//! Node counters and the HTTP stats endpoint.
//!
//! [`NodeStats`] is shared by the transceiver, the forwarding engine and the
//! runtime; every field is atomic so nothing on the receive path takes a lock
//! to count. [`StatsServer`] serves a snapshot as JSON at `/stats`.
//!
//! # Example Response
//!
//! ```json
//! {
//!   "uptime_secs": 3600,
//!   "node_id": 200,
//!   "role": "repeater",
//!   "radio": { "rx": 230, "tx": 150, "tx_failed": 0, "airtime_ms": 8400 },
//!   "admission": {
//!     "accepted": 40, "forwarded": 120,
//!     "dropped": { "corrupt": 3, "duplicate": 55, "looped": 9, "ttl_expired": 1, "not_for_me": 0 }
//!   },
//!   "delivery": { "acks_sent": 12, "acks_received": 10, "reacks": 2, "retries": 4, "failures": 1 }
//! }
//! ```

use crate::config::NodeRole;
use crate::sequence::RejectReason;
use log::{error, info, warn};
use serde_json::json;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tiny_http::{Header, Method, Response, Server};

/// Shared node counters.
#[derive(Debug)]
pub struct NodeStats {
    start_time: Instant,
    node_id: u16,
    role: NodeRole,
    /// Frames read from the radio.
    pub rx_frames: AtomicU64,
    /// Frames the radio accepted for transmission.
    pub tx_frames: AtomicU64,
    /// Frames the radio refused after every backoff attempt.
    pub tx_failed: AtomicU64,
    /// Estimated time on air of transmitted frames.
    pub airtime_ms: AtomicU64,
    /// Packets admitted for this node.
    pub accepted: AtomicU64,
    /// Packets relayed.
    pub forwarded: AtomicU64,
    /// Frames that failed to decode.
    pub dropped_corrupt: AtomicU64,
    /// Duplicates.
    pub dropped_duplicate: AtomicU64,
    /// Own packets heard again.
    pub dropped_looped: AtomicU64,
    /// Packets out of hops.
    pub dropped_ttl: AtomicU64,
    /// Packets addressed elsewhere.
    pub dropped_not_for_me: AtomicU64,
    /// ACKs sent.
    pub acks_sent: AtomicU64,
    /// ACKs matched to an outstanding exchange.
    pub acks_received: AtomicU64,
    /// Cached ACKs re-sent for retransmitted packets.
    pub reacks: AtomicU64,
    /// Retransmissions after an ACK timeout.
    pub retries: AtomicU64,
    /// Exchanges that failed.
    pub failures: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

fn load(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

impl NodeStats {
    /// Create zeroed counters for a node.
    pub fn new(node_id: u16, role: NodeRole) -> Self {
        Self {
            start_time: Instant::now(),
            node_id,
            role,
            rx_frames: AtomicU64::new(0),
            tx_frames: AtomicU64::new(0),
            tx_failed: AtomicU64::new(0),
            airtime_ms: AtomicU64::new(0),
            accepted: AtomicU64::new(0),
            forwarded: AtomicU64::new(0),
            dropped_corrupt: AtomicU64::new(0),
            dropped_duplicate: AtomicU64::new(0),
            dropped_looped: AtomicU64::new(0),
            dropped_ttl: AtomicU64::new(0),
            dropped_not_for_me: AtomicU64::new(0),
            acks_sent: AtomicU64::new(0),
            acks_received: AtomicU64::new(0),
            reacks: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// Record a received frame.
    pub fn record_rx(&self) {
        bump(&self.rx_frames);
    }

    /// Record a transmitted frame and its time on air.
    pub fn record_tx(&self, airtime: Duration) {
        bump(&self.tx_frames);
        self.airtime_ms
            .fetch_add(airtime.as_millis() as u64, Ordering::Relaxed);
    }

    /// Record a frame the radio would not take.
    pub fn record_tx_failed(&self) {
        bump(&self.tx_failed);
    }

    /// Record an admission rejection.
    pub fn record_drop(&self, reason: RejectReason) {
        bump(match reason {
            RejectReason::Duplicate => &self.dropped_duplicate,
            RejectReason::OwnPacketLooped => &self.dropped_looped,
            RejectReason::TtlExpired => &self.dropped_ttl,
            RejectReason::NotForMe => &self.dropped_not_for_me,
        });
    }

    /// Record a frame that failed to decode.
    pub fn record_corrupt(&self) {
        bump(&self.dropped_corrupt);
    }

    /// Record an admitted packet.
    pub fn record_accepted(&self) {
        bump(&self.accepted);
    }

    /// Record a relay.
    pub fn record_forwarded(&self) {
        bump(&self.forwarded);
    }

    /// Record an ACK sent.
    pub fn record_ack_sent(&self) {
        bump(&self.acks_sent);
    }

    /// Record an ACK matched to an exchange.
    pub fn record_ack_received(&self) {
        bump(&self.acks_received);
    }

    /// Record a cached ACK re-sent.
    pub fn record_reack(&self) {
        bump(&self.reacks);
    }

    /// Record a retransmission.
    pub fn record_retry(&self) {
        bump(&self.retries);
    }

    /// Record a failed exchange.
    pub fn record_failure(&self) {
        bump(&self.failures);
    }

    /// Get uptime in seconds.
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Serialize all statistics to JSON.
    pub fn to_json(&self) -> String {
        json!({
            "uptime_secs": self.uptime_secs(),
            "node_id": self.node_id,
            "role": self.role.to_string(),
            "radio": {
                "rx": load(&self.rx_frames),
                "tx": load(&self.tx_frames),
                "tx_failed": load(&self.tx_failed),
                "airtime_ms": load(&self.airtime_ms),
            },
            "admission": {
                "accepted": load(&self.accepted),
                "forwarded": load(&self.forwarded),
                "dropped": {
                    "corrupt": load(&self.dropped_corrupt),
                    "duplicate": load(&self.dropped_duplicate),
                    "looped": load(&self.dropped_looped),
                    "ttl_expired": load(&self.dropped_ttl),
                    "not_for_me": load(&self.dropped_not_for_me),
                },
            },
            "delivery": {
                "acks_sent": load(&self.acks_sent),
                "acks_received": load(&self.acks_received),
                "reacks": load(&self.reacks),
                "retries": load(&self.retries),
                "failures": load(&self.failures),
            },
        })
        .to_string()
    }
}

/// HTTP stats server.
///
/// Runs in a background thread and serves node statistics as JSON.
pub struct StatsServer {
    handle: Option<thread::JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl StatsServer {
    /// Start serving `stats` on `bind_addr:port` (`None` binds 0.0.0.0).
    ///
    /// Drop the returned handle to stop the server.
    pub fn start(
        bind_addr: Option<IpAddr>,
        port: u16,
        stats: Arc<NodeStats>,
    ) -> Result<Self, std::io::Error> {
        let addr = match bind_addr {
            Some(ip) => format!("{}:{}", ip, port),
            None => format!("0.0.0.0:{}", port),
        };

        let server = Server::http(&addr)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::AddrInUse, format!("{}", e)))?;

        info!("Stats server listening on http://{}/stats", addr);

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = shutdown.clone();

        let handle = thread::spawn(move || {
            Self::run_server(server, stats, shutdown_clone);
        });

        Ok(Self {
            handle: Some(handle),
            shutdown,
        })
    }

    fn run_server(server: Server, stats: Arc<NodeStats>, shutdown: Arc<AtomicBool>) {
        let content_type = Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..]).ok();
        let allow_get = Header::from_bytes(&b"Allow"[..], &b"GET"[..]).ok();

        loop {
            if shutdown.load(Ordering::Acquire) {
                info!("Stats server shutting down");
                break;
            }

            match server.recv_timeout(Duration::from_millis(100)) {
                Ok(Some(request)) => {
                    let response = if request.method() != &Method::Get {
                        let mut response =
                            Response::from_string("Method Not Allowed").with_status_code(405);
                        if let Some(header) = allow_get.clone() {
                            response = response.with_header(header);
                        }
                        response
                    } else if matches!(request.url(), "/stats" | "/stats/") {
                        let mut response = Response::from_string(stats.to_json());
                        if let Some(header) = content_type.clone() {
                            response = response.with_header(header);
                        }
                        response
                    } else {
                        Response::from_string("Not Found").with_status_code(404)
                    };

                    if let Err(e) = request.respond(response) {
                        warn!("Failed to send stats response: {}", e);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    error!("Stats server error: {}", e);
                    break;
                }
            }
        }
    }

    /// Stop the server. May take up to one 100 ms poll.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for StatsServer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_start_at_zero() {
        let stats = NodeStats::new(200, NodeRole::Repeater);
        assert_eq!(load(&stats.rx_frames), 0);
        assert_eq!(load(&stats.forwarded), 0);
    }

    #[test]
    fn test_drop_reasons_counted_separately() {
        let stats = NodeStats::new(1, NodeRole::Server);
        stats.record_drop(RejectReason::Duplicate);
        stats.record_drop(RejectReason::Duplicate);
        stats.record_drop(RejectReason::TtlExpired);
        assert_eq!(load(&stats.dropped_duplicate), 2);
        assert_eq!(load(&stats.dropped_ttl), 1);
        assert_eq!(load(&stats.dropped_looped), 0);
    }

    #[test]
    fn test_json_shape() {
        let stats = NodeStats::new(200, NodeRole::Repeater);
        stats.record_tx(Duration::from_millis(56));
        stats.record_forwarded();

        let value: serde_json::Value = serde_json::from_str(&stats.to_json()).unwrap();
        assert_eq!(value["node_id"], 200);
        assert_eq!(value["role"], "repeater");
        assert_eq!(value["radio"]["tx"], 1);
        assert_eq!(value["radio"]["airtime_ms"], 56);
        assert_eq!(value["admission"]["forwarded"], 1);
        assert_eq!(value["admission"]["dropped"]["corrupt"], 0);
    }

    #[test]
    fn test_server_serves_stats() {
        use std::io::{Read, Write};
        use std::net::TcpStream;

        let stats = Arc::new(NodeStats::new(1, NodeRole::Server));
        stats.record_rx();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut server = StatsServer::start(Some("127.0.0.1".parse().unwrap()), port, stats).unwrap();

        let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        stream
            .write_all(b"GET /stats HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .unwrap();
        let mut body = String::new();
        stream.read_to_string(&mut body).unwrap();
        assert!(body.starts_with("HTTP/1.1 200"));
        assert!(body.contains("\"rx\":1"));

        server.stop();
    }
}
