//! Host mesh node for development and testing.
//!
//! Runs one node over the UDP stand-in radio, so a server, a repeater and a
//! scanner can run as three processes on one machine:
//!
//! ```bash
//! MESH_NODE_ID=1   MESH_ROLE=server   MESH_UDP_BIND=127.0.0.1:7001 MESH_UDP_PEERS=127.0.0.1:7002 mesh-node
//! MESH_NODE_ID=200 MESH_ROLE=repeater MESH_UDP_BIND=127.0.0.1:7002 MESH_UDP_PEERS=127.0.0.1:7001,127.0.0.1:7003 mesh-node
//! MESH_NODE_ID=102 MESH_ROLE=scanner  MESH_UDP_BIND=127.0.0.1:7003 MESH_UDP_PEERS=127.0.0.1:7002 mesh-node
//! ```
//!
//! A scanner reads lookups from stdin, one per line, and sends each to
//! `MESH_SERVER_ID` (default 1). A server answers every lookup with the
//! comma-separated parts of the request, one record per part, so multi-packet
//! responses can be exercised by typing `a,b,c`.

use dismissal_mesh::config::{NodeConfig, NodeRole};
use dismissal_mesh::lora::{parse_peers, UdpRadio, FREQUENCY_MHZ, SPREADING_FACTOR};
use dismissal_mesh::node::{MeshHandler, MeshNode};
use dismissal_mesh::packet::Packet;
use dismissal_mesh::stats::StatsServer;
use log::{error, info, warn};
use std::io::BufRead;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Local UDP address of the stand-in radio.
const ENV_UDP_BIND: &str = "MESH_UDP_BIND";

/// Comma-separated UDP addresses of the neighbours that hear this node.
const ENV_UDP_PEERS: &str = "MESH_UDP_PEERS";

/// Server that scanner lookups go to.
const ENV_SERVER_ID: &str = "MESH_SERVER_ID";

const DEFAULT_UDP_BIND: &str = "127.0.0.1:7000";

/// Interval between server beacons.
const BEACON_INTERVAL: Duration = Duration::from_secs(60);

const BEACON_PAYLOAD: &[u8] = b"server-up";

/// Logs traffic; as a server, splits each request into response records.
struct ConsoleHandler {
    role: NodeRole,
}

impl MeshHandler for ConsoleHandler {
    fn on_message(&self, packet: &Packet, rssi: Option<i32>) {
        info!(
            "{} from {}: {:?} (rssi {:?})",
            packet.packet_type,
            packet.source_node,
            String::from_utf8_lossy(&packet.payload),
            rssi
        );
    }

    fn on_request(&self, packet: &Packet) -> Vec<Vec<u8>> {
        if self.role != NodeRole::Server {
            return Vec::new();
        }
        String::from_utf8_lossy(&packet.payload)
            .split(',')
            .map(|part| part.trim().as_bytes().to_vec())
            .collect()
    }

    fn on_forward(&self, packet: &Packet, rssi: Option<i32>) {
        info!("Relayed {} (rssi {:?})", packet, rssi);
    }
}

/// Broadcast a beacon every `period` until `cancel` fires.
///
/// Transmitting sleeps through the collision-avoidance delay, so each beacon
/// runs on the blocking pool.
async fn beacon_loop(node: Arc<MeshNode>, cancel: CancellationToken, period: Duration) {
    let mut timer = tokio::time::interval(period);
    timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = timer.tick() => {
                let node = node.clone();
                let sent = tokio::task::spawn_blocking(move || node.beacon(BEACON_PAYLOAD.to_vec())).await;
                match sent {
                    Ok(true) => {}
                    Ok(false) => warn!("Beacon not sent"),
                    Err(e) => error!("Beacon task error: {}", e),
                }
            }
        }
    }
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn open_radio() -> Result<UdpRadio, String> {
    let bind: SocketAddr = env_or(ENV_UDP_BIND, DEFAULT_UDP_BIND)
        .parse()
        .map_err(|e| format!("{}: {}", ENV_UDP_BIND, e))?;
    let peers =
        parse_peers(&env_or(ENV_UDP_PEERS, "")).map_err(|e| format!("{}: {}", ENV_UDP_PEERS, e))?;
    if peers.is_empty() {
        warn!("{} is empty; nobody will hear this node", ENV_UDP_PEERS);
    }
    UdpRadio::bind(bind, peers).map_err(|e| format!("cannot bind {}: {}", bind, e))
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("=== Dismissal mesh node starting ===");

    let config = match NodeConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Refusing to start: {}", e);
            std::process::exit(1);
        }
    };
    info!(
        "Node {} as {}, LoRa {} MHz SF{} (simulated over UDP)",
        config.node_id, config.role, FREQUENCY_MHZ, SPREADING_FACTOR
    );

    let radio = match open_radio() {
        Ok(radio) => radio,
        Err(e) => {
            error!("Radio unavailable: {}", e);
            std::process::exit(1);
        }
    };

    let handler = Arc::new(ConsoleHandler { role: config.role });
    let node = match MeshNode::start(&config, Box::new(radio), handler) {
        Ok(node) => Arc::new(node),
        Err(e) => {
            error!("Refusing to start: {}", e);
            std::process::exit(1);
        }
    };
    let cancel = node.cancel_token();

    let _stats_server = config.stats_port.and_then(|port| {
        match StatsServer::start(None, port, node.stats()) {
            Ok(server) => Some(server),
            Err(e) => {
                warn!("Failed to start stats server: {}", e);
                None
            }
        }
    });

    node.announce();

    let worker_node = node.clone();
    let worker_cancel = cancel.clone();
    let role = config.role;
    let server_id: u16 = env_or(ENV_SERVER_ID, "1").parse().unwrap_or(1);
    let worker = tokio::spawn(async move {
        match role {
            NodeRole::Scanner => {
                let result = tokio::task::spawn_blocking(move || {
                    info!("Type a lookup and press Enter (Ctrl+C to exit)");
                    for line in std::io::stdin().lock().lines() {
                        if worker_cancel.is_cancelled() {
                            break;
                        }
                        let Ok(line) = line else { break };
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        match worker_node.request(server_id, line.as_bytes().to_vec()) {
                            Ok(records) => {
                                for (i, record) in records.iter().enumerate() {
                                    info!(
                                        "  [{}] {}",
                                        i + 1,
                                        String::from_utf8_lossy(record)
                                    );
                                }
                            }
                            Err(e) => error!("Lookup failed: {}", e),
                        }
                    }
                })
                .await;
                if let Err(e) = result {
                    error!("Stdin task error: {}", e);
                }
            }
            NodeRole::Server => beacon_loop(worker_node, worker_cancel, BEACON_INTERVAL).await,
            NodeRole::Repeater => worker_cancel.cancelled().await,
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
            cancel.cancel();
        }
        _ = cancel.cancelled() => {}
    }

    // the scanner's stdin thread may stay blocked on a read; do not wait for it
    if role == NodeRole::Scanner {
        info!("Shutdown complete");
        std::process::exit(0);
    }
    if let Err(e) = worker.await {
        error!("Worker task error: {}", e);
    }
    drop(node);
    info!("Shutdown complete");
}
