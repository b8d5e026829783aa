//! Store-and-forward repeating.
//!
//! A repeater rebroadcasts every admitted packet addressed to someone else,
//! and every admitted broadcast, with one hop less on the clock. Relays are
//! fire-and-forget: the originator owns end-to-end reliability, and a lost
//! relay surfaces as an ACK timeout back at the source.
//!
//! Several repeaters often hear the same packet at once. Each waits its own
//! random delay before relaying so the copies do not collide; the copy heard
//! second is a duplicate everywhere and dies.

use crate::config::NodeRole;
use crate::node::MeshHandler;
use crate::packet::{encode, Packet, FLAG_IS_REPEAT};
use crate::transceiver::{Disposition, Inbound, Transceiver};
use log::{debug, warn};

/// Rewrite `packet` for retransmission by `repeater_id`.
///
/// Only the hop fields change: the sender becomes the repeater, one hop is
/// spent and the repeat flag is set. Source, destination, sequence number,
/// multi-part fields, timestamp and payload are carried over untouched.
pub fn create_repeat(packet: &Packet, repeater_id: u16) -> Packet {
    Packet {
        sender_node: repeater_id,
        ttl: packet.ttl.saturating_sub(1),
        flags: packet.flags | FLAG_IS_REPEAT,
        ..packet.clone()
    }
}

/// Relay policy of one node.
#[derive(Debug, Clone, Copy)]
pub struct ForwardingEngine {
    node_id: u16,
    enabled: bool,
}

impl ForwardingEngine {
    /// Engine for `node_id`; only repeaters relay.
    pub fn new(node_id: u16, role: NodeRole) -> Self {
        Self {
            node_id,
            enabled: role == NodeRole::Repeater,
        }
    }

    /// Whether this node relays at all.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Whether `inbound` should go back on the air.
    pub fn should_relay(&self, inbound: &Inbound) -> bool {
        self.enabled
            && inbound.packet.ttl > 0
            && match inbound.disposition {
                Disposition::Forward => true,
                Disposition::Deliver => inbound.packet.is_broadcast(),
                Disposition::Reack => false,
            }
    }

    /// Relay `inbound` if the policy says so. Returns `true` if the radio
    /// took the repeat.
    pub fn relay(
        &self,
        transceiver: &Transceiver,
        inbound: &Inbound,
        handler: &dyn MeshHandler,
    ) -> bool {
        if !self.should_relay(inbound) {
            return false;
        }

        let repeat = create_repeat(&inbound.packet, self.node_id);
        let frame = match encode(&repeat) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Cannot relay {}: {}", inbound.packet, e);
                return false;
            }
        };

        let delay = transceiver.collision().pre_send_delay();
        let sent = transceiver.transmit(&frame);
        if sent {
            debug!("Relayed {} after {:?}", repeat, delay);
            transceiver.stats().record_forwarded();
            handler.on_forward(&inbound.packet, inbound.rssi);
        } else {
            warn!("Radio refused relay of {}", repeat);
            transceiver.stats().record_tx_failed();
        }
        sent
    }
}
