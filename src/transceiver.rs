//! Packet-level access to the radio.
//!
//! The [`Transceiver`] owns the radio and the node's shared protocol state.
//! Outbound it encodes packets and hands frames to the radio behind the
//! collision-avoidance delay. Inbound it strips the hardware header, decodes,
//! and runs admission, so nothing above it ever sees a corrupt, looped,
//! duplicate or expired frame.
//!
//! # Half-Duplex Management
//!
//! One mutex guards the radio for both directions. The receive loop holds it
//! only for one short poll at a time and steps aside whenever a transmitter
//! is waiting, so TX takes priority over RX.

use crate::clock::Clock;
use crate::config::{ConfigError, NodeConfig, NodeRole};
use crate::delivery::decode_seq;
use crate::lora::{AirtimeParams, CollisionAvoidance, Radio};
use crate::node::NodeState;
use crate::packet::{decode, encode, Packet, PacketType, BROADCAST};
use crate::sequence::{Decision, RejectReason};
use crate::stats::NodeStats;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// How the receive loop should treat an admitted frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Addressed to this node or broadcast.
    Deliver,
    /// Addressed elsewhere; this node relays it.
    Forward,
    /// A retransmission of something this node already acknowledged.
    Reack,
}

/// A frame that survived decoding and admission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    /// The packet as received.
    pub packet: Packet,
    /// Signal strength of the frame.
    pub rssi: Option<i32>,
    /// What to do with it.
    pub disposition: Disposition,
}

/// Encodes, transmits, receives and admits packets for one node.
pub struct Transceiver {
    radio: Mutex<Box<dyn Radio>>,
    tx_waiting: AtomicUsize,
    state: Arc<Mutex<NodeState>>,
    collision: CollisionAvoidance,
    airtime: AirtimeParams,
    clock: Arc<dyn Clock>,
    stats: Arc<NodeStats>,
    node_id: u16,
    role: NodeRole,
    default_ttl: u8,
    hw_header_len: usize,
    relay_holdoff_ms: u64,
}

impl Transceiver {
    /// Create a transceiver for the node described by `config`.
    pub fn new(
        config: &NodeConfig,
        radio: Box<dyn Radio>,
        clock: Arc<dyn Clock>,
        stats: Arc<NodeStats>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let collision = CollisionAvoidance::new(config.collision_config(), clock.clone())
            .map_err(|_| ConfigError::InvalidConfig("invalid collision-avoidance window"))?;
        let state = NodeState::new(config)?;
        info!(
            "Transceiver up: node {} ({}), first sequence after {}",
            config.node_id,
            config.role,
            state.counter.current()
        );
        Ok(Self {
            radio: Mutex::new(radio),
            tx_waiting: AtomicUsize::new(0),
            state: Arc::new(Mutex::new(state)),
            collision,
            airtime: AirtimeParams::default(),
            clock,
            stats,
            node_id: config.node_id,
            role: config.role,
            default_ttl: config.default_ttl,
            hw_header_len: config.hw_header_len,
            relay_holdoff_ms: config.relay_holdoff().as_millis() as u64,
        })
    }

    /// This node's ID.
    pub fn node_id(&self) -> u16 {
        self.node_id
    }

    /// This node's role.
    pub fn role(&self) -> NodeRole {
        self.role
    }

    /// Hop budget of packets this node originates.
    pub fn default_ttl(&self) -> u8 {
        self.default_ttl
    }

    /// Time source.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Transmit timing.
    pub fn collision(&self) -> &CollisionAvoidance {
        &self.collision
    }

    /// Counters.
    pub fn stats(&self) -> &Arc<NodeStats> {
        &self.stats
    }

    /// The mutex guarding shared protocol state, for waiting on a condvar.
    pub fn state_mutex(&self) -> &Mutex<NodeState> {
        &self.state
    }

    /// Lock the shared protocol state.
    pub fn state(&self) -> MutexGuard<'_, NodeState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            warn!("Node state mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Advance and return this node's outgoing sequence number.
    pub fn next_sequence(&self) -> u16 {
        self.state().counter.next()
    }

    /// A fresh packet from this node with the next sequence number and the
    /// configured TTL.
    pub fn build(&self, packet_type: PacketType, dest: u16, payload: Vec<u8>) -> Packet {
        Packet::new(packet_type, self.node_id, dest, self.next_sequence(), payload)
            .with_ttl(self.default_ttl)
    }

    /// Encode and transmit `packet`.
    ///
    /// `true` means the radio took the frame, not that anyone heard it.
    pub fn send(&self, packet: &Packet) -> bool {
        match encode(packet) {
            Ok(frame) => {
                debug!("TX {}", packet);
                self.send_frame(&frame)
            }
            Err(e) => {
                warn!("Not sending {}: {}", packet, e);
                false
            }
        }
    }

    /// Transmit an encoded frame after the collision-avoidance delay,
    /// backing off while the radio refuses it.
    pub fn send_frame(&self, frame: &[u8]) -> bool {
        let max_retries = self.collision.config().max_retries;
        match self
            .collision
            .send_with_backoff(frame, max_retries, |f| self.transmit(f))
        {
            Ok(_) => true,
            Err(e) => {
                warn!("Transmit failed: {}", e);
                self.stats.record_tx_failed();
                false
            }
        }
    }

    /// Hand a frame to the radio now, with no delay.
    pub fn transmit(&self, frame: &[u8]) -> bool {
        self.tx_waiting.fetch_add(1, Ordering::AcqRel);
        let accepted = self.lock_radio().send(frame);
        self.tx_waiting.fetch_sub(1, Ordering::AcqRel);
        if accepted {
            self.stats.record_tx(self.airtime.airtime(frame.len()));
        }
        accepted
    }

    /// Wait up to `timeout` for a packet that passes admission.
    ///
    /// Corrupt and rejected frames are logged and yield `None`, as do
    /// retransmissions this node already acknowledged.
    pub fn receive(&self, timeout: Duration) -> Option<Packet> {
        self.poll(timeout)
            .filter(|inbound| inbound.disposition != Disposition::Reack)
            .map(|inbound| inbound.packet)
    }

    /// Wait up to `timeout` for a frame and run it through decoding and
    /// admission.
    pub fn poll(&self, timeout: Duration) -> Option<Inbound> {
        if self.tx_waiting.load(Ordering::Acquire) > 0 {
            std::thread::yield_now();
            return None;
        }

        let (raw, rssi) = {
            let mut radio = self.lock_radio();
            let raw = radio.receive(timeout)?;
            (raw, radio.last_rssi())
        };
        self.stats.record_rx();

        let frame = match raw.get(self.hw_header_len..) {
            Some(frame) => frame,
            None => {
                debug!("Frame of {} bytes shorter than hardware header", raw.len());
                self.stats.record_corrupt();
                return None;
            }
        };

        let packet = match decode(frame) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("Dropped frame: {}", e);
                self.stats.record_corrupt();
                return None;
            }
        };

        self.admit(packet, rssi)
    }

    fn admit(&self, packet: Packet, rssi: Option<i32>) -> Option<Inbound> {
        let now = self.clock.now_ms();
        let (decision, relay_again) = {
            let mut state = self.state();
            let source = packet.source_node;
            if packet.packet_type == PacketType::Hello && source != self.node_id {
                // a HELLO inside the current window is a late copy, not a restart
                let restarted = state.tracker.latest(source).is_some()
                    && !state.tracker.is_recent(source, packet.sequence_num);
                if restarted {
                    info!(
                        "HELLO from {} (baseline {:?}), clearing its sequence history",
                        source,
                        decode_seq(&packet.payload)
                    );
                    state.tracker.reset_peer(source);
                }
            }
            let decision = state.tracker.admit(&packet);
            let relay_again = match decision {
                Decision::ForwardOnly => {
                    state.relays.note(source, packet.sequence_num, now);
                    false
                }
                Decision::Reject(RejectReason::Duplicate) if self.may_relay_retry(&packet) => state
                    .relays
                    .permits_relay(source, packet.sequence_num, now, self.relay_holdoff_ms),
                _ => false,
            };
            (decision, relay_again)
        };

        let disposition = match decision {
            Decision::Accept => {
                self.stats.record_accepted();
                Disposition::Deliver
            }
            Decision::ForwardOnly => Disposition::Forward,
            Decision::Reject(RejectReason::Duplicate) if relay_again => {
                debug!("Relaying retransmission of {}", packet);
                Disposition::Forward
            }
            Decision::Reject(RejectReason::Duplicate)
                if packet.dest_node == self.node_id && packet.is_ack_requested() =>
            {
                debug!("Retransmission of {}", packet);
                self.stats.record_drop(RejectReason::Duplicate);
                Disposition::Reack
            }
            Decision::Reject(reason) => {
                debug!("Dropped {}: {}", packet, reason);
                self.stats.record_drop(reason);
                return None;
            }
        };

        debug!("RX {} rssi={:?} -> {:?}", packet, rssi, disposition);
        Some(Inbound {
            packet,
            rssi,
            disposition,
        })
    }

    /// Unicast traffic for someone else that its originator retransmits on
    /// a missing ACK: ACK-requested packets and the ACKs answering them.
    fn may_relay_retry(&self, packet: &Packet) -> bool {
        self.role == NodeRole::Repeater
            && packet.ttl > 0
            && packet.dest_node != self.node_id
            && packet.dest_node != BROADCAST
            && (packet.is_ack_requested()
                || matches!(packet.packet_type, PacketType::Ack | PacketType::HelloAck))
    }

    fn lock_radio(&self) -> MutexGuard<'_, Box<dyn Radio>> {
        self.radio.lock().unwrap_or_else(|poisoned| {
            warn!("Radio mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::lora::{SimRadio, SimulatedChannel};
    use crate::packet::encode;
    use std::sync::atomic::Ordering;

    const WAIT: Duration = Duration::from_millis(50);

    fn transceiver(node_id: u16, role: NodeRole, radio: SimRadio) -> Transceiver {
        let config = NodeConfig::new(node_id, role).unwrap();
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new());
        let stats = Arc::new(NodeStats::new(node_id, role));
        Transceiver::new(&config, Box::new(radio), clock, stats).unwrap()
    }

    fn transceiver_with_clock(
        node_id: u16,
        role: NodeRole,
        radio: SimRadio,
    ) -> (Transceiver, Arc<ManualClock>) {
        let config = NodeConfig::new(node_id, role).unwrap();
        let clock = Arc::new(ManualClock::new());
        let stats = Arc::new(NodeStats::new(node_id, role));
        let t = Transceiver::new(&config, Box::new(radio), clock.clone(), stats).unwrap();
        (t, clock)
    }

    fn raw_frame(packet: &Packet) -> Vec<u8> {
        encode(packet).unwrap()
    }

    #[test]
    fn test_send_and_receive() {
        let channel = SimulatedChannel::new();
        let scanner = transceiver(102, NodeRole::Scanner, channel.attach());
        let server = transceiver(1, NodeRole::Server, channel.attach());

        let packet = scanner.build(PacketType::Data, 1, b"lookup".to_vec());
        assert!(scanner.send(&packet));

        let received = server.receive(WAIT).unwrap();
        assert_eq!(received, packet);
        assert_eq!(server.stats().accepted.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_next_sequence_increments() {
        let channel = SimulatedChannel::new();
        let t = transceiver(102, NodeRole::Scanner, channel.attach());
        let a = t.next_sequence();
        let b = t.next_sequence();
        assert_eq!(b, a.wrapping_add(1));
    }

    #[test]
    fn test_corrupt_frame_filtered() {
        let channel = SimulatedChannel::new();
        let mut noise = channel.attach();
        let server = transceiver(1, NodeRole::Server, channel.attach());

        let mut frame = raw_frame(&Packet::new(PacketType::Data, 102, 1, 5, vec![1]));
        frame[10] ^= 0x40;
        noise.send(&frame);
        noise.send(&[0xFF; 3]);

        assert_eq!(server.receive(WAIT), None);
        assert_eq!(server.receive(WAIT), None);
        assert_eq!(server.stats().dropped_corrupt.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_hardware_header_stripped() {
        let channel = SimulatedChannel::new();
        let mut raw = channel.attach();
        let config = NodeConfig {
            hw_header_len: 4,
            ..NodeConfig::new(1, NodeRole::Server).unwrap()
        };
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new());
        let stats = Arc::new(NodeStats::new(1, NodeRole::Server));
        let server = Transceiver::new(&config, Box::new(channel.attach()), clock, stats).unwrap();

        let packet = Packet::new(PacketType::Data, 102, 1, 5, b"x".to_vec());
        let mut frame = vec![0xFF, 0xFF, 0x00, 0x00];
        frame.extend(raw_frame(&packet));
        raw.send(&frame);

        assert_eq!(server.receive(WAIT), Some(packet));
    }

    #[test]
    fn test_duplicate_ack_requested_is_reack() {
        let channel = SimulatedChannel::new();
        let mut raw = channel.attach();
        let server = transceiver(1, NodeRole::Server, channel.attach());

        let frame = raw_frame(&Packet::new(PacketType::Data, 102, 1, 5, vec![]).with_ack_requested());
        raw.send(&frame);
        raw.send(&frame);

        assert_eq!(server.poll(WAIT).unwrap().disposition, Disposition::Deliver);
        assert_eq!(server.poll(WAIT).unwrap().disposition, Disposition::Reack);
    }

    #[test]
    fn test_duplicate_without_ack_request_dropped() {
        let channel = SimulatedChannel::new();
        let mut raw = channel.attach();
        let server = transceiver(1, NodeRole::Server, channel.attach());

        let frame = raw_frame(&Packet::new(PacketType::Data, 102, 1, 5, vec![]));
        raw.send(&frame);
        raw.send(&frame);

        assert!(server.poll(WAIT).is_some());
        assert!(server.poll(WAIT).is_none());
        assert_eq!(server.stats().dropped_duplicate.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_repeater_gets_forward_disposition() {
        let channel = SimulatedChannel::new();
        let mut raw = channel.attach();
        let repeater = transceiver(200, NodeRole::Repeater, channel.attach());

        raw.send(&raw_frame(&Packet::new(PacketType::Data, 102, 1, 5, vec![])));
        assert_eq!(repeater.poll(WAIT).unwrap().disposition, Disposition::Forward);
    }

    #[test]
    fn test_repeater_relays_retransmission_after_holdoff() {
        let channel = SimulatedChannel::new();
        let mut raw = channel.attach();
        let (repeater, clock) = transceiver_with_clock(200, NodeRole::Repeater, channel.attach());

        let request = raw_frame(&Packet::new(PacketType::Data, 102, 1, 5, vec![]).with_ack_requested());
        raw.send(&request);
        assert_eq!(repeater.poll(WAIT).unwrap().disposition, Disposition::Forward);

        // an echo right after the relay is dropped
        raw.send(&request);
        assert!(repeater.poll(WAIT).is_none());
        assert_eq!(repeater.stats().dropped_duplicate.load(Ordering::Relaxed), 1);

        // the originator's retry after its ACK timeout goes through again
        clock.advance(Duration::from_millis(1_500));
        raw.send(&request);
        assert_eq!(repeater.poll(WAIT).unwrap().disposition, Disposition::Forward);

        let ack = raw_frame(&Packet::new(PacketType::Ack, 1, 102, 77, vec![0, 5, 0]));
        raw.send(&ack);
        assert_eq!(repeater.poll(WAIT).unwrap().disposition, Disposition::Forward);
        clock.advance(Duration::from_millis(1_500));
        raw.send(&ack);
        assert_eq!(repeater.poll(WAIT).unwrap().disposition, Disposition::Forward);
    }

    #[test]
    fn test_repeater_does_not_rerelay_unacknowledged_traffic() {
        let channel = SimulatedChannel::new();
        let mut raw = channel.attach();
        let (repeater, clock) = transceiver_with_clock(200, NodeRole::Repeater, channel.attach());

        let frame = raw_frame(&Packet::new(PacketType::Data, 102, 1, 6, vec![]));
        raw.send(&frame);
        assert_eq!(repeater.poll(WAIT).unwrap().disposition, Disposition::Forward);
        clock.advance(Duration::from_secs(5));
        raw.send(&frame);
        assert!(repeater.poll(WAIT).is_none());
    }

    #[test]
    fn test_late_hello_copy_keeps_history() {
        let channel = SimulatedChannel::new();
        let mut raw = channel.attach();
        let server = transceiver(1, NodeRole::Server, channel.attach());

        let hello = Packet::new(PacketType::Hello, 102, BROADCAST, 10, vec![0, 10]);
        let data = Packet::new(PacketType::Data, 102, 1, 11, b"qr".to_vec());
        raw.send(&raw_frame(&hello));
        raw.send(&raw_frame(&data));
        raw.send(&raw_frame(&crate::forwarding::create_repeat(&hello, 200)));
        raw.send(&raw_frame(&crate::forwarding::create_repeat(&data, 200)));

        assert_eq!(server.receive(WAIT), Some(hello));
        assert_eq!(server.receive(WAIT), Some(data));
        assert_eq!(server.receive(WAIT), None);
        assert_eq!(server.receive(WAIT), None);
        assert_eq!(server.stats().dropped_duplicate.load(Ordering::Relaxed), 2);
        assert_eq!(server.stats().accepted.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_hello_with_new_baseline_resets_peer() {
        let channel = SimulatedChannel::new();
        let mut raw = channel.attach();
        let server = transceiver(1, NodeRole::Server, channel.attach());

        raw.send(&raw_frame(&Packet::new(PacketType::Data, 102, 1, 900, vec![])));
        assert!(server.receive(WAIT).is_some());

        // rebooted scanner starts lower; without the HELLO this would be stale
        let hello = Packet::new(PacketType::Hello, 102, BROADCAST, 10, vec![0, 10]);
        raw.send(&raw_frame(&hello));
        assert_eq!(server.receive(WAIT), Some(hello));

        raw.send(&raw_frame(&Packet::new(PacketType::Data, 102, 1, 11, vec![])));
        assert!(server.receive(WAIT).is_some());
    }

    #[test]
    fn test_repeated_hello_is_duplicate() {
        let channel = SimulatedChannel::new();
        let mut raw = channel.attach();
        let server = transceiver(1, NodeRole::Server, channel.attach());

        let hello = raw_frame(&Packet::new(PacketType::Hello, 102, BROADCAST, 10, vec![0, 10]));
        raw.send(&hello);
        raw.send(&hello);
        assert!(server.receive(WAIT).is_some());
        assert!(server.receive(WAIT).is_none());
    }

    #[test]
    fn test_oversized_packet_not_sent() {
        let channel = SimulatedChannel::new();
        let t = transceiver(102, NodeRole::Scanner, channel.attach());
        let packet = t.build(PacketType::Data, 1, vec![0; 300]);
        assert!(!t.send(&packet));
        assert!(channel.transmissions().is_empty());
    }
}
