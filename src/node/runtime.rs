//! A running mesh node.
//!
//! [`MeshNode::start`] spawns the receive loop, the only reader of the radio.
//! Each pass polls the radio once, dispatches whatever it got, then services
//! retry timers for follow-ups this node is sending. Application threads call
//! [`MeshNode::request`] and friends, which transmit on the caller's thread
//! and then block on a condvar that the receive loop signals whenever an ACK
//! or follow-up arrives.

use super::handler::MeshHandler;
use super::state::NodeState;
use crate::clock::{Clock, SystemClock};
use crate::config::{ConfigError, NodeConfig, NodeRole};
use crate::delivery::{
    decode_seq, encode_seq, AckPayload, DeliveryError, DrainStatus, Exchange, ExchangeState,
    FollowupDrain, FollowupQueue, RetryPolicy, Tick, MAX_ACK_DATA,
};
use crate::forwarding::ForwardingEngine;
use crate::lora::Radio;
use crate::packet::{encode, EncodeError, Packet, PacketType, BROADCAST, MAX_PAYLOAD};
use crate::stats::NodeStats;
use crate::transceiver::{Disposition, Inbound, Transceiver};
use log::{debug, error, info, warn};
use std::sync::{Arc, Condvar, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Next move of a thread waiting on an exchange.
enum Step {
    Finished(Result<Vec<Vec<u8>>, DeliveryError>),
    Retransmit(Vec<u8>),
    Wait(Option<u64>),
}

struct Inner {
    transceiver: Transceiver,
    forwarding: ForwardingEngine,
    handler: Arc<dyn MeshHandler>,
    policy: RetryPolicy,
    rx_poll: Duration,
    changed: Condvar,
    cancel: CancellationToken,
}

/// A node attached to the mesh.
///
/// Dropping it stops the receive loop.
pub struct MeshNode {
    inner: Arc<Inner>,
    rx_thread: Option<JoinHandle<()>>,
}

impl MeshNode {
    /// Start a node on the wall clock.
    pub fn start(
        config: &NodeConfig,
        radio: Box<dyn Radio>,
        handler: Arc<dyn MeshHandler>,
    ) -> Result<Self, ConfigError> {
        Self::start_with(
            config,
            radio,
            handler,
            Arc::new(SystemClock::new()),
            CancellationToken::new(),
        )
    }

    /// Start a node with an explicit clock and a cancellation token that
    /// stops the receive loop when cancelled.
    pub fn start_with(
        config: &NodeConfig,
        radio: Box<dyn Radio>,
        handler: Arc<dyn MeshHandler>,
        clock: Arc<dyn Clock>,
        cancel: CancellationToken,
    ) -> Result<Self, ConfigError> {
        let stats = Arc::new(NodeStats::new(config.node_id, config.role));
        let transceiver = Transceiver::new(config, radio, clock, stats)?;
        let inner = Arc::new(Inner {
            transceiver,
            forwarding: ForwardingEngine::new(config.node_id, config.role),
            handler,
            policy: config.retry_policy(),
            rx_poll: config.rx_poll(),
            changed: Condvar::new(),
            cancel,
        });

        let loop_inner = inner.clone();
        let rx_thread = thread::Builder::new()
            .name(format!("mesh-rx-{}", config.node_id))
            .spawn(move || loop_inner.run())
            .map_err(|e| ConfigError::Io(format!("cannot spawn receive loop: {}", e)))?;

        info!("Node {} ({}) joined the mesh", config.node_id, config.role);
        Ok(Self {
            inner,
            rx_thread: Some(rx_thread),
        })
    }

    /// This node's ID.
    pub fn node_id(&self) -> u16 {
        self.inner.transceiver.node_id()
    }

    /// This node's role.
    pub fn role(&self) -> NodeRole {
        self.inner.transceiver.role()
    }

    /// Shared counters.
    pub fn stats(&self) -> Arc<NodeStats> {
        self.inner.transceiver.stats().clone()
    }

    /// Token that stops this node when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// Send `payload` to `dest` as an ACK-requested `DATA` packet and wait
    /// for the complete response.
    ///
    /// Returns every record of the response in order (empty for a bare ACK).
    /// A multi-packet response is returned only once all of it has arrived;
    /// anything less is an error.
    pub fn request(&self, dest: u16, payload: Vec<u8>) -> Result<Vec<Vec<u8>>, DeliveryError> {
        self.send_reliable(dest, PacketType::Data, payload)
    }

    /// Like [`request`](Self::request) with an explicit packet type
    /// (`DATA` or `CMD`).
    pub fn send_reliable(
        &self,
        dest: u16,
        packet_type: PacketType,
        payload: Vec<u8>,
    ) -> Result<Vec<Vec<u8>>, DeliveryError> {
        self.check_unicast(dest)?;
        if payload.len() > MAX_PAYLOAD {
            return Err(DeliveryError::PayloadTooLarge {
                len: payload.len(),
                max: MAX_PAYLOAD,
            });
        }
        let packet = self
            .inner
            .transceiver
            .build(packet_type, dest, payload)
            .with_ack_requested();
        self.inner.run_exchange(packet)
    }

    /// Send without asking for an acknowledgement.
    ///
    /// `true` means the radio took the frame.
    pub fn send(&self, dest: u16, packet_type: PacketType, payload: Vec<u8>) -> bool {
        let packet = self.inner.transceiver.build(packet_type, dest, payload);
        self.inner.transceiver.send(&packet)
    }

    /// Broadcast a `BEACON`.
    pub fn beacon(&self, payload: Vec<u8>) -> bool {
        self.send(BROADCAST, PacketType::Beacon, payload)
    }

    /// Announce a (re)start to `dest` and wait for its `HELLO_ACK`.
    ///
    /// The receiver drops its sequence history for this node, so packets
    /// numbered below what it saw before the restart are accepted again.
    pub fn hello(&self, dest: u16) -> Result<(), DeliveryError> {
        self.check_unicast(dest)?;
        let mut packet = self
            .inner
            .transceiver
            .build(PacketType::Hello, dest, Vec::new())
            .with_ack_requested();
        packet.payload = encode_seq(packet.sequence_num);
        self.inner.run_exchange(packet).map(|_| ())
    }

    /// Broadcast a `HELLO` to every neighbour without waiting for replies.
    pub fn announce(&self) -> bool {
        let mut packet = self
            .inner
            .transceiver
            .build(PacketType::Hello, BROADCAST, Vec::new());
        packet.payload = encode_seq(packet.sequence_num);
        self.inner.transceiver.send(&packet)
    }

    /// Stop the receive loop and wait for it to exit.
    pub fn shutdown(&mut self) {
        self.inner.cancel.cancel();
        self.inner.changed.notify_all();
        if let Some(handle) = self.rx_thread.take() {
            if handle.join().is_err() {
                error!("Receive loop of node {} panicked", self.node_id());
            }
        }
    }

    fn check_unicast(&self, dest: u16) -> Result<(), DeliveryError> {
        if dest == BROADCAST || dest == self.node_id() {
            return Err(DeliveryError::InvalidDestination(dest));
        }
        Ok(())
    }
}

impl Drop for MeshNode {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Inner {
    fn run(&self) {
        info!("Receive loop started");
        while !self.cancel.is_cancelled() {
            if let Some(inbound) = self.transceiver.poll(self.rx_poll) {
                self.dispatch(inbound);
            }
            self.service_timers();
        }
        self.changed.notify_all();
        info!("Receive loop stopped");
    }

    fn lock(&self) -> MutexGuard<'_, NodeState> {
        self.transceiver.state()
    }

    fn node_id(&self) -> u16 {
        self.transceiver.node_id()
    }

    fn now_ms(&self) -> u64 {
        self.transceiver.clock().now_ms()
    }

    fn dispatch(&self, inbound: Inbound) {
        match inbound.disposition {
            Disposition::Forward => {
                self.forwarding
                    .relay(&self.transceiver, &inbound, self.handler.as_ref());
            }
            Disposition::Reack => self.reack(&inbound.packet),
            Disposition::Deliver => {
                if self.forwarding.should_relay(&inbound) {
                    self.forwarding
                        .relay(&self.transceiver, &inbound, self.handler.as_ref());
                }
                self.handle_local(&inbound);
            }
        }
    }

    fn handle_local(&self, inbound: &Inbound) {
        let packet = &inbound.packet;
        let for_me = packet.dest_node == self.node_id();
        match packet.packet_type {
            PacketType::Ack => self.handle_ack(packet),
            PacketType::HelloAck => match decode_seq(&packet.payload) {
                Some(seq) => self.handle_ack_payload(packet.source_node, AckPayload::bare(seq)),
                None => debug!("HELLO_ACK from {} without sequence", packet.source_node),
            },
            PacketType::Hello => {
                if for_me && packet.is_ack_requested() {
                    self.send_ack(packet, PacketType::HelloAck, encode_seq(packet.sequence_num));
                }
            }
            PacketType::Data | PacketType::Cmd
                if for_me && packet.multi_part_index > 0 && packet.multi_part_total > 0 =>
            {
                self.handle_followup(packet);
            }
            PacketType::Data | PacketType::Cmd | PacketType::Beacon => {
                self.handler.on_message(packet, inbound.rssi);
                if for_me && packet.is_ack_requested() {
                    self.answer(packet);
                }
            }
        }
    }

    fn handle_ack(&self, packet: &Packet) {
        match AckPayload::decode(&packet.payload) {
            Some(ack) => self.handle_ack_payload(packet.source_node, ack),
            None => debug!("Malformed ACK from {}", packet.source_node),
        }
    }

    fn handle_ack_payload(&self, from: u16, ack: AckPayload) {
        let acked_seq = ack.acked_seq;
        let release = {
            let mut state = self.lock();
            let now = self.now_ms();
            if let Some(new_state) = state.pending.on_ack(from, ack) {
                self.transceiver.stats().record_ack_received();
                if let ExchangeState::AckedWithFollowup { remaining } = new_state {
                    match state.drains.get_mut(&from) {
                        Some(drain) => drain.confirm_expected(remaining),
                        None => {
                            let drain = FollowupDrain::new(from, remaining, &self.policy, now);
                            state.drains.insert(from, drain);
                        }
                    }
                }
                false
            } else if let Some(queue) = state.outgoing.get_mut(&from) {
                let matched = queue.on_ack(acked_seq);
                if matched {
                    self.transceiver.stats().record_ack_received();
                } else {
                    debug!("ACK {} from {} matches no follow-up", acked_seq, from);
                }
                matched
            } else {
                debug!("Unsolicited ACK {} from {}", acked_seq, from);
                false
            }
        };
        self.changed.notify_all();
        if release {
            self.release_followup(from);
        }
    }

    fn handle_followup(&self, packet: &Packet) {
        self.send_ack(
            packet,
            PacketType::Ack,
            AckPayload::bare(packet.sequence_num).encode(),
        );
        {
            let mut state = self.lock();
            let now = self.now_ms();
            let from = packet.source_node;
            let drain = state.drains.entry(from).or_insert_with(|| {
                FollowupDrain::new(from, packet.multi_part_total - 1, &self.policy, now)
            });
            if drain.accept(
                packet.multi_part_index,
                packet.multi_part_total,
                packet.payload.clone(),
                now,
            ) {
                debug!(
                    "Follow-up {}/{} from {}",
                    packet.multi_part_index, packet.multi_part_total, from
                );
            }
        }
        self.changed.notify_all();
    }

    /// Answer an ACK-requested packet with the handler's response records.
    fn answer(&self, packet: &Packet) {
        let from = packet.source_node;
        let mut records = self.handler.on_request(packet);
        let mut first = if records.is_empty() {
            Vec::new()
        } else {
            records.remove(0)
        };
        if first.len() > MAX_ACK_DATA {
            warn!(
                "Response record of {} bytes truncated to {}",
                first.len(),
                MAX_ACK_DATA
            );
            first.truncate(MAX_ACK_DATA);
        }

        let queue = FollowupQueue::new(from, records, self.policy);
        let remaining = queue.remaining() as u8;
        let ack = AckPayload {
            acked_seq: packet.sequence_num,
            remaining,
            data: first,
        };
        self.send_ack(packet, PacketType::Ack, ack.encode());

        if remaining > 0 {
            info!("Sending {} follow-up(s) to {}", remaining, from);
            if self.lock().outgoing.insert(from, queue).is_some() {
                warn!("Abandoned unfinished follow-ups to {}", from);
            }
            self.release_followup(from);
        }
    }

    /// Send an ACK-type reply to `to` and remember it for re-acknowledgement.
    fn send_ack(&self, to: &Packet, kind: PacketType, payload: Vec<u8>) {
        let reply = self.transceiver.build(kind, to.source_node, payload);
        let frame = match encode(&reply) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Cannot encode {} for {}: {}", kind, to.source_node, e);
                return;
            }
        };
        self.lock()
            .ack_cache
            .insert(to.source_node, to.sequence_num, frame.clone());
        if self.transceiver.send_frame(&frame) {
            self.transceiver.stats().record_ack_sent();
        }
    }

    fn reack(&self, packet: &Packet) {
        let frame = self
            .lock()
            .ack_cache
            .get(packet.source_node, packet.sequence_num)
            .map(<[u8]>::to_vec);
        match frame {
            Some(frame) => {
                debug!(
                    "Re-acknowledging {}:{}",
                    packet.source_node, packet.sequence_num
                );
                if self.transceiver.send_frame(&frame) {
                    self.transceiver.stats().record_reack();
                }
            }
            None => debug!(
                "No cached ACK for {}:{}",
                packet.source_node, packet.sequence_num
            ),
        }
    }

    /// Put the next queued follow-up for `peer` on the air, if none is in
    /// flight.
    fn release_followup(&self, peer: u16) {
        let frame = {
            let mut state = self.lock();
            let Some((index, total, payload)) = state
                .outgoing
                .get_mut(&peer)
                .and_then(FollowupQueue::next_part)
            else {
                return;
            };
            let sequence = state.counter.next();
            let mut packet = Packet::new(PacketType::Data, self.node_id(), peer, sequence, payload)
                .with_ttl(self.transceiver.default_ttl())
                .with_ack_requested()
                .with_multi_part(index, total);
            if packet.truncate_payload(MAX_PAYLOAD) {
                warn!("Follow-up {}/{} to {} truncated", index, total, peer);
            }
            let frame = match encode(&packet) {
                Ok(frame) => frame,
                Err(e) => {
                    error!("Dropping follow-ups to {}: {}", peer, e);
                    state.outgoing.remove(&peer);
                    return;
                }
            };
            if let Some(queue) = state.outgoing.get_mut(&peer) {
                queue.launch(sequence, frame.clone(), self.now_ms());
            }
            frame
        };
        if !self.transceiver.send_frame(&frame) {
            warn!("Radio refused follow-up to {}; retrying on timer", peer);
            if let Some(queue) = self.lock().outgoing.get_mut(&peer) {
                queue.note_refused();
            }
        }
    }

    fn service_timers(&self) {
        let mut resend = Vec::new();
        let mut release = Vec::new();
        {
            let mut state = self.lock();
            let now = self.now_ms();
            let mut finished = Vec::new();
            for (&peer, queue) in state.outgoing.iter_mut() {
                match queue.on_tick(now) {
                    Tick::Retransmit { frame, .. } => {
                        self.transceiver.stats().record_retry();
                        resend.push((peer, frame));
                    }
                    Tick::Failed(e) => {
                        error!("Follow-ups to {} failed: {}", peer, e);
                        self.transceiver.stats().record_failure();
                        finished.push(peer);
                    }
                    Tick::Idle { .. } => {
                        if queue.is_done() {
                            finished.push(peer);
                        } else if matches!(queue.state(), ExchangeState::AckedWithFollowup { .. })
                        {
                            release.push(peer);
                        }
                    }
                }
            }
            for peer in finished {
                state.outgoing.remove(&peer);
            }
            state.drains.retain(|peer, drain| {
                let stale = drain.is_stale(now);
                if stale {
                    debug!("Discarding unclaimed follow-ups from {}", peer);
                }
                !stale
            });
        }

        for (peer, frame) in resend {
            let sent = self.transceiver.send_frame(&frame);
            let now = self.now_ms();
            if let Some(queue) = self.lock().outgoing.get_mut(&peer) {
                queue.mark_resent(now);
                if !sent {
                    warn!("Radio refused follow-up retry to {}", peer);
                    queue.note_refused();
                }
            }
        }
        for peer in release {
            self.release_followup(peer);
        }
    }

    /// Transmit `packet`, then wait for its ACK and any follow-ups.
    fn run_exchange(&self, packet: Packet) -> Result<Vec<Vec<u8>>, DeliveryError> {
        let dest = packet.dest_node;
        let sequence = packet.sequence_num;
        let frame = encode(&packet).map_err(|e| match e {
            EncodeError::PayloadTooLarge { len, max } => DeliveryError::PayloadTooLarge { len, max },
        })?;

        {
            let mut state = self.lock();
            state.drains.remove(&dest);
            state
                .pending
                .insert(Exchange::new(dest, sequence, frame.clone(), self.policy));
        }
        debug!("TX {} (awaiting ACK)", packet);
        self.transmit_attempt(dest, sequence, &frame);

        let result = self.await_exchange(dest, sequence);

        let mut state = self.lock();
        state.pending.remove(dest, sequence);
        if result.is_err() {
            state.drains.remove(&dest);
            self.transceiver.stats().record_failure();
        }
        result
    }

    fn transmit_attempt(&self, dest: u16, sequence: u16, frame: &[u8]) {
        let sent = self.transceiver.send_frame(frame);
        let now = self.now_ms();
        if let Some(exchange) = self.lock().pending.get_mut(dest, sequence) {
            exchange.mark_sent(now);
            if !sent {
                warn!("Radio refused seq {} to {}; retrying on timer", sequence, dest);
                exchange.note_refused();
            }
        }
    }

    fn await_exchange(&self, dest: u16, sequence: u16) -> Result<Vec<Vec<u8>>, DeliveryError> {
        let poll_ms = self.rx_poll.as_millis().max(1) as u64;
        let mut state = self.lock();
        loop {
            if self.cancel.is_cancelled() {
                return Err(DeliveryError::Stopped);
            }
            let now = self.now_ms();
            let step = Self::step(&mut state, dest, sequence, now);
            let until = match step {
                Step::Finished(result) => {
                    if let Err(e) = &result {
                        error!("Exchange with {} failed: {}", dest, e);
                    }
                    return result;
                }
                Step::Retransmit(frame) => {
                    self.transceiver.stats().record_retry();
                    drop(state);
                    self.transmit_attempt(dest, sequence, &frame);
                    state = self.lock();
                    continue;
                }
                Step::Wait(until) => until,
            };

            let wait_ms = until.map_or(poll_ms, |t| t.saturating_sub(now).clamp(1, poll_ms));
            state = match self
                .changed
                .wait_timeout(state, Duration::from_millis(wait_ms))
            {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    fn step(state: &mut NodeState, dest: u16, sequence: u16, now: u64) -> Step {
        let Some(exchange) = state.pending.get_mut(dest, sequence) else {
            return Step::Finished(Err(DeliveryError::Stopped));
        };
        match exchange.state() {
            ExchangeState::AckedNoFollowup => {
                let data = exchange.take_ack().map(|ack| ack.data).unwrap_or_default();
                Step::Finished(Ok(if data.is_empty() { Vec::new() } else { vec![data] }))
            }
            ExchangeState::AckedWithFollowup { remaining } => {
                let first = exchange
                    .ack()
                    .map(|ack| ack.data.clone())
                    .unwrap_or_default();
                let Some(drain) = state.drains.get_mut(&dest) else {
                    return Step::Finished(Err(DeliveryError::IncompleteSequence {
                        expected: remaining,
                        received: 0,
                    }));
                };
                match drain.poll(now) {
                    DrainStatus::Pending { deadline_ms } => Step::Wait(Some(deadline_ms)),
                    DrainStatus::Complete(rest) => {
                        state.drains.remove(&dest);
                        let mut records = Vec::with_capacity(rest.len() + 1);
                        records.push(first);
                        records.extend(rest);
                        Step::Finished(Ok(records))
                    }
                    DrainStatus::Failed(e) => Step::Finished(Err(e)),
                }
            }
            _ => match exchange.on_tick(now) {
                Tick::Idle { until_ms } => Step::Wait(until_ms),
                Tick::Retransmit { frame, .. } => Step::Retransmit(frame),
                Tick::Failed(e) => Step::Finished(Err(e)),
            },
        }
    }
}
