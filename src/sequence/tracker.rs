//! Admission policy for received packets.
//!
//! Every frame heard on the shared channel passes through
//! [`SequenceTracker::admit`] before anything else looks at it. The checks run
//! in a fixed order:
//!
//! 1. I originated it: the packet looped back to me
//! 2. I am a repeater and I was the last hop: my own relay came back
//! 3. `(source, sequence)` already admitted: duplicate
//! 4. TTL exhausted
//! 5. Addressed to someone else: repeaters forward, everyone else drops
//! 6. Otherwise accept
//!
//! Admitted and forwarded packets are both recorded, so a repeater that hears
//! two copies of the same packet relays only the first.

use super::window::ReplayWindow;
use crate::config::NodeRole;
use crate::packet::{Packet, BROADCAST};
use std::collections::HashMap;
use std::fmt;

/// Configuration for the seen cache.
#[derive(Debug, Clone, Copy)]
pub struct SeenCacheConfig {
    /// Number of peers tracked before the oldest half is evicted.
    pub max_peers: usize,
}

impl Default for SeenCacheConfig {
    fn default() -> Self {
        Self { max_peers: 1_000 }
    }
}

impl SeenCacheConfig {
    /// Validate configuration parameters.
    pub fn validate(&self) -> Result<(), SeenCacheError> {
        if self.max_peers < 2 {
            return Err(SeenCacheError::InvalidConfig("max_peers must be at least 2"));
        }
        Ok(())
    }
}

/// Error type for seen cache operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeenCacheError {
    /// Invalid configuration parameter.
    InvalidConfig(&'static str),
}

impl fmt::Display for SeenCacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConfig(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for SeenCacheError {}

#[derive(Debug, Clone)]
struct PeerEntry {
    window: ReplayWindow,
    /// Logical time of the last update, for eviction.
    touched: u64,
}

/// Bounded per-source record of admitted sequence numbers.
#[derive(Debug)]
pub struct SeenCache {
    config: SeenCacheConfig,
    peers: HashMap<u16, PeerEntry>,
    clock: u64,
}

impl Default for SeenCache {
    fn default() -> Self {
        Self {
            config: SeenCacheConfig::default(),
            peers: HashMap::new(),
            clock: 0,
        }
    }
}

impl SeenCache {
    /// Create an empty cache.
    pub fn new(config: SeenCacheConfig) -> Result<Self, SeenCacheError> {
        config.validate()?;
        Ok(Self {
            config,
            peers: HashMap::new(),
            clock: 0,
        })
    }

    /// Whether `(source, seq)` has already been admitted.
    pub fn contains(&self, source: u16, seq: u16) -> bool {
        self.peers
            .get(&source)
            .is_some_and(|entry| entry.window.is_duplicate(seq))
    }

    /// Record `(source, seq)` as admitted.
    pub fn record(&mut self, source: u16, seq: u16) {
        self.clock += 1;
        let touched = self.clock;
        self.peers
            .entry(source)
            .and_modify(|entry| {
                entry.window.record(seq);
                entry.touched = touched;
            })
            .or_insert_with(|| PeerEntry {
                window: ReplayWindow::new(seq),
                touched,
            });

        if self.peers.len() > self.config.max_peers {
            self.evict_oldest_half();
        }
    }

    /// Latest admitted sequence for `source`, if tracked.
    pub fn latest(&self, source: u16) -> Option<u16> {
        self.peers.get(&source).map(|entry| entry.window.latest())
    }

    /// Whether `seq` falls inside the replay window of `source`.
    pub fn is_recent(&self, source: u16, seq: u16) -> bool {
        self.peers
            .get(&source)
            .is_some_and(|entry| entry.window.in_window(seq))
    }

    /// Forget everything about `source`.
    pub fn forget(&mut self, source: u16) -> bool {
        self.peers.remove(&source).is_some()
    }

    /// Number of tracked peers.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Whether no peer is tracked.
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    fn evict_oldest_half(&mut self) {
        let mut ages: Vec<u64> = self.peers.values().map(|entry| entry.touched).collect();
        ages.sort_unstable();
        let cutoff = ages[ages.len() / 2];
        let before = self.peers.len();
        self.peers.retain(|_, entry| entry.touched >= cutoff);
        log::debug!(
            "Seen cache pruned {} of {} peers",
            before - self.peers.len(),
            before
        );
    }
}

/// Why a packet was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectReason {
    /// This node originated or last relayed the packet.
    OwnPacketLooped,
    /// `(source, sequence)` was already admitted.
    Duplicate,
    /// No hops left.
    TtlExpired,
    /// Addressed to another node and this node does not relay.
    NotForMe,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OwnPacketLooped => write!(f, "own packet looped"),
            Self::Duplicate => write!(f, "duplicate"),
            Self::TtlExpired => write!(f, "ttl expired"),
            Self::NotForMe => write!(f, "not for me"),
        }
    }
}

/// Outcome of admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "ignoring an admission decision defeats duplicate suppression"]
pub enum Decision {
    /// Addressed to this node (or broadcast): handle it.
    Accept,
    /// Not for this node, but this node is a repeater: relay it.
    ForwardOnly,
    /// Drop it.
    Reject(RejectReason),
}

/// Per-node admission state.
#[derive(Debug)]
pub struct SequenceTracker {
    node_id: u16,
    role: NodeRole,
    seen: SeenCache,
}

impl SequenceTracker {
    /// Create a tracker for `node_id` acting as `role`.
    pub fn new(node_id: u16, role: NodeRole, seen: SeenCache) -> Self {
        Self {
            node_id,
            role,
            seen,
        }
    }

    /// Evaluate admission without recording anything.
    pub fn evaluate(&self, packet: &Packet) -> Decision {
        if packet.source_node == self.node_id {
            return Decision::Reject(RejectReason::OwnPacketLooped);
        }
        if packet.sender_node == self.node_id && self.role == NodeRole::Repeater {
            return Decision::Reject(RejectReason::OwnPacketLooped);
        }
        if self.seen.contains(packet.source_node, packet.sequence_num) {
            return Decision::Reject(RejectReason::Duplicate);
        }
        if packet.ttl == 0 {
            return Decision::Reject(RejectReason::TtlExpired);
        }
        if packet.dest_node != self.node_id && packet.dest_node != BROADCAST {
            return if self.role == NodeRole::Repeater {
                Decision::ForwardOnly
            } else {
                Decision::Reject(RejectReason::NotForMe)
            };
        }
        Decision::Accept
    }

    /// Evaluate admission and record the packet if it is accepted or
    /// forwarded.
    pub fn admit(&mut self, packet: &Packet) -> Decision {
        let decision = self.evaluate(packet);
        if matches!(decision, Decision::Accept | Decision::ForwardOnly) {
            self.seen.record(packet.source_node, packet.sequence_num);
        }
        decision
    }

    /// Clear the history of `source` after it announced a restart.
    pub fn reset_peer(&mut self, source: u16) -> bool {
        self.seen.forget(source)
    }

    /// Latest admitted sequence from `source`.
    pub fn latest(&self, source: u16) -> Option<u16> {
        self.seen.latest(source)
    }

    /// Whether `seq` from `source` is at or just behind the latest admitted
    /// one, i.e. traffic from the current run of that node.
    pub fn is_recent(&self, source: u16, seq: u16) -> bool {
        self.seen.is_recent(source, seq)
    }

    /// This node's ID.
    pub fn node_id(&self) -> u16 {
        self.node_id
    }

    /// This node's role.
    pub fn role(&self) -> NodeRole {
        self.role
    }

    /// Number of peers in the seen cache.
    pub fn tracked_peers(&self) -> usize {
        self.seen.len()
    }
}
