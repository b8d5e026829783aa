//! Protocol state shared by the receive loop and application threads.

use crate::config::{ConfigError, NodeConfig};
use crate::delivery::{FollowupDrain, FollowupQueue, PendingAcks};
use crate::sequence::{SeenCache, SeenCacheConfig, SequenceCounter, SequenceTracker};
use std::collections::{HashMap, VecDeque};

/// ACK frames kept for re-acknowledging retransmissions.
pub const ACK_CACHE_SIZE: usize = 32;

/// Relays a repeater remembers for re-relaying retransmissions.
pub const RELAY_LOG_SIZE: usize = 64;

/// Recently sent ACK frames keyed by what they acknowledged.
///
/// When our ACK is lost the peer retransmits with the same sequence number.
/// Admission rejects that as a duplicate, so the original ACK (which may
/// carry the first response record) is replayed from here instead of
/// handling the request twice.
#[derive(Debug)]
pub struct AckCache {
    entries: VecDeque<((u16, u16), Vec<u8>)>,
    capacity: usize,
}

impl AckCache {
    /// Create a cache holding up to `capacity` frames.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Remember the ACK frame sent for `(peer, sequence)`.
    pub fn insert(&mut self, peer: u16, sequence: u16, frame: Vec<u8>) {
        self.entries.retain(|(key, _)| *key != (peer, sequence));
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(((peer, sequence), frame));
    }

    /// The ACK frame sent for `(peer, sequence)`, if still cached.
    pub fn get(&self, peer: u16, sequence: u16) -> Option<&[u8]> {
        self.entries
            .iter()
            .rev()
            .find(|(key, _)| *key == (peer, sequence))
            .map(|(_, frame)| frame.as_slice())
    }

    /// Number of cached frames.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// When a repeater last relayed each `(source, sequence)`.
///
/// A retransmission keeps its sequence number, so admission calls it a
/// duplicate. The originator only retransmits after an ACK timeout, so a
/// copy arriving at least `holdoff` after the last relay is a retry worth
/// relaying again, while copies closer together are echoes.
#[derive(Debug)]
pub struct RelayLog {
    entries: VecDeque<((u16, u16), u64)>,
    capacity: usize,
}

impl RelayLog {
    /// Create a log of up to `capacity` relays.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Record a relay of `(source, sequence)` at `now_ms`.
    pub fn note(&mut self, source: u16, sequence: u16, now_ms: u64) {
        self.entries.retain(|(key, _)| *key != (source, sequence));
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(((source, sequence), now_ms));
    }

    /// Whether a duplicate of `(source, sequence)` heard at `now_ms` should
    /// be relayed again. Records the relay when it should.
    pub fn permits_relay(
        &mut self,
        source: u16,
        sequence: u16,
        now_ms: u64,
        holdoff_ms: u64,
    ) -> bool {
        let last = self
            .entries
            .iter()
            .find(|(key, _)| *key == (source, sequence))
            .map(|(_, at)| *at);
        if last.is_some_and(|at| now_ms.saturating_sub(at) < holdoff_ms) {
            return false;
        }
        self.note(source, sequence, now_ms);
        true
    }

    /// Number of remembered relays.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing has been relayed.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Everything about the mesh a node mutates while running.
///
/// Lives behind one mutex; no field may be touched without holding it.
#[derive(Debug)]
pub struct NodeState {
    /// Outgoing sequence numbers.
    pub counter: SequenceCounter,
    /// Admission state.
    pub tracker: SequenceTracker,
    /// ACK-requested packets this node is waiting on.
    pub pending: PendingAcks,
    /// Follow-up records this node still has to send, per peer.
    pub outgoing: HashMap<u16, FollowupQueue>,
    /// Follow-up records this node is collecting, per peer.
    pub drains: HashMap<u16, FollowupDrain>,
    /// ACK frames already sent.
    pub ack_cache: AckCache,
    /// Recent relays, for re-relaying retransmissions.
    pub relays: RelayLog,
}

impl NodeState {
    /// Fresh state for the node in `config`, with a random sequence start.
    pub fn new(config: &NodeConfig) -> Result<Self, ConfigError> {
        Self::with_counter(config, SequenceCounter::random())
    }

    /// Fresh state with a given sequence counter.
    pub fn with_counter(config: &NodeConfig, counter: SequenceCounter) -> Result<Self, ConfigError> {
        let seen = SeenCache::new(SeenCacheConfig {
            max_peers: config.max_seen_peers,
        })
        .map_err(|_| ConfigError::InvalidConfig("max_seen_peers must be at least 2"))?;
        Ok(Self {
            counter,
            tracker: SequenceTracker::new(config.node_id, config.role, seen),
            pending: PendingAcks::new(),
            outgoing: HashMap::new(),
            drains: HashMap::new(),
            ack_cache: AckCache::new(ACK_CACHE_SIZE),
            relays: RelayLog::new(RELAY_LOG_SIZE),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeRole;

    #[test]
    fn test_ack_cache_lookup() {
        let mut cache = AckCache::new(4);
        cache.insert(102, 7, vec![1]);
        cache.insert(103, 7, vec![2]);
        assert_eq!(cache.get(102, 7), Some(&[1u8][..]));
        assert_eq!(cache.get(103, 7), Some(&[2u8][..]));
        assert_eq!(cache.get(102, 8), None);
    }

    #[test]
    fn test_ack_cache_bounded() {
        let mut cache = AckCache::new(2);
        cache.insert(1, 1, vec![1]);
        cache.insert(1, 2, vec![2]);
        cache.insert(1, 3, vec![3]);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(1, 1), None);
        assert!(cache.get(1, 3).is_some());
    }

    #[test]
    fn test_ack_cache_replaces_same_key() {
        let mut cache = AckCache::new(2);
        cache.insert(1, 1, vec![1]);
        cache.insert(1, 1, vec![9]);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(1, 1), Some(&[9u8][..]));
    }

    #[test]
    fn test_relay_log_holdoff() {
        let mut log = RelayLog::new(8);
        log.note(102, 40, 1_000);
        assert!(!log.permits_relay(102, 40, 1_010, 500));
        assert!(log.permits_relay(102, 40, 1_500, 500));
        // the re-relay restarts the holdoff
        assert!(!log.permits_relay(102, 40, 1_700, 500));
        assert!(log.permits_relay(102, 40, 2_000, 500));
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_relay_log_forgotten_entry_relays() {
        let mut log = RelayLog::new(2);
        log.note(102, 1, 0);
        log.note(102, 2, 0);
        log.note(102, 3, 0);
        assert_eq!(log.len(), 2);
        assert!(log.permits_relay(102, 1, 10, 500));
        assert!(!log.permits_relay(102, 3, 10, 500));
    }

    #[test]
    fn test_new_state_is_empty() {
        let config = NodeConfig::new(1, NodeRole::Server).unwrap();
        let state = NodeState::with_counter(&config, SequenceCounter::starting_at(41)).unwrap();
        assert_eq!(state.counter.current(), 41);
        assert_eq!(state.tracker.node_id(), 1);
        assert!(state.pending.is_empty());
        assert!(state.outgoing.is_empty());
        assert!(state.ack_cache.is_empty());
        assert!(state.relays.is_empty());
    }
}
