//! Multi-packet responses.
//!
//! A lookup can match several records. The answering node puts the first
//! record in its ACK together with the number of records still to come, then
//! drains the rest as follow-up `DATA` packets, one in flight at a time:
//!
//! ```text
//! scanner                         server
//!    | ---- DATA seq=40 (req) -----> |
//!    | <--- ACK 40, remaining=2 ---- |   record 1
//!    | <--- DATA part 1/3 ---------- |   record 2
//!    | ---- ACK ------------------>  |
//!    | <--- DATA part 2/3 ---------- |   record 3
//!    | ---- ACK ------------------>  |
//! ```
//!
//! [`FollowupQueue`] is the sending side, [`FollowupDrain`] the receiving
//! side. A drain only ever yields the full set of records; a missing part
//! fails the whole response.

use super::ack::{Exchange, ExchangeState, RetryPolicy, Tick};
use super::DeliveryError;
use std::collections::{BTreeMap, VecDeque};

/// Outgoing follow-up records for one peer.
#[derive(Debug)]
pub struct FollowupQueue {
    peer: u16,
    records: VecDeque<Vec<u8>>,
    total: u8,
    next_index: u8,
    policy: RetryPolicy,
    in_flight: Option<Exchange>,
    state: ExchangeState,
}

impl FollowupQueue {
    /// Queue `records` for `peer`, whose first record already left in the
    /// ACK. At most 254 follow-ups fit the one-byte `remaining` field; extra
    /// records are dropped with a warning.
    pub fn new(peer: u16, mut records: Vec<Vec<u8>>, policy: RetryPolicy) -> Self {
        let max = u8::MAX as usize - 1;
        if records.len() > max {
            log::warn!(
                "Dropping {} follow-up records for {} (limit {})",
                records.len() - max,
                peer,
                max
            );
            records.truncate(max);
        }
        let remaining = records.len() as u8;
        Self {
            peer,
            records: records.into(),
            total: remaining + 1,
            next_index: 1,
            policy,
            in_flight: None,
            state: if remaining == 0 {
                ExchangeState::Done
            } else {
                ExchangeState::AckedWithFollowup { remaining }
            },
        }
    }

    /// Destination of the follow-ups.
    pub fn peer(&self) -> u16 {
        self.peer
    }

    /// Current state.
    pub fn state(&self) -> ExchangeState {
        self.state
    }

    /// Records not yet acknowledged, in-flight one included.
    pub fn remaining(&self) -> usize {
        self.records.len() + usize::from(self.in_flight.is_some())
    }

    /// Whether every follow-up has been acknowledged.
    pub fn is_done(&self) -> bool {
        self.state == ExchangeState::Done
    }

    /// Whether the queue gave up.
    pub fn is_failed(&self) -> bool {
        self.state == ExchangeState::Timeout
    }

    /// Pop the next record to send as `(index, total, payload)`.
    ///
    /// Returns `None` while a follow-up is still awaiting its ACK, which is
    /// what keeps only one of them on the air.
    pub fn next_part(&mut self) -> Option<(u8, u8, Vec<u8>)> {
        if self.in_flight.is_some() || matches!(self.state, ExchangeState::SendingFollowup { .. })
        {
            return None;
        }
        let payload = self.records.pop_front()?;
        let index = self.next_index;
        self.next_index += 1;
        self.state = ExchangeState::SendingFollowup { index };
        Some((index, self.total, payload))
    }

    /// The part returned by [`next_part`](Self::next_part) was encoded as
    /// `frame` with `sequence` and handed to the radio at `now_ms`.
    pub fn launch(&mut self, sequence: u16, frame: Vec<u8>, now_ms: u64) {
        if let ExchangeState::SendingFollowup { index } = self.state {
            let mut exchange = Exchange::new(self.peer, sequence, frame, self.policy);
            exchange.mark_sent(now_ms);
            self.in_flight = Some(exchange);
            self.state = ExchangeState::WaitingFollowupAck { index };
        }
    }

    /// Apply an ACK from the peer. Returns `true` if it acknowledged the
    /// in-flight follow-up.
    pub fn on_ack(&mut self, acked_seq: u16) -> bool {
        let matches = self
            .in_flight
            .as_ref()
            .is_some_and(|exchange| exchange.sequence() == acked_seq);
        if !matches {
            return false;
        }
        self.in_flight = None;
        if self.records.is_empty() {
            self.state = ExchangeState::Done;
            log::debug!("All {} follow-ups acknowledged by {}", self.total - 1, self.peer);
        } else {
            self.state = ExchangeState::AckedWithFollowup {
                remaining: self.records.len() as u8,
            };
        }
        true
    }

    /// The radio refused the in-flight follow-up.
    pub fn note_refused(&mut self) {
        if let Some(exchange) = self.in_flight.as_mut() {
            exchange.note_refused();
        }
    }

    /// Retransmitted in-flight follow-up is back on the air.
    pub fn mark_resent(&mut self, now_ms: u64) {
        if let Some(exchange) = self.in_flight.as_mut() {
            exchange.mark_sent(now_ms);
        }
    }

    /// Advance the in-flight follow-up's timer. On exhaustion the remaining
    /// records are discarded.
    pub fn on_tick(&mut self, now_ms: u64) -> Tick {
        let Some(exchange) = self.in_flight.as_mut() else {
            return Tick::Idle { until_ms: None };
        };
        let tick = exchange.on_tick(now_ms);
        if let Tick::Failed(_) = tick {
            log::error!(
                "Follow-up {}/{} to {} unacknowledged, dropping {} queued record(s)",
                self.next_index - 1,
                self.total,
                self.peer,
                self.records.len()
            );
            self.records.clear();
            self.in_flight = None;
            self.state = ExchangeState::Timeout;
        }
        tick
    }
}

/// Progress of a [`FollowupDrain`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainStatus {
    /// Still waiting for parts.
    Pending {
        /// Clock time after which the drain fails.
        deadline_ms: u64,
    },
    /// Every announced part arrived, in index order.
    Complete(Vec<Vec<u8>>),
    /// The response is unusable.
    Failed(DeliveryError),
}

/// Incoming follow-up records from one peer.
///
/// The expected count is learned from the ACK's `remaining` field or, if a
/// follow-up overtakes a lost ACK, from that packet's `multi_part_total`.
#[derive(Debug)]
pub struct FollowupDrain {
    peer: u16,
    expected: u8,
    parts: BTreeMap<u8, Vec<u8>>,
    last_progress_ms: u64,
    timeout_ms: u64,
    failure: Option<DeliveryError>,
}

impl FollowupDrain {
    /// Expect `expected` follow-ups from `peer`, failing after `policy`'s
    /// follow-up timeout without progress.
    pub fn new(peer: u16, expected: u8, policy: &RetryPolicy, now_ms: u64) -> Self {
        Self {
            peer,
            expected,
            parts: BTreeMap::new(),
            last_progress_ms: now_ms,
            timeout_ms: policy.followup_timeout().as_millis() as u64,
            failure: None,
        }
    }

    /// Sending peer.
    pub fn peer(&self) -> u16 {
        self.peer
    }

    /// Announced follow-up count.
    pub fn expected(&self) -> u8 {
        self.expected
    }

    /// Distinct parts received so far.
    pub fn received(&self) -> u8 {
        self.parts.len() as u8
    }

    /// Check an announced count (from the ACK) against what this drain
    /// already expects.
    pub fn confirm_expected(&mut self, remaining: u8) {
        if remaining != self.expected && self.failure.is_none() {
            self.failure = Some(DeliveryError::CountMismatch {
                expected: self.expected,
                announced: remaining,
            });
        }
    }

    /// Store part `index` of a `total`-packet response. Returns `true` if it
    /// was new.
    pub fn accept(&mut self, index: u8, total: u8, payload: Vec<u8>, now_ms: u64) -> bool {
        if self.failure.is_some() {
            return false;
        }
        if total != self.expected.saturating_add(1) {
            self.failure = Some(DeliveryError::CountMismatch {
                expected: self.expected,
                announced: total.saturating_sub(1),
            });
            return false;
        }
        if index == 0 || index > self.expected {
            log::debug!("Follow-up index {} out of range from {}", index, self.peer);
            return false;
        }
        if self.parts.contains_key(&index) {
            return false;
        }
        self.parts.insert(index, payload);
        self.last_progress_ms = now_ms;
        true
    }

    /// Evaluate the drain at `now_ms`. A completed drain hands its records
    /// out once.
    pub fn poll(&mut self, now_ms: u64) -> DrainStatus {
        if let Some(failure) = &self.failure {
            return DrainStatus::Failed(failure.clone());
        }
        if self.parts.len() == self.expected as usize {
            return DrainStatus::Complete(std::mem::take(&mut self.parts).into_values().collect());
        }
        let deadline_ms = self.last_progress_ms + self.timeout_ms;
        if now_ms >= deadline_ms {
            log::warn!(
                "Follow-ups from {} timed out: {}/{} received",
                self.peer,
                self.parts.len(),
                self.expected
            );
            let failure = DeliveryError::IncompleteSequence {
                expected: self.expected,
                received: self.received(),
            };
            self.parts.clear();
            self.failure = Some(failure.clone());
            return DrainStatus::Failed(failure);
        }
        DrainStatus::Pending { deadline_ms }
    }

    /// Whether nobody has claimed this drain for twice its timeout.
    pub fn is_stale(&self, now_ms: u64) -> bool {
        now_ms >= self.last_progress_ms + 2 * self.timeout_ms
    }
}
