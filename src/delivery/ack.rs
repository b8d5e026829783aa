//! Acknowledged unicast delivery.
//!
//! An [`Exchange`] tracks one ACK-requested packet from the moment it is
//! queued until an ACK for its sequence number comes back or the retry budget
//! runs out:
//!
//! ```text
//! Sent(1) -> WaitingAck(1) -> Sent(2) -> WaitingAck(2) -> ... -> Timeout
//!                 |
//!                 +-> AckedNoFollowup
//!                 +-> AckedWithFollowup(remaining)
//! ```
//!
//! The ACK payload names the acknowledged sequence number explicitly; the
//! ACK packet's own `sequence_num` belongs to the acknowledging node and is
//! never compared against ours.

use super::DeliveryError;
use crate::packet::MAX_PAYLOAD;
use std::collections::HashMap;
use std::time::Duration;

/// Bytes in front of the data in an ACK payload (`acked_seq`, `remaining`).
pub const ACK_HEADER_SIZE: usize = 3;

/// Largest data an ACK can carry.
pub const MAX_ACK_DATA: usize = MAX_PAYLOAD - ACK_HEADER_SIZE;

/// Retry budget for ACK-requested packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Transmissions per packet, including the first.
    pub max_attempts: u8,
    /// Wait for an ACK after each transmission.
    pub ack_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            ack_timeout: Duration::from_secs(3),
        }
    }
}

impl RetryPolicy {
    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), DeliveryError> {
        if self.max_attempts == 0 {
            return Err(DeliveryError::InvalidConfig("max_attempts must be > 0"));
        }
        if self.ack_timeout.is_zero() {
            return Err(DeliveryError::InvalidConfig("ack_timeout must be > 0"));
        }
        Ok(())
    }

    /// Silence after which a follow-up drain gives up: the time the sender
    /// needs to exhaust its retries on one follow-up.
    pub fn followup_timeout(&self) -> Duration {
        self.ack_timeout * self.max_attempts as u32
    }

    fn ack_timeout_ms(&self) -> u64 {
        self.ack_timeout.as_millis() as u64
    }
}

/// Body of an `ACK` packet: `acked_seq(2B BE) | remaining(1B) | data`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AckPayload {
    /// Sequence number being acknowledged, in the original sender's space.
    pub acked_seq: u16,
    /// Follow-up packets still to come.
    pub remaining: u8,
    /// First response record, if any.
    pub data: Vec<u8>,
}

impl AckPayload {
    /// Plain acknowledgement with no response data.
    pub fn bare(acked_seq: u16) -> Self {
        Self {
            acked_seq,
            remaining: 0,
            data: Vec::new(),
        }
    }

    /// Serialize to packet payload bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(ACK_HEADER_SIZE + self.data.len());
        out.extend_from_slice(&self.acked_seq.to_be_bytes());
        out.push(self.remaining);
        out.extend_from_slice(&self.data);
        out
    }

    /// Parse packet payload bytes.
    ///
    /// A two-byte payload is a bare ACK. Anything shorter is not an ACK.
    pub fn decode(payload: &[u8]) -> Option<Self> {
        let acked_seq = decode_seq(payload)?;
        let remaining = payload.get(2).copied().unwrap_or(0);
        let data = payload.get(ACK_HEADER_SIZE..).unwrap_or(&[]).to_vec();
        Some(Self {
            acked_seq,
            remaining,
            data,
        })
    }
}

/// Payload carrying a single big-endian sequence number (`HELLO` baseline,
/// `HELLO_ACK` acknowledged sequence).
pub fn encode_seq(seq: u16) -> Vec<u8> {
    seq.to_be_bytes().to_vec()
}

/// Read the leading big-endian sequence number of a payload.
pub fn decode_seq(payload: &[u8]) -> Option<u16> {
    match payload {
        [hi, lo, ..] => Some(u16::from_be_bytes([*hi, *lo])),
        _ => None,
    }
}

/// Where an exchange stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    /// Handed to the radio for the `attempt`-th time.
    Sent {
        /// 1-based transmission count.
        attempt: u8,
    },
    /// On the air, ACK timer running.
    WaitingAck {
        /// 1-based transmission count.
        attempt: u8,
    },
    /// Acknowledged, nothing more to come.
    AckedNoFollowup,
    /// Acknowledged, `remaining` follow-up packets announced.
    AckedWithFollowup {
        /// Announced follow-up count.
        remaining: u8,
    },
    /// Follow-up `index` is being handed to the radio.
    SendingFollowup {
        /// 1-based follow-up index.
        index: u8,
    },
    /// Follow-up `index` is on the air, ACK timer running.
    WaitingFollowupAck {
        /// 1-based follow-up index.
        index: u8,
    },
    /// Every follow-up acknowledged.
    Done,
    /// Retry budget exhausted.
    Timeout,
}

impl ExchangeState {
    /// Whether no further transition can happen.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::AckedNoFollowup | Self::AckedWithFollowup { .. } | Self::Done | Self::Timeout
        )
    }
}

/// What the owner of an exchange should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tick {
    /// Nothing to do until the given time (absent while not on the air yet).
    Idle {
        /// Clock time of the next deadline.
        until_ms: Option<u64>,
    },
    /// Transmit this frame again, then call [`Exchange::mark_sent`].
    Retransmit {
        /// Frame to put back on the air.
        frame: Vec<u8>,
        /// 1-based transmission count of the retry.
        attempt: u8,
    },
    /// The exchange failed for good.
    Failed(DeliveryError),
}

/// One ACK-requested packet awaiting its acknowledgement.
#[derive(Debug, Clone)]
pub struct Exchange {
    dest: u16,
    sequence: u16,
    frame: Vec<u8>,
    policy: RetryPolicy,
    state: ExchangeState,
    deadline_ms: Option<u64>,
    ack: Option<AckPayload>,
    refused: u8,
}

impl Exchange {
    /// Track `frame`, about to be transmitted to `dest` for the first time.
    pub fn new(dest: u16, sequence: u16, frame: Vec<u8>, policy: RetryPolicy) -> Self {
        Self {
            dest,
            sequence,
            frame,
            policy,
            state: ExchangeState::Sent { attempt: 1 },
            deadline_ms: None,
            ack: None,
            refused: 0,
        }
    }

    /// Destination node.
    pub fn dest(&self) -> u16 {
        self.dest
    }

    /// Sequence number awaiting acknowledgement.
    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    /// Encoded frame, for retransmission.
    pub fn frame(&self) -> &[u8] {
        &self.frame
    }

    /// Current state.
    pub fn state(&self) -> ExchangeState {
        self.state
    }

    /// ACK deadline, once the frame is on the air.
    pub fn deadline_ms(&self) -> Option<u64> {
        self.deadline_ms
    }

    /// The ACK, once received.
    pub fn ack(&self) -> Option<&AckPayload> {
        self.ack.as_ref()
    }

    /// Take the ACK out of a finished exchange.
    pub fn take_ack(&mut self) -> Option<AckPayload> {
        self.ack.take()
    }

    /// The frame went out at `now_ms`; start the ACK timer.
    pub fn mark_sent(&mut self, now_ms: u64) {
        if let ExchangeState::Sent { attempt } = self.state {
            self.state = ExchangeState::WaitingAck { attempt };
            self.deadline_ms = Some(now_ms + self.policy.ack_timeout_ms());
        }
    }

    /// The radio refused the latest transmission. The ACK timer still runs,
    /// so the next attempt happens on schedule.
    pub fn note_refused(&mut self) {
        self.refused = self.refused.saturating_add(1);
    }

    /// Transmissions the radio refused.
    pub fn refused(&self) -> u8 {
        self.refused
    }

    /// Apply an ACK. Returns the new state, or `None` if the ACK does not
    /// match or the exchange already finished.
    pub fn on_ack(&mut self, ack: AckPayload) -> Option<ExchangeState> {
        if ack.acked_seq != self.sequence || self.state.is_terminal() {
            return None;
        }
        self.state = if ack.remaining > 0 {
            ExchangeState::AckedWithFollowup {
                remaining: ack.remaining,
            }
        } else {
            ExchangeState::AckedNoFollowup
        };
        self.deadline_ms = None;
        self.ack = Some(ack);
        Some(self.state)
    }

    /// Advance timers to `now_ms`.
    pub fn on_tick(&mut self, now_ms: u64) -> Tick {
        let ExchangeState::WaitingAck { attempt } = self.state else {
            return Tick::Idle { until_ms: None };
        };
        let deadline = self.deadline_ms.unwrap_or(now_ms);
        if now_ms < deadline {
            return Tick::Idle {
                until_ms: Some(deadline),
            };
        }
        if attempt < self.policy.max_attempts {
            let next = attempt + 1;
            self.state = ExchangeState::Sent { attempt: next };
            self.deadline_ms = None;
            log::warn!(
                "No ACK from {} for seq {}, retry {}/{}",
                self.dest,
                self.sequence,
                next,
                self.policy.max_attempts
            );
            return Tick::Retransmit {
                frame: self.frame.clone(),
                attempt: next,
            };
        }
        self.state = ExchangeState::Timeout;
        self.deadline_ms = None;
        if self.refused >= attempt {
            return Tick::Failed(DeliveryError::RadioRefused {
                dest: self.dest,
                sequence: self.sequence,
                attempts: attempt,
            });
        }
        Tick::Failed(DeliveryError::NoAck {
            dest: self.dest,
            sequence: self.sequence,
            attempts: attempt,
        })
    }
}

/// Outstanding exchanges keyed by `(dest, sequence)`.
#[derive(Debug, Default)]
pub struct PendingAcks {
    exchanges: HashMap<(u16, u16), Exchange>,
}

impl PendingAcks {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking an exchange. Replaces any stale entry with the same key.
    pub fn insert(&mut self, exchange: Exchange) {
        let key = (exchange.dest(), exchange.sequence());
        if self.exchanges.insert(key, exchange).is_some() {
            log::debug!("Replaced stale exchange {}:{}", key.0, key.1);
        }
    }

    /// Look up an exchange.
    pub fn get(&self, dest: u16, sequence: u16) -> Option<&Exchange> {
        self.exchanges.get(&(dest, sequence))
    }

    /// Look up an exchange for update.
    pub fn get_mut(&mut self, dest: u16, sequence: u16) -> Option<&mut Exchange> {
        self.exchanges.get_mut(&(dest, sequence))
    }

    /// Stop tracking an exchange.
    pub fn remove(&mut self, dest: u16, sequence: u16) -> Option<Exchange> {
        self.exchanges.remove(&(dest, sequence))
    }

    /// Route an ACK received from `from` to its exchange.
    pub fn on_ack(&mut self, from: u16, ack: AckPayload) -> Option<ExchangeState> {
        self.exchanges
            .get_mut(&(from, ack.acked_seq))
            .and_then(|exchange| exchange.on_ack(ack))
    }

    /// Number of tracked exchanges.
    pub fn len(&self) -> usize {
        self.exchanges.len()
    }

    /// Whether nothing is outstanding.
    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            ack_timeout: Duration::from_millis(1_000),
        }
    }

    #[test]
    fn test_policy_validation() {
        assert!(RetryPolicy::default().validate().is_ok());
        let zero = RetryPolicy {
            max_attempts: 0,
            ..RetryPolicy::default()
        };
        assert!(matches!(zero.validate(), Err(DeliveryError::InvalidConfig(_))));
        assert_eq!(policy().followup_timeout(), Duration::from_secs(3));
    }

    #[test]
    fn test_ack_payload_layout() {
        let ack = AckPayload {
            acked_seq: 0x1234,
            remaining: 2,
            data: b"rec".to_vec(),
        };
        let bytes = ack.encode();
        assert_eq!(bytes, vec![0x12, 0x34, 2, b'r', b'e', b'c']);
        assert_eq!(AckPayload::decode(&bytes), Some(ack));
    }

    #[test]
    fn test_ack_payload_short_forms() {
        assert_eq!(AckPayload::decode(&[0, 7]), Some(AckPayload::bare(7)));
        assert_eq!(AckPayload::decode(&[1]), None);
        assert_eq!(AckPayload::decode(&[]), None);
    }

    #[test]
    fn test_seq_payload() {
        assert_eq!(encode_seq(0xBEEF), vec![0xBE, 0xEF]);
        assert_eq!(decode_seq(&[0xBE, 0xEF, 0x00]), Some(0xBEEF));
        assert_eq!(decode_seq(&[0xBE]), None);
    }

    #[test]
    fn test_acked_first_try() {
        let clock = ManualClock::new();
        let mut ex = Exchange::new(1, 40, vec![0xAA], policy());
        assert_eq!(ex.state(), ExchangeState::Sent { attempt: 1 });

        ex.mark_sent(clock.now_ms());
        assert_eq!(ex.state(), ExchangeState::WaitingAck { attempt: 1 });
        assert_eq!(ex.on_tick(500), Tick::Idle { until_ms: Some(1_000) });

        assert_eq!(
            ex.on_ack(AckPayload::bare(40)),
            Some(ExchangeState::AckedNoFollowup)
        );
        assert_eq!(ex.on_tick(10_000), Tick::Idle { until_ms: None });
    }

    #[test]
    fn test_ack_with_followups() {
        let mut ex = Exchange::new(1, 40, vec![0xAA], policy());
        ex.mark_sent(0);
        let ack = AckPayload {
            acked_seq: 40,
            remaining: 2,
            data: b"first".to_vec(),
        };
        assert_eq!(
            ex.on_ack(ack),
            Some(ExchangeState::AckedWithFollowup { remaining: 2 })
        );
        assert_eq!(ex.ack().map(|a| a.data.as_slice()), Some(&b"first"[..]));
    }

    #[test]
    fn test_ack_for_other_sequence_ignored() {
        let mut ex = Exchange::new(1, 40, vec![0xAA], policy());
        ex.mark_sent(0);
        assert_eq!(ex.on_ack(AckPayload::bare(41)), None);
        assert_eq!(ex.state(), ExchangeState::WaitingAck { attempt: 1 });
    }

    #[test]
    fn test_retries_then_gives_up() {
        let clock = ManualClock::new();
        let mut ex = Exchange::new(1, 9, vec![0xAA, 0xBB], policy());
        ex.mark_sent(clock.now_ms());

        for attempt in 2..=3u8 {
            clock.advance(Duration::from_millis(1_000));
            match ex.on_tick(clock.now_ms()) {
                Tick::Retransmit { frame, attempt: a } => {
                    assert_eq!(frame, vec![0xAA, 0xBB]);
                    assert_eq!(a, attempt);
                }
                other => panic!("expected retransmit, got {:?}", other),
            }
            ex.mark_sent(clock.now_ms());
        }

        clock.advance(Duration::from_millis(1_000));
        assert_eq!(
            ex.on_tick(clock.now_ms()),
            Tick::Failed(DeliveryError::NoAck {
                dest: 1,
                sequence: 9,
                attempts: 3
            })
        );
        assert_eq!(ex.state(), ExchangeState::Timeout);
        assert_eq!(ex.on_ack(AckPayload::bare(9)), None);
    }

    #[test]
    fn test_refused_every_attempt_reported() {
        let mut ex = Exchange::new(1, 9, vec![0xAA], policy());
        let mut now = 0;
        ex.mark_sent(now);
        ex.note_refused();
        loop {
            now += 1_000;
            match ex.on_tick(now) {
                Tick::Retransmit { .. } => {
                    ex.mark_sent(now);
                    ex.note_refused();
                }
                Tick::Failed(e) => {
                    assert_eq!(
                        e,
                        DeliveryError::RadioRefused {
                            dest: 1,
                            sequence: 9,
                            attempts: 3
                        }
                    );
                    break;
                }
                Tick::Idle { .. } => panic!("deadline passed"),
            }
        }
        assert_eq!(ex.refused(), 3);
    }

    #[test]
    fn test_partly_refused_is_no_ack() {
        let mut ex = Exchange::new(1, 9, vec![0xAA], policy());
        ex.mark_sent(0);
        ex.note_refused();
        assert!(matches!(ex.on_tick(1_000), Tick::Retransmit { .. }));
        ex.mark_sent(1_000);
        assert!(matches!(ex.on_tick(2_000), Tick::Retransmit { .. }));
        ex.mark_sent(2_000);
        assert!(matches!(
            ex.on_tick(3_000),
            Tick::Failed(DeliveryError::NoAck { attempts: 3, .. })
        ));
    }

    #[test]
    fn test_ack_during_retransmit_accepted() {
        let mut ex = Exchange::new(1, 9, vec![], policy());
        ex.mark_sent(0);
        assert!(matches!(ex.on_tick(1_000), Tick::Retransmit { .. }));
        assert_eq!(
            ex.on_ack(AckPayload::bare(9)),
            Some(ExchangeState::AckedNoFollowup)
        );
    }

    #[test]
    fn test_pending_table_routes_by_peer_and_seq() {
        let mut pending = PendingAcks::new();
        let mut a = Exchange::new(1, 5, vec![], policy());
        a.mark_sent(0);
        let mut b = Exchange::new(2, 5, vec![], policy());
        b.mark_sent(0);
        pending.insert(a);
        pending.insert(b);

        assert_eq!(
            pending.on_ack(2, AckPayload::bare(5)),
            Some(ExchangeState::AckedNoFollowup)
        );
        assert_eq!(
            pending.get(1, 5).map(Exchange::state),
            Some(ExchangeState::WaitingAck { attempt: 1 })
        );
        assert_eq!(pending.on_ack(3, AckPayload::bare(5)), None);
        assert!(pending.remove(2, 5).is_some());
        assert_eq!(pending.len(), 1);
    }
}
