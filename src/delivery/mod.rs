//! Reliable delivery on top of the best-effort channel.
//!
//! This module provides:
//! - [`Exchange`] / [`PendingAcks`]: per-packet ACK and retry state machine
//! - [`FollowupQueue`]: one-in-flight release of multi-record responses
//! - [`FollowupDrain`]: all-or-nothing collection of those responses
//!
//! Nothing here sleeps or reads a clock; callers pass the current time in,
//! which keeps every transition testable without waiting.

mod ack;
mod followup;

pub use ack::{
    decode_seq, encode_seq, AckPayload, Exchange, ExchangeState, PendingAcks, RetryPolicy, Tick,
    ACK_HEADER_SIZE, MAX_ACK_DATA,
};
pub use followup::{DrainStatus, FollowupDrain, FollowupQueue};

use std::fmt;

/// Delivery failures reported to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// Invalid configuration parameter.
    InvalidConfig(&'static str),
    /// Every transmission went unacknowledged.
    NoAck {
        /// Destination node.
        dest: u16,
        /// Sequence number of the unacknowledged packet.
        sequence: u16,
        /// Transmissions made.
        attempts: u8,
    },
    /// The radio refused every transmission, so nothing went on the air.
    RadioRefused {
        /// Destination node.
        dest: u16,
        /// Sequence number of the packet.
        sequence: u16,
        /// Transmissions attempted.
        attempts: u8,
    },
    /// A multi-packet response stopped arriving before it was complete.
    IncompleteSequence {
        /// Follow-ups announced.
        expected: u8,
        /// Follow-ups received before the timeout.
        received: u8,
    },
    /// The follow-up count changed mid-response.
    CountMismatch {
        /// Follow-ups first announced.
        expected: u8,
        /// Follow-ups announced later.
        announced: u8,
    },
    /// Reliable delivery needs a single peer other than this node.
    InvalidDestination(u16),
    /// Payload does not fit one packet.
    PayloadTooLarge {
        /// Payload length.
        len: usize,
        /// Largest payload allowed.
        max: usize,
    },
    /// The node shut down while the exchange was in progress.
    Stopped,
}

impl fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConfig(msg) => write!(f, "invalid delivery config: {}", msg),
            Self::NoAck {
                dest,
                sequence,
                attempts,
            } => write!(
                f,
                "no ACK from node {} for seq {} after {} attempts",
                dest, sequence, attempts
            ),
            Self::RadioRefused {
                dest,
                sequence,
                attempts,
            } => write!(
                f,
                "radio refused all {} transmissions of seq {} to node {}",
                attempts, sequence, dest
            ),
            Self::IncompleteSequence { expected, received } => write!(
                f,
                "multi-packet response incomplete: {} of {} follow-ups received",
                received, expected
            ),
            Self::CountMismatch {
                expected,
                announced,
            } => write!(
                f,
                "follow-up count changed from {} to {}",
                expected, announced
            ),
            Self::InvalidDestination(dest) => {
                write!(f, "node {} is not a valid unicast destination", dest)
            }
            Self::PayloadTooLarge { len, max } => {
                write!(f, "payload of {} bytes exceeds {} bytes", len, max)
            }
            Self::Stopped => write!(f, "node stopped"),
        }
    }
}

impl std::error::Error for DeliveryError {}
