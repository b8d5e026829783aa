//! Packet framing.
//!
//! This module provides:
//! - [`Packet`]: the wire unit and its header fields
//! - [`encode`] / [`decode`]: frame serialization with CRC16 integrity check

mod codec;
mod crc;

pub use codec::{
    decode, encode, multi_flags_for, unix_timestamp, DecodeError, EncodeError, Packet,
    PacketType, BROADCAST, CRC_SIZE, DEFAULT_TTL, FLAG_ACK_REQUESTED, FLAG_IS_REPEAT,
    HEADER_SIZE, MAGIC, MAX_PAYLOAD, MULTI_FIRST, MULTI_LAST, MULTI_MORE, PROTOCOL_VERSION,
};
pub use crc::crc16_ccitt;
