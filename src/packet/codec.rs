//! Mesh packet wire format.
//!
//! Every frame on air is a fixed 22-byte big-endian header, a variable payload
//! and a trailing CRC16 over header and payload:
//!
//! ```text
//! offset  size  field
//!      0     2  magic (0x4951)
//!      2     1  version
//!      3     1  packet type
//!      4     1  flags (ACK_REQUESTED, IS_REPEAT)
//!      5     1  multi flags (FIRST, MORE, LAST)
//!      6     2  source node (original sender, never rewritten)
//!      8     2  destination node (0 = broadcast)
//!     10     2  sender node (this hop's transmitter)
//!     12     2  sequence number (source's numbering space)
//!     14     1  ttl
//!     15     1  payload length
//!     16     1  multi-part index
//!     17     1  multi-part total
//!     18     4  timestamp (seconds, original creation)
//!     22     N  payload
//!   22+N     2  crc16
//! ```
//!
//! # Example
//!
//! ```
//! use dismissal_mesh::packet::{decode, encode, Packet, PacketType};
//!
//! let packet = Packet::new(PacketType::Cmd, 102, 1, 7, b"QR:4411".to_vec());
//! let frame = encode(&packet).unwrap();
//! assert_eq!(decode(&frame).unwrap(), packet);
//! ```

use super::crc::crc16_ccitt;
use crate::lora::LORA_MTU;
use log::warn;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Frame sentinel ("IQ").
pub const MAGIC: u16 = 0x4951;

/// Wire format version written by this implementation.
pub const PROTOCOL_VERSION: u8 = 1;

/// Fixed header size in bytes.
pub const HEADER_SIZE: usize = 22;

/// Trailing CRC size in bytes.
pub const CRC_SIZE: usize = 2;

/// Largest payload that still fits the radio's per-packet ceiling.
pub const MAX_PAYLOAD: usize = LORA_MTU - HEADER_SIZE - CRC_SIZE;

/// Hop budget given to freshly created packets.
pub const DEFAULT_TTL: u8 = 3;

/// Destination address meaning "every node".
pub const BROADCAST: u16 = 0;

/// Sender asks the destination to acknowledge this packet.
pub const FLAG_ACK_REQUESTED: u8 = 0x01;

/// Set by every repeater that relays the packet.
pub const FLAG_IS_REPEAT: u8 = 0x02;

/// First packet of a multi-part sequence.
pub const MULTI_FIRST: u8 = 0x01;

/// More packets follow this one.
pub const MULTI_MORE: u8 = 0x02;

/// Last packet of a multi-part sequence.
pub const MULTI_LAST: u8 = 0x04;

/// Payload semantics of a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    /// Application data (lookup results, follow-up records).
    Data,
    /// Acknowledgement; payload carries the acknowledged sequence.
    Ack,
    /// Application command / request (QR lookup).
    Cmd,
    /// Periodic presence broadcast.
    Beacon,
    /// Restart announcement carrying the sender's sequence baseline.
    Hello,
    /// Reply to a HELLO.
    HelloAck,
}

impl PacketType {
    /// Wire value of this type.
    pub fn to_byte(self) -> u8 {
        match self {
            Self::Data => 1,
            Self::Ack => 2,
            Self::Cmd => 3,
            Self::Beacon => 4,
            Self::Hello => 5,
            Self::HelloAck => 6,
        }
    }

    /// Parse a wire value.
    pub fn from_byte(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Data),
            2 => Some(Self::Ack),
            3 => Some(Self::Cmd),
            4 => Some(Self::Beacon),
            5 => Some(Self::Hello),
            6 => Some(Self::HelloAck),
            _ => None,
        }
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Data => "DATA",
            Self::Ack => "ACK",
            Self::Cmd => "CMD",
            Self::Beacon => "BEACON",
            Self::Hello => "HELLO",
            Self::HelloAck => "HELLO_ACK",
        };
        f.write_str(name)
    }
}

/// Errors returned by [`decode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Fewer bytes than header plus CRC.
    TooShort {
        /// Bytes received.
        len: usize,
    },
    /// CRC over header and payload did not match the trailer.
    Corrupt {
        /// CRC carried by the frame.
        expected: u16,
        /// CRC computed over the received bytes.
        actual: u16,
    },
    /// Frame sentinel is not [`MAGIC`].
    BadMagic(u16),
    /// Packet type byte is not a known [`PacketType`].
    UnknownType(u8),
    /// Declared payload length disagrees with the frame size.
    LengthMismatch {
        /// Length from the header.
        declared: usize,
        /// Length implied by the frame size.
        actual: usize,
    },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooShort { len } => write!(
                f,
                "frame too short: {} bytes (minimum {})",
                len,
                HEADER_SIZE + CRC_SIZE
            ),
            Self::Corrupt { expected, actual } => write!(
                f,
                "crc mismatch: frame carries {:#06x}, computed {:#06x}",
                expected, actual
            ),
            Self::BadMagic(magic) => write!(f, "bad magic {:#06x}", magic),
            Self::UnknownType(t) => write!(f, "unknown packet type {}", t),
            Self::LengthMismatch { declared, actual } => write!(
                f,
                "payload length mismatch: header says {}, frame holds {}",
                declared, actual
            ),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Errors returned by [`encode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// Payload exceeds [`MAX_PAYLOAD`]; callers truncate before encoding.
    PayloadTooLarge {
        /// Payload length.
        len: usize,
        /// Allowed maximum.
        max: usize,
    },
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PayloadTooLarge { len, max } => {
                write!(f, "payload too large: {} bytes (max {})", len, max)
            }
        }
    }
}

impl std::error::Error for EncodeError {}

/// One mesh packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Format sentinel.
    pub magic: u16,
    /// Format version.
    pub version: u8,
    /// Payload semantics.
    pub packet_type: PacketType,
    /// `FLAG_*` bits.
    pub flags: u8,
    /// `MULTI_*` bits; zero for a self-contained packet.
    pub multi_flags: u8,
    /// Original sender.
    pub source_node: u16,
    /// Final recipient, [`BROADCAST`] for everyone.
    pub dest_node: u16,
    /// Transmitter of this hop.
    pub sender_node: u16,
    /// Sequence number in the source's numbering space.
    pub sequence_num: u16,
    /// Remaining hop budget.
    pub ttl: u8,
    /// Position within a multi-part sequence.
    pub multi_part_index: u8,
    /// Size of the multi-part sequence (0 when not multi-part).
    pub multi_part_total: u8,
    /// Creation time of the original packet.
    pub timestamp: u32,
    /// Application payload.
    pub payload: Vec<u8>,
}

impl Packet {
    /// Create a packet originated by `source` with default TTL and the
    /// current timestamp.
    pub fn new(
        packet_type: PacketType,
        source: u16,
        dest: u16,
        sequence: u16,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            magic: MAGIC,
            version: PROTOCOL_VERSION,
            packet_type,
            flags: 0,
            multi_flags: 0,
            source_node: source,
            dest_node: dest,
            sender_node: source,
            sequence_num: sequence,
            ttl: DEFAULT_TTL,
            multi_part_index: 0,
            multi_part_total: 0,
            timestamp: unix_timestamp(),
            payload,
        }
    }

    /// Set the hop budget.
    pub fn with_ttl(mut self, ttl: u8) -> Self {
        self.ttl = ttl;
        self
    }

    /// Request an acknowledgement from the destination.
    pub fn with_ack_requested(mut self) -> Self {
        self.flags |= FLAG_ACK_REQUESTED;
        self
    }

    /// Override the creation timestamp.
    pub fn with_timestamp(mut self, timestamp: u32) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Tag this packet as part `index` of a `total`-packet sequence and set
    /// the matching FIRST/MORE/LAST bits.
    pub fn with_multi_part(mut self, index: u8, total: u8) -> Self {
        self.multi_part_index = index;
        self.multi_part_total = total;
        self.multi_flags = multi_flags_for(index, total);
        self
    }

    /// Whether the sender wants an ACK.
    pub fn is_ack_requested(&self) -> bool {
        self.flags & FLAG_ACK_REQUESTED != 0
    }

    /// Whether a repeater has relayed this packet.
    pub fn is_repeat(&self) -> bool {
        self.flags & FLAG_IS_REPEAT != 0
    }

    /// Whether this packet is addressed to every node.
    pub fn is_broadcast(&self) -> bool {
        self.dest_node == BROADCAST
    }

    /// Whether this packet belongs to a multi-part sequence.
    pub fn is_multi_part(&self) -> bool {
        self.multi_flags & (MULTI_FIRST | MULTI_MORE | MULTI_LAST) != 0
    }

    /// Truncate the payload to fit `max` bytes. Returns `true` if bytes were
    /// dropped.
    pub fn truncate_payload(&mut self, max: usize) -> bool {
        if self.payload.len() > max {
            self.payload.truncate(max);
            true
        } else {
            false
        }
    }

    /// Size of this packet on the wire.
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.payload.len() + CRC_SIZE
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}->{} via {} seq={} ttl={} len={}",
            self.packet_type,
            self.source_node,
            self.dest_node,
            self.sender_node,
            self.sequence_num,
            self.ttl,
            self.payload.len()
        )?;
        if self.multi_part_total > 0 {
            write!(f, " part={}/{}", self.multi_part_index, self.multi_part_total)?;
        }
        Ok(())
    }
}

/// FIRST/MORE/LAST bits for part `index` of `total`.
pub fn multi_flags_for(index: u8, total: u8) -> u8 {
    if total == 0 {
        return 0;
    }
    let mut flags = 0;
    if index == 0 {
        flags |= MULTI_FIRST;
    }
    if index.saturating_add(1) < total {
        flags |= MULTI_MORE;
    } else {
        flags |= MULTI_LAST;
    }
    flags
}

/// Current time as whole seconds since the UNIX epoch, truncated to 32 bits.
pub fn unix_timestamp() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

/// Serialize a packet into a frame.
///
/// # Errors
///
/// Returns [`EncodeError::PayloadTooLarge`] if the payload exceeds
/// [`MAX_PAYLOAD`]. The codec never truncates silently.
pub fn encode(packet: &Packet) -> Result<Vec<u8>, EncodeError> {
    let len = packet.payload.len();
    if len > MAX_PAYLOAD {
        return Err(EncodeError::PayloadTooLarge {
            len,
            max: MAX_PAYLOAD,
        });
    }

    let mut frame = Vec::with_capacity(packet.encoded_len());
    frame.extend_from_slice(&packet.magic.to_be_bytes());
    frame.push(packet.version);
    frame.push(packet.packet_type.to_byte());
    frame.push(packet.flags);
    frame.push(packet.multi_flags);
    frame.extend_from_slice(&packet.source_node.to_be_bytes());
    frame.extend_from_slice(&packet.dest_node.to_be_bytes());
    frame.extend_from_slice(&packet.sender_node.to_be_bytes());
    frame.extend_from_slice(&packet.sequence_num.to_be_bytes());
    frame.push(packet.ttl);
    frame.push(len as u8);
    frame.push(packet.multi_part_index);
    frame.push(packet.multi_part_total);
    frame.extend_from_slice(&packet.timestamp.to_be_bytes());
    frame.extend_from_slice(&packet.payload);

    let crc = crc16_ccitt(&frame);
    frame.extend_from_slice(&crc.to_be_bytes());
    Ok(frame)
}

/// Parse a frame.
///
/// Checks run in order: length, CRC, magic, type, payload length. A version
/// other than [`PROTOCOL_VERSION`] is logged and tolerated. Total over any
/// input.
pub fn decode(frame: &[u8]) -> Result<Packet, DecodeError> {
    if frame.len() < HEADER_SIZE + CRC_SIZE {
        return Err(DecodeError::TooShort { len: frame.len() });
    }

    let (body, trailer) = frame.split_at(frame.len() - CRC_SIZE);
    let expected = u16::from_be_bytes([trailer[0], trailer[1]]);
    let actual = crc16_ccitt(body);
    if expected != actual {
        return Err(DecodeError::Corrupt { expected, actual });
    }

    let magic = be_u16(body, 0);
    if magic != MAGIC {
        return Err(DecodeError::BadMagic(magic));
    }

    let version = body[2];
    if version != PROTOCOL_VERSION {
        warn!(
            "Packet version {} differs from ours ({}), decoding anyway",
            version, PROTOCOL_VERSION
        );
    }

    let packet_type = PacketType::from_byte(body[3]).ok_or(DecodeError::UnknownType(body[3]))?;

    let declared = body[15] as usize;
    let actual_len = body.len() - HEADER_SIZE;
    if declared != actual_len {
        return Err(DecodeError::LengthMismatch {
            declared,
            actual: actual_len,
        });
    }

    Ok(Packet {
        magic,
        version,
        packet_type,
        flags: body[4],
        multi_flags: body[5],
        source_node: be_u16(body, 6),
        dest_node: be_u16(body, 8),
        sender_node: be_u16(body, 10),
        sequence_num: be_u16(body, 12),
        ttl: body[14],
        multi_part_index: body[16],
        multi_part_total: body[17],
        timestamp: u32::from_be_bytes([body[18], body[19], body[20], body[21]]),
        payload: body[HEADER_SIZE..].to_vec(),
    })
}

fn be_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([bytes[offset], bytes[offset + 1]])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Packet {
        Packet::new(PacketType::Data, 102, 1, 4242, b"Jordan Lee, 4B".to_vec())
            .with_ack_requested()
            .with_multi_part(1, 3)
            .with_timestamp(1_700_000_000)
    }

    #[test]
    fn test_round_trip() {
        let packet = sample();
        let frame = encode(&packet).unwrap();
        assert_eq!(frame.len(), packet.encoded_len());
        assert_eq!(decode(&frame).unwrap(), packet);
    }

    #[test]
    fn test_round_trip_edge_payloads() {
        for len in [0, 1, MAX_PAYLOAD] {
            let packet = Packet::new(PacketType::Beacon, 200, BROADCAST, 65535, vec![0xA5; len]);
            let frame = encode(&packet).unwrap();
            assert_eq!(decode(&frame).unwrap(), packet, "payload len {}", len);
        }
    }

    #[test]
    fn test_header_layout() {
        let packet = Packet::new(PacketType::Cmd, 0x0102, 0x0304, 0x0506, vec![9])
            .with_ttl(7)
            .with_timestamp(0x0A0B0C0D);
        let frame = encode(&packet).unwrap();
        assert_eq!(&frame[0..2], &[0x49, 0x51]);
        assert_eq!(frame[2], PROTOCOL_VERSION);
        assert_eq!(frame[3], 3);
        assert_eq!(&frame[6..8], &[0x01, 0x02]);
        assert_eq!(&frame[8..10], &[0x03, 0x04]);
        assert_eq!(&frame[10..12], &[0x01, 0x02]); // sender == source
        assert_eq!(&frame[12..14], &[0x05, 0x06]);
        assert_eq!(frame[14], 7);
        assert_eq!(frame[15], 1);
        assert_eq!(&frame[18..22], &[0x0A, 0x0B, 0x0C, 0x0D]);
        assert_eq!(frame[22], 9);
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let packet = Packet::new(PacketType::Data, 1, 2, 3, vec![0; MAX_PAYLOAD + 1]);
        assert_eq!(
            encode(&packet),
            Err(EncodeError::PayloadTooLarge {
                len: MAX_PAYLOAD + 1,
                max: MAX_PAYLOAD
            })
        );
    }

    #[test]
    fn test_truncate_before_encode() {
        let mut packet = Packet::new(PacketType::Data, 1, 2, 3, vec![7; 300]);
        assert!(packet.truncate_payload(MAX_PAYLOAD));
        assert!(!packet.truncate_payload(MAX_PAYLOAD));
        assert!(encode(&packet).is_ok());
    }

    #[test]
    fn test_too_short() {
        assert_eq!(decode(&[]), Err(DecodeError::TooShort { len: 0 }));
        assert_eq!(
            decode(&[0u8; HEADER_SIZE + CRC_SIZE - 1]),
            Err(DecodeError::TooShort { len: 23 })
        );
    }

    #[test]
    fn test_every_single_bit_flip_is_rejected() {
        let frame = encode(&sample()).unwrap();
        for byte in 0..frame.len() {
            for bit in 0..8 {
                let mut corrupted = frame.clone();
                corrupted[byte] ^= 1 << bit;
                assert!(
                    decode(&corrupted).is_err(),
                    "flip at byte {} bit {} decoded",
                    byte,
                    bit
                );
            }
        }
    }

    #[test]
    fn test_bad_magic_with_valid_crc() {
        let mut frame = encode(&sample()).unwrap();
        frame[0] = 0x00;
        let len = frame.len();
        let crc = crc16_ccitt(&frame[..len - CRC_SIZE]);
        frame[len - 2..].copy_from_slice(&crc.to_be_bytes());
        assert_eq!(decode(&frame), Err(DecodeError::BadMagic(0x0051)));
    }

    #[test]
    fn test_version_mismatch_is_tolerated() {
        let mut packet = sample();
        packet.version = PROTOCOL_VERSION + 1;
        let frame = encode(&packet).unwrap();
        assert_eq!(decode(&frame).unwrap().version, PROTOCOL_VERSION + 1);
    }

    #[test]
    fn test_unknown_type() {
        let mut frame = encode(&sample()).unwrap();
        frame[3] = 0x7F;
        let len = frame.len();
        let crc = crc16_ccitt(&frame[..len - CRC_SIZE]);
        frame[len - 2..].copy_from_slice(&crc.to_be_bytes());
        assert_eq!(decode(&frame), Err(DecodeError::UnknownType(0x7F)));
    }

    #[test]
    fn test_length_mismatch() {
        let mut frame = encode(&sample()).unwrap();
        frame[15] = frame[15].wrapping_add(1);
        let len = frame.len();
        let crc = crc16_ccitt(&frame[..len - CRC_SIZE]);
        frame[len - 2..].copy_from_slice(&crc.to_be_bytes());
        assert!(matches!(
            decode(&frame),
            Err(DecodeError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn test_noise_never_panics() {
        // Deterministic pseudo-random noise of varying lengths
        let mut state = 0x1234_5678u32;
        for len in 0..300 {
            let noise: Vec<u8> = (0..len)
                .map(|_| {
                    state = state.wrapping_mul(1664525).wrapping_add(1013904223);
                    (state >> 24) as u8
                })
                .collect();
            let _ = decode(&noise);
        }
    }

    #[test]
    fn test_multi_flags() {
        assert_eq!(multi_flags_for(0, 0), 0);
        assert_eq!(multi_flags_for(0, 1), MULTI_FIRST | MULTI_LAST);
        assert_eq!(multi_flags_for(0, 3), MULTI_FIRST | MULTI_MORE);
        assert_eq!(multi_flags_for(1, 3), MULTI_MORE);
        assert_eq!(multi_flags_for(2, 3), MULTI_LAST);

        let single = Packet::new(PacketType::Data, 1, 2, 3, vec![]);
        assert!(!single.is_multi_part());
        assert!(single.clone().with_multi_part(2, 3).is_multi_part());
    }

    #[test]
    fn test_packet_type_bytes() {
        for t in [
            PacketType::Data,
            PacketType::Ack,
            PacketType::Cmd,
            PacketType::Beacon,
            PacketType::Hello,
            PacketType::HelloAck,
        ] {
            assert_eq!(PacketType::from_byte(t.to_byte()), Some(t));
        }
        assert_eq!(PacketType::from_byte(0), None);
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            format!("{}", DecodeError::BadMagic(0x1234)),
            "bad magic 0x1234"
        );
    }
}
