//! LoRa modulation settings shared by every node on the channel.
//!
//! All nodes must agree on these; they are compile-time constants rather than
//! configuration so a field unit cannot drift onto different settings.

/// Carrier frequency in MHz (US 915 MHz ISM band, RFM95W modules).
pub const FREQUENCY_MHZ: f32 = 915.0;

/// Spreading factor (SF7 - balanced range/speed).
pub const SPREADING_FACTOR: u8 = 7;

/// Bandwidth in Hz (125 kHz - standard LoRa).
pub const BANDWIDTH_HZ: u32 = 125_000;

/// Coding rate denominator (5 = 4/5 coding rate).
pub const CODING_RATE: u8 = 5;

/// Preamble length in symbols.
pub const PREAMBLE_LENGTH: u16 = 8;

/// Largest frame the radio accepts in one packet (RFM9x FIFO minus its
/// 4-byte addressing header).
pub const LORA_MTU: usize = 251;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{CRC_SIZE, HEADER_SIZE, MAX_PAYLOAD};

    #[test]
    fn test_payload_fits_mtu() {
        assert_eq!(HEADER_SIZE + MAX_PAYLOAD + CRC_SIZE, LORA_MTU);
        assert!(MAX_PAYLOAD <= u8::MAX as usize);
    }
}
