//! LoRa time-on-air estimate.
//!
//! Semtech symbol-time formula (SX127x datasheet section 4.1.1.7). The result
//! is advisory: it is logged and counted in the node statistics, but it never
//! decides whether a frame may be sent.
//!
//! # Example
//!
//! ```
//! use dismissal_mesh::lora::estimate_airtime;
//!
//! let t = estimate_airtime(64, 7, 125_000, 5);
//! assert!(t.as_millis() > 50 && t.as_millis() < 200);
//! ```

use super::config::{BANDWIDTH_HZ, CODING_RATE, PREAMBLE_LENGTH, SPREADING_FACTOR};
use std::time::Duration;

/// Symbol times above this require low data rate optimization.
const LDRO_SYMBOL_US: f64 = 16_000.0;

/// Modulation parameters that determine time on air.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AirtimeParams {
    /// Spreading factor (7-12).
    pub spreading_factor: u8,
    /// Bandwidth in Hz.
    pub bandwidth_hz: u32,
    /// Coding rate denominator (5-8 for 4/5 to 4/8).
    pub coding_rate: u8,
    /// Preamble length in symbols.
    pub preamble_symbols: u16,
    /// Explicit (variable length) header mode.
    pub explicit_header: bool,
    /// Hardware payload CRC.
    pub crc_enabled: bool,
}

impl Default for AirtimeParams {
    /// The channel settings every node uses.
    fn default() -> Self {
        Self {
            spreading_factor: SPREADING_FACTOR,
            bandwidth_hz: BANDWIDTH_HZ,
            coding_rate: CODING_RATE,
            preamble_symbols: PREAMBLE_LENGTH,
            explicit_header: true,
            crc_enabled: true,
        }
    }
}

impl AirtimeParams {
    /// Duration of one symbol in microseconds (`2^SF / BW`).
    pub fn symbol_time_us(&self) -> f64 {
        if self.bandwidth_hz == 0 {
            return 0.0;
        }
        (1u64 << self.spreading_factor.min(12)) as f64 * 1_000_000.0 / self.bandwidth_hz as f64
    }

    /// Whether the radio must run with low data rate optimization.
    pub fn low_data_rate_optimize(&self) -> bool {
        self.symbol_time_us() > LDRO_SYMBOL_US
    }

    /// Time on air of a frame with `payload_len` bytes.
    pub fn airtime(&self, payload_len: usize) -> Duration {
        let t_sym = self.symbol_time_us();
        if t_sym == 0.0 {
            return Duration::ZERO;
        }

        let sf = self.spreading_factor.min(12) as f64;
        let de = if self.low_data_rate_optimize() { 1.0 } else { 0.0 };
        let ih = if self.explicit_header { 0.0 } else { 1.0 };
        let crc = if self.crc_enabled { 1.0 } else { 0.0 };

        let numerator = 8.0 * payload_len as f64 - 4.0 * sf + 28.0 + 16.0 * crc - 20.0 * ih;
        let denominator = 4.0 * (sf - 2.0 * de);
        let payload_symbols = if denominator > 0.0 {
            8.0 + (numerator / denominator).ceil().max(0.0) * self.coding_rate as f64
        } else {
            8.0
        };

        let preamble_us = (self.preamble_symbols as f64 + 4.25) * t_sym;
        Duration::from_micros((preamble_us + payload_symbols * t_sym) as u64)
    }
}

/// Expected time on air for `payload_len` bytes at the given modulation
/// (explicit header, CRC on, 8-symbol preamble).
pub fn estimate_airtime(
    payload_len: usize,
    spreading_factor: u8,
    bandwidth_hz: u32,
    coding_rate: u8,
) -> Duration {
    AirtimeParams {
        spreading_factor,
        bandwidth_hz,
        coding_rate,
        ..AirtimeParams::default()
    }
    .airtime(payload_len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_value_sf7() {
        // 12.25 preamble symbols + 43 payload symbols at 1.024 ms
        let us = estimate_airtime(20, 7, 125_000, 5).as_micros();
        assert!((56_500..=56_700).contains(&us), "got {} us", us);
    }

    #[test]
    fn test_symbol_time() {
        let params = AirtimeParams::default();
        assert!((params.symbol_time_us() - 1024.0).abs() < 0.01);
        assert!(!params.low_data_rate_optimize());

        let slow = AirtimeParams {
            spreading_factor: 12,
            ..AirtimeParams::default()
        };
        assert!(slow.low_data_rate_optimize());
    }

    #[test]
    fn test_longer_payload_takes_longer() {
        let params = AirtimeParams::default();
        assert!(params.airtime(200) > params.airtime(20));
        assert!(params.airtime(0) > Duration::ZERO);
    }

    #[test]
    fn test_higher_sf_takes_longer() {
        assert!(estimate_airtime(50, 10, 125_000, 5) > estimate_airtime(50, 7, 125_000, 5));
        assert!(estimate_airtime(50, 12, 125_000, 5) > Duration::from_secs(1));
    }

    #[test]
    fn test_wider_bandwidth_is_faster() {
        assert!(estimate_airtime(50, 7, 500_000, 5) < estimate_airtime(50, 7, 125_000, 5));
    }

    #[test]
    fn test_zero_bandwidth_is_safe() {
        assert_eq!(estimate_airtime(50, 7, 0, 5), Duration::ZERO);
    }
}
