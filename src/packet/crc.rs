//! CRC-16/CCITT-FALSE frame check.
//!
//! Polynomial 0x1021, initial value 0xFFFF, no input/output reflection and no
//! final xor. Computed bitwise; frames are at most a few hundred bytes so a
//! lookup table buys nothing on the hosts and MCUs this runs on.

/// CCITT polynomial.
const POLY: u16 = 0x1021;

/// Initial register value.
const INIT: u16 = 0xFFFF;

/// Compute the CRC over `data`.
pub fn crc16_ccitt(data: &[u8]) -> u16 {
    data.iter().fold(INIT, |crc, &byte| update(crc, byte))
}

fn update(mut crc: u16, byte: u8) -> u16 {
    crc ^= (byte as u16) << 8;
    for _ in 0..8 {
        crc = if crc & 0x8000 != 0 {
            (crc << 1) ^ POLY
        } else {
            crc << 1
        };
    }
    crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_value() {
        // Standard check input for CRC-16/CCITT-FALSE
        assert_eq!(crc16_ccitt(b"123456789"), 0x29B1);
    }

    #[test]
    fn test_empty_input_is_init() {
        assert_eq!(crc16_ccitt(&[]), 0xFFFF);
    }

    #[test]
    fn test_single_bit_changes_crc() {
        let data = [0x49u8, 0x51, 0x01, 0x02];
        let base = crc16_ccitt(&data);
        for byte in 0..data.len() {
            for bit in 0..8 {
                let mut flipped = data;
                flipped[byte] ^= 1 << bit;
                assert_ne!(crc16_ccitt(&flipped), base, "byte {} bit {}", byte, bit);
            }
        }
    }
}
