//! Outgoing sequence counter.

use rand_core::{OsRng, RngCore};

/// This node's outgoing sequence numbers, wrapping at 65536.
#[derive(Debug, Clone)]
pub struct SequenceCounter {
    current: u16,
}

impl SequenceCounter {
    /// Start from a fixed value. The first call to [`next`](Self::next)
    /// returns `start + 1`.
    pub fn starting_at(start: u16) -> Self {
        Self { current: start }
    }

    /// Start from a random value so a rebooted node is unlikely to reuse the
    /// numbers it sent before the restart.
    pub fn random() -> Self {
        Self::starting_at((OsRng.next_u32() & 0xFFFF) as u16)
    }

    /// Advance and return the next sequence number.
    pub fn next(&mut self) -> u16 {
        self.current = self.current.wrapping_add(1);
        self.current
    }

    /// Last number handed out (or the seed if none yet).
    pub fn current(&self) -> u16 {
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_increments() {
        let mut counter = SequenceCounter::starting_at(41);
        assert_eq!(counter.next(), 42);
        assert_eq!(counter.next(), 43);
        assert_eq!(counter.current(), 43);
    }

    #[test]
    fn test_next_wraps() {
        let mut counter = SequenceCounter::starting_at(65534);
        assert_eq!(counter.next(), 65535);
        assert_eq!(counter.next(), 0);
        assert_eq!(counter.next(), 1);
    }
}
