//! 16-bit sequence arithmetic and the per-peer anti-replay window.
//!
//! Sequence numbers wrap at 65536, so "newer" is defined on the circle: `s` is
//! newer than `l` when the forward distance from `l` to `s` lies in
//! `[1, 32767]`. Anything else is at or behind `l`.
//!
//! A [`ReplayWindow`] remembers the latest admitted sequence for a peer plus a
//! bitmap of the [`WINDOW_SIZE`] sequences just before it. This catches
//! duplicates that arrive after newer packets (a retransmission overtaken by
//! the next request) while still letting a late, never-seen packet through.

/// Number of sequences behind the latest that are tracked individually.
pub const WINDOW_SIZE: u16 = 64;

/// Half the sequence space; forward distances at or above this are "behind".
const HALF_RANGE: u16 = 0x8000;

/// Whether `seq` is strictly newer than `last` under 16-bit wraparound.
pub fn is_newer(seq: u16, last: u16) -> bool {
    let distance = seq.wrapping_sub(last);
    distance != 0 && distance < HALF_RANGE
}

/// Sliding window of recently admitted sequence numbers for one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayWindow {
    latest: u16,
    /// Bit `i` set means `latest - i` was admitted. Bit 0 is `latest` itself.
    bitmap: u64,
}

impl ReplayWindow {
    /// Start a window whose only admitted sequence is `seq`.
    pub fn new(seq: u16) -> Self {
        Self {
            latest: seq,
            bitmap: 1,
        }
    }

    /// Latest admitted sequence.
    pub fn latest(&self) -> u16 {
        self.latest
    }

    /// Whether `seq` must be treated as already seen.
    ///
    /// Sequences older than the window are reported as duplicates: their
    /// history has been forgotten, so they cannot be proven fresh.
    pub fn is_duplicate(&self, seq: u16) -> bool {
        if is_newer(seq, self.latest) {
            return false;
        }
        let behind = self.latest.wrapping_sub(seq);
        if behind >= WINDOW_SIZE {
            return true;
        }
        self.bitmap & (1u64 << behind) != 0
    }

    /// Whether `seq` is `latest` or one of the sequences tracked behind it.
    pub fn in_window(&self, seq: u16) -> bool {
        !is_newer(seq, self.latest) && self.latest.wrapping_sub(seq) < WINDOW_SIZE
    }

    /// Mark `seq` as admitted, sliding the window forward if it is newer.
    pub fn record(&mut self, seq: u16) {
        if is_newer(seq, self.latest) {
            let shift = seq.wrapping_sub(self.latest);
            self.bitmap = if shift >= WINDOW_SIZE {
                0
            } else {
                self.bitmap << shift
            };
            self.bitmap |= 1;
            self.latest = seq;
        } else {
            let behind = self.latest.wrapping_sub(seq);
            if behind < WINDOW_SIZE {
                self.bitmap |= 1u64 << behind;
            }
        }
    }
}
