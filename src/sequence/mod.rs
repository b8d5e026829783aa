//! Sequence numbering and duplicate/loop suppression.
//!
//! This module provides:
//! - [`SequenceCounter`]: this node's outgoing numbering
//! - [`ReplayWindow`] and [`is_newer`]: wraparound-safe sequence comparison
//! - [`SequenceTracker`]: the admission decision for every received packet

mod counter;
mod tracker;
mod window;

pub use counter::SequenceCounter;
pub use tracker::{
    Decision, RejectReason, SeenCache, SeenCacheConfig, SeenCacheError, SequenceTracker,
};
pub use window::{is_newer, ReplayWindow, WINDOW_SIZE};
