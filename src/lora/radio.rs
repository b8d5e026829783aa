//! Radio primitive consumed by the transport.
//!
//! The hardware driver lives outside this crate. All the mesh needs from it is
//! a half-duplex byte pipe: hand a frame to the transmitter, wait a bounded
//! time for a frame, and report the signal strength of the last frame heard.
//! No addressing, ordering or delivery guarantee is assumed.

use std::time::Duration;

/// A half-duplex packet radio.
pub trait Radio: Send {
    /// Queue `frame` for transmission.
    ///
    /// `true` means the hardware accepted the frame, not that anyone heard it.
    fn send(&mut self, frame: &[u8]) -> bool;

    /// Wait up to `timeout` for a frame.
    ///
    /// Returned bytes may start with a hardware header the caller must strip.
    fn receive(&mut self, timeout: Duration) -> Option<Vec<u8>>;

    /// RSSI in dBm of the last received frame, if the hardware reports one.
    fn last_rssi(&self) -> Option<i32>;
}

impl<R: Radio + ?Sized> Radio for Box<R> {
    fn send(&mut self, frame: &[u8]) -> bool {
        (**self).send(frame)
    }

    fn receive(&mut self, timeout: Duration) -> Option<Vec<u8>> {
        (**self).receive(timeout)
    }

    fn last_rssi(&self) -> Option<i32> {
        (**self).last_rssi()
    }
}
