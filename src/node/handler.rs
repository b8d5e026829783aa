//! Application callbacks.

use crate::packet::Packet;

/// Hooks the application implements to see mesh traffic.
///
/// Every method runs on the receive loop thread and blocks the radio while it
/// runs, so implementations should return quickly. All methods have no-op
/// defaults; a pure repeater usually implements none of them.
pub trait MeshHandler: Send + Sync {
    /// A `DATA`, `CMD` or `BEACON` packet was accepted for this node (or as a
    /// broadcast). Follow-up parts of a multi-packet response are not passed
    /// here; they are returned from the request that asked for them.
    fn on_message(&self, packet: &Packet, rssi: Option<i32>) {
        let _ = (packet, rssi);
    }

    /// An ACK-requested `DATA` or `CMD` packet addressed to this node.
    ///
    /// The returned records form the response: the first rides in the ACK,
    /// the rest are sent as flow-controlled follow-ups. Return an empty list
    /// for a bare acknowledgement.
    fn on_request(&self, packet: &Packet) -> Vec<Vec<u8>> {
        let _ = packet;
        Vec::new()
    }

    /// This node relayed `packet` (as received, before rewriting).
    fn on_forward(&self, packet: &Packet, rssi: Option<i32>) {
        let _ = (packet, rssi);
    }
}

/// Handler that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

impl MeshHandler for NoopHandler {}
