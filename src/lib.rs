//! Dismissal mesh transport library.
//!
//! Reliable messaging for the dismissal-scanning network: scanners send QR
//! lookups to a server over LoRa, possibly through repeaters, and get back
//! acknowledged, possibly multi-packet, answers. Everything here runs on the
//! host; the radio driver plugs in through [`lora::Radio`].

pub mod clock;
pub mod config;
pub mod delivery;
pub mod forwarding;
pub mod lora;
pub mod node;
pub mod packet;
pub mod sequence;
pub mod stats;
pub mod transceiver;

// Re-export commonly used items
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, NodeConfig, NodeRole};
pub use delivery::{DeliveryError, RetryPolicy};
pub use forwarding::{create_repeat, ForwardingEngine};
pub use lora::{CollisionAvoidance, Radio, SimulatedChannel, UdpRadio};
pub use node::{MeshHandler, MeshNode, NoopHandler};
pub use packet::{decode, encode, DecodeError, EncodeError, Packet, PacketType};
pub use sequence::{Decision, RejectReason, SequenceTracker};
pub use stats::{NodeStats, StatsServer};
pub use transceiver::{Disposition, Inbound, Transceiver};
