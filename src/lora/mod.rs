//! LoRa radio support.
//!
//! This module contains:
//! - [`config`]: modulation settings every node shares
//! - [`airtime`]: time-on-air estimate for LoRa frames
//! - [`collision`]: randomized transmit jitter and retry backoff
//! - [`radio`]: the byte-pipe trait the transport drives
//! - [`sim`]: in-process channel for tests
//! - [`udp`]: UDP stand-in used by the host binary

mod airtime;
mod collision;
mod config;
mod radio;
mod sim;
mod udp;

pub use airtime::{estimate_airtime, AirtimeParams};
pub use collision::{CollisionAvoidance, CollisionConfig, CollisionError};
pub use config::{
    BANDWIDTH_HZ, CODING_RATE, FREQUENCY_MHZ, LORA_MTU, PREAMBLE_LENGTH, SPREADING_FACTOR,
};
pub use radio::Radio;
pub use sim::{FrameFilter, SimRadio, SimulatedChannel};
pub use udp::{parse_peers, UdpRadio};
