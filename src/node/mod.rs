//! Mesh node runtime.
//!
//! This module provides:
//! - [`NodeState`]: the protocol tables shared by every thread of a node
//! - [`MeshHandler`]: the callbacks an application implements
//! - [`MeshNode`]: the receive loop plus the blocking send/request API

mod handler;
mod runtime;
mod state;

pub use handler::{MeshHandler, NoopHandler};
pub use runtime::MeshNode;
pub use state::{AckCache, NodeState, RelayLog, ACK_CACHE_SIZE, RELAY_LOG_SIZE};
