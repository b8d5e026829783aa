//! Node configuration management.
//!
//! # Components
//!
//! - [`NodeConfig`] - node identity, role and protocol tuning, loadable from
//!   JSON or the environment
//! - [`NodeRole`] - server / scanner / repeater, each with a reserved ID band

mod node;

pub use node::{
    ConfigError, NodeConfig, NodeRole, ENV_CONFIG_PATH, ENV_NODE_ID, ENV_ROLE,
};
