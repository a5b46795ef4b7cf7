#![forbid(unsafe_code)]

//! Bring-up of a local Lightning test network: one mining node and a chain
//! of light clients, funded, peered and connected by channels, with their
//! credentials exported for downstream services.

/// Backing chain controller
pub mod chain;
/// Command templates and response parsing
pub mod compose;
pub mod config;
pub mod coordinator;
pub mod credentials;
pub mod error;
pub mod executor;
/// Typed node and chain CLI responses
pub mod model;
pub mod node;
pub mod poller;
pub mod sidecar;
pub mod topology;

#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;

pub use config::{Network, SimnetConfig};
pub use error::{Error, Result};
pub use executor::{CommandExecutor, CommandOutput, CommandSpec, ShellExecutor};
pub use node::{ChannelPeer, NodeHandle};
pub use topology::{NetworkSummary, TopologyDriver};
