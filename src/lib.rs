//! Network control plane of the rtain container engine: subnet allocation,
//! bridge networks, container endpoints and port forwarding.

pub mod config;
pub mod error;
pub mod network;

pub use crate::config::NetConfig;
pub use crate::error::{NetError, NetnsStep, Result};
pub use crate::network::{ConnectedEndpoint, ContainerInfo, Network, NetworkManager};
