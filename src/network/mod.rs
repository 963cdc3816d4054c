mod bridge;
mod driver;
mod endpoint;
mod ipam;
mod manager;
mod netns;
#[allow(clippy::module_inception)]
mod network;
mod port_mapping;

pub use bridge::{BridgeDriver, BRIDGE_DRIVER};
pub use driver::NetworkDriver;
pub use endpoint::{endpoint_id, ConnectedEndpoint, ContainerInfo, Endpoint, MacAddr, VethPair};
pub use ipam::{parse_subnet, GATEWAY_OFFSET, IPAM};
pub use manager::NetworkManager;
pub use netns::{netns_path, NamespaceConfigurator, NetnsConfigurator, NetnsGuard, PeerConfig};
pub use network::{scan_networks, Network};
pub use port_mapping::{
    apply_port_mappings, remove_port_mappings, Iptables, PortForwarder, PortMapping,
};
