use std::{fmt, net::Ipv4Addr};

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::Network;

/// Hex digits of the endpoint id digest used in interface names. Interface
/// names are limited to 15 bytes.
const IFNAME_ID_LEN: usize = 8;

/// What the engine knows about a container when attaching it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub id: String,
    pub pid: i32,
    /// `hostPort:containerPort` entries.
    pub port_mapping: Vec<String>,
    /// Address handed out by a previous connect, if the engine kept it.
    pub ip_address: Option<Ipv4Addr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        <[u8; 6]>::try_from(bytes).ok().map(MacAddr)
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

/// The two ends of a veth pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VethPair {
    pub host: String,
    pub peer: String,
}

impl VethPair {
    /// Names derived from a digest of the whole endpoint id, so the same
    /// container on two networks gets two distinct pairs.
    pub fn for_endpoint(endpoint_id: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(endpoint_id.as_bytes());
        let digest = hex::encode(hasher.finalize());
        let short = &digest[..IFNAME_ID_LEN];

        Self {
            host: format!("veth{short}"),
            peer: format!("cif-{short}"),
        }
    }
}

/// A container's attachment to a network. Built per connect, never stored.
#[derive(Debug)]
pub struct Endpoint<'a> {
    pub id: String,
    pub device: VethPair,
    pub ip_address: Ipv4Addr,
    pub mac_address: Option<MacAddr>,
    pub network: &'a Network,
    pub port_mapping: Vec<String>,
}

impl<'a> Endpoint<'a> {
    pub fn new(container: &ContainerInfo, network: &'a Network, ip_address: Ipv4Addr) -> Self {
        let id = endpoint_id(&container.id, &network.name);

        Self {
            device: VethPair::for_endpoint(&id),
            id,
            ip_address,
            mac_address: None,
            network,
            port_mapping: container.port_mapping.clone(),
        }
    }

    /// The peer address with the network's prefix length.
    pub fn interface_address(&self) -> Ipv4Net {
        Ipv4Net::new(self.ip_address, self.network.ip_range.prefix_len())
            .unwrap_or_else(|_| Ipv4Net::from(self.ip_address))
    }
}

pub fn endpoint_id(container_id: &str, network_name: &str) -> String {
    format!("{container_id}-{network_name}")
}

/// Owned record of a finished connect, for the engine to keep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectedEndpoint {
    pub id: String,
    pub network: String,
    pub device: VethPair,
    pub ip_address: Ipv4Addr,
    pub mac_address: Option<MacAddr>,
}

impl From<&Endpoint<'_>> for ConnectedEndpoint {
    fn from(endpoint: &Endpoint<'_>) -> Self {
        Self {
            id: endpoint.id.clone(),
            network: endpoint.network.name.clone(),
            device: endpoint.device.clone(),
            ip_address: endpoint.ip_address,
            mac_address: endpoint.mac_address,
        }
    }
}
