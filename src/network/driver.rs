use async_trait::async_trait;
use ipnet::Ipv4Net;

use super::{Endpoint, Network, VethPair};
use crate::error::Result;

/// A network backend, registered under [`NetworkDriver::name`].
#[async_trait]
pub trait NetworkDriver: Send + Sync {
    fn name(&self) -> &str;

    /// Create the device backing a network. `ip_range` carries the gateway
    /// address and the subnet prefix.
    async fn create(&self, ip_range: Ipv4Net, name: &str) -> Result<Network>;

    async fn delete(&self, network: &Network) -> Result<()>;

    /// Plug an endpoint into the network. The peer side is left in the host
    /// namespace for the caller to move.
    async fn connect(&self, network: &Network, endpoint: &mut Endpoint<'_>) -> Result<()>;

    /// Unplug the device pair of an endpoint. A pair that is already gone is
    /// not an error.
    async fn disconnect(&self, network: &Network, device: &VethPair) -> Result<()>;
}
