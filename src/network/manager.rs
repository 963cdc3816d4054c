use std::{collections::HashMap, io::Write, sync::Arc};

use ipnet::Ipv4Net;
use log::{debug, error, info, warn};
use tabwriter::TabWriter;

use super::{
    apply_port_mappings, endpoint_id, ipam::parse_subnet, remove_port_mappings, scan_networks,
    BridgeDriver, ConnectedEndpoint, ContainerInfo, Endpoint, Iptables, NamespaceConfigurator,
    NetnsConfigurator, Network, NetworkDriver, PeerConfig, PortForwarder, VethPair, IPAM,
};
use crate::{
    config::NetConfig,
    error::{NetError, Result},
};

/// Owns the driver table, the network registry and the allocator.
///
/// Calls are expected to be serialized by the engine: the allocator file and
/// the registry are not guarded against concurrent lifecycle operations.
pub struct NetworkManager {
    config: NetConfig,
    ipam: IPAM,
    drivers: HashMap<String, Arc<dyn NetworkDriver>>,
    networks: HashMap<String, Network>,
    netns: Arc<dyn NamespaceConfigurator>,
    forwarder: Arc<dyn PortForwarder>,
}

impl NetworkManager {
    /// Register the bridge driver and load the persisted networks.
    pub fn init(config: NetConfig) -> Result<Self> {
        let bridge: Arc<dyn NetworkDriver> = Arc::new(BridgeDriver);
        Self::with_parts(
            config,
            vec![bridge],
            Arc::new(NetnsConfigurator),
            Arc::new(Iptables),
        )
    }

    pub fn with_parts(
        config: NetConfig,
        drivers: Vec<Arc<dyn NetworkDriver>>,
        netns: Arc<dyn NamespaceConfigurator>,
        forwarder: Arc<dyn PortForwarder>,
    ) -> Result<Self> {
        let mut table = HashMap::new();
        for driver in drivers {
            let name = driver.name().to_string();
            if table.insert(name.clone(), driver).is_some() {
                warn!("Driver {name} registered twice, keeping the last one");
            }
        }

        let network_dir = config.network_dir();
        std::fs::create_dir_all(&network_dir).map_err(|e| {
            NetError::persistence(
                format!("Failed to create {}", network_dir.display()),
                Some(e.into()),
            )
        })?;

        let networks = scan_networks(&network_dir)?;
        info!(
            "Loaded {} network(s) from {}",
            networks.len(),
            network_dir.display()
        );

        Ok(Self {
            ipam: IPAM::new(config.ipam_path()),
            config,
            drivers: table,
            networks,
            netns,
            forwarder,
        })
    }

    pub fn config(&self) -> &NetConfig {
        &self.config
    }

    pub fn get_network(&self, name: &str) -> Option<&Network> {
        self.networks.get(name)
    }

    /// Create a network named `name` over `subnet`, with the subnet's
    /// gateway address on the driver's device.
    pub async fn create_network(&mut self, driver: &str, subnet: &str, name: &str) -> Result<()> {
        let driver = self
            .drivers
            .get(driver)
            .ok_or_else(|| NetError::not_found("driver", driver))?;
        let subnet = parse_subnet(subnet)?;

        let gateway = self.ipam.allocate_gateway(&subnet)?;
        let ip_range = Ipv4Net::new(gateway, subnet.prefix_len())
            .map_err(|e| NetError::invalid_subnet(&subnet.to_string(), e))?;

        let network = match driver.create(ip_range, name).await {
            Ok(network) => network,
            Err(e) => {
                if let Err(release) = self.ipam.release(&subnet, gateway) {
                    error!("Failed to release gateway {gateway} of {subnet}: {release}");
                }
                return Err(e);
            }
        };

        if let Err(e) = network.dump(self.config.network_dir()) {
            if let Err(cleanup) = driver.delete(&network).await {
                warn!("Failed to remove device of network {name}: {cleanup}");
            }
            release_quietly(&mut self.ipam, &subnet, gateway);
            return Err(e);
        }

        if self.networks.insert(name.to_string(), network).is_some() {
            warn!("Network {name} replaced");
        }
        info!("Network {name} created over {ip_range}");

        Ok(())
    }

    /// Release the gateway, remove the device and forget the network.
    pub async fn delete_network(&mut self, name: &str) -> Result<()> {
        let network = self
            .networks
            .get(name)
            .ok_or_else(|| NetError::not_found("network", name))?;
        let driver = self
            .drivers
            .get(&network.driver)
            .ok_or_else(|| NetError::not_found("driver", &network.driver))?;

        self.ipam.release(&network.subnet(), network.gateway())?;
        driver.delete(network).await?;
        network.remove(self.config.network_dir())?;

        self.networks.remove(name);
        info!("Network {name} deleted");

        Ok(())
    }

    /// Attach a running container to a network.
    ///
    /// Allocation, driver and namespace failures abort the call and undo
    /// what was done so far. Port mapping failures are only logged.
    pub async fn connect(
        &mut self,
        network_name: &str,
        container: &ContainerInfo,
    ) -> Result<ConnectedEndpoint> {
        let network = self
            .networks
            .get(network_name)
            .ok_or_else(|| NetError::not_found("network", network_name))?;
        let driver = self
            .drivers
            .get(&network.driver)
            .ok_or_else(|| NetError::not_found("driver", &network.driver))?;

        let subnet = network.subnet();
        let ip = self.ipam.allocate(&subnet)?;
        let mut endpoint = Endpoint::new(container, network, ip);

        if let Err(e) = driver.connect(network, &mut endpoint).await {
            release_quietly(&mut self.ipam, &subnet, ip);
            return Err(e);
        }

        if let Err(e) = self
            .netns
            .configure(container.pid, PeerConfig::from(&endpoint))
            .await
        {
            if let Err(cleanup) = driver.disconnect(network, &endpoint.device).await {
                warn!("Failed to unplug endpoint {}: {cleanup}", endpoint.id);
            }
            release_quietly(&mut self.ipam, &subnet, ip);
            return Err(e);
        }

        let applied = apply_port_mappings(self.forwarder.as_ref(), &endpoint.port_mapping, ip).await;
        debug!(
            "Applied {applied}/{} port mapping(s) for {}",
            endpoint.port_mapping.len(),
            endpoint.id
        );

        info!(
            "Container {} connected to {network_name} as {ip}",
            container.id
        );
        Ok(ConnectedEndpoint::from(&endpoint))
    }

    /// Detach a container: unplug its device pair and, when the engine
    /// recorded the address, drop its forwarding rules and release it.
    pub async fn disconnect(&mut self, network_name: &str, container: &ContainerInfo) -> Result<()> {
        let network = self
            .networks
            .get(network_name)
            .ok_or_else(|| NetError::not_found("network", network_name))?;
        let driver = self
            .drivers
            .get(&network.driver)
            .ok_or_else(|| NetError::not_found("driver", &network.driver))?;

        let device = VethPair::for_endpoint(&endpoint_id(&container.id, network_name));
        driver.disconnect(network, &device).await?;

        if let Some(ip) = container.ip_address {
            remove_port_mappings(self.forwarder.as_ref(), &container.port_mapping, ip).await;
            self.ipam.release(&network.subnet(), ip)?;
        }

        info!(
            "Container {} disconnected from {network_name}",
            container.id
        );
        Ok(())
    }

    /// Registered networks, by name.
    pub fn list_networks(&self) -> Vec<&Network> {
        let mut networks: Vec<&Network> = self.networks.values().collect();
        networks.sort_by(|a, b| a.name.cmp(&b.name));
        networks
    }

    pub fn format_networks(&self) -> String {
        let mut tw = TabWriter::new(vec![]).padding(3);
        let _ = tw.write_all(b"NAME\tIpRange\tDriver\n");

        for network in self.list_networks() {
            let _ = writeln!(
                tw,
                "{}\t{}\t{}",
                network.name, network.ip_range, network.driver
            );
        }

        match tw.into_inner() {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) => {
                error!("Failed to flush network table: {e}");
                String::new()
            }
        }
    }

    pub fn print_networks(&self) {
        print!("{}", self.format_networks());
    }
}

fn release_quietly(ipam: &mut IPAM, subnet: &Ipv4Net, ip: std::net::Ipv4Addr) {
    if let Err(e) = ipam.release(subnet, ip) {
        error!("Failed to release {ip} of {subnet}: {e}");
    }
}
