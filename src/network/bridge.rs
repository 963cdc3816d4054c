use std::net::Ipv4Addr;

use anyhow::Context;
use async_trait::async_trait;
use futures::TryStreamExt;
use ipnet::Ipv4Net;
use log::{debug, info, warn};
use netlink_packet_route::link::{LinkAttribute, LinkMessage};

use super::{
    driver::NetworkDriver, port_mapping::exec_iptables, Endpoint, MacAddr, Network, VethPair,
};
use crate::error::{NetError, Result};

pub const BRIDGE_DRIVER: &str = "bridge";

/// Linux bridge backed networks.
#[derive(Debug, Default, Clone, Copy)]
pub struct BridgeDriver;

#[async_trait]
impl NetworkDriver for BridgeDriver {
    fn name(&self) -> &str {
        BRIDGE_DRIVER
    }

    async fn create(&self, ip_range: Ipv4Net, name: &str) -> Result<Network> {
        self.create_bridge(name)
            .await
            .map_err(|e| NetError::from_driver(&format!("Failed to create bridge {name}"), e))?;

        if let Err(e) = self.setup_bridge(name, ip_range).await {
            if let Err(cleanup) = self.delete_link(name).await {
                warn!("Failed to clean up bridge {name}: {cleanup:#}");
            }
            return Err(NetError::from_driver(
                &format!("Failed to set up bridge {name}"),
                e,
            ));
        }

        info!("Bridge {name} up with gateway {ip_range}");
        Ok(Network::new(name, ip_range, BRIDGE_DRIVER))
    }

    async fn delete(&self, network: &Network) -> Result<()> {
        self.clear_basic_iptables(&network.name, network.subnet())
            .await;

        self.delete_link(&network.name).await.map_err(|e| {
            NetError::from_driver(&format!("Failed to delete bridge {}", network.name), e)
        })
    }

    async fn connect(&self, network: &Network, endpoint: &mut Endpoint<'_>) -> Result<()> {
        let device = &endpoint.device;

        self.create_veth_pair(&device.host, &device.peer)
            .await
            .map_err(|e| NetError::from_driver("Failed to create veth pair", e))?;

        let plugged: anyhow::Result<Option<MacAddr>> = async {
            self.add_to_bridge(&device.host, &network.name)
                .await
                .context("Failed to add veth to bridge")?;

            self.set_link_up(&device.host)
                .await
                .context("Failed to set host veth up")?;

            self.link_mac(&device.peer)
                .await
                .context("Failed to read peer veth address")
        }
        .await;

        match plugged {
            Ok(mac) => {
                endpoint.mac_address = mac;
                debug!(
                    "Endpoint {} plugged into {} as {}",
                    endpoint.id, network.name, endpoint.device.host
                );
                Ok(())
            }
            Err(e) => {
                // Removing one end removes the pair.
                if let Err(cleanup) = self.delete_link(&device.host).await {
                    warn!("Failed to clean up veth {}: {cleanup:#}", device.host);
                }
                Err(NetError::from_driver(
                    &format!("Failed to connect endpoint {}", endpoint.id),
                    e,
                ))
            }
        }
    }

    async fn disconnect(&self, network: &Network, device: &VethPair) -> Result<()> {
        let (connection, handle, _) =
            rtnetlink::new_connection().map_err(|e| NetError::driver("Netlink", Some(e.into())))?;
        tokio::spawn(connection);

        let link = match get_link_by_name(&device.host, &handle).await {
            Ok(link) => link,
            Err(e) => {
                debug!(
                    "Veth {} on {} is already gone: {e:#}",
                    device.host, network.name
                );
                return Ok(());
            }
        };

        handle
            .link()
            .del(link.header.index)
            .execute()
            .await
            .map_err(|e| {
                NetError::driver(
                    format!("Failed to delete veth {}", device.host),
                    Some(e.into()),
                )
            })
    }
}

impl BridgeDriver {
    async fn setup_bridge(&self, name: &str, ip_range: Ipv4Net) -> anyhow::Result<()> {
        self.set_link_ip(name, ip_range.addr(), ip_range.prefix_len())
            .await
            .context("Failed to assign gateway address")?;
        self.set_link_up(name)
            .await
            .context("Failed to set bridge up")?;
        self.set_basic_iptables(name, ip_range.trunc())
            .await
            .context("Failed to install bridge rules")
    }

    async fn create_bridge(&self, name: &str) -> anyhow::Result<()> {
        let (connection, handle, _) = rtnetlink::new_connection()?;
        tokio::spawn(connection);

        handle
            .link()
            .add()
            .bridge(name.to_string())
            .execute()
            .await?;
        Ok(())
    }

    async fn delete_link(&self, name: &str) -> anyhow::Result<()> {
        let (connection, handle, _) = rtnetlink::new_connection()?;
        tokio::spawn(connection);

        let link = get_link_by_name(name, &handle).await?;
        handle.link().del(link.header.index).execute().await?;

        Ok(())
    }

    async fn create_veth_pair(&self, host_veth: &str, peer_veth: &str) -> anyhow::Result<()> {
        let (connection, handle, _) = rtnetlink::new_connection()?;
        tokio::spawn(connection);

        handle
            .link()
            .add()
            .veth(host_veth.to_string(), peer_veth.to_string())
            .execute()
            .await?;

        Ok(())
    }

    async fn set_link_ip(&self, name: &str, ip: Ipv4Addr, prefix_len: u8) -> anyhow::Result<()> {
        let (connection, handle, _) = rtnetlink::new_connection()?;
        tokio::spawn(connection);

        let link = get_link_by_name(name, &handle).await?;
        handle
            .address()
            .add(link.header.index, ip.into(), prefix_len)
            .execute()
            .await?;

        Ok(())
    }

    async fn add_to_bridge(&self, iface: &str, bridge: &str) -> anyhow::Result<()> {
        let (connection, handle, _) = rtnetlink::new_connection()?;
        tokio::spawn(connection);

        let bridge_link = get_link_by_name(bridge, &handle).await?;
        let iface_link = get_link_by_name(iface, &handle).await?;

        handle
            .link()
            .set(iface_link.header.index)
            .controller(bridge_link.header.index)
            .execute()
            .await?;

        Ok(())
    }

    async fn set_link_up(&self, name: &str) -> anyhow::Result<()> {
        let (connection, handle, _) = rtnetlink::new_connection()?;
        tokio::spawn(connection);

        let link = get_link_by_name(name, &handle).await?;
        handle.link().set(link.header.index).up().execute().await?;

        Ok(())
    }

    async fn link_mac(&self, name: &str) -> anyhow::Result<Option<MacAddr>> {
        let (connection, handle, _) = rtnetlink::new_connection()?;
        tokio::spawn(connection);

        let link = get_link_by_name(name, &handle).await?;
        Ok(link.attributes.iter().find_map(|attr| match attr {
            LinkAttribute::Address(bytes) => MacAddr::from_bytes(bytes),
            _ => None,
        }))
    }

    async fn set_basic_iptables(&self, name: &str, subnet: Ipv4Net) -> anyhow::Result<()> {
        exec_iptables(&forward_rule("-A", name))
            .await
            .context("Failed to set FORWARD rule")?;

        exec_iptables(&masquerade_rule("-A", subnet))
            .await
            .context("Failed to set MASQUERADE rule")?;

        Ok(())
    }

    async fn clear_basic_iptables(&self, name: &str, subnet: Ipv4Net) {
        if let Err(e) = exec_iptables(&forward_rule("-D", name)).await {
            warn!("Failed to remove FORWARD rule of {name}: {e:#}");
        }
        if let Err(e) = exec_iptables(&masquerade_rule("-D", subnet)).await {
            warn!("Failed to remove MASQUERADE rule of {subnet}: {e:#}");
        }
    }
}

fn forward_rule(op: &str, bridge: &str) -> Vec<String> {
    ["-t", "filter", op, "FORWARD", "-i", bridge, "-j", "ACCEPT"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn masquerade_rule(op: &str, subnet: Ipv4Net) -> Vec<String> {
    let subnet = subnet.to_string();
    ["-t", "nat", op, "POSTROUTING", "-s", subnet.as_str(), "-j", "MASQUERADE"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

pub(super) async fn get_link_by_name(
    name: &str,
    handle: &rtnetlink::Handle,
) -> anyhow::Result<LinkMessage> {
    handle
        .link()
        .get()
        .match_name(name.to_string())
        .execute()
        .try_next()
        .await?
        .ok_or(anyhow::anyhow!("Link {name} not found"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn is_root() -> bool {
        nix::unistd::geteuid().is_root()
    }

    #[test]
    fn test_bridge_rules() {
        assert_eq!(
            forward_rule("-A", "net1").join(" "),
            "-t filter -A FORWARD -i net1 -j ACCEPT"
        );
        assert_eq!(
            masquerade_rule("-D", "192.168.0.0/24".parse().unwrap()).join(" "),
            "-t nat -D POSTROUTING -s 192.168.0.0/24 -j MASQUERADE"
        );
    }

    #[test]
    fn test_driver_name() {
        assert_eq!(BridgeDriver.name(), "bridge");
    }

    #[tokio::test]
    async fn test_bridge_lifecycle() {
        if !is_root() {
            println!("Skipping bridge test - requires root privileges");
            return;
        }

        let driver = BridgeDriver;
        let ip_range: Ipv4Net = "10.213.7.1/24".parse().unwrap();

        let network = match driver.create(ip_range, "rtaintest0").await {
            Ok(network) => network,
            Err(e) => {
                println!("Skipping bridge test - cannot create bridge: {e}");
                return;
            }
        };
        assert_eq!(network.gateway(), Ipv4Addr::new(10, 213, 7, 1));

        let container = crate::network::ContainerInfo {
            id: "bridgetest".to_string(),
            ..Default::default()
        };
        let mut endpoint =
            Endpoint::new(&container, &network, Ipv4Addr::new(10, 213, 7, 2));

        driver.connect(&network, &mut endpoint).await.unwrap();
        assert!(endpoint.mac_address.is_some());

        driver
            .disconnect(&network, &endpoint.device)
            .await
            .unwrap();
        // The pair is gone now; a second disconnect is fine.
        driver
            .disconnect(&network, &endpoint.device)
            .await
            .unwrap();

        driver.delete(&network).await.unwrap();
    }
}
