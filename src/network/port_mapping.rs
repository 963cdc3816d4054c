use std::{net::Ipv4Addr, str::FromStr};

use anyhow::Context;
use async_trait::async_trait;
use log::{debug, error};

use crate::error::{NetError, Result};

/// One `hostPort:containerPort` entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMapping {
    pub host_port: u16,
    pub container_port: u16,
}

impl FromStr for PortMapping {
    type Err = NetError;

    fn from_str(s: &str) -> Result<Self> {
        let malformed = || NetError::PortMapping {
            message: format!("expected hostPort:containerPort, got {s:?}"),
        };

        let fields: Vec<&str> = s.split(':').collect();
        let [host, container] = fields.as_slice() else {
            return Err(malformed());
        };

        Ok(PortMapping {
            host_port: host.trim().parse().map_err(|_| malformed())?,
            container_port: container.trim().parse().map_err(|_| malformed())?,
        })
    }
}

/// Installs destination-NAT rules.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PortForwarder: Send + Sync {
    async fn insert(&self, mapping: PortMapping, ip: Ipv4Addr) -> Result<()>;

    async fn remove(&self, mapping: PortMapping, ip: Ipv4Addr) -> Result<()>;
}

/// Forwarding through the `nat` table's PREROUTING chain.
#[derive(Debug, Default, Clone, Copy)]
pub struct Iptables;

#[async_trait]
impl PortForwarder for Iptables {
    async fn insert(&self, mapping: PortMapping, ip: Ipv4Addr) -> Result<()> {
        let args = dnat_args("-A", mapping, ip);
        exec_iptables(&args).await.map_err(|e| NetError::PortMapping {
            message: format!("{e:#}"),
        })
    }

    async fn remove(&self, mapping: PortMapping, ip: Ipv4Addr) -> Result<()> {
        let args = dnat_args("-D", mapping, ip);
        exec_iptables(&args).await.map_err(|e| NetError::PortMapping {
            message: format!("{e:#}"),
        })
    }
}

fn dnat_args(op: &str, mapping: PortMapping, ip: Ipv4Addr) -> Vec<String> {
    [
        "-t",
        "nat",
        op,
        "PREROUTING",
        "-p",
        "tcp",
        "-m",
        "tcp",
        "--dport",
        mapping.host_port.to_string().as_str(),
        "-j",
        "DNAT",
        "--to-destination",
        format!("{ip}:{}", mapping.container_port).as_str(),
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

pub(super) async fn exec_iptables<S: AsRef<str>>(args: &[S]) -> anyhow::Result<()> {
    let args: Vec<&str> = args.iter().map(AsRef::as_ref).collect();

    let output = tokio::process::Command::new("iptables")
        .args(&args)
        .output()
        .await
        .context("Failed to spawn `iptables`")?;

    if output.status.success() {
        return Ok(());
    }

    Err(anyhow::anyhow!(
        "`iptables {}` exited with {}: {}",
        args.join(" "),
        output.status,
        String::from_utf8_lossy(&output.stderr).trim()
    ))
}

/// Insert a forwarding rule for every well-formed entry. Malformed entries
/// and failed inserts are logged and skipped. Returns the number of rules
/// inserted.
pub async fn apply_port_mappings(
    forwarder: &dyn PortForwarder,
    entries: &[String],
    ip: Ipv4Addr,
) -> usize {
    let mut applied = 0;

    for entry in entries {
        let mapping = match entry.parse::<PortMapping>() {
            Ok(mapping) => mapping,
            Err(e) => {
                error!("Skipping port mapping: {e}");
                continue;
            }
        };

        match forwarder.insert(mapping, ip).await {
            Ok(()) => {
                debug!(
                    "Forwarding host port {} to {ip}:{}",
                    mapping.host_port, mapping.container_port
                );
                applied += 1;
            }
            Err(e) => error!("Failed to forward {entry} to {ip}: {e}"),
        }
    }

    applied
}

/// Best-effort inverse of [`apply_port_mappings`].
pub async fn remove_port_mappings(
    forwarder: &dyn PortForwarder,
    entries: &[String],
    ip: Ipv4Addr,
) -> usize {
    let mut removed = 0;

    for entry in entries {
        let Ok(mapping) = entry.parse::<PortMapping>() else {
            continue;
        };

        match forwarder.remove(mapping, ip).await {
            Ok(()) => removed += 1,
            Err(e) => error!("Failed to remove forwarding {entry} to {ip}: {e}"),
        }
    }

    removed
}

#[cfg(test)]
mod tests {
    use super::*;

    use mockall::predicate::eq;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    const IP: Ipv4Addr = Ipv4Addr::new(192, 168, 0, 2);

    fn entries(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[rstest]
    #[case("8080:80", 8080, 80)]
    #[case(" 443 : 8443 ", 443, 8443)]
    fn test_parse(#[case] entry: &str, #[case] host: u16, #[case] container: u16) {
        assert_eq!(
            entry.parse::<PortMapping>().unwrap(),
            PortMapping {
                host_port: host,
                container_port: container,
            }
        );
    }

    #[rstest]
    #[case("8080")]
    #[case("8080:80:90")]
    #[case("http:80")]
    #[case("70000:80")]
    #[case("")]
    fn test_parse_malformed(#[case] entry: &str) {
        assert!(matches!(
            entry.parse::<PortMapping>(),
            Err(NetError::PortMapping { .. })
        ));
    }

    #[test]
    fn test_dnat_rule() {
        let mapping = "8080:80".parse().unwrap();
        assert_eq!(
            dnat_args("-A", mapping, IP).join(" "),
            "-t nat -A PREROUTING -p tcp -m tcp --dport 8080 -j DNAT --to-destination 192.168.0.2:80"
        );
    }

    #[tokio::test]
    async fn test_single_mapping_inserts_one_rule() {
        let mut forwarder = MockPortForwarder::new();
        forwarder
            .expect_insert()
            .with(
                eq(PortMapping {
                    host_port: 8080,
                    container_port: 80,
                }),
                eq(IP),
            )
            .times(1)
            .returning(|_, _| Ok(()));

        let applied = apply_port_mappings(&forwarder, &entries(&["8080:80"]), IP).await;
        assert_eq!(applied, 1);
    }

    #[tokio::test]
    async fn test_malformed_entry_does_not_stop_the_rest() {
        let mut forwarder = MockPortForwarder::new();
        forwarder
            .expect_insert()
            .withf(|mapping, _| mapping.host_port == 9090)
            .times(1)
            .returning(|_, _| Ok(()));

        let applied = apply_port_mappings(&forwarder, &entries(&["8080", "9090:90"]), IP).await;
        assert_eq!(applied, 1);
    }

    #[tokio::test]
    async fn test_failed_insert_is_skipped() {
        let mut forwarder = MockPortForwarder::new();
        forwarder
            .expect_insert()
            .withf(|mapping, _| mapping.host_port == 1000)
            .times(1)
            .returning(|_, _| {
                Err(NetError::PortMapping {
                    message: "rule rejected".to_string(),
                })
            });
        forwarder
            .expect_insert()
            .withf(|mapping, _| mapping.host_port == 2000)
            .times(1)
            .returning(|_, _| Ok(()));

        let applied =
            apply_port_mappings(&forwarder, &entries(&["1000:10", "2000:20"]), IP).await;
        assert_eq!(applied, 1);
    }

    #[tokio::test]
    async fn test_remove_skips_malformed() {
        let mut forwarder = MockPortForwarder::new();
        forwarder
            .expect_remove()
            .times(1)
            .returning(|_, _| Ok(()));

        let removed = remove_port_mappings(&forwarder, &entries(&["bad", "8080:80"]), IP).await;
        assert_eq!(removed, 1);
    }
}
