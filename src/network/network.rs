use std::{
    collections::HashMap,
    net::Ipv4Addr,
    path::{Path, PathBuf},
};

use ipnet::Ipv4Net;
use log::{debug, error, warn};
use serde::{Deserialize, Serialize};

use crate::error::{NetError, Result};

/// A named virtual network.
///
/// `ip_range` keeps the gateway as its address, e.g. `192.168.0.1/24`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Network {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "IpRange")]
    pub ip_range: Ipv4Net,
    #[serde(rename = "Driver")]
    pub driver: String,
}

impl Network {
    pub fn new(name: &str, ip_range: Ipv4Net, driver: &str) -> Self {
        Self {
            name: name.to_string(),
            ip_range,
            driver: driver.to_string(),
        }
    }

    pub fn gateway(&self) -> Ipv4Addr {
        self.ip_range.addr()
    }

    /// The subnet this network allocates from.
    pub fn subnet(&self) -> Ipv4Net {
        self.ip_range.trunc()
    }

    /// Write the network to `<dir>/<name>`, replacing any previous file.
    pub fn dump(&self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir).map_err(|e| {
            NetError::persistence(format!("Failed to create {}", dir.display()), Some(e.into()))
        })?;

        let contents = serde_json::to_vec(self).map_err(|e| {
            NetError::persistence(format!("Failed to encode network {}", self.name), Some(e.into()))
        })?;

        let path = self.file_path(dir);
        std::fs::write(&path, contents).map_err(|e| {
            NetError::persistence(format!("Failed to write {}", path.display()), Some(e.into()))
        })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let contents = std::fs::read(path).map_err(|e| {
            NetError::persistence(format!("Failed to read {}", path.display()), Some(e.into()))
        })?;

        serde_json::from_slice(&contents).map_err(|e| {
            NetError::persistence(format!("Failed to decode {}", path.display()), Some(e.into()))
        })
    }

    /// Delete `<dir>/<name>`. A missing file is fine.
    pub fn remove(&self, dir: impl AsRef<Path>) -> Result<()> {
        let path = self.file_path(dir.as_ref());

        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(NetError::persistence(
                format!("Failed to remove {}", path.display()),
                Some(e.into()),
            )),
        }
    }

    fn file_path(&self, dir: &Path) -> PathBuf {
        dir.join(&self.name)
    }
}

/// Load every network file under `dir`, keyed by file name.
///
/// Unreadable or corrupt entries are logged and skipped, as is anything
/// that is not a regular file.
pub fn scan_networks(dir: impl AsRef<Path>) -> Result<HashMap<String, Network>> {
    let dir = dir.as_ref();
    let entries = std::fs::read_dir(dir).map_err(|e| {
        NetError::persistence(format!("Failed to read {}", dir.display()), Some(e.into()))
    })?;

    let mut networks = HashMap::new();
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                error!("Failed to read entry in {}: {e}", dir.display());
                continue;
            }
        };

        let path = entry.path();
        match entry.file_type() {
            Ok(ft) if ft.is_file() => {}
            _ => {
                debug!("Skipping {}, not a regular file", path.display());
                continue;
            }
        }

        let Some(file_name) = entry.file_name().to_str().map(str::to_string) else {
            warn!("Skipping {}, name is not valid UTF-8", path.display());
            continue;
        };

        match Network::load(&path) {
            Ok(network) => {
                if network.name != file_name {
                    warn!(
                        "Network file {file_name} holds network {}, registering it as {file_name}",
                        network.name
                    );
                }
                networks.insert(file_name, network);
            }
            Err(e) => error!("Failed to load network {file_name}: {e}"),
        }
    }

    Ok(networks)
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn sample(name: &str, cidr: &str) -> Network {
        Network::new(name, cidr.parse().unwrap(), "bridge")
    }

    #[test]
    fn test_dump_then_load() {
        let dir = TempDir::new().unwrap();
        let network = sample("net1", "192.168.0.1/24");

        network.dump(dir.path()).unwrap();
        let loaded = Network::load(dir.path().join("net1")).unwrap();

        assert_eq!(loaded, network);
        assert_eq!(loaded.gateway(), Ipv4Addr::new(192, 168, 0, 1));
        assert_eq!(loaded.subnet().to_string(), "192.168.0.0/24");
    }

    #[test]
    fn test_file_format() {
        let dir = TempDir::new().unwrap();
        sample("net1", "10.10.0.1/16").dump(dir.path()).unwrap();

        let contents = std::fs::read_to_string(dir.path().join("net1")).unwrap();
        assert_eq!(
            contents,
            r#"{"Name":"net1","IpRange":"10.10.0.1/16","Driver":"bridge"}"#
        );
    }

    #[test]
    fn test_dump_overwrites() {
        let dir = TempDir::new().unwrap();
        sample("net1", "10.10.0.1/16").dump(dir.path()).unwrap();
        sample("net1", "172.18.0.1/24").dump(dir.path()).unwrap();

        let loaded = Network::load(dir.path().join("net1")).unwrap();
        assert_eq!(loaded.ip_range.to_string(), "172.18.0.1/24");
    }

    #[test]
    fn test_remove_missing_is_ok() {
        let dir = TempDir::new().unwrap();
        let network = sample("gone", "10.0.0.1/24");

        assert!(network.remove(dir.path()).is_ok());

        network.dump(dir.path()).unwrap();
        network.remove(dir.path()).unwrap();
        assert!(!dir.path().join("gone").exists());
    }

    #[test]
    fn test_load_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken");
        std::fs::write(&path, b"{not json").unwrap();

        assert!(matches!(
            Network::load(&path),
            Err(NetError::Persistence { .. })
        ));
    }

    #[test]
    fn test_scan_skips_bad_entries() {
        let dir = TempDir::new().unwrap();
        sample("net1", "192.168.0.1/24").dump(dir.path()).unwrap();
        sample("net2", "192.168.1.1/24").dump(dir.path()).unwrap();
        std::fs::write(dir.path().join("broken"), b"garbage").unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();

        let networks = scan_networks(dir.path()).unwrap();

        let mut names: Vec<_> = networks.keys().cloned().collect();
        names.sort();
        assert_eq!(names, vec!["net1".to_string(), "net2".to_string()]);
        assert_eq!(networks["net2"], sample("net2", "192.168.1.1/24"));
    }

    #[test]
    fn test_scan_missing_dir() {
        let dir = TempDir::new().unwrap();
        assert!(scan_networks(dir.path().join("absent")).is_err());
    }
}
