use std::path::{Path, PathBuf};

pub const ROOT_PATH: &str = "/var/run/rtain/network";
pub const ROOT_ENV: &str = "RTAIN_NETWORK_ROOT";

/// Where the network control plane keeps its state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetConfig {
    pub root: PathBuf,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self::new(ROOT_PATH)
    }
}

impl NetConfig {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Use `RTAIN_NETWORK_ROOT` when set, the default root otherwise.
    pub fn from_env() -> Self {
        match std::env::var_os(ROOT_ENV) {
            Some(root) if !root.is_empty() => Self::new(root),
            _ => Self::default(),
        }
    }

    pub fn ipam_path(&self) -> PathBuf {
        self.root.join("ipam").join("subnet.json")
    }

    pub fn network_dir(&self) -> PathBuf {
        self.root.join("network")
    }
}
