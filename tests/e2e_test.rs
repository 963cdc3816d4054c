use std::process::{Child, Command, Stdio};

use rtain_net::{ContainerInfo, NetConfig, NetworkManager};
use tempfile::TempDir;

fn is_root() -> bool {
    nix::unistd::geteuid().is_root()
}

/// A process sitting in a fresh network namespace.
struct Sandbox(Child);

impl Sandbox {
    fn spawn() -> Option<Self> {
        Command::new("unshare")
            .args(["--net", "sleep", "30"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .ok()
            .map(Sandbox)
    }

    fn pid(&self) -> i32 {
        self.0.id() as i32
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

#[tokio::test]
async fn test_bridge_network_end_to_end() {
    if !is_root() {
        println!("Skipping e2e test - requires root privileges");
        return;
    }
    let _ = env_logger::builder().is_test(true).try_init();

    let dir = TempDir::new().unwrap();
    let mut manager = NetworkManager::init(NetConfig::new(dir.path())).unwrap();

    if let Err(e) = manager
        .create_network("bridge", "10.213.9.0/24", "rtaine2e0")
        .await
    {
        println!("Skipping e2e test - cannot create bridge: {e}");
        return;
    }
    assert!(manager.format_networks().contains("rtaine2e0"));

    let Some(sandbox) = Sandbox::spawn() else {
        println!("Skipping connect step - unshare is not available");
        manager.delete_network("rtaine2e0").await.unwrap();
        return;
    };
    // Give unshare time to switch namespaces before exec'ing sleep.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    let mut container = ContainerInfo {
        id: "e2ebox".to_string(),
        pid: sandbox.pid(),
        port_mapping: vec!["18080:80".to_string()],
        ip_address: None,
    };

    let connected = manager.connect("rtaine2e0", &container).await;
    match connected {
        Ok(endpoint) => {
            assert_eq!(endpoint.ip_address.octets()[..3], [10, 213, 9]);
            container.ip_address = Some(endpoint.ip_address);
            manager.disconnect("rtaine2e0", &container).await.unwrap();
        }
        Err(e) => println!("Connect failed in this environment: {e}"),
    }

    drop(sandbox);
    manager.delete_network("rtaine2e0").await.unwrap();
    assert!(manager.list_networks().is_empty());
}
