//! Configuring an endpoint from inside a container's network namespace.
//!
//! Namespace membership belongs to a thread, so each configuration runs on
//! its own OS thread. That thread enters the container namespace through a
//! [`NetnsGuard`], which switches back to the original namespace when it is
//! dropped, whatever the outcome of the work done inside.

use std::{
    fs::File,
    net::Ipv4Addr,
    os::fd::AsFd,
    path::PathBuf,
};

use async_trait::async_trait;
use ipnet::Ipv4Net;
use log::{debug, error};
use nix::sched::{setns, CloneFlags};
use tokio::sync::oneshot;

use super::{bridge::get_link_by_name, Endpoint};
use crate::error::{NetError, NetnsStep, Result};

const CURRENT_THREAD_NETNS: &str = "/proc/thread-self/ns/net";
const LOOPBACK: &str = "lo";

pub fn netns_path(pid: i32) -> PathBuf {
    PathBuf::from(format!("/proc/{pid}/ns/net"))
}

/// What the peer side of an endpoint needs inside the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    pub name: String,
    pub address: Ipv4Net,
    pub gateway: Ipv4Addr,
}

impl From<&Endpoint<'_>> for PeerConfig {
    fn from(endpoint: &Endpoint<'_>) -> Self {
        Self {
            name: endpoint.device.peer.clone(),
            address: endpoint.interface_address(),
            gateway: endpoint.network.gateway(),
        }
    }
}

/// Moves a peer link into a container and configures it there.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NamespaceConfigurator: Send + Sync {
    async fn configure(&self, pid: i32, peer: PeerConfig) -> Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NetnsConfigurator;

#[async_trait]
impl NamespaceConfigurator for NetnsConfigurator {
    async fn configure(&self, pid: i32, peer: PeerConfig) -> Result<()> {
        let (tx, rx) = oneshot::channel();

        std::thread::Builder::new()
            .name(format!("netns-{pid}"))
            .spawn(move || {
                let _ = tx.send(configure_in_netns(pid, &peer));
            })
            .map_err(|e| NetError::namespace(NetnsStep::Enter, e))?;

        // A dropped sender means the thread panicked.
        rx.await
            .map_err(|e| NetError::namespace(NetnsStep::Restore, e))?
    }
}

/// Switches the calling thread into another network namespace until
/// dropped.
#[derive(Debug)]
pub struct NetnsGuard {
    original: Option<File>,
}

impl NetnsGuard {
    pub fn enter(target: &File) -> Result<Self> {
        let original = File::open(CURRENT_THREAD_NETNS)
            .map_err(|e| NetError::namespace(NetnsStep::Enter, e))?;

        setns(target.as_fd(), CloneFlags::CLONE_NEWNET)
            .map_err(|e| NetError::namespace(NetnsStep::Enter, e))?;

        Ok(Self {
            original: Some(original),
        })
    }

    /// Switch back now and report failure, instead of only logging it on
    /// drop.
    pub fn restore(mut self) -> Result<()> {
        self.switch_back()
    }

    fn switch_back(&mut self) -> Result<()> {
        match self.original.take() {
            Some(original) => setns(original.as_fd(), CloneFlags::CLONE_NEWNET)
                .map_err(|e| NetError::namespace(NetnsStep::Restore, e)),
            None => Ok(()),
        }
    }
}

impl Drop for NetnsGuard {
    fn drop(&mut self) {
        if let Err(e) = self.switch_back() {
            error!("{e}");
        }
    }
}

/// Runs on a dedicated thread; the thread ends with it.
fn configure_in_netns(pid: i32, peer: &PeerConfig) -> Result<()> {
    let netns = File::open(netns_path(pid)).map_err(|e| NetError::namespace(NetnsStep::Resolve, e))?;

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| NetError::namespace(NetnsStep::Enter, e))?;

    // Still in the host namespace here.
    rt.block_on(move_link(&peer.name, &netns))
        .map_err(|e| NetError::namespace(NetnsStep::MoveLink, e))?;

    let guard = NetnsGuard::enter(&netns)?;
    let configured = rt.block_on(configure_peer(peer));
    let restored = guard.restore();

    if let (Err(e), Err(_)) = (&configured, &restored) {
        error!("Failed to configure {} in netns of {pid}: {e}", peer.name);
    }
    restored?;

    debug!("Configured {} in netns of {pid}", peer.name);
    configured
}

async fn move_link(name: &str, netns: &File) -> anyhow::Result<()> {
    use std::os::fd::AsRawFd;

    let (connection, handle, _) = rtnetlink::new_connection()?;
    tokio::spawn(connection);

    let link = get_link_by_name(name, &handle).await?;
    handle
        .link()
        .set(link.header.index)
        .setns_by_fd(netns.as_raw_fd())
        .execute()
        .await?;

    Ok(())
}

/// Address, links and default route, with a netlink socket opened inside
/// the container namespace.
async fn configure_peer(peer: &PeerConfig) -> Result<()> {
    let (connection, handle, _) =
        rtnetlink::new_connection().map_err(|e| NetError::namespace(NetnsStep::Enter, e))?;
    tokio::spawn(connection);

    let link = get_link_by_name(&peer.name, &handle)
        .await
        .map_err(|e| NetError::namespace(NetnsStep::SetAddress, e))?;
    let index = link.header.index;

    handle
        .address()
        .add(index, peer.address.addr().into(), peer.address.prefix_len())
        .execute()
        .await
        .map_err(|e| NetError::namespace(NetnsStep::SetAddress, e))?;

    handle
        .link()
        .set(index)
        .up()
        .execute()
        .await
        .map_err(|e| NetError::namespace(NetnsStep::LinkUp, e))?;

    let lo = get_link_by_name(LOOPBACK, &handle)
        .await
        .map_err(|e| NetError::namespace(NetnsStep::LoopbackUp, e))?;
    handle
        .link()
        .set(lo.header.index)
        .up()
        .execute()
        .await
        .map_err(|e| NetError::namespace(NetnsStep::LoopbackUp, e))?;

    handle
        .route()
        .add()
        .v4()
        .destination_prefix(Ipv4Addr::UNSPECIFIED, 0)
        .gateway(peer.gateway)
        .output_interface(index)
        .execute()
        .await
        .map_err(|e| NetError::namespace(NetnsStep::DefaultRoute, e))?;

    Ok(())
}
