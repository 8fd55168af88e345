//! The dataplane seam.
//!
//! An `InterfaceManager` materialises attachments as interfaces: a *local*
//! interface carries a guest on this host, a *remote* interface is the
//! tunnel endpoint towards a guest on another host. The real (netlink)
//! implementation lives outside this crate; the logging fabric below keeps
//! interfaces in memory and is used by tests and single-box runs.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum FabricError {
    #[error("no such interface {0:?}")]
    NoSuchInterface(String),
    #[error("fabric operation failed: {0}")]
    Op(String),
}

/// One interface known to the fabric.
#[derive(Clone, Debug, PartialEq)]
pub struct InterfaceDescriptor {
    pub name: String,
    pub vni: u32,
    pub guest_ip: Ipv4Addr,
    pub host_ip: Ipv4Addr,
    /// Empty for remote interfaces.
    pub guest_mac: String,
    pub local: bool,
}

#[async_trait]
pub trait InterfaceManager: Send + Sync {
    fn name(&self) -> &'static str;

    /// Creates the interface for a guest on this host; returns its name.
    async fn create_local(
        &self,
        vni: u32,
        guest_ip: Ipv4Addr,
        guest_mac: &str,
        host_ip: Ipv4Addr,
    ) -> Result<String, FabricError>;

    /// Creates the tunnel endpoint towards a guest on another host; returns
    /// the interface name.
    async fn create_remote(
        &self,
        vni: u32,
        guest_ip: Ipv4Addr,
        host_ip: Ipv4Addr,
    ) -> Result<String, FabricError>;

    async fn delete(&self, name: &str) -> Result<(), FabricError>;

    async fn list(&self) -> Result<Vec<InterfaceDescriptor>, FabricError>;
}

/// In-memory fabric that logs every operation.
#[derive(Default)]
pub struct LoggingFabric {
    interfaces: Mutex<HashMap<String, InterfaceDescriptor>>,
    counter: AtomicU64,
}

impl LoggingFabric {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn next_name(&self, vni: u32) -> String {
        format!("kosif{:06x}n{}", vni, self.counter.fetch_add(1, Ordering::Relaxed))
    }
}

#[async_trait]
impl InterfaceManager for LoggingFabric {
    fn name(&self) -> &'static str {
        "logger"
    }

    async fn create_local(
        &self,
        vni: u32,
        guest_ip: Ipv4Addr,
        guest_mac: &str,
        host_ip: Ipv4Addr,
    ) -> Result<String, FabricError> {
        let name = self.next_name(vni);
        info!(%name, vni, %guest_ip, guest_mac, %host_ip, "created local interface");
        self.interfaces.lock().unwrap().insert(
            name.clone(),
            InterfaceDescriptor {
                name: name.clone(),
                vni,
                guest_ip,
                host_ip,
                guest_mac: guest_mac.to_owned(),
                local: true,
            },
        );
        Ok(name)
    }

    async fn create_remote(
        &self,
        vni: u32,
        guest_ip: Ipv4Addr,
        host_ip: Ipv4Addr,
    ) -> Result<String, FabricError> {
        let name = self.next_name(vni);
        info!(%name, vni, %guest_ip, %host_ip, "created remote interface");
        self.interfaces.lock().unwrap().insert(
            name.clone(),
            InterfaceDescriptor {
                name: name.clone(),
                vni,
                guest_ip,
                host_ip,
                guest_mac: String::new(),
                local: false,
            },
        );
        Ok(name)
    }

    async fn delete(&self, name: &str) -> Result<(), FabricError> {
        match self.interfaces.lock().unwrap().remove(name) {
            Some(_) => {
                info!(%name, "deleted interface");
                Ok(())
            }
            None => Err(FabricError::NoSuchInterface(name.to_owned())),
        }
    }

    async fn list(&self) -> Result<Vec<InterfaceDescriptor>, FabricError> {
        let ifcs: Vec<_> = self.interfaces.lock().unwrap().values().cloned().collect();
        debug!(count = ifcs.len(), "listed interfaces");
        Ok(ifcs)
    }
}

/// Looks up a fabric implementation by its `--netfabric` name.
pub fn by_name(name: &str) -> Option<Arc<dyn InterfaceManager>> {
    match name {
        "logger" => Some(LoggingFabric::new()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_list_delete() {
        let fabric = LoggingFabric::new();
        let guest: Ipv4Addr = "10.0.0.2".parse().unwrap();
        let host: Ipv4Addr = "172.16.0.1".parse().unwrap();
        let local = fabric.create_local(7, guest, "0a:07:0a:00:00:02", host).await.unwrap();
        let remote = fabric
            .create_remote(7, "10.0.0.3".parse().unwrap(), "172.16.0.2".parse().unwrap())
            .await
            .unwrap();
        assert_ne!(local, remote);
        let listed = fabric.list().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().any(|d| d.name == local && d.local));
        assert!(listed.iter().any(|d| d.name == remote && !d.local));
        fabric.delete(&local).await.unwrap();
        assert!(fabric.delete(&local).await.is_err());
        assert_eq!(fabric.list().await.unwrap().len(), 1);
    }

    #[test]
    fn lookup_by_name() {
        assert!(by_name("logger").is_some());
        assert!(by_name("netlink").is_none());
    }
}
