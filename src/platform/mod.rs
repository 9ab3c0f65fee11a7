//! Platform-specific implementations

#[cfg(target_os = "linux")]
pub mod linux;

#[cfg(test)]
pub(crate) mod fake;

use async_trait::async_trait;
use ipnet::IpNet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("Failed to add route: {0}")]
    AddRouteError(String),
    #[error("Failed to delete route: {0}")]
    DeleteRouteError(String),
    #[error("Failed to replace default route: {0}")]
    DefaultRouteError(String),
    #[error("Failed to query routing table: {0}")]
    QueryError(String),
    #[error("Unsupported platform")]
    UnsupportedPlatform,
}

/// Platform-agnostic routing interface
///
/// Every read goes to the kernel; implementations must not cache.
#[async_trait]
pub trait RouteTable: Send + Sync {
    /// Add (or replace) a route to `destination` via `gateway`
    async fn add_route(&self, destination: &IpNet, gateway: IpAddr) -> Result<(), PlatformError>;
    async fn delete_route(&self, destination: &IpNet, gateway: IpAddr) -> Result<(), PlatformError>;
    async fn replace_default_route(&self, gateway: IpAddr) -> Result<(), PlatformError>;
    /// Next hop of the current default route, `None` if there is none
    async fn current_default_route(&self) -> Result<Option<IpAddr>, PlatformError>;
}

/// Read-only link and reachability probes
#[async_trait]
pub trait NetworkProbe: Send + Sync {
    async fn interface_exists(&self, interface: &str) -> bool;
    /// Single echo request; `interface` pins the egress device
    async fn ping(&self, target: IpAddr, interface: Option<&str>, timeout: Duration) -> bool;
}

/// Get the routing table for the current platform
pub fn get_route_table() -> Result<Arc<dyn RouteTable>, PlatformError> {
    #[cfg(target_os = "linux")]
    {
        Ok(Arc::new(linux::LinuxRouteTable::new()))
    }

    #[cfg(not(target_os = "linux"))]
    {
        Err(PlatformError::UnsupportedPlatform)
    }
}

/// Get the network prober for the current platform
pub fn get_network_probe() -> Result<Arc<dyn NetworkProbe>, PlatformError> {
    #[cfg(target_os = "linux")]
    {
        Ok(Arc::new(linux::LinuxNetworkProbe::new()))
    }

    #[cfg(not(target_os = "linux"))]
    {
        Err(PlatformError::UnsupportedPlatform)
    }
}

/// Host route (`/32` or `/128`) for a single address
pub fn host_net(addr: IpAddr) -> IpNet {
    IpNet::from(addr)
}
