//! Tunnel management
//!
//! - `transport`: the secure transport seam and its handle/batch types
//! - `ssh`: OpenSSH `-w` implementation of the transport
//! - `firewall`: NAT/forward rules applied on the remote side
//! - `health`: three-stage reachability check
//! - `lifecycle`: create/remove and the tunnel state machine

pub mod firewall;
pub mod health;
pub mod lifecycle;
#[cfg(target_os = "linux")]
pub mod ssh;
pub mod transport;

pub use firewall::FirewallRules;
pub use health::{HealthChecker, HealthStatus};
pub use lifecycle::{TunnelLifecycle, TunnelState};
pub use transport::{RemoteBatch, SecureTransport, TransportError, TunnelHandle};

use crate::config::TunnelConfig;
use crate::platform::PlatformError;
use std::net::IpAddr;
use std::sync::Arc;

/// Addresses and interface identifiers of both ends of the tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelEndpoints {
    pub local_address: IpAddr,
    pub remote_address: IpAddr,
    pub local_tun_id: u32,
    pub remote_tun_id: u32,
    pub local_interface: String,
    pub remote_interface: String,
}

impl TunnelEndpoints {
    pub fn from_config(config: &TunnelConfig) -> Self {
        Self {
            local_address: config.local_address,
            remote_address: config.remote_address,
            local_tun_id: config.local_tun_id,
            remote_tun_id: config.remote_tun_id,
            local_interface: config.local_interface(),
            remote_interface: config.remote_interface(),
        }
    }
}

/// Get the secure transport for the current platform
pub fn get_transport(config: &TunnelConfig) -> Result<Arc<dyn SecureTransport>, PlatformError> {
    #[cfg(target_os = "linux")]
    {
        Ok(Arc::new(ssh::SshTransport::new(config)))
    }

    #[cfg(not(target_os = "linux"))]
    {
        let _ = config;
        Err(PlatformError::UnsupportedPlatform)
    }
}
