//! Tunnel health check
//!
//! Three ordered stages, the first failing one decides the verdict:
//! local interface present, far tunnel end answering, public internet
//! reachable through the tunnel.

use crate::config::HealthConfig;
use crate::platform::NetworkProbe;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::TunnelEndpoints;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    /// Local tunnel interface does not exist
    MissingInterface,
    /// Far end of the tunnel does not answer
    RemoteUnreachable,
    /// Tunnel works but the remote side has no working uplink
    UpstreamUnreachable,
}

impl HealthStatus {
    pub fn is_healthy(self) -> bool {
        self == HealthStatus::Healthy
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::MissingInterface => "missing interface",
            HealthStatus::RemoteUnreachable => "remote unreachable",
            HealthStatus::UpstreamUnreachable => "upstream unreachable",
        };
        f.write_str(s)
    }
}

pub struct HealthChecker {
    probe: Arc<dyn NetworkProbe>,
    interface: String,
    remote_address: IpAddr,
    upstream: IpAddr,
    attempts: u32,
    timeout: Duration,
}

impl HealthChecker {
    pub fn new(probe: Arc<dyn NetworkProbe>, endpoints: &TunnelEndpoints, config: &HealthConfig) -> Self {
        Self {
            probe,
            interface: endpoints.local_interface.clone(),
            remote_address: endpoints.remote_address,
            upstream: config.upstream_probe,
            attempts: config.attempts.max(1),
            timeout: config.probe_timeout(),
        }
    }

    pub async fn check(&self) -> HealthStatus {
        let status = self.run_stages().await;
        if status.is_healthy() {
            info!("Tunnel {} is healthy", self.interface);
        } else {
            warn!("Tunnel {} check failed: {}", self.interface, status);
        }
        status
    }

    async fn run_stages(&self) -> HealthStatus {
        if !self.probe.interface_exists(&self.interface).await {
            return HealthStatus::MissingInterface;
        }
        debug!("{} present", self.interface);

        if !self.reachable(self.remote_address).await {
            return HealthStatus::RemoteUnreachable;
        }
        debug!("{} answers", self.remote_address);

        if !self.reachable(self.upstream).await {
            return HealthStatus::UpstreamUnreachable;
        }
        debug!("{} answers through {}", self.upstream, self.interface);

        HealthStatus::Healthy
    }

    /// Any one successful probe out of `attempts` counts
    async fn reachable(&self, target: IpAddr) -> bool {
        for attempt in 1..=self.attempts {
            if self
                .probe
                .ping(target, Some(&self.interface), self.timeout)
                .await
            {
                return true;
            }
            debug!("probe {}/{} to {} failed", attempt, self.attempts, target);
        }
        false
    }
}
