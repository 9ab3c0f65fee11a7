//! Tunnel create/remove and its state machine
//!
//! ```text
//! Absent -> Creating -> {Healthy, Unhealthy} -> Removing -> Absent
//! ```
//!
//! A new tunnel is never created on top of an existing one: `create` first
//! passes through `remove` whenever the state is not `Absent` or a tunnel
//! record from an earlier run is still on disk.

use super::firewall::FirewallRules;
use super::health::HealthStatus;
use super::transport::{BatchMode, RemoteBatch, SecureTransport, TunnelHandle};
use super::TunnelEndpoints;
use crate::state::{RuntimeDir, TunnelRecord};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Absent,
    Creating,
    Healthy,
    Unhealthy,
    Removing,
}

pub struct TunnelLifecycle {
    transport: Arc<dyn SecureTransport>,
    endpoints: TunnelEndpoints,
    firewall: FirewallRules,
    remote_host: IpAddr,
    runtime: RuntimeDir,
    state: TunnelState,
    handle: Option<TunnelHandle>,
}

impl TunnelLifecycle {
    pub fn new(
        transport: Arc<dyn SecureTransport>,
        endpoints: TunnelEndpoints,
        remote_host: IpAddr,
        runtime: RuntimeDir,
    ) -> Self {
        let firewall = FirewallRules::new(endpoints.local_address);
        Self {
            transport,
            endpoints,
            firewall,
            remote_host,
            runtime,
            state: TunnelState::Absent,
            handle: None,
        }
    }

    pub fn state(&self) -> TunnelState {
        self.state
    }

    pub fn handle(&self) -> Option<TunnelHandle> {
        self.handle
    }

    /// Feed the latest health verdict into the state machine
    pub fn record_health(&mut self, status: HealthStatus) {
        if matches!(self.state, TunnelState::Absent | TunnelState::Removing) {
            return;
        }
        self.state = if status.is_healthy() {
            TunnelState::Healthy
        } else {
            TunnelState::Unhealthy
        };
    }

    fn remote_setup_batch(&self) -> RemoteBatch {
        let remote_if = &self.endpoints.remote_interface;
        let mut batch = RemoteBatch::new(BatchMode::StopOnError);
        batch.push(format!("ip link set {} up", remote_if));
        batch.push(format!(
            "ip addr replace {} peer {} dev {}",
            self.endpoints.remote_address, self.endpoints.local_address, remote_if
        ));
        batch.push(self.firewall.forwarding_command());
        batch.extend(self.firewall.install_commands());
        batch
    }

    fn remote_teardown_batch(&self) -> RemoteBatch {
        let mut batch = RemoteBatch::new(BatchMode::Continue);
        batch.extend(self.firewall.remove_commands());
        batch
    }

    /// Bring up a fresh tunnel; success is judged by the next health check
    pub async fn create(&mut self) {
        let stale = match self.runtime.load_record() {
            Ok(record) => record.is_some(),
            Err(e) => {
                warn!("Unreadable tunnel record, treating as stale: {}", e);
                true
            }
        };
        if self.state != TunnelState::Absent || stale {
            debug!("Existing tunnel ({:?}), removing before create", self.state);
            self.remove().await;
        }

        self.state = TunnelState::Creating;
        info!(
            "Creating tunnel {} <-> {} to {}",
            self.endpoints.local_address, self.endpoints.remote_address, self.remote_host
        );

        match self.transport.establish(&self.endpoints).await {
            Ok(handle) => {
                self.handle = Some(handle);
                let record = TunnelRecord {
                    handle,
                    local_interface: self.endpoints.local_interface.clone(),
                    remote_host: self.remote_host,
                };
                if let Err(e) = self.runtime.save_record(&record) {
                    warn!("Failed to persist tunnel record: {}", e);
                }
            }
            Err(e) => {
                warn!("Tunnel transport failed: {}", e);
                return;
            }
        }

        if let Err(e) = self.transport.run_remote(&self.remote_setup_batch()).await {
            warn!("Remote tunnel setup failed: {}", e);
        }
    }

    /// Tear the tunnel down; safe to call when nothing exists
    pub async fn remove(&mut self) {
        self.state = TunnelState::Removing;

        if let Err(e) = self.transport.run_remote(&self.remote_teardown_batch()).await {
            warn!("Remote rule removal failed: {}", e);
        }

        let persisted = match self.runtime.load_record() {
            Ok(record) => record.map(|r| r.handle),
            Err(e) => {
                warn!("Failed to read tunnel record: {}", e);
                None
            }
        };
        let mut handles: Vec<TunnelHandle> = self.handle.take().into_iter().collect();
        if let Some(handle) = persisted {
            if !handles.contains(&handle) {
                handles.push(handle);
            }
        }

        for handle in &handles {
            if let Err(e) = self.transport.terminate(handle).await {
                warn!("{}", e);
            }
        }

        if let Err(e) = self
            .transport
            .release_interface(&self.endpoints.local_interface)
            .await
        {
            debug!("{}", e);
        }

        if let Err(e) = self.runtime.clear_record() {
            warn!("Failed to clear tunnel record: {}", e);
        }

        self.state = TunnelState::Absent;
        info!("Tunnel removed");
    }
}
