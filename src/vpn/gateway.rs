//! Default-route switching between the original gateway and the tunnel
//!
//! The remote host's own route must exist before the default points into the
//! tunnel and must outlive it on the way back, otherwise the tunnel's carrier
//! traffic would try to ride the tunnel itself.

use super::Tally;
use crate::platform::{host_net, RouteTable};
use ipnet::IpNet;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Which way the default route currently points, read fresh from the table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverState {
    OnOriginalGateway,
    OnTunnel,
    /// No default route, or the table could not be read
    Unknown,
}

pub struct GatewaySwitcher {
    routes: Arc<dyn RouteTable>,
    gateway: IpAddr,
    remote_host: IpNet,
    tunnel_peer: IpAddr,
}

impl GatewaySwitcher {
    pub fn new(
        routes: Arc<dyn RouteTable>,
        gateway: IpAddr,
        remote_host: IpAddr,
        tunnel_peer: IpAddr,
    ) -> Self {
        Self {
            routes,
            gateway,
            remote_host: host_net(remote_host),
            tunnel_peer,
        }
    }

    /// Classify the live default route
    pub async fn current_state(&self) -> FailoverState {
        match self.routes.current_default_route().await {
            Ok(Some(via)) if via == self.gateway => FailoverState::OnOriginalGateway,
            Ok(Some(via)) => {
                debug!("Default route via {}", via);
                FailoverState::OnTunnel
            }
            Ok(None) => {
                warn!("No default route present");
                FailoverState::Unknown
            }
            Err(e) => {
                warn!("Could not read default route: {}", e);
                FailoverState::Unknown
            }
        }
    }

    /// Point the default route at the original gateway, then drop the
    /// remote host exception
    pub async fn to_default(&self) -> Tally {
        let mut tally = Tally::default();

        let result = self.routes.replace_default_route(self.gateway).await;
        if let Err(e) = &result {
            warn!("Failed to restore default route via {}: {}", self.gateway, e);
        }
        tally.record(&result);

        // Absent exception route is the normal case when the tunnel never came up
        let result = self.routes.delete_route(&self.remote_host, self.gateway).await;
        if let Err(e) = &result {
            debug!("Remote host route {} not removed: {}", self.remote_host, e);
        }
        tally.record(&result);

        info!("Default route via original gateway {}", self.gateway);
        tally
    }

    /// Pin the remote host to the gateway, then point the default into the tunnel
    pub async fn to_tunnel(&self) -> Tally {
        let mut tally = Tally::default();

        let result = self.routes.add_route(&self.remote_host, self.gateway).await;
        tally.record(&result);
        if let Err(e) = result {
            warn!(
                "Failed to pin remote host {} via {}: {}; staying on gateway",
                self.remote_host, self.gateway, e
            );
            // skipped default flip
            tally.failed += 1;
            return tally;
        }

        let result = self.routes.replace_default_route(self.tunnel_peer).await;
        if let Err(e) = &result {
            warn!("Failed to route default via tunnel {}: {}", self.tunnel_peer, e);
        } else {
            info!("Default route via tunnel peer {}", self.tunnel_peer);
        }
        tally.record(&result);
        tally
    }
}
