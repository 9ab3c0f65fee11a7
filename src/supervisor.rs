//! Supervisory control loop
//!
//! Every cycle re-reads the default route from the kernel, decides between
//! maintaining, failing back or (in `full` mode) rebuilding the tunnel, and
//! ends in one of two consistent states:
//!
//! - on the tunnel, with the remote host and protected subnets pinned to the
//!   original gateway
//! - on the original gateway, with no tunnel, rules or protected routes left
//!
//! The shutdown signal is only consulted between a finished cycle and the
//! sleep that follows, so a cycle is never abandoned halfway.

use crate::config::{Config, Mode};
use crate::platform::{NetworkProbe, RouteTable};
use crate::state::RuntimeDir;
use crate::tunnel::{
    HealthChecker, HealthStatus, SecureTransport, TunnelEndpoints, TunnelLifecycle, TunnelState,
};
use crate::vpn::gateway::FailoverState;
use crate::vpn::{BlacklistRouter, GatewaySwitcher};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{info, warn};

/// What a single cycle did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// On the original gateway and nothing to do (light mode)
    Idle,
    /// On the tunnel and it is healthy
    Maintained,
    /// No usable default route was found; reverted to the gateway
    Restored,
    /// Left the tunnel because of the given verdict and stayed on the gateway
    FailedBack(HealthStatus),
    /// Left an unhealthy tunnel and came back on a rebuilt one
    Recovered(HealthStatus),
    /// Moved from the gateway onto a freshly built tunnel
    SwitchedToTunnel,
    /// A freshly built tunnel failed the check; still on the gateway
    StayedOnGateway(HealthStatus),
    /// The tunnel was healthy but the default route could not be moved
    SwitchFailed,
}

impl fmt::Display for CycleOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CycleOutcome::Idle => write!(f, "idle on original gateway"),
            CycleOutcome::Maintained => write!(f, "tunnel maintained"),
            CycleOutcome::Restored => write!(f, "default route restored"),
            CycleOutcome::FailedBack(s) => write!(f, "failed back to gateway ({})", s),
            CycleOutcome::Recovered(s) => write!(f, "tunnel rebuilt after {}", s),
            CycleOutcome::SwitchedToTunnel => write!(f, "switched to tunnel"),
            CycleOutcome::StayedOnGateway(s) => write!(f, "new tunnel rejected ({})", s),
            CycleOutcome::SwitchFailed => write!(f, "could not switch to tunnel"),
        }
    }
}

enum BringUp {
    OnTunnel,
    Unhealthy(HealthStatus),
    SwitchFailed,
}

pub struct Supervisor {
    mode: Mode,
    frequency: Duration,
    switcher: GatewaySwitcher,
    blacklist: BlacklistRouter,
    health: HealthChecker,
    lifecycle: TunnelLifecycle,
}

impl Supervisor {
    pub fn new(
        config: &Config,
        mode: Mode,
        routes: Arc<dyn RouteTable>,
        probe: Arc<dyn NetworkProbe>,
        transport: Arc<dyn SecureTransport>,
    ) -> Self {
        let endpoints = TunnelEndpoints::from_config(&config.tunnel);
        let gateway = config.network.gateway;

        Self {
            mode,
            frequency: config.supervisor.frequency(),
            switcher: GatewaySwitcher::new(
                routes.clone(),
                gateway,
                config.tunnel.remote_host,
                endpoints.remote_address,
            ),
            blacklist: BlacklistRouter::new(
                routes,
                gateway,
                config.network.protected_subnets.clone(),
                config.network.blacklist_file.clone(),
            ),
            health: HealthChecker::new(probe, &endpoints, &config.health),
            lifecycle: TunnelLifecycle::new(
                transport,
                endpoints,
                config.tunnel.remote_host,
                RuntimeDir::new(&config.supervisor.runtime_dir),
            ),
        }
    }

    pub fn tunnel_state(&self) -> TunnelState {
        self.lifecycle.state()
    }

    /// Run the loop for the configured mode until `shutdown` flips to true
    pub async fn run(&mut self, shutdown: watch::Receiver<bool>) {
        match self.mode {
            Mode::Light => self.run_passive(shutdown).await,
            Mode::Full => self.run_active(shutdown).await,
        }
    }

    /// Health-monitor-only loop; never creates a tunnel
    pub async fn run_passive(&mut self, shutdown: watch::Receiver<bool>) {
        info!("Supervising in light mode every {:?}", self.frequency);
        self.run_loop(shutdown, Mode::Light).await;
        info!("Light mode stopped, routing left as is");
    }

    /// Self-healing loop; on shutdown converges back onto the original gateway
    pub async fn run_active(&mut self, shutdown: watch::Receiver<bool>) {
        info!("Supervising in full mode every {:?}", self.frequency);
        self.run_loop(shutdown, Mode::Full).await;
        self.shutdown_cleanup().await;
    }

    async fn run_loop(&mut self, mut shutdown: watch::Receiver<bool>, mode: Mode) {
        loop {
            let outcome = match mode {
                Mode::Light => self.passive_cycle().await,
                Mode::Full => self.active_cycle().await,
            };
            info!("Cycle complete: {}", outcome);

            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = sleep(self.frequency) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        warn!("Shutdown channel closed, stopping");
                        break;
                    }
                }
            }
            if *shutdown.borrow() {
                break;
            }
        }
    }

    /// One light-mode iteration
    pub async fn passive_cycle(&mut self) -> CycleOutcome {
        match self.switcher.current_state().await {
            FailoverState::OnOriginalGateway => CycleOutcome::Idle,
            FailoverState::Unknown => {
                self.switcher.to_default().await;
                CycleOutcome::Restored
            }
            FailoverState::OnTunnel => {
                let status = self.health.check().await;
                if status.is_healthy() {
                    CycleOutcome::Maintained
                } else {
                    let tally = self.switcher.to_default().await;
                    info!("Failed back to original gateway ({} route ops)", tally);
                    CycleOutcome::FailedBack(status)
                }
            }
        }
    }

    /// One full-mode iteration
    pub async fn active_cycle(&mut self) -> CycleOutcome {
        match self.switcher.current_state().await {
            FailoverState::OnTunnel => {
                let status = self.health.check().await;
                self.lifecycle.record_health(status);
                if status.is_healthy() {
                    return CycleOutcome::Maintained;
                }

                warn!("Tunnel unhealthy ({}), failing back and rebuilding", status);
                self.fail_back().await;
                match self.bring_up().await {
                    BringUp::OnTunnel => CycleOutcome::Recovered(status),
                    BringUp::Unhealthy(_) | BringUp::SwitchFailed => {
                        CycleOutcome::FailedBack(status)
                    }
                }
            }
            FailoverState::OnOriginalGateway => self.bring_up_from_gateway().await,
            FailoverState::Unknown => {
                self.fail_back().await;
                self.bring_up_from_gateway().await
            }
        }
    }

    async fn bring_up_from_gateway(&mut self) -> CycleOutcome {
        match self.bring_up().await {
            BringUp::OnTunnel => CycleOutcome::SwitchedToTunnel,
            BringUp::Unhealthy(status) => CycleOutcome::StayedOnGateway(status),
            BringUp::SwitchFailed => CycleOutcome::SwitchFailed,
        }
    }

    /// Create, verify and, if healthy, move traffic onto the tunnel.
    /// Every failure path ends on the gateway with nothing left behind.
    async fn bring_up(&mut self) -> BringUp {
        self.lifecycle.create().await;
        let status = self.health.check().await;
        self.lifecycle.record_health(status);

        if !status.is_healthy() {
            // Routes from an earlier tunnel may still be installed
            self.fail_back().await;
            return BringUp::Unhealthy(status);
        }

        let added = self.blacklist.apply(true).await;
        if !added.is_complete() {
            warn!("Some protected routes are missing ({})", added);
        }
        self.switcher.to_tunnel().await;

        if self.switcher.current_state().await != FailoverState::OnTunnel {
            warn!("Default route did not move onto the tunnel, rolling back");
            self.fail_back().await;
            return BringUp::SwitchFailed;
        }
        BringUp::OnTunnel
    }

    /// Gateway first, then protected routes, then the tunnel itself
    async fn fail_back(&mut self) {
        let switched = self.switcher.to_default().await;
        let removed = self.blacklist.apply(false).await;
        self.lifecycle.remove().await;
        info!(
            "Fail-back complete (gateway ops {}, protected routes {})",
            switched, removed
        );
    }

    /// Protected routes can outlive the tunnel, so this runs even when
    /// already on the gateway with no tunnel
    async fn shutdown_cleanup(&mut self) {
        info!("Shutdown: returning to original gateway");
        self.fail_back().await;
    }
}
