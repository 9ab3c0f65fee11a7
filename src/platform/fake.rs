//! In-memory network for tests
//!
//! One `FakeNetwork` plays every collaborator: the routing table, the link
//! prober and the secure transport (including the remote firewall). Clones
//! share state, so a test can hand clones to components and inspect the
//! original afterwards.
//!
//! Reachability helpers assume the addresses of `Config::default()`.

use super::{NetworkProbe, PlatformError, RouteTable};
use crate::tunnel::transport::{RemoteBatch, SecureTransport, TransportError, TunnelHandle};
use crate::tunnel::TunnelEndpoints;
use async_trait::async_trait;
use ipnet::IpNet;
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

pub const REMOTE_TUNNEL_ADDRESS: &str = "10.254.0.2";
pub const UPSTREAM_PROBE: &str = "8.8.8.8";

/// Observable routing/link state, compared before and after operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub default_route: Option<IpAddr>,
    pub routes: BTreeSet<(IpNet, IpAddr)>,
    pub interfaces: BTreeSet<String>,
}

#[derive(Debug, Default)]
struct FakeState {
    default_route: Option<IpAddr>,
    routes: BTreeSet<(IpNet, IpAddr)>,
    interfaces: BTreeSet<String>,
    reachable: BTreeSet<IpAddr>,
    ping_count: usize,
    tunnel_comes_up: bool,
    next_pid: u32,
    processes: BTreeSet<u32>,
    remote_rules: BTreeSet<String>,
    batches: Vec<RemoteBatch>,
    failing_routes: BTreeSet<IpNet>,
    fail_remote_batches: bool,
}

#[derive(Debug, Clone)]
pub struct FakeNetwork {
    state: Arc<Mutex<FakeState>>,
}

impl FakeNetwork {
    /// Table with a single default route via `gateway`
    pub fn new(gateway: &str) -> Self {
        let state = FakeState {
            default_route: Some(gateway.parse().unwrap()),
            tunnel_comes_up: true,
            next_pid: 1000,
            ..FakeState::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    fn set_reachable(&self, addr: &str, reachable: bool) {
        let addr: IpAddr = addr.parse().unwrap();
        let mut state = self.lock();
        if reachable {
            state.reachable.insert(addr);
        } else {
            state.reachable.remove(&addr);
        }
    }

    pub fn set_remote_reachable(&self, reachable: bool) {
        self.set_reachable(REMOTE_TUNNEL_ADDRESS, reachable);
    }

    pub fn set_upstream_reachable(&self, reachable: bool) {
        self.set_reachable(UPSTREAM_PROBE, reachable);
    }

    /// Both ends answer: a tunnel that comes up will be healthy
    pub fn set_all_reachable(&self) {
        self.set_remote_reachable(true);
        self.set_upstream_reachable(true);
    }

    pub fn set_tunnel_comes_up(&self, comes_up: bool) {
        self.lock().tunnel_comes_up = comes_up;
    }

    pub fn fail_route(&self, destination: &str) {
        self.lock().failing_routes.insert(destination.parse().unwrap());
    }

    pub fn fail_remote_batches(&self, fail: bool) {
        self.lock().fail_remote_batches = fail;
    }

    pub fn add_interface(&self, name: &str) {
        self.lock().interfaces.insert(name.to_string());
    }

    pub fn set_default(&self, via: Option<&str>) {
        self.lock().default_route = via.map(|v| v.parse().unwrap());
    }

    pub fn add_static_route(&self, destination: &str, via: &str) {
        self.lock()
            .routes
            .insert((destination.parse().unwrap(), via.parse().unwrap()));
    }

    /// Start a live tunnel process as if left behind by an earlier run
    pub fn spawn_process(&self) -> u32 {
        let mut state = self.lock();
        state.next_pid += 1;
        let pid = state.next_pid;
        state.processes.insert(pid);
        pid
    }

    pub fn default_route(&self) -> Option<IpAddr> {
        self.lock().default_route
    }

    pub fn has_route(&self, destination: &str, via: &str) -> bool {
        self.lock()
            .routes
            .contains(&(destination.parse().unwrap(), via.parse().unwrap()))
    }

    pub fn route_count(&self) -> usize {
        self.lock().routes.len()
    }

    pub fn has_interface(&self, name: &str) -> bool {
        self.lock().interfaces.contains(name)
    }

    pub fn live_processes(&self) -> usize {
        self.lock().processes.len()
    }

    pub fn remote_rule_count(&self) -> usize {
        self.lock().remote_rules.len()
    }

    pub fn batches(&self) -> Vec<RemoteBatch> {
        self.lock().batches.clone()
    }

    pub fn ping_count(&self) -> usize {
        self.lock().ping_count
    }

    pub fn snapshot(&self) -> Snapshot {
        let state = self.lock();
        Snapshot {
            default_route: state.default_route,
            routes: state.routes.clone(),
            interfaces: state.interfaces.clone(),
        }
    }
}

/// Strip the action so an append and its delete map to the same key
fn rule_key(command: &str) -> Option<String> {
    if let Some(rest) = command.strip_prefix("( ") {
        let append = rest.split(" || ").nth(1)?.trim_end_matches(" )");
        return Some(append.replacen(" -A ", " ", 1));
    }
    if command.contains(" -D ") {
        return Some(command.replacen(" -D ", " ", 1));
    }
    None
}

#[async_trait]
impl RouteTable for FakeNetwork {
    async fn add_route(&self, destination: &IpNet, gateway: IpAddr) -> Result<(), PlatformError> {
        let mut state = self.lock();
        if state.failing_routes.contains(destination) {
            return Err(PlatformError::AddRouteError("injected failure".to_string()));
        }
        state.routes.insert((*destination, gateway));
        Ok(())
    }

    async fn delete_route(&self, destination: &IpNet, gateway: IpAddr) -> Result<(), PlatformError> {
        let mut state = self.lock();
        if state.failing_routes.contains(destination) {
            return Err(PlatformError::DeleteRouteError("injected failure".to_string()));
        }
        if state.routes.remove(&(*destination, gateway)) {
            Ok(())
        } else {
            Err(PlatformError::DeleteRouteError("No such process".to_string()))
        }
    }

    async fn replace_default_route(&self, gateway: IpAddr) -> Result<(), PlatformError> {
        self.lock().default_route = Some(gateway);
        Ok(())
    }

    async fn current_default_route(&self) -> Result<Option<IpAddr>, PlatformError> {
        Ok(self.lock().default_route)
    }
}

#[async_trait]
impl NetworkProbe for FakeNetwork {
    async fn interface_exists(&self, interface: &str) -> bool {
        self.lock().interfaces.contains(interface)
    }

    async fn ping(&self, target: IpAddr, interface: Option<&str>, _timeout: Duration) -> bool {
        let mut state = self.lock();
        state.ping_count += 1;
        if let Some(iface) = interface {
            if !state.interfaces.contains(iface) {
                return false;
            }
        }
        state.reachable.contains(&target)
    }
}

#[async_trait]
impl SecureTransport for FakeNetwork {
    async fn establish(&self, endpoints: &TunnelEndpoints) -> Result<TunnelHandle, TransportError> {
        let mut state = self.lock();
        if !state.tunnel_comes_up {
            return Err(TransportError::EstablishTimeout(
                endpoints.local_interface.clone(),
            ));
        }
        state.next_pid += 1;
        let pid = state.next_pid;
        state.processes.insert(pid);
        state.interfaces.insert(endpoints.local_interface.clone());
        Ok(TunnelHandle { pid })
    }

    async fn run_remote(&self, batch: &RemoteBatch) -> Result<(), TransportError> {
        let mut state = self.lock();
        state.batches.push(batch.clone());
        if state.fail_remote_batches {
            return Err(TransportError::RemoteBatch {
                status: "exit status: 255".to_string(),
                stderr: "Connection refused".to_string(),
            });
        }
        for command in &batch.commands {
            let Some(key) = rule_key(command) else {
                continue;
            };
            if command.starts_with("( ") {
                state.remote_rules.insert(key);
            } else {
                state.remote_rules.remove(&key);
            }
        }
        Ok(())
    }

    async fn terminate(&self, handle: &TunnelHandle) -> Result<(), TransportError> {
        self.lock().processes.remove(&handle.pid);
        Ok(())
    }

    async fn release_interface(&self, interface: &str) -> Result<(), TransportError> {
        self.lock().interfaces.remove(interface);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_key_matches_install_and_delete() {
        let install = "( iptables -t nat -C POSTROUTING -s 10.254.0.1/32 -j MASQUERADE || \
                       iptables -t nat -A POSTROUTING -s 10.254.0.1/32 -j MASQUERADE )";
        let delete = "iptables -t nat -D POSTROUTING -s 10.254.0.1/32 -j MASQUERADE";
        assert_eq!(rule_key(install), rule_key(delete));
        assert!(rule_key("ip link set tun0 up").is_none());
    }
}
