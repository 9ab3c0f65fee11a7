//! Linux implementation backed by iproute2 and ping

use super::{NetworkProbe, PlatformError, RouteTable};
use async_trait::async_trait;
use ipnet::IpNet;
use std::net::IpAddr;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

const IP_CMD: &str = "ip";
const PING_CMD: &str = "ping";

/// Run `ip` with the given arguments, returning stdout or stderr on failure
pub(crate) async fn run_ip(args: &[&str]) -> Result<String, String> {
    debug!("exec: {} {}", IP_CMD, args.join(" "));
    let output = Command::new(IP_CMD)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| e.to_string())?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(stderr.trim().to_string());
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn family_flag(addr: IpAddr) -> &'static str {
    if addr.is_ipv6() { "-6" } else { "-4" }
}

/// Extract the next hop from `ip route show default` output
fn parse_default_via(output: &str) -> Option<IpAddr> {
    output.lines().find_map(|line| {
        let mut tokens = line.split_whitespace();
        if tokens.next()? != "default" {
            return None;
        }
        tokens
            .skip_while(|t| *t != "via")
            .nth(1)
            .and_then(|via| via.parse().ok())
    })
}

pub struct LinuxRouteTable;

impl LinuxRouteTable {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LinuxRouteTable {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RouteTable for LinuxRouteTable {
    async fn add_route(&self, destination: &IpNet, gateway: IpAddr) -> Result<(), PlatformError> {
        let dest = destination.to_string();
        let via = gateway.to_string();
        run_ip(&[family_flag(gateway), "route", "replace", &dest, "via", &via])
            .await
            .map(|_| ())
            .map_err(PlatformError::AddRouteError)
    }

    async fn delete_route(&self, destination: &IpNet, gateway: IpAddr) -> Result<(), PlatformError> {
        let dest = destination.to_string();
        let via = gateway.to_string();
        run_ip(&[family_flag(gateway), "route", "delete", &dest, "via", &via])
            .await
            .map(|_| ())
            .map_err(PlatformError::DeleteRouteError)
    }

    async fn replace_default_route(&self, gateway: IpAddr) -> Result<(), PlatformError> {
        let via = gateway.to_string();
        run_ip(&[family_flag(gateway), "route", "replace", "default", "via", &via])
            .await
            .map(|_| ())
            .map_err(PlatformError::DefaultRouteError)
    }

    async fn current_default_route(&self) -> Result<Option<IpAddr>, PlatformError> {
        let v4 = run_ip(&["-4", "route", "show", "default"])
            .await
            .map_err(PlatformError::QueryError)?;
        if let Some(via) = parse_default_via(&v4) {
            return Ok(Some(via));
        }

        let v6 = run_ip(&["-6", "route", "show", "default"])
            .await
            .map_err(PlatformError::QueryError)?;
        Ok(parse_default_via(&v6))
    }
}

pub struct LinuxNetworkProbe;

impl LinuxNetworkProbe {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LinuxNetworkProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NetworkProbe for LinuxNetworkProbe {
    async fn interface_exists(&self, interface: &str) -> bool {
        run_ip(&["link", "show", "dev", interface]).await.is_ok()
    }

    async fn ping(&self, target: IpAddr, interface: Option<&str>, timeout: Duration) -> bool {
        let wait = timeout.as_secs().max(1).to_string();
        let target = target.to_string();

        let mut cmd = Command::new(PING_CMD);
        cmd.args(["-c", "1", "-W", &wait]);
        if let Some(iface) = interface {
            cmd.args(["-I", iface]);
        }
        cmd.arg(&target)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        // -W only bounds the reply wait, not the whole invocation
        let deadline = timeout + Duration::from_secs(1);
        match tokio::time::timeout(deadline, cmd.status()).await {
            Ok(Ok(status)) => status.success(),
            Ok(Err(e)) => {
                debug!("ping {} failed to run: {}", target, e);
                false
            }
            Err(_) => {
                debug!("ping {} timed out", target);
                false
            }
        }
    }
}
