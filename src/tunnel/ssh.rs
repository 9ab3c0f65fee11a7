//! OpenSSH-backed secure transport
//!
//! The tunnel is an `ssh -w` point-to-point link. The ssh process is spawned
//! directly so its pid is known; that pid is the tunnel handle.

use super::transport::{RemoteBatch, SecureTransport, TransportError, TunnelHandle};
use super::TunnelEndpoints;
use crate::config::TunnelConfig;
use crate::platform::linux::run_ip;
use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::net::IpAddr;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

const SSH_CMD: &str = "ssh";
const POLL_INTERVAL: Duration = Duration::from_millis(500);

pub struct SshTransport {
    user: String,
    host: IpAddr,
    port: u16,
    identity_file: Option<PathBuf>,
    timeout: Duration,
}

impl SshTransport {
    pub fn new(config: &TunnelConfig) -> Self {
        Self {
            user: config.ssh_user.clone(),
            host: config.remote_host,
            port: config.ssh_port,
            identity_file: config.identity_file.clone(),
            timeout: Duration::from_secs(config.establish_timeout_secs),
        }
    }

    fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// Options shared by the tunnel and the remote batch connections
    fn base_args(&self) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            self.port.to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.timeout.as_secs()),
        ];
        if let Some(identity) = &self.identity_file {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
        }
        args
    }

    fn tunnel_args(&self, endpoints: &TunnelEndpoints) -> Vec<String> {
        let mut args = self.base_args();
        args.extend(
            [
                "-N",
                "-w",
                &format!("{}:{}", endpoints.local_tun_id, endpoints.remote_tun_id),
                "-o",
                "Tunnel=point-to-point",
                "-o",
                "ExitOnForwardFailure=yes",
                "-o",
                "ServerAliveInterval=15",
                "-o",
                "ServerAliveCountMax=3",
            ]
            .iter()
            .map(|s| s.to_string()),
        );
        args.push(self.destination());
        args
    }

    async fn configure_local(&self, endpoints: &TunnelEndpoints) -> Result<(), TransportError> {
        let iface = endpoints.local_interface.as_str();
        let local = endpoints.local_address.to_string();
        let peer = endpoints.remote_address.to_string();

        run_ip(&["link", "set", iface, "up"])
            .await
            .map_err(TransportError::LocalSetup)?;
        run_ip(&["addr", "replace", &local, "peer", &peer, "dev", iface])
            .await
            .map_err(TransportError::LocalSetup)?;
        Ok(())
    }
}

#[async_trait]
impl SecureTransport for SshTransport {
    async fn establish(&self, endpoints: &TunnelEndpoints) -> Result<TunnelHandle, TransportError> {
        let iface = endpoints.local_interface.clone();
        info!("Starting ssh tunnel to {} on {}", self.host, iface);

        let mut child = Command::new(SSH_CMD)
            .args(self.tunnel_args(endpoints))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;

        let Some(pid) = child.id() else {
            return Err(TransportError::Exited {
                interface: iface,
                status: "exited immediately".to_string(),
            });
        };
        debug!("ssh tunnel process pid={}", pid);

        let deadline = Instant::now() + self.timeout;
        loop {
            if let Some(status) = child.try_wait()? {
                return Err(TransportError::Exited {
                    interface: iface,
                    status: status.to_string(),
                });
            }
            if run_ip(&["link", "show", "dev", &iface]).await.is_ok() {
                break;
            }
            if Instant::now() >= deadline {
                let _ = child.start_kill();
                return Err(TransportError::EstablishTimeout(iface));
            }
            sleep(POLL_INTERVAL).await;
        }

        if let Err(e) = self.configure_local(endpoints).await {
            let _ = child.start_kill();
            return Err(e);
        }

        info!("Tunnel interface {} is up (pid {})", iface, pid);
        Ok(TunnelHandle { pid })
    }

    async fn run_remote(&self, batch: &RemoteBatch) -> Result<(), TransportError> {
        if batch.is_empty() {
            return Ok(());
        }
        let script = batch.script();
        debug!("remote batch on {}: {}", self.host, script);

        let mut cmd = Command::new(SSH_CMD);
        cmd.args(self.base_args())
            .arg(self.destination())
            .arg(&script)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout * 2, cmd.output())
            .await
            .map_err(|_| TransportError::RemoteTimeout)??;

        if !output.status.success() {
            return Err(TransportError::RemoteBatch {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    async fn terminate(&self, handle: &TunnelHandle) -> Result<(), TransportError> {
        let pid = i32::try_from(handle.pid).map_err(|_| TransportError::Terminate {
            pid: handle.pid,
            message: "pid out of range".to_string(),
        })?;

        match kill(Pid::from_raw(pid), Signal::SIGTERM) {
            Ok(()) => {
                info!("Sent SIGTERM to tunnel process {}", handle.pid);
                Ok(())
            }
            Err(Errno::ESRCH) => {
                debug!("Tunnel process {} already gone", handle.pid);
                Ok(())
            }
            Err(e) => Err(TransportError::Terminate {
                pid: handle.pid,
                message: e.to_string(),
            }),
        }
    }

    async fn release_interface(&self, interface: &str) -> Result<(), TransportError> {
        if run_ip(&["link", "show", "dev", interface]).await.is_err() {
            return Ok(());
        }
        run_ip(&["link", "delete", interface]).await.map(|_| ()).map_err(|message| {
            warn!("Could not delete {}: {}", interface, message);
            TransportError::Release {
                interface: interface.to_string(),
                message,
            }
        })
    }
}
