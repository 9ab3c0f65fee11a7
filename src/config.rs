//! Configuration handling for tunguard
//!
//! The configuration is read once at startup and shared immutably with every
//! component. Command-line flags override the file (see `main.rs`).

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

const CONFIG_FILE_NAME: &str = "tunguard.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Operating mode of the supervisor loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Passive monitor: fail back to the gateway, never build the tunnel
    Light,
    /// Active maintainer: rebuild the tunnel and switch over when healthy
    Full,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Light => write!(f, "light"),
            Mode::Full => write!(f, "full"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub network: NetworkConfig,
    pub tunnel: TunnelConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Original default router
    pub gateway: IpAddr,
    /// Subnets that always bypass the tunnel
    #[serde(default)]
    pub protected_subnets: Vec<IpNet>,
    /// Optional file with one CIDR per line, re-read on every apply
    #[serde(default)]
    pub blacklist_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    pub remote_host: IpAddr,
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
    #[serde(default)]
    pub local_tun_id: u32,
    #[serde(default)]
    pub remote_tun_id: u32,
    pub local_address: IpAddr,
    pub remote_address: IpAddr,
    #[serde(default = "default_establish_timeout")]
    pub establish_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Public address probed through the tunnel
    pub upstream_probe: IpAddr,
    pub attempts: u32,
    pub probe_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    pub frequency_secs: u64,
    pub runtime_dir: PathBuf,
}

fn default_ssh_user() -> String {
    "root".to_string()
}

fn default_ssh_port() -> u16 {
    22
}

fn default_establish_timeout() -> u64 {
    15
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            upstream_probe: IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
            attempts: 3,
            probe_timeout_secs: 2,
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            frequency_secs: 90,
            runtime_dir: PathBuf::from("/var/run/tunguard"),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network: NetworkConfig {
                gateway: IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1)),
                protected_subnets: ["10.0.0.0/8", "172.16.0.0/12", "192.168.0.0/16"]
                    .iter()
                    .filter_map(|s| s.parse().ok())
                    .collect(),
                blacklist_file: Some(PathBuf::from("/etc/tunguard/blacklist")),
            },
            tunnel: TunnelConfig {
                remote_host: IpAddr::V4(Ipv4Addr::new(203, 0, 113, 10)),
                ssh_user: default_ssh_user(),
                ssh_port: default_ssh_port(),
                identity_file: None,
                local_tun_id: 0,
                remote_tun_id: 0,
                local_address: IpAddr::V4(Ipv4Addr::new(10, 254, 0, 1)),
                remote_address: IpAddr::V4(Ipv4Addr::new(10, 254, 0, 2)),
                establish_timeout_secs: default_establish_timeout(),
            },
            health: HealthConfig::default(),
            supervisor: SupervisorConfig::default(),
        }
    }
}

impl TunnelConfig {
    pub fn local_interface(&self) -> String {
        format!("tun{}", self.local_tun_id)
    }

    pub fn remote_interface(&self) -> String {
        format!("tun{}", self.remote_tun_id)
    }
}

impl HealthConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

impl SupervisorConfig {
    pub fn frequency(&self) -> Duration {
        Duration::from_secs(self.frequency_secs)
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from an explicit path, or the first config found in the usual places.
    pub fn discover(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        for candidate in search_paths() {
            if candidate.exists() {
                info!("Loading config from {}", candidate.display());
                return Self::load(&candidate);
            }
        }

        info!("No config file found, using defaults");
        Ok(Config::default())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let tunnel = &self.tunnel;
        if tunnel.local_address == tunnel.remote_address {
            return Err(ConfigError::Invalid(
                "local and remote tunnel addresses must differ".to_string(),
            ));
        }
        for addr in [tunnel.local_address, tunnel.remote_address] {
            if addr == self.network.gateway || addr == tunnel.remote_host {
                return Err(ConfigError::Invalid(format!(
                    "tunnel address {} collides with the gateway or remote host",
                    addr
                )));
            }
        }
        if self.health.attempts == 0 {
            return Err(ConfigError::Invalid("health.attempts must be at least 1".to_string()));
        }
        if self.supervisor.frequency_secs == 0 {
            return Err(ConfigError::Invalid(
                "supervisor.frequency_secs must be at least 1".to_string(),
            ));
        }
        if tunnel.establish_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "tunnel.establish_timeout_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn search_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from(CONFIG_FILE_NAME)];
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".tunguard").join("config.toml"));
    }
    paths.push(PathBuf::from("/etc/tunguard/config.toml"));
    paths
}
