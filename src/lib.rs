//! tunguard - self-healing SSH tunnel with default-gateway failover
//!
//! Keeps a point-to-point tunnel to a remote host alive and steers the
//! default route through it while it is healthy. When the tunnel breaks the
//! default route falls back to the original gateway, so connectivity is
//! never left pointing into a dead tunnel.
//!
//! # Architecture
//!
//! - `config`: Configuration file handling (TOML) and the run mode
//! - `platform`: Route table and network probes (Linux)
//! - `tunnel`: Secure transport, health check and tunnel lifecycle
//! - `vpn`: Default-route switching and protected subnets
//! - `state`: Runtime directory and persisted tunnel record
//! - `supervisor`: The light/full control loops
//!
//! # Usage
//!
//! ```bash
//! sudo tunguard -m full -f 60
//! ```

pub mod config;
pub mod platform;
pub mod state;
pub mod supervisor;
pub mod tunnel;
pub mod vpn;

pub use config::{Config, Mode};
pub use state::RuntimeDir;
pub use supervisor::{CycleOutcome, Supervisor};
