//! Protected subnets that always bypass the tunnel
//!
//! The static list comes from the configuration; the blacklist file is
//! re-read on every apply so edits take effect on the next cycle. Removal
//! also covers everything installed earlier, so entries dropped from the
//! file in the meantime do not linger.

use super::Tally;
use crate::platform::RouteTable;
use ipnet::IpNet;
use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Parse a blacklist file body: one CIDR (or bare address) per line
///
/// Blank lines and `#` comments are ignored, malformed lines are skipped.
pub fn parse_blacklist(content: &str) -> Vec<IpNet> {
    content
        .lines()
        .enumerate()
        .filter_map(|(idx, raw)| {
            let line = raw.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                return None;
            }
            match parse_subnet(line) {
                Some(net) => Some(net),
                None => {
                    warn!("Ignoring blacklist line {}: {:?}", idx + 1, line);
                    None
                }
            }
        })
        .collect()
}

fn parse_subnet(s: &str) -> Option<IpNet> {
    if let Ok(net) = s.parse::<IpNet>() {
        return Some(net.trunc());
    }
    s.parse::<IpAddr>().ok().map(IpNet::from)
}

/// Read the blacklist file; a missing file is an empty list
pub fn load_blacklist(path: &Path) -> io::Result<Vec<IpNet>> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(parse_blacklist(&content)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!("Blacklist file {} not present, skipping", path.display());
            Ok(Vec::new())
        }
        Err(e) => Err(e),
    }
}

pub struct BlacklistRouter {
    routes: Arc<dyn RouteTable>,
    gateway: IpAddr,
    static_subnets: Vec<IpNet>,
    blacklist_file: Option<PathBuf>,
    installed: BTreeSet<IpNet>,
}

impl BlacklistRouter {
    pub fn new(
        routes: Arc<dyn RouteTable>,
        gateway: IpAddr,
        static_subnets: Vec<IpNet>,
        blacklist_file: Option<PathBuf>,
    ) -> Self {
        Self {
            routes,
            gateway,
            static_subnets,
            blacklist_file,
            installed: BTreeSet::new(),
        }
    }

    /// Static subnets plus the current file contents, deduplicated
    pub fn subnets(&self) -> Vec<IpNet> {
        let mut set: BTreeSet<IpNet> = self.static_subnets.iter().map(IpNet::trunc).collect();

        if let Some(path) = &self.blacklist_file {
            match load_blacklist(path) {
                Ok(entries) => set.extend(entries),
                Err(e) => warn!("Failed to read blacklist {}: {}", path.display(), e),
            }
        }

        // Only subnets of the gateway's family can be routed through it
        let v4 = self.gateway.is_ipv4();
        set.into_iter()
            .filter(|net| matches!(net, IpNet::V4(_)) == v4)
            .collect()
    }

    /// Add (`add == true`) or remove the protected routes, best effort
    pub async fn apply(&mut self, add: bool) -> Tally {
        let mut subnets: BTreeSet<IpNet> = self.subnets().into_iter().collect();
        if add {
            self.installed.extend(subnets.iter().copied());
        } else {
            subnets.extend(std::mem::take(&mut self.installed));
        }
        let mut tally = Tally::default();

        for net in &subnets {
            let result = if add {
                self.routes.add_route(net, self.gateway).await
            } else {
                self.routes.delete_route(net, self.gateway).await
            };
            if let Err(e) = &result {
                warn!("Protected route {} via {}: {} (continuing)", net, self.gateway, e);
            }
            tally.record(&result);
        }

        info!(
            "Protected routes {}: {} via {}",
            if add { "added" } else { "removed" },
            tally,
            self.gateway
        );
        tally
    }
}
