//! NAT and forwarding rules for tunnel-sourced traffic
//!
//! Rules are rendered as command lines and shipped to the remote side inside
//! a `RemoteBatch`. Installation checks for an existing rule first so a
//! repeated setup never stacks duplicates.

use ipnet::IpNet;
use std::net::IpAddr;

use crate::platform::host_net;

/// One iptables rule, independent of whether it is being added or deleted
#[derive(Debug, Clone, PartialEq, Eq)]
struct Rule {
    table: &'static str,
    chain: &'static str,
    spec: String,
}

impl Rule {
    fn render(&self, binary: &str, action: &str) -> String {
        format!(
            "{} -t {} {} {} {}",
            binary, self.table, action, self.chain, self.spec
        )
    }
}

/// Masquerade and forward-accept rules scoped to the local tunnel address
#[derive(Debug, Clone)]
pub struct FirewallRules {
    source: IpNet,
}

impl FirewallRules {
    pub fn new(local_tunnel_address: IpAddr) -> Self {
        Self {
            source: host_net(local_tunnel_address),
        }
    }

    fn binary(&self) -> &'static str {
        match self.source {
            IpNet::V4(_) => "iptables",
            IpNet::V6(_) => "ip6tables",
        }
    }

    fn rules(&self) -> Vec<Rule> {
        vec![
            Rule {
                table: "nat",
                chain: "POSTROUTING",
                spec: format!("-s {} -j MASQUERADE", self.source),
            },
            Rule {
                table: "filter",
                chain: "FORWARD",
                spec: format!("-s {} -j ACCEPT", self.source),
            },
            Rule {
                table: "filter",
                chain: "FORWARD",
                spec: format!(
                    "-d {} -m conntrack --ctstate RELATED,ESTABLISHED -j ACCEPT",
                    self.source
                ),
            },
        ]
    }

    /// Kernel switch that lets the remote host forward tunnel traffic
    pub fn forwarding_command(&self) -> &'static str {
        match self.source {
            IpNet::V4(_) => "sysctl -w net.ipv4.ip_forward=1",
            IpNet::V6(_) => "sysctl -w net.ipv6.conf.all.forwarding=1",
        }
    }

    /// Check-then-append commands, safe to run repeatedly
    pub fn install_commands(&self) -> Vec<String> {
        let binary = self.binary();
        self.rules()
            .iter()
            .map(|rule| {
                format!(
                    "( {} || {} )",
                    rule.render(binary, "-C"),
                    rule.render(binary, "-A")
                )
            })
            .collect()
    }

    /// Inverse of `install_commands`, in reverse order
    pub fn remove_commands(&self) -> Vec<String> {
        let binary = self.binary();
        self.rules()
            .iter()
            .rev()
            .map(|rule| rule.render(binary, "-D"))
            .collect()
    }
}
