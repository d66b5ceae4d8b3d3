//! Environment configuration.
//!
//! Everything here is read once at startup. Runtime tunables (ban duration,
//! thresholds, the regex corpus) live in the key-value store instead and are
//! re-read per decision; see [`crate::store`].

use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tracing::warn;

const DEFAULT_IPV4_NETWORK: &str = "172.22.1";
const DEFAULT_IPV6_NETWORK: &str = "fd4d:6169:6c63:6f77::/64";
const DEFAULT_STORE_PORT: u16 = 6379;

/// A source-NAT assignment: rewrite traffic leaving `source` to `to`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snat {
    pub source: IpNet,
    pub to: IpAddr,
}

/// Startup configuration derived from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Key-value store endpoint, `redis://host:port/0`.
    pub store_url: String,
    /// Masquerade loop for the internal IPv4 network, if enabled.
    pub snat4: Option<Snat>,
    /// Masquerade loop for the internal IPv6 network, if enabled.
    pub snat6: Option<Snat>,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let ipv4_network = non_empty(lookup("IPV4_NETWORK"))
            .unwrap_or_else(|| DEFAULT_IPV4_NETWORK.to_string());
        let ipv6_network = non_empty(lookup("IPV6_NETWORK"))
            .unwrap_or_else(|| DEFAULT_IPV6_NETWORK.to_string());

        // The store lives at .249 of the internal network unless a replica
        // endpoint is configured explicitly.
        let store_url = match non_empty(lookup("REDIS_SLAVEOF_IP")) {
            Some(host) => {
                let port = non_empty(lookup("REDIS_SLAVEOF_PORT"))
                    .and_then(|p| p.parse::<u16>().ok())
                    .unwrap_or(DEFAULT_STORE_PORT);
                format!("redis://{}:{}/0", host, port)
            }
            None => format!("redis://{}.249:{}/0", ipv4_network, DEFAULT_STORE_PORT),
        };

        let snat4 = snat_target(lookup("SNAT_TO_SOURCE")).and_then(|raw| {
            let to = match raw.parse::<Ipv4Addr>() {
                Ok(addr) => addr,
                Err(_) => {
                    warn!(value = %raw, "SNAT_TO_SOURCE is not a valid IPv4 address");
                    return None;
                }
            };
            let source = match format!("{}.0/24", ipv4_network).parse::<Ipv4Net>() {
                Ok(net) => net,
                Err(_) => {
                    warn!(value = %ipv4_network, "IPV4_NETWORK does not form a valid /24");
                    return None;
                }
            };
            Some(Snat {
                source: IpNet::V4(source),
                to: IpAddr::V4(to),
            })
        });

        let snat6 = snat_target(lookup("SNAT6_TO_SOURCE")).and_then(|raw| {
            let to = match raw.parse::<Ipv6Addr>() {
                Ok(addr) => addr,
                Err(_) => {
                    warn!(value = %raw, "SNAT6_TO_SOURCE is not a valid IPv6 address");
                    return None;
                }
            };
            let source = match ipv6_network.parse::<Ipv6Net>() {
                Ok(net) => net,
                Err(_) => {
                    warn!(value = %ipv6_network, "IPV6_NETWORK is not a valid IPv6 network");
                    return None;
                }
            };
            Some(Snat {
                source: IpNet::V6(source),
                to: IpAddr::V6(to),
            })
        });

        Config {
            store_url,
            snat4,
            snat6,
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

/// `n` (or nothing) disables a SNAT loop.
fn snat_target(value: Option<String>) -> Option<String> {
    non_empty(value).filter(|v| v != "n")
}
