// SPDX-License-Identifier: AGPL-3.0-or-later
//! Endpoint validation against internal address ranges
//!
//! Every remote endpoint is resolved and each resulting address is checked,
//! so a public-looking hostname that resolves to a private address is caught.
//! Drivers then connect only to the addresses returned here.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tracing::{info, warn};
use url::{Host, Url};

use stow_core::{ResolvedEndpoint, StowError, StowResult};

/// Process-wide endpoint policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityPolicy {
    /// Permit loopback, link-local and private ranges as remote endpoints
    pub allow_local_ips: bool,
}

/// One entry of the blocked-range table
#[derive(Debug, Clone, Copy)]
pub struct BlockedRange {
    network: IpAddr,
    prefix: u8,
    pub reason: &'static str,
}

impl BlockedRange {
    const fn v4(a: u8, b: u8, c: u8, d: u8, prefix: u8, reason: &'static str) -> Self {
        Self {
            network: IpAddr::V4(Ipv4Addr::new(a, b, c, d)),
            prefix,
            reason,
        }
    }

    const fn v6(segments: [u16; 8], prefix: u8, reason: &'static str) -> Self {
        let [a, b, c, d, e, f, g, h] = segments;
        Self {
            network: IpAddr::V6(Ipv6Addr::new(a, b, c, d, e, f, g, h)),
            prefix,
            reason,
        }
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = u32::MAX.checked_shl(32 - u32::from(self.prefix)).unwrap_or(0);
                u32::from(net) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = u128::MAX.checked_shl(128 - u32::from(self.prefix)).unwrap_or(0);
                u128::from(net) & mask == u128::from(ip) & mask
            }
            _ => false,
        }
    }

    pub fn cidr(&self) -> String {
        format!("{}/{}", self.network, self.prefix)
    }
}

/// Blocked ranges in match order; the metadata address comes first so it is
/// reported under its own name.
pub const BLOCKED_RANGES: [BlockedRange; 15] = [
    BlockedRange::v4(169, 254, 169, 254, 32, "cloud metadata service"),
    BlockedRange::v4(0, 0, 0, 0, 8, "unspecified network"),
    BlockedRange::v4(127, 0, 0, 0, 8, "loopback"),
    BlockedRange::v4(10, 0, 0, 0, 8, "private network"),
    BlockedRange::v4(100, 64, 0, 0, 10, "carrier-grade NAT"),
    BlockedRange::v4(169, 254, 0, 0, 16, "link-local"),
    BlockedRange::v4(172, 16, 0, 0, 12, "private network"),
    BlockedRange::v4(192, 168, 0, 0, 16, "private network"),
    BlockedRange::v4(224, 0, 0, 0, 4, "multicast"),
    BlockedRange::v4(255, 255, 255, 255, 32, "broadcast"),
    BlockedRange::v6([0, 0, 0, 0, 0, 0, 0, 0], 128, "unspecified address"),
    BlockedRange::v6([0, 0, 0, 0, 0, 0, 0, 1], 128, "loopback"),
    BlockedRange::v6([0xfe80, 0, 0, 0, 0, 0, 0, 0], 10, "link-local"),
    BlockedRange::v6([0xfc00, 0, 0, 0, 0, 0, 0, 0], 7, "unique local address"),
    BlockedRange::v6([0xff00, 0, 0, 0, 0, 0, 0, 0], 8, "multicast"),
];

/// The blocked range `ip` falls into, if any. IPv4-mapped IPv6 addresses are
/// matched as IPv4.
pub fn blocked_range(ip: IpAddr) -> Option<&'static BlockedRange> {
    let ip = match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(ip, IpAddr::V4),
        v4 => v4,
    };
    BLOCKED_RANGES.iter().find(|range| range.contains(ip))
}

/// Check one address against `policy`
pub fn check_addr(ip: IpAddr, policy: &SecurityPolicy) -> StowResult<()> {
    if policy.allow_local_ips {
        return Ok(());
    }
    match blocked_range(ip) {
        Some(range) => Err(StowError::EndpointBlocked {
            reason: format!("{ip} is a {} address", range.reason),
            matched_range: range.cidr(),
        }),
        None => Ok(()),
    }
}

/// Host name resolution seam
#[async_trait]
pub trait HostResolver: Send + Sync {
    async fn resolve(&self, host: &str) -> StowResult<Vec<IpAddr>>;
}

/// Resolver backed by the operating system
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

#[async_trait]
impl HostResolver for SystemResolver {
    async fn resolve(&self, host: &str) -> StowResult<Vec<IpAddr>> {
        let addrs = tokio::net::lookup_host((host, 0))
            .await
            .map_err(|e| StowError::Network(format!("cannot resolve {host}: {e}")))?;
        let mut ips: Vec<IpAddr> = addrs.map(|addr| addr.ip()).collect();
        ips.dedup();
        Ok(ips)
    }
}

/// Fixed host table, for tests and offline setups
#[derive(Debug, Default, Clone)]
pub struct StaticResolver {
    hosts: HashMap<String, Vec<IpAddr>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(mut self, host: impl Into<String>, addrs: impl IntoIterator<Item = IpAddr>) -> Self {
        self.hosts
            .insert(host.into().to_ascii_lowercase(), addrs.into_iter().collect());
        self
    }
}

#[async_trait]
impl HostResolver for StaticResolver {
    async fn resolve(&self, host: &str) -> StowResult<Vec<IpAddr>> {
        Ok(self
            .hosts
            .get(&host.to_ascii_lowercase())
            .cloned()
            .unwrap_or_default())
    }
}

/// Split an endpoint string into host and port.
///
/// Accepts `host`, `host:port`, `[v6]:port`, bare IPv6 and URLs with a scheme.
pub fn split_endpoint(input: &str) -> StowResult<(String, Option<u16>)> {
    let input = input.trim();
    let invalid = || StowError::InvalidConfig(format!("invalid endpoint: {input:?}"));

    if input.contains("://") {
        let url = Url::parse(input).map_err(|_| invalid())?;
        let host = match url.host().ok_or_else(invalid)? {
            Host::Domain(domain) => domain.to_string(),
            Host::Ipv4(v4) => v4.to_string(),
            Host::Ipv6(v6) => v6.to_string(),
        };
        return Ok((host, url.port_or_known_default()));
    }

    if let Some(rest) = input.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(invalid)?;
        host.parse::<Ipv6Addr>().map_err(|_| invalid())?;
        let port = match tail.strip_prefix(':') {
            Some(port) => Some(port.parse().map_err(|_| invalid())?),
            None if tail.is_empty() => None,
            None => return Err(invalid()),
        };
        return Ok((host.to_string(), port));
    }

    let host_port = match input.matches(':').count() {
        0 => (input.to_string(), None),
        1 => {
            let (host, port) = input.split_once(':').ok_or_else(invalid)?;
            (host.to_string(), Some(port.parse().map_err(|_| invalid())?))
        }
        // More than one colon: only a bare IPv6 literal makes sense
        _ => {
            input.parse::<Ipv6Addr>().map_err(|_| invalid())?;
            (input.to_string(), None)
        }
    };
    let host = host_port.0.trim_end_matches('/');
    if host.is_empty() || host.contains(['/', ' ', '@']) {
        return Err(invalid());
    }
    Ok((host.to_string(), host_port.1))
}

/// The endpoint validator and holder of the process-wide policy
pub struct SecurityGate {
    policy: RwLock<SecurityPolicy>,
    resolver: Arc<dyn HostResolver>,
}

impl SecurityGate {
    pub fn new(policy: SecurityPolicy) -> Self {
        Self::with_resolver(policy, Arc::new(SystemResolver))
    }

    pub fn with_resolver(policy: SecurityPolicy, resolver: Arc<dyn HostResolver>) -> Self {
        Self {
            policy: RwLock::new(policy),
            resolver,
        }
    }

    pub fn policy(&self) -> SecurityPolicy {
        *self.policy.read()
    }

    pub fn set_policy(&self, policy: SecurityPolicy) {
        let mut current = self.policy.write();
        if *current != policy {
            info!(allow_local_ips = policy.allow_local_ips, "security policy updated");
        }
        *current = policy;
    }

    /// Resolve `input` and check every address it resolves to
    pub async fn validate(&self, input: &str) -> StowResult<ResolvedEndpoint> {
        let (host, port) = split_endpoint(input)?;
        let ips = match host.parse::<IpAddr>() {
            Ok(ip) => vec![ip],
            Err(_) => self.resolver.resolve(&host).await?,
        };
        if ips.is_empty() {
            return Err(StowError::Network(format!("{host} resolved to no address")));
        }

        let policy = self.policy();
        for ip in &ips {
            if let Err(e) = check_addr(*ip, &policy) {
                warn!(endpoint = input, %ip, "endpoint blocked");
                return Err(match e {
                    StowError::EndpointBlocked { reason, matched_range } if ip.to_string() != host => {
                        StowError::EndpointBlocked {
                            reason: format!("{host} resolves to {reason}"),
                            matched_range,
                        }
                    }
                    other => other,
                });
            }
        }

        Ok(ResolvedEndpoint {
            input: input.to_string(),
            host,
            port,
            addrs: ips
                .into_iter()
                .map(|ip| SocketAddr::new(ip, port.unwrap_or(0)))
                .collect(),
        })
    }
}

impl Default for SecurityGate {
    fn default() -> Self {
        Self::new(SecurityPolicy::default())
    }
}
