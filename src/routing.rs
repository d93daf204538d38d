//! Domain-based routing decisions.
//!
//! A [`DomainFilter`] is parsed once from a comma/semicolon/whitespace
//! separated list and is immutable afterwards. Entries are either host names
//! (`hospital.local`, matching itself and every sub-domain) or IP networks in
//! CIDR notation (`10.0.0.0/8`, matching literal IP hosts inside the network).
//! A bare IP address is a single-host network.
//!
//! [`DomainRouter`] adds the empty-list policy, which differs per side:
//! the edge relays nothing when its filter is empty, the agent allows
//! everything when its allow-list is empty.

use std::fmt;
use std::net::IpAddr;

use crate::error::{Error, Result};

/// One entry of a [`DomainFilter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostPattern {
    /// Lower-cased domain name.
    Domain(String),
    /// IP network; `prefix` is the number of leading bits that must match.
    Network { addr: IpAddr, prefix: u8 },
}

impl HostPattern {
    fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim().trim_end_matches('.');
        if let Some((addr, prefix)) = raw.split_once('/') {
            let addr: IpAddr = addr
                .parse()
                .map_err(|_| Error::Config(format!("invalid network address in filter: {raw}")))?;
            let prefix: u8 = prefix
                .parse()
                .map_err(|_| Error::Config(format!("invalid prefix length in filter: {raw}")))?;
            let max = if addr.is_ipv4() { 32 } else { 128 };
            if prefix > max {
                return Err(Error::Config(format!(
                    "prefix length {prefix} exceeds {max} in filter: {raw}"
                )));
            }
            return Ok(Self::Network { addr, prefix });
        }
        let unbracketed = raw.trim_start_matches('[').trim_end_matches(']');
        if let Ok(addr) = unbracketed.parse::<IpAddr>() {
            let prefix = if addr.is_ipv4() { 32 } else { 128 };
            return Ok(Self::Network { addr, prefix });
        }
        Ok(Self::Domain(raw.to_ascii_lowercase()))
    }

    /// `host` must already be normalized (lower-case, no brackets, no trailing dot).
    fn matches(&self, host: &str) -> bool {
        match self {
            Self::Domain(domain) => {
                host == domain
                    || (host.len() > domain.len()
                        && host.ends_with(domain.as_str())
                        && host.as_bytes()[host.len() - domain.len() - 1] == b'.')
            }
            Self::Network { addr, prefix } => host
                .parse::<IpAddr>()
                .is_ok_and(|ip| network_contains(*addr, *prefix, ip)),
        }
    }
}

impl fmt::Display for HostPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Domain(d) => f.write_str(d),
            Self::Network { addr, prefix } => write!(f, "{addr}/{prefix}"),
        }
    }
}

fn network_contains(net: IpAddr, prefix: u8, ip: IpAddr) -> bool {
    match (net, ip) {
        (IpAddr::V4(net), IpAddr::V4(ip)) => {
            let mask = u32::MAX.checked_shl(32 - u32::from(prefix)).unwrap_or(0);
            u32::from(net) & mask == u32::from(ip) & mask
        }
        (IpAddr::V6(net), IpAddr::V6(ip)) => {
            let mask = u128::MAX.checked_shl(128 - u32::from(prefix)).unwrap_or(0);
            u128::from(net) & mask == u128::from(ip) & mask
        }
        _ => false,
    }
}

/// Normalize a request host for matching: lower-case, strip IPv6 brackets and
/// a trailing root dot.
fn normalize_host(host: &str) -> String {
    host.trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim_end_matches('.')
        .to_ascii_lowercase()
}

/// Immutable set of host patterns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DomainFilter {
    patterns: Vec<HostPattern>,
}

impl DomainFilter {
    /// Parse a `,`/`;`/whitespace separated list. Empty entries are skipped.
    pub fn parse(list: &str) -> Result<Self> {
        let patterns = list
            .split(|c: char| c == ',' || c == ';' || c.is_whitespace())
            .filter(|s| !s.trim().is_empty())
            .map(HostPattern::parse)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn patterns(&self) -> &[HostPattern] {
        &self.patterns
    }

    /// Whether `host` equals a domain entry, is a sub-domain of one, or is a
    /// literal IP inside a network entry.
    pub fn matches(&self, host: &str) -> bool {
        let host = normalize_host(host);
        !host.is_empty() && self.patterns.iter().any(|p| p.matches(&host))
    }
}

impl fmt::Display for DomainFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, p) in self.patterns.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{p}")?;
        }
        Ok(())
    }
}

/// What an empty filter means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmptyPolicy {
    /// Nothing matches (edge: relay nothing, every request goes direct).
    MatchNone,
    /// Everything matches (agent: execute requests for any host).
    MatchAll,
}

/// Per-side routing decision on top of a [`DomainFilter`].
#[derive(Debug, Clone)]
pub struct DomainRouter {
    filter: DomainFilter,
    on_empty: EmptyPolicy,
}

impl DomainRouter {
    /// Edge router: matching hosts are relayed, all others go direct.
    pub fn edge(filter: DomainFilter) -> Self {
        Self {
            filter,
            on_empty: EmptyPolicy::MatchNone,
        }
    }

    /// Agent router: matching hosts are executed, all others get a 403.
    pub fn agent(allow_list: DomainFilter) -> Self {
        Self {
            filter: allow_list,
            on_empty: EmptyPolicy::MatchAll,
        }
    }

    pub fn filter(&self) -> &DomainFilter {
        &self.filter
    }

    fn decide(&self, host: &str) -> bool {
        if self.filter.is_empty() {
            return self.on_empty == EmptyPolicy::MatchAll;
        }
        self.filter.matches(host)
    }

    /// Edge side: should a request for `host` go through the relay?
    pub fn should_relay(&self, host: &str) -> bool {
        self.decide(host)
    }

    /// Agent side: may the agent execute a request for `host`?
    pub fn is_allowed(&self, host: &str) -> bool {
        self.decide(host)
    }
}
