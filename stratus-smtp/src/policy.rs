//! Recipient and source-network policy for the relay.

use std::{
    fmt::{self, Display},
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    str::FromStr,
};

use stratus_common::{address::is_valid_domain, tracing};

use crate::error::PolicyError;

/// An IPv4 or IPv6 network in CIDR notation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Subnet {
    network: IpAddr,
    prefix: u8,
}

impl Subnet {
    /// Returns `true` if `ip` lies inside this network.
    ///
    /// IPv4-mapped IPv6 addresses are compared against IPv4 networks and
    /// vice versa, so a dual-stack listener sees the same policy.
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.network, ip) {
            (IpAddr::V4(network), IpAddr::V4(ip)) => contains_v4(network, self.prefix, ip),
            (IpAddr::V6(network), IpAddr::V6(ip)) => contains_v6(network, self.prefix, ip),
            (IpAddr::V4(network), IpAddr::V6(ip)) => ip
                .to_ipv4_mapped()
                .is_some_and(|ip| contains_v4(network, self.prefix, ip)),
            (IpAddr::V6(network), IpAddr::V4(ip)) => {
                contains_v6(network, self.prefix, ip.to_ipv6_mapped())
            }
        }
    }
}

fn contains_v4(network: Ipv4Addr, prefix: u8, ip: Ipv4Addr) -> bool {
    let mask = u32::MAX.checked_shl(32 - u32::from(prefix)).unwrap_or(0);
    u32::from(network) & mask == u32::from(ip) & mask
}

fn contains_v6(network: Ipv6Addr, prefix: u8, ip: Ipv6Addr) -> bool {
    let mask = u128::MAX.checked_shl(128 - u32::from(prefix)).unwrap_or(0);
    u128::from(network) & mask == u128::from(ip) & mask
}

impl FromStr for Subnet {
    type Err = PolicyError;

    /// Parse `addr/prefix`, or a bare address as a single-host network.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        let (address, prefix) = value
            .split_once('/')
            .map_or((value, None), |(address, prefix)| (address, Some(prefix)));

        let network = IpAddr::from_str(address.trim())
            .map_err(|_| PolicyError::InvalidSubnet(value.to_string()))?;
        let max = if network.is_ipv4() { 32 } else { 128 };

        let prefix = match prefix {
            None => max,
            Some(prefix) => prefix
                .trim()
                .parse::<u8>()
                .ok()
                .filter(|prefix| *prefix <= max)
                .ok_or_else(|| PolicyError::InvalidPrefix(value.to_string()))?,
        };

        Ok(Self { network, prefix })
    }
}

impl Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

/// The allow-lists a relay enforces. Fixed for the lifetime of a service.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PolicyConfig {
    allowed_destination_domains: Vec<String>,
    allowed_source_subnets: Vec<Subnet>,
}

impl PolicyConfig {
    /// # Errors
    ///
    /// Fails on the first domain that does not validate or subnet that does not parse.
    pub fn new<D, S>(domains: D, subnets: S) -> Result<Self, PolicyError>
    where
        D: IntoIterator,
        D::Item: AsRef<str>,
        S: IntoIterator,
        S::Item: AsRef<str>,
    {
        let allowed_destination_domains = domains
            .into_iter()
            .map(|domain| {
                let domain = domain.as_ref().trim();
                if is_valid_domain(domain) {
                    Ok(domain.to_string())
                } else {
                    Err(PolicyError::InvalidDomain(domain.to_string()))
                }
            })
            .collect::<Result<_, _>>()?;

        let allowed_source_subnets = subnets
            .into_iter()
            .map(|subnet| subnet.as_ref().parse())
            .collect::<Result<_, _>>()?;

        Ok(Self {
            allowed_destination_domains,
            allowed_source_subnets,
        })
    }

    pub fn domains(&self) -> &[String] {
        &self.allowed_destination_domains
    }

    pub fn subnets(&self) -> &[Subnet] {
        &self.allowed_source_subnets
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PolicyDecision {
    Accept,
    RejectDomain,
    RejectSource,
}

/// Decides whether a recipient may be relayed for a given client.
#[derive(Clone, Debug)]
pub struct PolicyFilter {
    config: PolicyConfig,
}

impl PolicyFilter {
    pub const fn new(config: PolicyConfig) -> Self {
        Self { config }
    }

    pub const fn config(&self) -> &PolicyConfig {
        &self.config
    }

    /// Check `candidate` arriving from `source`.
    ///
    /// The source network is checked first, so a disallowed client is always
    /// reported as [`PolicyDecision::RejectSource`]. Domains match on a literal
    /// `@domain` suffix, compared case-sensitively; subdomains are not implied.
    pub fn check_recipient(&self, candidate: &str, source: IpAddr) -> PolicyDecision {
        if !self.source_allowed(source) {
            tracing::warn!(%source, "Rejected mail relay from {source}");
            return PolicyDecision::RejectSource;
        }

        if !self.domain_allowed(candidate) {
            tracing::warn!(%source, %candidate, "Rejected mail relay from {source} to {candidate}");
            return PolicyDecision::RejectDomain;
        }

        PolicyDecision::Accept
    }

    fn source_allowed(&self, source: IpAddr) -> bool {
        self.config
            .allowed_source_subnets
            .iter()
            .any(|subnet| subnet.contains(source))
    }

    fn domain_allowed(&self, candidate: &str) -> bool {
        let candidate = candidate.as_bytes();
        self.config.allowed_destination_domains.iter().any(|domain| {
            let domain = domain.as_bytes();
            candidate.len() > domain.len()
                && candidate[candidate.len() - domain.len() - 1] == b'@'
                && candidate.ends_with(domain)
        })
    }
}
