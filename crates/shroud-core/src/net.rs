//! Client address matching for allowed-IP lists.

use crate::config::ConfigError;
use std::net::IpAddr;
use std::str::FromStr;

/// A single address or a CIDR block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpPattern {
    Addr(IpAddr),
    Cidr { network: IpAddr, prefix: u8 },
}

impl IpPattern {
    pub fn contains(&self, ip: IpAddr) -> bool {
        let ip = ip.to_canonical();
        match *self {
            IpPattern::Addr(addr) => addr.to_canonical() == ip,
            IpPattern::Cidr { network, prefix } => match (network.to_canonical(), ip) {
                (IpAddr::V4(net), IpAddr::V4(ip)) => match 32u32.checked_sub(u32::from(prefix)) {
                    Some(host_bits) => {
                        let mask = u32::MAX.checked_shl(host_bits).unwrap_or(0);
                        u32::from(net) & mask == u32::from(ip) & mask
                    }
                    None => false,
                },
                (IpAddr::V6(net), IpAddr::V6(ip)) => match 128u32.checked_sub(u32::from(prefix)) {
                    Some(host_bits) => {
                        let mask = u128::MAX.checked_shl(host_bits).unwrap_or(0);
                        u128::from(net) & mask == u128::from(ip) & mask
                    }
                    None => false,
                },
                _ => false,
            },
        }
    }
}

impl FromStr for IpPattern {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = || ConfigError::Config(format!("invalid IP or CIDR {s:?}"));
        match s.split_once('/') {
            Some((network, prefix)) => {
                let network: IpAddr = network.parse().map_err(|_| invalid())?;
                let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
                let max = if network.is_ipv4() { 32 } else { 128 };
                if prefix > max {
                    return Err(invalid());
                }
                // Clients are matched canonically, so an IPv4-mapped block
                // becomes the IPv4 block it maps.
                match (network, network.to_canonical()) {
                    (IpAddr::V6(_), IpAddr::V4(v4)) => {
                        let prefix = prefix.checked_sub(96).ok_or_else(invalid)?;
                        Ok(IpPattern::Cidr { network: IpAddr::V4(v4), prefix })
                    }
                    _ => Ok(IpPattern::Cidr { network, prefix }),
                }
            }
            None => s.parse().map(IpPattern::Addr).map_err(|_| invalid()),
        }
    }
}

/// A list of allowed client addresses. An empty list allows everyone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IpAllowList {
    patterns: Vec<IpPattern>,
}

impl IpAllowList {
    pub fn parse<S: AsRef<str>>(entries: &[S]) -> Result<Self, ConfigError> {
        let patterns = entries
            .iter()
            .map(|e| e.as_ref().parse())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    pub fn allows(&self, ip: IpAddr) -> bool {
        self.patterns.is_empty() || self.patterns.iter().any(|p| p.contains(ip))
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}
