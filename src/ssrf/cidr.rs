//! Prefix-notation network ranges.
//!
//! Matching compares the leading `prefix` bits of the address against the
//! network address: whole bytes directly, then the final partial byte under
//! the mask `0xFF << (8 - remaining_bits)`. Any malformed input yields "not in
//! range" rather than an error.

use std::net::IpAddr;

/// A parsed `address/prefix` range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CidrRange {
    network: IpAddr,
    prefix: u8,
}

impl CidrRange {
    /// Parses `a.b.c.d/n` or `x:y::z/n`. Returns `None` on any malformed input.
    pub fn parse(notation: &str) -> Option<Self> {
        let (address, prefix) = notation.trim().split_once('/')?;
        let network: IpAddr = address.trim().parse().ok()?;
        let prefix: u8 = prefix.trim().parse().ok()?;

        let max_prefix = match network {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix > max_prefix {
            return None;
        }

        Some(Self { network, prefix })
    }

    pub fn network(&self) -> IpAddr {
        self.network
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// Whether `address` lies inside this range. Families must match.
    pub fn contains(&self, address: IpAddr) -> bool {
        match (self.network, address) {
            (IpAddr::V4(net), IpAddr::V4(addr)) => {
                prefix_matches(&net.octets(), &addr.octets(), self.prefix)
            }
            (IpAddr::V6(net), IpAddr::V6(addr)) => {
                prefix_matches(&net.octets(), &addr.octets(), self.prefix)
            }
            _ => false,
        }
    }
}

fn prefix_matches(network: &[u8], address: &[u8], prefix: u8) -> bool {
    let full_bytes = usize::from(prefix / 8);
    let remaining_bits = prefix % 8;

    if network[..full_bytes] != address[..full_bytes] {
        return false;
    }

    if remaining_bits == 0 {
        return true;
    }

    let mask = 0xFFu8 << (8 - remaining_bits);
    (network[full_bytes] & mask) == (address[full_bytes] & mask)
}

/// Whether `address` lies inside `cidr`. False for any malformed input.
pub fn is_in_range(address: &str, cidr: &str) -> bool {
    match address.trim().parse::<IpAddr>() {
        Ok(ip) => ip_in_range(ip, cidr),
        Err(_) => false,
    }
}

/// Whether `ip` lies inside `cidr`. False if `cidr` is malformed.
pub fn ip_in_range(ip: IpAddr, cidr: &str) -> bool {
    CidrRange::parse(cidr).map(|range| range.contains(ip)).unwrap_or(false)
}
