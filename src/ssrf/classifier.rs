use crate::ssrf::cidr::ip_in_range;
use crate::ssrf::policy::{normalize_host, AddressSafetyPolicy, DEFAULT_BLOCKED_RANGES};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// The rule that rejected an address, first match wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockReason {
    Loopback,
    PrivateNetwork,
    CustomRange(String),
    DefaultRange(&'static str),
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockReason::Loopback => write!(f, "loopback address"),
            BlockReason::PrivateNetwork => write!(f, "private network address"),
            BlockReason::CustomRange(range) => write!(f, "custom blocked range {}", range),
            BlockReason::DefaultRange(range) => write!(f, "default blocked range {}", range),
        }
    }
}

/// Classifies an address against the policy, naming the rule that blocks it.
///
/// Rules run in order: loopback, private networks, custom ranges, default
/// ranges. The order only decides which reason is reported.
pub fn classify_address(ip: IpAddr, policy: &AddressSafetyPolicy) -> Option<BlockReason> {
    let ip = canonical(ip);

    if policy.block_localhost && ip.is_loopback() {
        return Some(BlockReason::Loopback);
    }

    if policy.block_private_networks && is_private(ip) {
        return Some(BlockReason::PrivateNetwork);
    }

    if let Some(range) = policy
        .custom_blocked_ranges
        .iter()
        .find(|range| ip_in_range(ip, range))
    {
        return Some(BlockReason::CustomRange(range.clone()));
    }

    DEFAULT_BLOCKED_RANGES
        .iter()
        .find(|range| ip_in_range(ip, range))
        .map(|range| BlockReason::DefaultRange(*range))
}

pub fn is_address_safe(ip: IpAddr, policy: &AddressSafetyPolicy) -> bool {
    classify_address(ip, policy).is_none()
}

/// Hostnames rejected before any resolution happens.
pub fn is_hostname_blocked(host: &str, policy: &AddressSafetyPolicy) -> bool {
    if !policy.block_localhost {
        return false;
    }
    let host = normalize_host(host);
    host == "localhost" || host.ends_with(".localhost")
}

/// Unwraps IPv4-mapped and IPv4-compatible IPv6 so v4 rules apply to them.
fn canonical(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => ipv4_compatible(v6).map(IpAddr::V4).unwrap_or(ip),
        },
        IpAddr::V4(_) => ip,
    }
}

/// `::a.b.c.d`, excluding `::` and `::1` which keep their IPv6 meaning.
fn ipv4_compatible(ip: Ipv6Addr) -> Option<Ipv4Addr> {
    let segments = ip.segments();
    if segments[..6] != [0, 0, 0, 0, 0, 0] || (segments[6] == 0 && segments[7] <= 1) {
        return None;
    }
    let [a, b] = segments[6].to_be_bytes();
    let [c, d] = segments[7].to_be_bytes();
    Some(Ipv4Addr::new(a, b, c, d))
}

fn is_private(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private(),
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            // fc00::/7 unique local, fe80::/10 link-local
            (first & 0xfe00) == 0xfc00 || (first & 0xffc0) == 0xfe80
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_loopback_blamed_first() {
        let policy = AddressSafetyPolicy::default();
        assert_eq!(classify_address(ip("127.0.0.1"), &policy), Some(BlockReason::Loopback));
        assert_eq!(classify_address(ip("::1"), &policy), Some(BlockReason::Loopback));
    }

    #[test]
    fn test_private_networks() {
        let policy = AddressSafetyPolicy::default();
        for addr in ["10.1.2.3", "172.20.0.1", "192.168.1.1", "fd00::1", "fe80::1"] {
            assert_eq!(
                classify_address(ip(addr), &policy),
                Some(BlockReason::PrivateNetwork),
                "{}",
                addr
            );
        }
    }

    #[test]
    fn test_defaults_apply_when_flags_off() {
        let policy = AddressSafetyPolicy {
            block_localhost: false,
            block_private_networks: false,
            ..AddressSafetyPolicy::default()
        };

        assert_eq!(
            classify_address(ip("127.0.0.1"), &policy),
            Some(BlockReason::DefaultRange("127.0.0.0/8"))
        );
        assert_eq!(
            classify_address(ip("10.0.0.1"), &policy),
            Some(BlockReason::DefaultRange("10.0.0.0/8"))
        );
        assert!(!is_address_safe(ip("224.0.0.251"), &policy));
        assert!(!is_address_safe(ip("ff02::1"), &policy));
        assert!(!is_address_safe(ip("169.254.169.254"), &policy));
    }

    #[test]
    fn test_custom_range_before_defaults() {
        let policy = AddressSafetyPolicy::default()
            .with_custom_blocked_ranges(["garbage", "203.0.113.0/24"]);

        assert_eq!(
            classify_address(ip("203.0.113.9"), &policy),
            Some(BlockReason::CustomRange("203.0.113.0/24".to_string()))
        );
        assert!(is_address_safe(ip("198.51.100.1"), &policy));
    }

    #[test]
    fn test_public_addresses_safe() {
        let policy = AddressSafetyPolicy::default();
        assert!(is_address_safe(ip("93.184.216.34"), &policy));
        assert!(is_address_safe(ip("2001:4860:4860::8888"), &policy));
    }

    #[test]
    fn test_ipv4_mapped_ipv6_uses_v4_rules() {
        let policy = AddressSafetyPolicy::default();
        assert_eq!(
            classify_address(ip("::ffff:127.0.0.1"), &policy),
            Some(BlockReason::Loopback)
        );
        assert_eq!(
            classify_address(ip("::ffff:10.0.0.1"), &policy),
            Some(BlockReason::PrivateNetwork)
        );
        assert!(!is_address_safe(ip("::169.254.169.254"), &policy));
        assert!(is_address_safe(ip("::ffff:93.184.216.34"), &policy));
    }

    #[test]
    fn test_unspecified_blocked() {
        let policy = AddressSafetyPolicy::default();
        assert!(!is_address_safe(ip("0.0.0.0"), &policy));
        assert!(!is_address_safe(ip("::"), &policy));
    }

    #[test]
    fn test_localhost_names() {
        let policy = AddressSafetyPolicy::default();
        assert!(is_hostname_blocked("localhost", &policy));
        assert!(is_hostname_blocked("LOCALHOST.", &policy));
        assert!(is_hostname_blocked("api.localhost", &policy));
        assert!(!is_hostname_blocked("localhost.example.com", &policy));

        let relaxed = AddressSafetyPolicy {
            block_localhost: false,
            ..AddressSafetyPolicy::default()
        };
        assert!(!is_hostname_blocked("localhost", &relaxed));
    }

    #[test]
    fn test_block_reason_display() {
        assert_eq!(
            BlockReason::CustomRange("203.0.113.0/24".to_string()).to_string(),
            "custom blocked range 203.0.113.0/24"
        );
    }
}
