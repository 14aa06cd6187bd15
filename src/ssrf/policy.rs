use crate::ssrf::cidr::CidrRange;
use serde::{Deserialize, Serialize};

/// Ranges blocked regardless of policy flags.
pub const DEFAULT_BLOCKED_RANGES: &[&str] = &[
    "0.0.0.0/8",          // "this network"
    "10.0.0.0/8",         // RFC1918
    "127.0.0.0/8",        // loopback
    "169.254.0.0/16",     // link-local, cloud metadata
    "172.16.0.0/12",      // RFC1918
    "192.168.0.0/16",     // RFC1918
    "224.0.0.0/4",        // multicast
    "255.255.255.255/32", // broadcast
    "::/128",             // unspecified
    "::1/128",            // loopback
    "fc00::/7",           // unique local
    "fe80::/10",          // link-local
    "ff00::/8",           // multicast
];

/// Outbound address policy, loaded once and shared read-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AddressSafetyPolicy {
    pub enabled: bool,
    /// Domain suffixes; when non-empty only matching hosts pass.
    pub allowed_domains: Vec<String>,
    pub block_private_networks: bool,
    pub block_localhost: bool,
    pub custom_blocked_ranges: Vec<String>,
}

impl Default for AddressSafetyPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            allowed_domains: Vec::new(),
            block_private_networks: true,
            block_localhost: true,
            custom_blocked_ranges: Vec::new(),
        }
    }
}

impl AddressSafetyPolicy {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn with_allowed_domains<I, S>(mut self, domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_domains = domains.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_custom_blocked_ranges<I, S>(mut self, ranges: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.custom_blocked_ranges = ranges.into_iter().map(Into::into).collect();
        self
    }

    /// Custom ranges that will never match anything because they do not parse.
    pub fn invalid_custom_ranges(&self) -> Vec<&str> {
        self.custom_blocked_ranges
            .iter()
            .filter(|r| CidrRange::parse(r).is_none())
            .map(String::as_str)
            .collect()
    }

    /// Allow-list check with dot-boundary suffix matching.
    ///
    /// An empty allow-list admits every host.
    pub fn allows_domain(&self, host: &str) -> bool {
        if self.allowed_domains.is_empty() {
            return true;
        }

        let host = normalize_host(host);
        if host.is_empty() {
            return false;
        }

        self.allowed_domains.iter().any(|domain| {
            let domain = normalize_host(domain.trim_start_matches('.'));
            !domain.is_empty()
                && (host == domain
                    || host
                        .strip_suffix(domain.as_str())
                        .is_some_and(|rest| rest.ends_with('.')))
        })
    }
}

/// Lowercases and strips the FQDN trailing dot.
pub fn normalize_host(host: &str) -> String {
    host.trim().trim_end_matches('.').to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_blocks() {
        let policy = AddressSafetyPolicy::default();
        assert!(policy.enabled);
        assert!(policy.block_localhost);
        assert!(policy.block_private_networks);
        assert!(policy.allowed_domains.is_empty());
    }

    #[test]
    fn test_default_ranges_all_parse() {
        for range in DEFAULT_BLOCKED_RANGES {
            assert!(CidrRange::parse(range).is_some(), "{} should parse", range);
        }
    }

    #[test]
    fn test_allowed_domain_suffix_respects_dot_boundary() {
        let policy = AddressSafetyPolicy::default().with_allowed_domains(["partner.com"]);

        assert!(policy.allows_domain("partner.com"));
        assert!(policy.allows_domain("api.partner.com"));
        assert!(policy.allows_domain("API.Partner.COM."));
        assert!(!policy.allows_domain("partner.com.evil.net"));
        assert!(!policy.allows_domain("evilpartner.com"));
        assert!(!policy.allows_domain(""));
    }

    #[test]
    fn test_leading_dot_entries() {
        let policy = AddressSafetyPolicy::default().with_allowed_domains([".partner.com"]);
        assert!(policy.allows_domain("partner.com"));
        assert!(policy.allows_domain("x.partner.com"));
    }

    #[test]
    fn test_empty_allow_list_admits_all() {
        assert!(AddressSafetyPolicy::default().allows_domain("anything.example"));
    }

    #[test]
    fn test_invalid_custom_ranges_reported() {
        let policy = AddressSafetyPolicy::default()
            .with_custom_blocked_ranges(["203.0.113.0/24", "garbage", "10.0.0.0/40"]);
        assert_eq!(policy.invalid_custom_ranges(), vec!["garbage", "10.0.0.0/40"]);
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let policy: AddressSafetyPolicy =
            serde_json::from_str(r#"{"allowed_domains": ["partner.com"]}"#).unwrap();
        assert!(policy.enabled);
        assert_eq!(policy.allowed_domains, vec!["partner.com".to_string()]);
    }
}
