//! Outbound URL validation with DNS resolution.

use crate::observability::{get_metrics, LatencyTimer};
use crate::ssrf::classifier::{classify_address, is_hostname_blocked, BlockReason};
use crate::ssrf::policy::AddressSafetyPolicy;
use crate::ssrf::resolver::{HostResolver, SystemResolver};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::{Host, Url};

/// Why a URL was judged unsafe.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UrlRejection {
    #[error("empty URL")]
    Empty,

    #[error("malformed URL: {0}")]
    Malformed(String),

    #[error("scheme '{0}' is not allowed, only http/https")]
    DisallowedScheme(String),

    #[error("URL has no host")]
    MissingHost,

    #[error("host '{0}' is not in the allowed domains")]
    DisallowedDomain(String),

    #[error("host '{0}' is blocked")]
    BlockedHostname(String),

    #[error("could not resolve '{host}': {reason}")]
    ResolutionFailed { host: String, reason: String },

    #[error("resolving '{0}' timed out")]
    ResolutionTimeout(String),

    #[error("'{0}' resolved to no addresses")]
    NoAddresses(String),

    #[error("'{host}' resolves to {ip} ({reason})")]
    UnsafeAddress {
        host: String,
        ip: IpAddr,
        reason: BlockReason,
    },

    #[error("internal validation failure: {0}")]
    Internal(String),
}

impl UrlRejection {
    /// Metric label for the rejection kind.
    pub fn label(&self) -> &'static str {
        match self {
            UrlRejection::Empty => "empty",
            UrlRejection::Malformed(_) | UrlRejection::MissingHost => "bad_format",
            UrlRejection::DisallowedScheme(_) => "disallowed_scheme",
            UrlRejection::DisallowedDomain(_) => "disallowed_domain",
            UrlRejection::BlockedHostname(_) => "blocked_hostname",
            UrlRejection::ResolutionFailed { .. }
            | UrlRejection::ResolutionTimeout(_)
            | UrlRejection::NoAddresses(_) => "resolution_failure",
            UrlRejection::UnsafeAddress { .. } => "unsafe_address",
            UrlRejection::Internal(_) => "internal",
        }
    }
}

/// Aborts the wrapped task when dropped, so a cancelled or timed-out
/// check does not leave a lookup running.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Guards outbound requests against server-side request forgery.
pub struct UrlSafetyValidator {
    policy: Arc<AddressSafetyPolicy>,
    resolver: Arc<dyn HostResolver>,
    dns_timeout: Duration,
}

impl UrlSafetyValidator {
    pub const DEFAULT_DNS_TIMEOUT: Duration = Duration::from_secs(5);

    pub fn new(policy: AddressSafetyPolicy) -> Self {
        let invalid = policy.invalid_custom_ranges();
        if !invalid.is_empty() {
            warn!(ranges = ?invalid, "Ignoring malformed custom blocked ranges");
        }

        Self {
            policy: Arc::new(policy),
            resolver: Arc::new(SystemResolver),
            dns_timeout: Self::DEFAULT_DNS_TIMEOUT,
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn HostResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_dns_timeout(mut self, dns_timeout: Duration) -> Self {
        self.dns_timeout = dns_timeout;
        self
    }

    pub fn policy(&self) -> &AddressSafetyPolicy {
        &self.policy
    }

    /// Whether `url` may be fetched. Never fails: every doubt is "unsafe".
    pub async fn is_url_safe(&self, url: &str) -> bool {
        if !self.policy.enabled {
            debug!("URL safety policy disabled, allowing {}", url);
            get_metrics().record_url_check("disabled");
            return true;
        }

        match self.check_url(url).await {
            Ok(addrs) => {
                debug!(url, addresses = ?addrs, "Outbound URL allowed");
                get_metrics().record_url_check("safe");
                true
            }
            Err(rejection) => {
                warn!(url, reason = %rejection, "Rejected outbound URL");
                get_metrics().record_url_check(rejection.label());
                false
            }
        }
    }

    /// Runs every check and returns the vetted addresses, or why `url` is unsafe.
    ///
    /// With the policy disabled this returns an empty address list.
    pub async fn check_url(&self, url: &str) -> Result<Vec<IpAddr>, UrlRejection> {
        if !self.policy.enabled {
            return Ok(Vec::new());
        }

        let url = url.trim();
        if url.is_empty() {
            return Err(UrlRejection::Empty);
        }

        let parsed = Url::parse(url).map_err(|e| UrlRejection::Malformed(e.to_string()))?;

        match parsed.scheme() {
            "http" | "https" => {}
            other => return Err(UrlRejection::DisallowedScheme(other.to_string())),
        }

        let host = parsed.host().ok_or(UrlRejection::MissingHost)?;
        let host_name = match &host {
            Host::Domain(domain) => domain.to_string(),
            Host::Ipv4(ip) => ip.to_string(),
            Host::Ipv6(ip) => ip.to_string(),
        };

        if !self.policy.allows_domain(&host_name) {
            return Err(UrlRejection::DisallowedDomain(host_name));
        }

        if is_hostname_blocked(&host_name, &self.policy) {
            return Err(UrlRejection::BlockedHostname(host_name));
        }

        let addrs = match host {
            Host::Ipv4(ip) => vec![IpAddr::V4(ip)],
            Host::Ipv6(ip) => vec![IpAddr::V6(ip)],
            Host::Domain(domain) => self.resolve_bounded(domain).await?,
        };

        if addrs.is_empty() {
            return Err(UrlRejection::NoAddresses(host_name));
        }

        // One bad answer poisons the whole set.
        for ip in &addrs {
            if let Some(reason) = classify_address(*ip, &self.policy) {
                return Err(UrlRejection::UnsafeAddress {
                    host: host_name,
                    ip: *ip,
                    reason,
                });
            }
        }

        Ok(addrs)
    }

    async fn resolve_bounded(&self, host: &str) -> Result<Vec<IpAddr>, UrlRejection> {
        let resolver = Arc::clone(&self.resolver);
        let owned_host = host.to_string();
        let timer = LatencyTimer::new();

        // A separate task contains resolver panics.
        let mut task = AbortOnDrop(tokio::spawn(async move {
            resolver.resolve(&owned_host).await
        }));

        let outcome = tokio::time::timeout(self.dns_timeout, &mut task.0).await;
        let result = match outcome {
            Err(_) => Err(UrlRejection::ResolutionTimeout(host.to_string())),
            Ok(Err(join_error)) => Err(UrlRejection::Internal(format!(
                "resolver task failed for {}: {}",
                host, join_error
            ))),
            Ok(Ok(Err(e))) => Err(UrlRejection::ResolutionFailed {
                host: host.to_string(),
                reason: e.to_string(),
            }),
            Ok(Ok(Ok(addrs))) => Ok(addrs),
        };

        get_metrics().record_dns_latency(timer.elapsed_ms(), result.is_ok());
        result
    }
}
