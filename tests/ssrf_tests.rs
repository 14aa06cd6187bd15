mod common;

use async_trait::async_trait;
use gateway_guard::error::{AppError, Result};
use gateway_guard::outbound::GuardedClient;
use gateway_guard::ssrf::{
    is_in_range, AddressSafetyPolicy, BlockReason, HostResolver, UrlRejection, UrlSafetyValidator,
};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

struct SlowResolver(Duration);

#[async_trait]
impl HostResolver for SlowResolver {
    async fn resolve(&self, _host: &str) -> Result<Vec<IpAddr>> {
        tokio::time::sleep(self.0).await;
        Ok(vec![common::ip("93.184.216.34")])
    }
}

struct PanickingResolver;

#[async_trait]
impl HostResolver for PanickingResolver {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>> {
        panic!("resolver exploded on {}", host);
    }
}

#[tokio::test]
async fn test_public_url_is_safe() {
    let validator = common::validator(AddressSafetyPolicy::default());

    assert!(validator.is_url_safe("https://example.com/webhook").await);
    assert!(validator.is_url_safe("http://example.com:8080/path?q=1").await);
    assert!(validator.is_url_safe("https://v6.example/").await);
    assert_eq!(
        validator.check_url("https://example.com").await.unwrap(),
        vec![common::ip("93.184.216.34")]
    );
}

#[tokio::test]
async fn test_non_http_schemes_rejected() {
    let validator = common::validator(AddressSafetyPolicy::default());

    for url in [
        "ftp://example.com/file",
        "file:///etc/passwd",
        "gopher://example.com",
        "javascript:alert(1)",
    ] {
        assert!(!validator.is_url_safe(url).await, "{}", url);
    }
}

#[tokio::test]
async fn test_loopback_literals_rejected() {
    let validator = common::validator(AddressSafetyPolicy::default());

    assert!(!validator.is_url_safe("http://127.0.0.1/").await);
    assert!(!validator.is_url_safe("http://127.8.9.10:3000/").await);
    assert!(!validator.is_url_safe("http://[::1]/").await);
    assert!(!validator.is_url_safe("http://localhost/").await);

    assert_eq!(
        validator.check_url("http://127.0.0.1/").await,
        Err(UrlRejection::UnsafeAddress {
            host: "127.0.0.1".to_string(),
            ip: common::ip("127.0.0.1"),
            reason: BlockReason::Loopback,
        })
    );
}

#[tokio::test]
async fn test_hostname_resolving_to_private_address() {
    let validator = common::validator(AddressSafetyPolicy::default());

    assert!(!validator.is_url_safe("https://internal.corp/api").await);
    assert_eq!(
        validator.check_url("https://internal.corp/api").await,
        Err(UrlRejection::UnsafeAddress {
            host: "internal.corp".to_string(),
            ip: common::ip("10.1.2.3"),
            reason: BlockReason::PrivateNetwork,
        })
    );
}

#[tokio::test]
async fn test_cloud_metadata_blocked() {
    let validator = common::validator(AddressSafetyPolicy::default());

    assert!(!validator.is_url_safe("http://169.254.169.254/latest/meta-data/").await);
    assert!(!validator.is_url_safe("http://metadata.example/").await);
}

#[tokio::test]
async fn test_any_unsafe_answer_rejects_host() {
    let validator = common::validator(AddressSafetyPolicy::default());

    assert!(matches!(
        validator.check_url("https://mixed.example").await,
        Err(UrlRejection::UnsafeAddress { ip, .. }) if ip == common::ip("192.168.1.20")
    ));
}

#[tokio::test]
async fn test_mapped_ipv6_answer_rejected() {
    let validator = common::validator(AddressSafetyPolicy::default());
    assert!(!validator.is_url_safe("https://mapped.example").await);
}

#[tokio::test]
async fn test_allow_list() {
    let policy = AddressSafetyPolicy::default().with_allowed_domains(["partner.com"]);
    let validator = common::validator(policy);

    assert!(validator.is_url_safe("https://api.partner.com/hook").await);
    assert_eq!(
        validator.check_url("https://example.com").await,
        Err(UrlRejection::DisallowedDomain("example.com".to_string()))
    );
    assert!(!validator.is_url_safe("https://partner.com.evil.net").await);
}

#[tokio::test]
async fn test_allow_list_does_not_bypass_address_checks() {
    let policy = AddressSafetyPolicy::default().with_allowed_domains(["corp"]);
    let validator = common::validator(policy);

    assert!(!validator.is_url_safe("https://internal.corp").await);
}

#[tokio::test]
async fn test_disabled_policy_allows_everything() {
    let validator = common::validator(AddressSafetyPolicy::disabled());

    assert!(validator.is_url_safe("http://127.0.0.1/").await);
    assert!(validator.is_url_safe("ftp://internal.corp").await);
    assert!(validator.is_url_safe("not even a url").await);
}

#[tokio::test]
async fn test_relaxed_flags_still_apply_default_ranges() {
    let policy = AddressSafetyPolicy {
        block_private_networks: false,
        block_localhost: false,
        ..AddressSafetyPolicy::default()
    };
    let validator = common::validator(policy);

    assert!(matches!(
        validator.check_url("https://internal.corp").await,
        Err(UrlRejection::UnsafeAddress {
            reason: BlockReason::DefaultRange("10.0.0.0/8"),
            ..
        })
    ));
}

#[tokio::test]
async fn test_custom_blocked_range() {
    let policy = AddressSafetyPolicy::default().with_custom_blocked_ranges(["203.0.113.0/24"]);
    let validator = common::validator(policy);

    assert!(matches!(
        validator.check_url("https://api.partner.com").await,
        Err(UrlRejection::UnsafeAddress {
            reason: BlockReason::CustomRange(_),
            ..
        })
    ));
    assert!(validator.is_url_safe("https://example.com").await);
}

#[tokio::test]
async fn test_dns_timeout_is_unsafe() {
    let validator = UrlSafetyValidator::new(AddressSafetyPolicy::default())
        .with_resolver(Arc::new(SlowResolver(Duration::from_secs(10))))
        .with_dns_timeout(Duration::from_millis(100));

    let started = std::time::Instant::now();
    assert!(!validator.is_url_safe("https://slow.example").await);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_resolver_panic_is_unsafe() {
    let validator = UrlSafetyValidator::new(AddressSafetyPolicy::default())
        .with_resolver(Arc::new(PanickingResolver));

    assert!(!validator.is_url_safe("https://boom.example").await);
    // The validator stays usable afterwards.
    assert!(!validator.is_url_safe("https://boom.example").await);
}

#[tokio::test]
async fn test_guarded_client_blocks_before_sending() {
    let validator = Arc::new(common::validator(AddressSafetyPolicy::default()));
    let client = GuardedClient::new(validator).unwrap();

    let err = client.get("https://internal.corp/admin").await.unwrap_err();
    match err {
        AppError::UnsafeUrl { url, reason } => {
            assert_eq!(url, "https://internal.corp/admin");
            assert!(reason.contains("10.1.2.3"));
        }
        other => panic!("expected UnsafeUrl, got {:?}", other),
    }
}

#[test]
fn test_cidr_membership() {
    assert!(is_in_range("10.1.2.3", "10.0.0.0/8"));
    assert!(!is_in_range("11.0.0.1", "10.0.0.0/8"));
    assert!(is_in_range("2001:db8::1", "2001:db8::/32"));
    assert!(!is_in_range("10.0.0.1", "2001:db8::/32"));
    assert!(!is_in_range("not-an-ip", "10.0.0.0/8"));
    assert!(!is_in_range("10.0.0.1", "10.0.0.0/33"));
}
