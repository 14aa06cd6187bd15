//! HTTP client that only talks to addresses the URL validator approved.

use crate::error::{AppError, Result};
use crate::ssrf::UrlSafetyValidator;
use reqwest::redirect::Policy as RedirectPolicy;
use reqwest::{Client, Response};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

const MAX_REDIRECTS: usize = 10;
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Outbound GET client guarded by a [`UrlSafetyValidator`].
///
/// Redirects are never followed by reqwest itself: each hop is re-validated,
/// and the connection is pinned to the address that passed validation so a
/// second DNS answer cannot swap it for an internal one.
#[derive(Clone)]
pub struct GuardedClient {
    validator: Arc<UrlSafetyValidator>,
    request_timeout: Duration,
    /// Used when the policy is disabled and there is nothing to pin.
    passthrough: Client,
}

impl GuardedClient {
    pub fn new(validator: Arc<UrlSafetyValidator>) -> Result<Self> {
        Self::with_timeout(validator, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(validator: Arc<UrlSafetyValidator>, request_timeout: Duration) -> Result<Self> {
        let passthrough = Client::builder()
            .redirect(RedirectPolicy::none())
            .timeout(request_timeout)
            .build()?;

        Ok(Self {
            validator,
            request_timeout,
            passthrough,
        })
    }

    pub fn validator(&self) -> &UrlSafetyValidator {
        &self.validator
    }

    /// Fetches `url`, validating the URL and every redirect hop.
    pub async fn get(&self, url: &str) -> Result<Response> {
        let mut current = url.to_string();

        for _ in 0..=MAX_REDIRECTS {
            let response = self.get_once(&current).await?;

            if !response.status().is_redirection() {
                return Ok(response);
            }

            let location = response
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|value| value.to_str().ok())
                .ok_or_else(|| AppError::UnsafeUrl {
                    url: current.clone(),
                    reason: "redirect without a Location header".to_string(),
                })?;

            let next = Url::parse(&current)
                .and_then(|base| base.join(location))
                .map_err(|e| AppError::UnsafeUrl {
                    url: location.to_string(),
                    reason: format!("invalid redirect target: {}", e),
                })?;

            debug!(from = %current, to = %next, "Following redirect");
            current = next.to_string();
        }

        Err(AppError::UnsafeUrl {
            url: url.to_string(),
            reason: format!("more than {} redirects", MAX_REDIRECTS),
        })
    }

    async fn get_once(&self, url: &str) -> Result<Response> {
        let addrs = self.validator.check_url(url).await.map_err(|rejection| {
            warn!(url, reason = %rejection, "Blocked outbound request");
            AppError::UnsafeUrl {
                url: url.to_string(),
                reason: rejection.to_string(),
            }
        })?;

        let client = match pinned_target(url, &addrs) {
            Some((host, addr)) => Client::builder()
                .redirect(RedirectPolicy::none())
                .timeout(self.request_timeout)
                .resolve(&host, addr)
                .build()?,
            None => self.passthrough.clone(),
        };

        Ok(client.get(url).send().await?)
    }
}

/// Host and socket address to pin the connection to, for domain hosts only.
fn pinned_target(url: &str, addrs: &[IpAddr]) -> Option<(String, SocketAddr)> {
    let ip = *addrs.first()?;
    let parsed = Url::parse(url).ok()?;
    let host = parsed.domain()?.to_string();
    let port = parsed.port_or_known_default()?;
    Some((host, SocketAddr::new(ip, port)))
}
