use crate::error::{AppError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::IpAddr;

/// Hostname to address resolution used by the URL validator.
#[async_trait]
pub trait HostResolver: Send + Sync {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>>;
}

/// Resolves through the operating system via tokio's `lookup_host`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

#[async_trait]
impl HostResolver for SystemResolver {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>> {
        // lookup_host wants a socket address; the port is irrelevant here.
        let addrs = tokio::net::lookup_host((host, 0u16)).await.map_err(|e| {
            AppError::Internal(anyhow::anyhow!("DNS resolution failed for {}: {}", host, e))
        })?;

        let mut ips: Vec<IpAddr> = addrs.map(|addr| addr.ip()).collect();
        ips.sort();
        ips.dedup();
        Ok(ips)
    }
}

/// Fixed host table, for pinned upstreams and tests.
#[derive(Debug, Default, Clone)]
pub struct StaticResolver {
    entries: HashMap<String, Vec<IpAddr>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host<I>(mut self, host: &str, addrs: I) -> Self
    where
        I: IntoIterator<Item = IpAddr>,
    {
        self.entries
            .insert(host.to_ascii_lowercase(), addrs.into_iter().collect());
        self
    }
}

#[async_trait]
impl HostResolver for StaticResolver {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>> {
        self.entries
            .get(&host.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| AppError::Internal(anyhow::anyhow!("No addresses known for {}", host)))
    }
}
