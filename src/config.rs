use crate::error::{AppError, Result};
use crate::idempotency::LedgerConfig;
use crate::ssrf::AddressSafetyPolicy;
use serde::Deserialize;
use std::time::Duration;
use validator::Validate;

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct Settings {
    #[validate]
    pub application: ApplicationSettings,
    #[validate]
    pub idempotency: IdempotencySettings,
    #[validate]
    pub ssrf: SsrfSettings,
    pub redis: Option<RedisSettings>,
    #[validate]
    pub database: Option<DatabaseSettings>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ApplicationSettings {
    #[validate(length(min = 1))]
    pub name: String,
    pub log_level: String,
    pub log_format: String,
}

/// Which storage backs the idempotency ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerBackend {
    Memory,
    Redis,
    Postgres,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct IdempotencySettings {
    pub backend: LedgerBackend,
    #[validate(range(min = 1, max = 604800))]
    pub ttl_seconds: u64,
    #[validate(length(min = 1, max = 32))]
    pub key_prefix: String,
    #[validate(range(min = 1))]
    pub cleanup_interval_seconds: u64,
    #[validate(range(min = 1, max = 255))]
    pub max_key_length: usize,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct SsrfSettings {
    pub enabled: bool,
    #[serde(default)]
    pub allowed_domains: Vec<String>,
    pub block_private_networks: bool,
    pub block_localhost: bool,
    #[serde(default)]
    pub custom_blocked_ranges: Vec<String>,
    #[validate(range(min = 100, max = 60000))]
    pub dns_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisSettings {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct DatabaseSettings {
    pub url: String,
    #[validate(range(min = 1, max = 100))]
    pub pool_size: u32,
}

impl Settings {
    pub fn new() -> Result<Self> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name("config/default"))
            .add_source(config::File::with_name("config/local").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("ssrf.allowed_domains")
                    .with_list_parse_key("ssrf.custom_blocked_ranges")
                    .try_parsing(true),
            );

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.check()?;
        Ok(settings)
    }

    /// Runs field validation plus cross-section checks.
    pub fn check(&self) -> Result<()> {
        self.validate()
            .map_err(|e| AppError::Validation(format!("Invalid settings: {}", e)))?;

        match self.idempotency.backend {
            LedgerBackend::Redis if self.redis.is_none() => Err(AppError::Validation(
                "idempotency backend 'redis' requires a [redis] section".to_string(),
            )),
            LedgerBackend::Postgres if self.database.is_none() => Err(AppError::Validation(
                "idempotency backend 'postgres' requires a [database] section".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

impl IdempotencySettings {
    pub fn ledger_config(&self) -> LedgerConfig {
        LedgerConfig {
            ttl: Duration::from_secs(self.ttl_seconds),
            max_key_length: self.max_key_length,
        }
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_seconds)
    }
}

impl SsrfSettings {
    pub fn policy(&self) -> AddressSafetyPolicy {
        AddressSafetyPolicy {
            enabled: self.enabled,
            allowed_domains: self.allowed_domains.clone(),
            block_private_networks: self.block_private_networks,
            block_localhost: self.block_localhost,
            custom_blocked_ranges: self.custom_blocked_ranges.clone(),
        }
    }

    pub fn dns_timeout(&self) -> Duration {
        Duration::from_millis(self.dns_timeout_ms)
    }
}
