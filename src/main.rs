use gateway_guard::config::{LedgerBackend, Settings};
use gateway_guard::idempotency::{
    IdempotencyCleanupJob, IdempotencyLedger, PostgresIdempotencyStore, RedisIdempotencyStore,
    StorageKeyLock,
};
use gateway_guard::observability::{init_logging, init_metrics, LogConfig};
use gateway_guard::outbound::GuardedClient;
use gateway_guard::ssrf::UrlSafetyValidator;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    // Load configuration
    let settings = Settings::new()?;

    init_logging(&LogConfig::new(
        settings.application.log_level.clone(),
        &settings.application.log_format,
    ));
    info!("Configuration loaded for {}", settings.application.name);

    if let Err(e) = init_metrics() {
        warn!("Metrics exporter unavailable: {}", e);
    }

    let ledger_config = settings.idempotency.ledger_config();
    let ledger = match settings.idempotency.backend {
        LedgerBackend::Memory => {
            info!("Using in-memory idempotency ledger");
            IdempotencyLedger::in_memory(ledger_config)
        }
        LedgerBackend::Postgres => {
            let database = settings
                .database
                .as_ref()
                .ok_or("postgres backend requires a [database] section")?;

            info!("Connecting to database...");
            let pool = PgPoolOptions::new()
                .max_connections(database.pool_size)
                .acquire_timeout(Duration::from_secs(5))
                .connect(&database.url)
                .await?;

            let store = PostgresIdempotencyStore::new(pool);
            info!("Running database migrations...");
            store.migrate().await?;
            info!("Migrations applied successfully");

            IdempotencyLedger::new(Arc::new(store), Arc::new(StorageKeyLock), ledger_config)
        }
        LedgerBackend::Redis => {
            let redis_settings = settings
                .redis
                .as_ref()
                .ok_or("redis backend requires a [redis] section")?;

            info!("Connecting to Redis...");
            let client = redis::Client::open(redis_settings.url.as_str())?;
            let mut con = client.get_multiplexed_async_connection().await?;
            let _: () = redis::cmd("PING").query_async(&mut con).await?;
            info!("Redis connection established");

            let store = RedisIdempotencyStore::new(client, settings.idempotency.key_prefix.clone());
            IdempotencyLedger::new(Arc::new(store), Arc::new(StorageKeyLock), ledger_config)
        }
    };
    let ledger = Arc::new(ledger);

    let validator = Arc::new(
        UrlSafetyValidator::new(settings.ssrf.policy()).with_dns_timeout(settings.ssrf.dns_timeout()),
    );
    if !validator.policy().enabled {
        warn!("Outbound URL safety checks are disabled");
    }
    let _client = GuardedClient::new(Arc::clone(&validator))?;

    let cleanup = IdempotencyCleanupJob::new(Arc::clone(&ledger), settings.idempotency.cleanup_interval())
        .start();

    info!(
        backend = ledger.backend_name(),
        ttl_seconds = settings.idempotency.ttl_seconds,
        "Gateway guard ready"
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    cleanup.abort();

    Ok(())
}
