use crate::error::Result;
use crate::idempotency::ledger::IdempotencyLedger;
use std::sync::Arc;
use std::time::Duration;

/// Background sweep of expired idempotency records.
///
/// Expiry is already enforced on read; this only bounds storage growth.
pub struct IdempotencyCleanupJob {
    ledger: Arc<IdempotencyLedger>,
    interval: Duration,
}

impl IdempotencyCleanupJob {
    pub fn new(ledger: Arc<IdempotencyLedger>, interval: Duration) -> Self {
        Self { ledger, interval }
    }

    /// Runs the cleanup job once.
    pub async fn run_once(&self) -> Result<u64> {
        self.ledger.purge_expired().await
    }

    /// Starts the cleanup job in a background task.
    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                interval.tick().await;

                match self.ledger.purge_expired().await {
                    Ok(count) => {
                        if count > 0 {
                            tracing::info!("Cleaned up {} expired idempotency records", count);
                        }
                    }
                    Err(e) => {
                        tracing::error!("Failed to cleanup expired idempotency records: {}", e);
                    }
                }
            }
        })
    }
}
