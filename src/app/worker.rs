//! Background sweep for transactions webhooks missed.
//!
//! Webhooks get lost: networks flake, the service restarts mid-request, the
//! gateway gives up redelivering. The sweep periodically re-reconciles what
//! is left behind: stale `pending` rows are verified one last time and
//! expired, and `paid` / `delivery_failed` rows get their side effect
//! retried.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use super::engine::ReconciliationEngine;

/// Sweep configuration
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// Interval between sweep cycles
    pub poll_interval: Duration,
    /// Rows processed per cycle, per pass
    pub batch_size: i64,
    pub enabled: bool,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(300),
            batch_size: 50,
            enabled: true,
        }
    }
}

/// Periodically expires stale transactions and re-triggers undelivered
/// side effects
pub struct ReconciliationSweeper {
    engine: Arc<ReconciliationEngine>,
    config: SweeperConfig,
}

impl ReconciliationSweeper {
    #[must_use]
    pub fn new(engine: Arc<ReconciliationEngine>, config: SweeperConfig) -> Self {
        Self { engine, config }
    }

    /// Run the sweep loop until the shutdown signal flips
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        if !self.config.enabled {
            info!("Reconciliation sweep disabled");
            return;
        }

        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            batch_size = self.config.batch_size,
            "Reconciliation sweep started"
        );

        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.run_cycle().await;
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Reconciliation sweep shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One sweep cycle: the expiry pass, then the re-delivery pass
    async fn run_cycle(&self) {
        match self.engine.expire_stale(self.config.batch_size).await {
            Ok(0) => {}
            Ok(expired) => info!(expired, "Expiry pass completed"),
            Err(e) => error!(error = %e, "Expiry pass failed"),
        }

        match self
            .engine
            .redeliver_pending_effects(self.config.batch_size)
            .await
        {
            Ok(0) => {}
            Ok(retried) => info!(retried, "Re-delivery pass completed"),
            Err(e) => error!(error = %e, "Re-delivery pass failed"),
        }
    }
}

/// Spawn the sweep on the runtime. Returns the join handle and a shutdown
/// sender; send `true` to stop the loop.
pub fn spawn_sweeper(
    engine: Arc<ReconciliationEngine>,
    config: SweeperConfig,
) -> (JoinHandle<()>, watch::Sender<bool>) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = ReconciliationSweeper::new(engine, config);
    let handle = tokio::spawn(sweeper.run(shutdown_rx));
    (handle, shutdown_tx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sweeper_config_default() {
        let config = SweeperConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(300));
        assert_eq!(config.batch_size, 50);
        assert!(config.enabled);
    }
}
