//! Periodic background maintenance

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::reconcile::ReconciliationEngine;

/// Interval between maintenance passes.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(3600);

/// Retry delay after a pass that hit errors.
const RETRY_INTERVAL: Duration = Duration::from_secs(60);

/// Hourly driver for reconciliation and retention.
pub struct MaintenanceLoop {
    engine: Arc<ReconciliationEngine>,
    shutdown: CancellationToken,
}

impl MaintenanceLoop {
    pub fn new(engine: Arc<ReconciliationEngine>) -> Self {
        Self {
            engine,
            shutdown: CancellationToken::new(),
        }
    }

    /// Launch the background task. Stops when [`Self::stop`] is called.
    pub fn start(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.run().await;
        });
        info!(
            interval_s = MAINTENANCE_INTERVAL.as_secs(),
            "Maintenance loop started"
        );
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    async fn run(&self) {
        loop {
            let stats = self.engine.reconcile().await;

            // A pass with per-item errors retries sooner; a clean pass
            // waits the full interval.
            let delay = if stats.errors > 0 {
                warn!(errors = stats.errors, "maintenance pass had errors, retrying sooner");
                RETRY_INTERVAL
            } else {
                MAINTENANCE_INTERVAL
            };

            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    debug!("maintenance loop stopped");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
