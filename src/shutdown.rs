//! Graceful shutdown
//!
//! Stops accepting work, drains in-flight execs up to the configured grace
//! window, stops running transient containers, leaves persistent ones
//! running, and flushes the store.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::audit::{self, AuditEvent};
use crate::containers::ContainerManager;
use crate::database::{ContainerStatus, Database};
use crate::exec::ExecManager;

/// Stop timeout handed to each transient container during shutdown.
const STOP_TIMEOUT_S: i64 = 10;

pub struct ShutdownCoordinator {
    db: Arc<Database>,
    containers: Arc<ContainerManager>,
    execs: Arc<ExecManager>,
    grace: Duration,
    stopping: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new(
        db: Arc<Database>,
        containers: Arc<ContainerManager>,
        execs: Arc<ExecManager>,
        grace_s: u64,
    ) -> Self {
        Self {
            db,
            containers,
            execs,
            grace: Duration::from_secs(grace_s),
            stopping: CancellationToken::new(),
        }
    }

    /// Token the transport layer watches to stop accepting operations.
    pub fn stopping_token(&self) -> CancellationToken {
        self.stopping.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.stopping.is_cancelled()
    }

    /// Run the full shutdown sequence. Idempotent.
    pub async fn shutdown(&self) {
        if self.stopping.is_cancelled() {
            warn!("shutdown already initiated");
            return;
        }

        info!("Initiating graceful shutdown");
        self.stopping.cancel();
        audit::record(AuditEvent::SystemShutdown, None, json!({}));

        self.drain_execs().await;
        self.stop_transients().await;

        if let Err(e) = self.db.checkpoint().await {
            warn!("failed to flush store during shutdown: {}", e);
        }

        info!("Graceful shutdown completed");
    }

    /// Wait for in-flight execs to finish, bounded by the grace window.
    async fn drain_execs(&self) {
        let deadline = Instant::now() + self.grace;
        let initial = self.execs.in_flight();
        if initial == 0 {
            return;
        }

        info!(in_flight = initial, grace_s = self.grace.as_secs(), "draining execs");

        while self.execs.in_flight() > 0 {
            if Instant::now() >= deadline {
                warn!(
                    remaining = self.execs.in_flight(),
                    "drain grace expired, continuing shutdown"
                );
                return;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }

        info!("all execs drained");
    }

    /// Stop running transient containers with a short timeout. Persistent
    /// containers are deliberately left running.
    async fn stop_transients(&self) {
        let transients = {
            let conn = self.db.conn().await;
            self.db
                .containers
                .list_by_status(&conn, ContainerStatus::Running, Some(false))
                .unwrap_or_default()
        };

        let mut stopped = 0usize;
        for container in transients {
            match self.containers.stop(&container.id, STOP_TIMEOUT_S).await {
                Ok(()) => stopped += 1,
                Err(e) => {
                    warn!(container_id = %container.id, "failed to stop transient: {}", e);
                }
            }
        }

        info!(stopped, "transient containers stopped");
    }
}
