//! Reconciliation between the state store and the Docker engine
//!
//! Runs at boot, on demand, and hourly from the maintenance loop. Every
//! step is per-item fault isolated: an error is logged, counted and the
//! engine moves to the next item.

use std::collections::HashMap;
use std::sync::Arc;

use bollard::models::ContainerSummary;
use chrono::{Duration, Utc};
use serde_json::json;
use tracing::{info, warn};

use crate::audit::{self, AuditEvent};
use crate::database::{ContainerRecord, ContainerStatus, Database};
use crate::docker::{DockerService, ALIAS_LABEL, CONTAINER_ID_LABEL, WORKSPACE_DIR};
use crate::error::Result;
use crate::exec::ExecManager;

/// Hours completed execs are retained before garbage collection.
pub const EXEC_RETENTION_HOURS: i64 = 24;

/// Counters reported by one reconciliation pass.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ReconcileStats {
    pub discovered: usize,
    pub adopted: usize,
    pub marked_stopped: usize,
    pub gc_transients: usize,
    pub synced: usize,
    pub execs_cleaned: usize,
    pub errors: usize,
}

pub struct ReconciliationEngine {
    docker: DockerService,
    db: Arc<Database>,
    execs: Arc<ExecManager>,
    transient_gc_days: i64,
}

impl ReconciliationEngine {
    pub fn new(
        docker: DockerService,
        db: Arc<Database>,
        execs: Arc<ExecManager>,
        transient_gc_days: i64,
    ) -> Self {
        Self {
            docker,
            db,
            execs,
            transient_gc_days,
        }
    }

    /// Align the store with the engine and collect garbage.
    pub async fn reconcile(&self) -> ReconcileStats {
        info!("Starting reconciliation");
        let mut stats = ReconcileStats::default();

        let discovered = match self.docker.list_managed_containers().await {
            Ok(containers) => containers,
            Err(e) => {
                warn!("failed to list managed containers: {}", e);
                stats.errors += 1;
                Vec::new()
            }
        };
        stats.discovered = discovered.len();

        let known_rows = {
            let conn = self.db.conn().await;
            self.db.containers.list(&conn, true).unwrap_or_default()
        };
        let known_docker_ids: std::collections::HashSet<String> =
            known_rows.iter().map(|r| r.docker_id.clone()).collect();

        // Engine-side view keyed by docker id, for status sync.
        let mut engine_state: HashMap<String, String> = HashMap::new();
        for summary in &discovered {
            if let (Some(id), Some(state)) = (&summary.id, &summary.state) {
                engine_state.insert(id.clone(), state.clone());
            }
        }

        // Adopt runtime containers the store has never seen.
        for summary in &discovered {
            let docker_id = match &summary.id {
                Some(id) => id.clone(),
                None => continue,
            };
            if known_docker_ids.contains(&docker_id) {
                continue;
            }

            match self.adopt(summary, &docker_id).await {
                Ok(true) => stats.adopted += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(docker_id, "failed to adopt container: {}", e);
                    stats.errors += 1;
                }
            }
        }

        // Rows whose runtime container vanished are marked stopped.
        for row in &known_rows {
            if engine_state.contains_key(&row.docker_id) {
                continue;
            }
            if row.status != ContainerStatus::Stopped {
                let conn = self.db.conn().await;
                match self
                    .db
                    .containers
                    .update_status(&conn, &row.id, ContainerStatus::Stopped)
                {
                    Ok(()) => {
                        info!(container_id = %row.id, "runtime container missing, marked stopped");
                        stats.marked_stopped += 1;
                    }
                    Err(e) => {
                        warn!(container_id = %row.id, "failed to mark stopped: {}", e);
                        stats.errors += 1;
                    }
                }
            }
        }

        stats.gc_transients = self.gc_old_transients(&mut stats).await;

        // Sync status for containers present on both sides.
        for row in &known_rows {
            let Some(state) = engine_state.get(&row.docker_id) else {
                continue;
            };
            let refreshed = match state.as_str() {
                "running" => ContainerStatus::Running,
                _ => ContainerStatus::Stopped,
            };

            let conn = self.db.conn().await;
            let result = if refreshed != row.status {
                self.db.containers.update_status(&conn, &row.id, refreshed)
            } else {
                self.db.containers.update_last_seen(&conn, &row.id)
            };
            match result {
                Ok(()) => stats.synced += 1,
                Err(e) => {
                    warn!(container_id = %row.id, "failed to sync status: {}", e);
                    stats.errors += 1;
                }
            }
        }

        // Exec retention, buffer cleanup and idempotency expiry.
        match self.execs.cleanup_older_than(EXEC_RETENTION_HOURS).await {
            Ok(count) => stats.execs_cleaned = count,
            Err(e) => {
                warn!("exec retention failed: {}", e);
                stats.errors += 1;
            }
        }
        self.execs
            .streamer()
            .cleanup_completed_older_than(EXEC_RETENTION_HOURS * 3600);

        if let Err(e) = self.db.vacuum().await {
            warn!("vacuum failed: {}", e);
            stats.errors += 1;
        }

        audit::record(
            AuditEvent::SystemReconcile,
            None,
            json!({
                "discovered": stats.discovered,
                "adopted": stats.adopted,
                "marked_stopped": stats.marked_stopped,
                "gc_transients": stats.gc_transients,
            }),
        );
        info!(?stats, "Reconciliation completed");
        stats
    }

    /// Insert a store row for a runtime-only container. Returns false when
    /// the container carries no usable identity label.
    async fn adopt(&self, summary: &ContainerSummary, docker_id: &str) -> Result<bool> {
        let labels = summary.labels.clone().unwrap_or_default();

        let Some(container_id) = labels.get(CONTAINER_ID_LABEL).cloned() else {
            warn!(docker_id, "managed container missing the container-id label");
            return Ok(false);
        };
        let alias = labels.get(ALIAS_LABEL).cloned();

        let mut volume_name = None;
        for mount in summary.mounts.clone().unwrap_or_default() {
            if mount.destination.as_deref() == Some(WORKSPACE_DIR) {
                volume_name = mount.name;
                break;
            }
        }
        let persistent = volume_name
            .as_deref()
            .map(|name| name.starts_with("persist_"))
            .unwrap_or(false);

        let status = match summary.state.as_deref() {
            Some("running") => ContainerStatus::Running,
            Some(_) => ContainerStatus::Stopped,
            None => ContainerStatus::Error,
        };

        let now = Utc::now();
        let record = ContainerRecord {
            id: container_id.clone(),
            docker_id: docker_id.to_string(),
            alias,
            image: summary.image.clone().unwrap_or_else(|| "unknown".into()),
            digest: None,
            persistent,
            created_at: now,
            last_seen: now,
            ttl_s: None,
            volume_name,
            status,
            idempotency_key: None,
            idempotency_key_created_at: None,
        };

        let insert = {
            let conn = self.db.conn().await;
            self.db.containers.insert(&conn, &record)
        };

        match insert {
            Ok(()) => {
                info!(
                    container_id = %record.id,
                    docker_id,
                    alias = record.alias.as_deref().unwrap_or("-"),
                    "adopted runtime container"
                );
                Ok(true)
            }
            Err(e) if crate::database::is_unique_violation(&e, "alias") => {
                // Another row holds the alias; adopt without it.
                let mut aliasless = record;
                aliasless.alias = None;
                let conn = self.db.conn().await;
                self.db.containers.insert(&conn, &aliasless)?;
                warn!(
                    container_id = %aliasless.id,
                    "adopted container lost its alias to an existing row"
                );
                Ok(true)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Delete transient containers unseen for longer than the GC window,
    /// or whose ttl has lapsed, both in the engine (best effort) and the
    /// store.
    async fn gc_old_transients(&self, stats: &mut ReconcileStats) -> usize {
        let now = Utc::now();
        let cutoff = now - Duration::days(self.transient_gc_days);

        let mut stale = {
            let conn = self.db.conn().await;
            match self.db.containers.transients_older_than(&conn, cutoff) {
                Ok(rows) => rows,
                Err(e) => {
                    warn!("failed to query stale transients: {}", e);
                    stats.errors += 1;
                    return 0;
                }
            }
        };

        // Transients carrying an explicit ttl expire on their own clock.
        let expired = {
            let conn = self.db.conn().await;
            self.db.containers.list(&conn, true).unwrap_or_default()
        };
        for row in expired {
            if row.persistent || stale.iter().any(|s| s.id == row.id) {
                continue;
            }
            if let Some(ttl_s) = row.ttl_s {
                if row.created_at + Duration::seconds(ttl_s) < now {
                    stale.push(row);
                }
            }
        }

        let mut cleaned = 0;
        for row in stale {
            if let Err(e) = self.docker.remove_container(&row.docker_id, true, true).await {
                // The runtime container may already be gone.
                warn!(container_id = %row.id, "runtime removal during gc failed: {}", e);
            }

            let deleted = {
                let mut conn = self.db.conn().await;
                self.db.containers.delete_with_attachments(&mut conn, &row.id)
            };
            match deleted {
                Ok(()) => {
                    info!(container_id = %row.id, "garbage-collected stale transient");
                    cleaned += 1;
                }
                Err(e) => {
                    warn!(container_id = %row.id, "failed to delete stale transient: {}", e);
                    stats.errors += 1;
                }
            }
        }

        if cleaned > 0 {
            audit::record(AuditEvent::SystemGc, None, json!({"containers": cleaned}));
        }
        cleaned
    }
}
