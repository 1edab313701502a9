//! Container lifecycle management
//!
//! Owns every mutation of container rows. The store is the source of
//! truth; the Docker engine is reconciled against it on reads and by the
//! reconciliation engine.

use std::collections::HashMap;
use std::sync::Arc;

use bollard::container::Config;
use bollard::models::{Mount, MountTypeEnum};
use chrono::{Duration, Utc};
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::audit::{self, AuditEvent};
use crate::database::{
    is_unique_violation, AttachmentRecord, ContainerRecord, ContainerStatus, Database,
};
use crate::docker::{
    DockerService, ALIAS_LABEL, CONTAINER_ID_LABEL, MANAGED_LABEL, WORKSPACE_DIR,
};
use crate::error::{is_docker_not_found, DaemonError, Result};
use crate::image::ImagePolicy;
use crate::security::SecurityProfile;

/// Hours an idempotency key stays valid after creation.
pub const IDEMPOTENCY_KEY_TTL_HOURS: i64 = 24;

/// Parameters for container creation.
#[derive(Debug, Clone, Default)]
pub struct CreateRequest {
    pub image: String,
    pub alias: Option<String>,
    pub persistent: bool,
    pub ttl_s: Option<i64>,
    pub idempotency_key: Option<String>,
}

pub struct ContainerManager {
    docker: DockerService,
    db: Arc<Database>,
    image_policy: Arc<ImagePolicy>,
    security: SecurityProfile,
}

impl ContainerManager {
    pub fn new(
        docker: DockerService,
        db: Arc<Database>,
        image_policy: Arc<ImagePolicy>,
        security: SecurityProfile,
    ) -> Self {
        Self {
            docker,
            db,
            image_policy,
            security,
        }
    }

    pub fn docker(&self) -> &DockerService {
        &self.docker
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    /// Create a container. With an idempotency key, a repeated call inside
    /// the key's validity window returns the original container.
    pub async fn create(&self, request: CreateRequest) -> Result<ContainerRecord> {
        if let Some(key) = &request.idempotency_key {
            if let Some(existing) = self.lookup_idempotent(key).await? {
                info!(
                    container_id = %existing.id,
                    "returning existing container for idempotency key"
                );
                return Ok(existing);
            }
        }

        let resolved = self.image_policy.resolve(&request.image, false).await?;

        // Pre-check the alias for a friendly error; the UNIQUE constraint
        // still decides races.
        if let Some(alias) = &request.alias {
            let conn = self.db.conn().await;
            if self.db.containers.get_by_alias(&conn, alias)?.is_some() {
                return Err(DaemonError::AliasInUse(alias.clone()));
            }
        }

        let container_id = format!("c_{}", Uuid::new_v4());
        let volume_name = if request.persistent {
            format!("persist_{container_id}")
        } else {
            format!("transient_{container_id}")
        };

        let mut labels = HashMap::new();
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());
        labels.insert(CONTAINER_ID_LABEL.to_string(), container_id.clone());
        if let Some(alias) = &request.alias {
            labels.insert(ALIAS_LABEL.to_string(), alias.clone());
        }

        let mounts = vec![Mount {
            target: Some(WORKSPACE_DIR.to_string()),
            source: Some(volume_name.clone()),
            typ: Some(MountTypeEnum::VOLUME),
            read_only: Some(false),
            ..Default::default()
        }];

        let config = Config {
            image: Some(resolved.resolved_ref.clone()),
            labels: Some(labels),
            user: Some(self.security.container_user()),
            working_dir: Some(WORKSPACE_DIR.to_string()),
            tty: Some(true),
            open_stdin: Some(true),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            host_config: Some(self.security.host_config(mounts)),
            ..Default::default()
        };

        let docker_id = self.docker.create_container(&container_id, config).await?;

        let now = Utc::now();
        let record = ContainerRecord {
            id: container_id.clone(),
            docker_id: docker_id.clone(),
            alias: request.alias.clone(),
            image: resolved.resolved_ref.clone(),
            digest: resolved.digest.clone(),
            persistent: request.persistent,
            created_at: now,
            last_seen: now,
            ttl_s: request.ttl_s,
            volume_name: Some(volume_name),
            status: ContainerStatus::Stopped,
            idempotency_key: request.idempotency_key.clone(),
            idempotency_key_created_at: request.idempotency_key.as_ref().map(|_| now),
        };

        let insert_result = {
            let conn = self.db.conn().await;
            self.db.containers.insert(&conn, &record)
        };

        match insert_result {
            Ok(()) => {
                info!(
                    container_id = %record.id,
                    image = %record.image,
                    persistent = record.persistent,
                    "container created"
                );
                audit::record(
                    AuditEvent::ContainerSpawn,
                    Some(&record.id),
                    json!({
                        "image": &record.image,
                        "alias": &record.alias,
                        "persistent": record.persistent,
                    }),
                );
                Ok(record)
            }
            Err(e) if is_unique_violation(&e, "idempotency_key") => {
                // Lost a creation race on the same key: the winner's row is
                // the container to return. Ours must not leak.
                self.remove_runtime_container_best_effort(&docker_id).await;

                let key = request
                    .idempotency_key
                    .as_deref()
                    .unwrap_or_default()
                    .to_string();
                match self.lookup_idempotent(&key).await? {
                    Some(winner) => Ok(winner),
                    None => Err(DaemonError::Internal(format!(
                        "idempotency key '{key}' conflicted but no winner found"
                    ))),
                }
            }
            Err(e) if is_unique_violation(&e, "alias") => {
                self.remove_runtime_container_best_effort(&docker_id).await;
                Err(DaemonError::AliasInUse(
                    request.alias.unwrap_or_default(),
                ))
            }
            Err(e) => {
                // Never leave an orphaned runtime container behind a failed
                // commit.
                self.remove_runtime_container_best_effort(&docker_id).await;
                Err(e.into())
            }
        }
    }

    pub async fn start(&self, container_id: &str) -> Result<()> {
        let record = self.load(container_id).await?;

        match self.docker.start_container(&record.docker_id).await {
            Ok(()) => {
                let conn = self.db.conn().await;
                self.db
                    .containers
                    .update_status(&conn, &record.id, ContainerStatus::Running)?;
                info!(container_id = %record.id, "container started");
                Ok(())
            }
            Err(DaemonError::Docker(e)) if is_docker_not_found(&e) => {
                let conn = self.db.conn().await;
                self.db
                    .containers
                    .update_status(&conn, &record.id, ContainerStatus::Error)?;
                Err(DaemonError::ContainerNotFound(record.id))
            }
            Err(e) => {
                let conn = self.db.conn().await;
                self.db
                    .containers
                    .update_status(&conn, &record.id, ContainerStatus::Error)?;
                Err(e)
            }
        }
    }

    pub async fn stop(&self, container_id: &str, grace_s: i64) -> Result<()> {
        let record = self.load(container_id).await?;

        match self.docker.stop_container(&record.docker_id, grace_s).await {
            Ok(()) => {}
            Err(DaemonError::Docker(e)) if is_docker_not_found(&e) => {
                // Runtime-missing is not an error for stop.
            }
            Err(e) => return Err(e),
        }

        let conn = self.db.conn().await;
        self.db
            .containers
            .update_status(&conn, &record.id, ContainerStatus::Stopped)?;
        info!(container_id = %record.id, "container stopped");
        Ok(())
    }

    /// Remove a container, its transient volume, and (for persistent
    /// containers) the named workspace volume. Attachments are detached in
    /// the same transaction as the row deletion.
    pub async fn remove(&self, container_id: &str, force: bool) -> Result<()> {
        let record = self.load(container_id).await?;

        match self
            .docker
            .remove_container(&record.docker_id, force, !record.persistent)
            .await
        {
            Ok(()) => {}
            Err(DaemonError::Docker(e)) if is_docker_not_found(&e) => {
                info!(
                    container_id = %record.id,
                    "runtime container already gone, removing store row"
                );
            }
            Err(e) => return Err(e),
        }

        if record.persistent {
            if let Some(volume_name) = &record.volume_name {
                match self.docker.remove_volume(volume_name).await {
                    Ok(()) => {}
                    Err(DaemonError::Docker(e)) if is_docker_not_found(&e) => {}
                    Err(e) => {
                        warn!(volume = %volume_name, "failed to remove workspace volume: {}", e)
                    }
                }
            }
        }

        {
            let mut conn = self.db.conn().await;
            self.db
                .containers
                .delete_with_attachments(&mut conn, &record.id)?;
        }

        audit::record(
            AuditEvent::ContainerKill,
            Some(&record.id),
            json!({"force": force, "persistent": record.persistent}),
        );
        info!(container_id = %record.id, "container removed");
        Ok(())
    }

    /// Fetch by id or alias, refreshing the stored status from the engine.
    pub async fn get(&self, identifier: &str) -> Result<ContainerRecord> {
        let mut record = {
            let conn = self.db.conn().await;
            self.db
                .containers
                .get_by_identifier(&conn, identifier)?
                .ok_or_else(|| DaemonError::ContainerNotFound(identifier.to_string()))?
        };

        let engine_status = self.docker.container_status(&record.docker_id).await?;
        let refreshed = match engine_status.as_deref() {
            Some("running") => ContainerStatus::Running,
            Some("exited") | Some("created") | Some("dead") | Some("paused") => {
                ContainerStatus::Stopped
            }
            Some(_) => record.status,
            None => ContainerStatus::Error,
        };

        if refreshed != record.status {
            let conn = self.db.conn().await;
            self.db
                .containers
                .update_status(&conn, &record.id, refreshed)?;
            record.status = refreshed;
        }

        Ok(record)
    }

    pub async fn list(&self, include_stopped: bool) -> Result<Vec<ContainerRecord>> {
        let conn = self.db.conn().await;
        self.db.containers.list(&conn, include_stopped)
    }

    /// Record a client attachment and return the workspace root handle.
    pub async fn attach(
        &self,
        target: &str,
        client_name: &str,
        session_id: &str,
    ) -> Result<(ContainerRecord, AttachmentRecord)> {
        let record = self.get(target).await?;

        let attachment = {
            let conn = self.db.conn().await;
            self.db
                .attachments
                .attach(&conn, &record.id, client_name, session_id)?
        };

        audit::record(
            AuditEvent::ContainerAttach,
            Some(&record.id),
            json!({"client_name": client_name, "session_id": session_id}),
        );

        Ok((record, attachment))
    }

    async fn load(&self, container_id: &str) -> Result<ContainerRecord> {
        let conn = self.db.conn().await;
        self.db
            .containers
            .get(&conn, container_id)?
            .ok_or_else(|| DaemonError::ContainerNotFound(container_id.to_string()))
    }

    /// Return the container for a still-valid idempotency key, releasing
    /// keys that have aged out.
    async fn lookup_idempotent(&self, key: &str) -> Result<Option<ContainerRecord>> {
        let conn = self.db.conn().await;
        let existing = self.db.containers.get_by_idempotency_key(&conn, key)?;

        match existing {
            Some(record) => {
                let created = record
                    .idempotency_key_created_at
                    .unwrap_or(record.created_at);
                if Utc::now() - created < Duration::hours(IDEMPOTENCY_KEY_TTL_HOURS) {
                    Ok(Some(record))
                } else {
                    self.db.containers.clear_idempotency_key(&conn, &record.id)?;
                    Ok(None)
                }
            }
            None => Ok(None),
        }
    }

    async fn remove_runtime_container_best_effort(&self, docker_id: &str) {
        if let Err(e) = self.docker.remove_container(docker_id, true, true).await {
            error!(
                docker_id,
                "failed to clean up runtime container after store error: {}", e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Configuration;

    fn manager() -> (ContainerManager, Arc<Database>) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        // Lazy client: nothing talks to an engine until a call is made.
        let docker = DockerService::new().unwrap();
        let image_policy = Arc::new(ImagePolicy::new(docker.clone(), &Configuration::from_env()));
        let manager = ContainerManager::new(
            docker,
            Arc::clone(&db),
            image_policy,
            SecurityProfile::default(),
        );
        (manager, db)
    }

    #[tokio::test]
    async fn test_lifecycle_ops_fail_for_unknown_container() {
        let (manager, _db) = manager();

        for result in [
            manager.start("c_missing").await.err(),
            manager.stop("c_missing", 10).await.err(),
            manager.remove("c_missing", false).await.err(),
            manager.get("c_missing").await.err(),
        ] {
            let err = result.expect("operation should fail");
            assert_eq!(err.category(), "container_not_found");
        }
    }

    #[tokio::test]
    async fn test_list_on_empty_store() {
        let (manager, _db) = manager();
        assert!(manager.list(true).await.unwrap().is_empty());
    }
}
