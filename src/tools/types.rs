//! Request and response shapes for the tool catalog

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::database::{AttachmentRecord, ContainerRecord, ExecRecord};
use crate::filesystem::{BatchResult, FileInfo, ImportReport};
use crate::reconcile::ReconcileStats;

fn default_workspace() -> String {
    crate::docker::WORKSPACE_DIR.to_string()
}

fn default_true() -> bool {
    true
}

fn default_import_cap_mb() -> usize {
    1024
}

#[derive(Debug, Deserialize)]
pub struct SpawnInput {
    pub image: String,
    #[serde(default)]
    pub persistent: bool,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub ttl_s: Option<i64>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SpawnOutput {
    pub container_id: String,
    pub alias: Option<String>,
    pub status: String,
    /// True when the container came from the warm pool.
    pub warm: bool,
}

#[derive(Debug, Deserialize)]
pub struct AttachInput {
    pub target: String,
    pub client_name: String,
    pub session_id: String,
}

#[derive(Debug, Serialize)]
pub struct AttachOutput {
    pub container_id: String,
    pub alias: Option<String>,
    pub roots: Vec<String>,
    pub attachment_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct KillInput {
    pub container_id: String,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Serialize)]
pub struct KillOutput {
    pub status: String,
}

#[derive(Debug, Deserialize)]
pub struct ExecInput {
    pub container_id: String,
    pub cmd: Vec<String>,
    #[serde(default = "default_workspace")]
    pub cwd: String,
    #[serde(default)]
    pub env: Option<HashMap<String, String>>,
    #[serde(default)]
    pub as_root: bool,
    #[serde(default)]
    pub timeout_s: Option<u64>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ExecOutput {
    pub exec_id: String,
    pub status: String,
}

#[derive(Debug, Deserialize)]
pub struct ExecCancelInput {
    pub exec_id: String,
}

#[derive(Debug, Serialize)]
pub struct ExecCancelOutput {
    pub exec_id: String,
    pub status: String,
}

#[derive(Debug, Deserialize)]
pub struct ExecPollInput {
    pub exec_id: String,
    #[serde(default)]
    pub after_seq: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct ExecPollOutput {
    pub messages: Vec<Value>,
    pub complete: bool,
}

#[derive(Debug, Deserialize)]
pub struct FileReadInput {
    pub container_id: String,
    pub path: String,
}

#[derive(Debug, Serialize)]
pub struct FileReadOutput {
    pub path: String,
    /// base64 file content
    pub content: String,
    pub etag: String,
    pub size: u64,
    pub mime_type: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct FileWriteInput {
    pub container_id: String,
    pub path: String,
    /// base64 file content
    pub content: String,
    #[serde(default)]
    pub if_match_etag: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct FileWriteOutput {
    pub path: String,
    pub etag: String,
    pub size: usize,
}

#[derive(Debug, Deserialize)]
pub struct FileDeleteInput {
    pub container_id: String,
    pub path: String,
}

#[derive(Debug, Serialize)]
pub struct FileDeleteOutput {
    pub path: String,
    pub status: String,
}

#[derive(Debug, Deserialize)]
pub struct FileStatInput {
    pub container_id: String,
    pub path: String,
}

#[derive(Debug, Deserialize)]
pub struct FileListInput {
    pub container_id: String,
    #[serde(default = "default_workspace")]
    pub path: String,
}

#[derive(Debug, Serialize)]
pub struct FileListOutput {
    pub path: String,
    pub entries: Vec<FileInfo>,
}

/// One wire-shape batch operation.
#[derive(Debug, Deserialize)]
pub struct BatchOperationInput {
    pub op: String,
    pub path: String,
    /// base64 content for writes
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub dest_path: Option<String>,
    #[serde(default)]
    pub if_match_etag: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct FileBatchInput {
    pub container_id: String,
    pub operations: Vec<BatchOperationInput>,
}

pub type FileBatchOutput = BatchResult;

#[derive(Debug, Deserialize)]
pub struct ExportTarInput {
    pub container_id: String,
    #[serde(default = "default_workspace")]
    pub path: String,
    #[serde(default)]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default = "default_true")]
    pub compress: bool,
}

#[derive(Debug, Deserialize)]
pub struct ImportTarInput {
    pub container_id: String,
    #[serde(default = "default_workspace")]
    pub dest: String,
    /// base64 tar archive (optionally gzipped)
    pub content: String,
    #[serde(default = "default_import_cap_mb")]
    pub max_size_mb: usize,
}

pub type ImportTarOutput = ImportReport;

#[derive(Debug, Default, Deserialize)]
pub struct ReconcileInput {
    #[serde(default)]
    pub force: bool,
}

pub type ReconcileOutput = ReconcileStats;

#[derive(Debug, Serialize)]
pub struct GarbageCollectOutput {
    pub containers_removed: usize,
    pub execs_cleaned: usize,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListContainersInput {
    #[serde(default)]
    pub include_stopped: bool,
}

#[derive(Debug, Serialize)]
pub struct ListContainersOutput {
    pub containers: Vec<ContainerRecord>,
}

#[derive(Debug, Deserialize)]
pub struct ListExecsInput {
    pub container_id: String,
    #[serde(default)]
    pub active_only: bool,
}

#[derive(Debug, Serialize)]
pub struct ListExecsOutput {
    pub execs: Vec<ExecRecord>,
}

#[derive(Debug, Serialize)]
pub struct HealthOutput {
    pub status: String,
    pub docker_connected: bool,
    pub database_initialized: bool,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct SystemStatusOutput {
    pub status: String,
    pub docker_connected: bool,
    pub database_initialized: bool,
    pub active_containers: usize,
    pub in_flight_execs: usize,
    pub warm_container_id: Option<String>,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct MetricsOutput {
    pub metrics: String,
}

/// Workspace root handle returned by attach.
pub fn workspace_root(container: &ContainerRecord) -> String {
    format!("workspace:{}", container.id)
}

/// Attachment id helper kept close to the wire types.
pub fn attachment_output(container: &ContainerRecord, attachment: &AttachmentRecord) -> AttachOutput {
    AttachOutput {
        container_id: container.id.clone(),
        alias: container.alias.clone(),
        roots: vec![workspace_root(container)],
        attachment_id: attachment.id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_workspace_root_shape() {
        let record = ContainerRecord {
            id: "c_abc".into(),
            docker_id: "d".into(),
            alias: None,
            image: "alpine".into(),
            digest: None,
            persistent: false,
            created_at: Utc::now(),
            last_seen: Utc::now(),
            ttl_s: None,
            volume_name: None,
            status: crate::database::ContainerStatus::Running,
            idempotency_key: None,
            idempotency_key_created_at: None,
        };
        assert_eq!(workspace_root(&record), "workspace:c_abc");
    }

    #[test]
    fn test_exec_input_defaults() {
        let input: ExecInput =
            serde_json::from_str(r#"{"container_id": "c_1", "cmd": ["true"]}"#).unwrap();
        assert_eq!(input.cwd, "/workspace");
        assert!(!input.as_root);
        assert!(input.timeout_s.is_none());
    }

    #[test]
    fn test_spawn_input_defaults() {
        let input: SpawnInput = serde_json::from_str(r#"{"image": "alpine"}"#).unwrap();
        assert!(!input.persistent);
        assert!(input.alias.is_none());
        assert!(input.idempotency_key.is_none());
    }
}
