//! Filesystem operations inside container workspaces
//!
//! Reads and metadata go through in-container commands; writes go through
//! the engine's put-archive endpoint, which avoids shell escaping and
//! argument size limits. ETags are hex SHA-256 of file content.

use std::pin::Pin;
use std::sync::Arc;

use bollard::container::LogOutput;
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use futures_util::{Stream, StreamExt};
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::archive::{
    export_command, shell_quote, single_file_tar, validate_tar_members, ImportReport,
};
use super::path::{file_name, parent_dir, validate_path, WORKSPACE_ROOT};
use crate::audit::{self, AuditEvent};
use crate::database::Database;
use crate::docker::{DockerService, ExecOutput};
use crate::error::{DaemonError, Result};

/// Exec user for all filesystem commands.
const FS_USER: &str = "1000:1000";

/// Metadata for one file or directory.
#[derive(Debug, Clone, serde::Serialize)]
pub struct FileInfo {
    pub path: String,
    pub size: u64,
    pub is_dir: bool,
    pub mode: String,
    pub mtime: DateTime<Utc>,
    pub etag: String,
    pub mime_type: Option<String>,
}

/// One operation inside a batch.
#[derive(Debug, Clone)]
pub enum BatchOperation {
    Read {
        path: String,
    },
    Write {
        path: String,
        content: Vec<u8>,
        if_match_etag: Option<String>,
    },
    Delete {
        path: String,
        if_match_etag: Option<String>,
    },
    Move {
        path: String,
        dest_path: String,
    },
    Copy {
        path: String,
        dest_path: String,
    },
}

impl BatchOperation {
    pub fn path(&self) -> &str {
        match self {
            BatchOperation::Read { path }
            | BatchOperation::Write { path, .. }
            | BatchOperation::Delete { path, .. }
            | BatchOperation::Move { path, .. }
            | BatchOperation::Copy { path, .. } => path,
        }
    }

    pub fn dest_path(&self) -> Option<&str> {
        match self {
            BatchOperation::Move { dest_path, .. } | BatchOperation::Copy { dest_path, .. } => {
                Some(dest_path)
            }
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            BatchOperation::Read { .. } => "read",
            BatchOperation::Write { .. } => "write",
            BatchOperation::Delete { .. } => "delete",
            BatchOperation::Move { .. } => "move",
            BatchOperation::Copy { .. } => "copy",
        }
    }
}

/// Result of one batch operation.
#[derive(Debug, Clone, serde::Serialize)]
pub struct OperationOutcome {
    pub op: &'static str,
    pub path: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of a whole batch.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BatchResult {
    pub success: bool,
    pub results: Vec<OperationOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_index: Option<usize>,
    pub rollback_performed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Byte stream of an exported tar archive.
pub type TarStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

pub struct FilesystemManager {
    docker: DockerService,
    db: Arc<Database>,
}

impl FilesystemManager {
    pub fn new(docker: DockerService, db: Arc<Database>) -> Self {
        Self { docker, db }
    }

    /// Read a file and its metadata.
    pub async fn read(&self, container_id: &str, path: &str) -> Result<(Vec<u8>, FileInfo)> {
        let normalized = validate_path(path)?;
        let docker_id = self.resolve_docker_id(container_id).await?;

        let (size, mode, mtime, is_dir) = self
            .raw_stat(&docker_id, &normalized)
            .await?
            .ok_or_else(|| DaemonError::FileNotFound(path.to_string()))?;

        if is_dir {
            return Err(DaemonError::Validation(format!(
                "'{normalized}' is a directory"
            )));
        }

        let output = self
            .exec_sh(&docker_id, &format!("cat {}", shell_quote(&normalized)))
            .await?;
        if output.exit_code != 0 {
            return Err(DaemonError::FileNotFound(path.to_string()));
        }

        let content = output.stdout;
        let etag = content_etag(&content);

        let info = FileInfo {
            path: normalized.clone(),
            size,
            is_dir: false,
            mode,
            mtime,
            etag,
            mime_type: Some(guess_mime(&normalized)),
        };

        audit::record(
            AuditEvent::FsRead,
            Some(container_id),
            json!({"path": normalized, "size": content.len()}),
        );
        Ok((content, info))
    }

    /// Write a file, creating parent directories. With `if_match_etag`,
    /// an existing file whose etag differs fails the write; a missing file
    /// is created regardless.
    pub async fn write(
        &self,
        container_id: &str,
        path: &str,
        content: &[u8],
        if_match_etag: Option<&str>,
    ) -> Result<String> {
        let normalized = validate_path(path)?;
        if normalized == WORKSPACE_ROOT {
            return Err(DaemonError::Validation(
                "cannot write the workspace root itself".to_string(),
            ));
        }
        let docker_id = self.resolve_docker_id(container_id).await?;

        if let Some(expected) = if_match_etag {
            if let Some(actual) = self.current_etag(&docker_id, &normalized).await? {
                if actual != expected {
                    return Err(DaemonError::FileConflict {
                        path: normalized,
                        expected: expected.to_string(),
                        actual,
                    });
                }
            }
        }

        let parent = parent_dir(&normalized);
        if parent != WORKSPACE_ROOT {
            let mkdir = self
                .exec_sh(&docker_id, &format!("mkdir -p {}", shell_quote(&parent)))
                .await?;
            if mkdir.exit_code != 0 {
                return Err(DaemonError::Internal(format!(
                    "failed to create parent directory {parent}: {}",
                    mkdir.stderr_str()
                )));
            }
        }

        let tar = single_file_tar(file_name(&normalized), content, 1000, 1000)?;
        self.docker.upload_archive(&docker_id, &parent, tar).await?;

        let etag = content_etag(content);

        audit::record(
            AuditEvent::FsWrite,
            Some(container_id),
            json!({"path": &normalized, "size": content.len()}),
        );
        debug!(container_id, path = %normalized, size = content.len(), "wrote file");
        Ok(etag)
    }

    /// Recursively delete a file or directory. The workspace root itself
    /// is never deletable.
    pub async fn delete(&self, container_id: &str, path: &str) -> Result<()> {
        let normalized = validate_path(path)?;
        if normalized == WORKSPACE_ROOT {
            return Err(DaemonError::PathSecurity {
                path: path.to_string(),
                reason: "cannot delete the workspace root".to_string(),
            });
        }

        let docker_id = self.resolve_docker_id(container_id).await?;

        if self.raw_stat(&docker_id, &normalized).await?.is_none() {
            return Err(DaemonError::FileNotFound(path.to_string()));
        }

        let output = self
            .exec_sh(&docker_id, &format!("rm -rf {}", shell_quote(&normalized)))
            .await?;
        if output.exit_code != 0 {
            return Err(DaemonError::Internal(format!(
                "failed to delete {normalized}: {}",
                output.stderr_str()
            )));
        }

        audit::record(
            AuditEvent::FsDelete,
            Some(container_id),
            json!({"path": normalized}),
        );
        Ok(())
    }

    /// Metadata for one path.
    pub async fn stat(&self, container_id: &str, path: &str) -> Result<FileInfo> {
        let normalized = validate_path(path)?;
        let docker_id = self.resolve_docker_id(container_id).await?;

        let (size, mode, mtime, is_dir) = self
            .raw_stat(&docker_id, &normalized)
            .await?
            .ok_or_else(|| DaemonError::FileNotFound(path.to_string()))?;

        let etag = if is_dir {
            path_etag(&normalized)
        } else {
            self.current_etag(&docker_id, &normalized)
                .await?
                .unwrap_or_else(|| path_etag(&normalized))
        };

        Ok(FileInfo {
            path: normalized.clone(),
            size,
            is_dir,
            mode,
            mtime,
            etag,
            mime_type: if is_dir {
                None
            } else {
                Some(guess_mime(&normalized))
            },
        })
    }

    /// One-level listing of a directory. An empty directory yields an
    /// empty list; a missing one fails.
    pub async fn list(&self, container_id: &str, path: &str) -> Result<Vec<FileInfo>> {
        let normalized = validate_path(path)?;
        let docker_id = self.resolve_docker_id(container_id).await?;

        let list_cmd = format!(
            "find {} -maxdepth 1 -mindepth 1 -printf '%p|%s|%m|%T@|%y\\n'",
            shell_quote(&normalized)
        );
        let output = self.exec_sh(&docker_id, &list_cmd).await?;

        if output.exit_code != 0 {
            let probe = self
                .exec_sh(&docker_id, &format!("test -d {}", shell_quote(&normalized)))
                .await?;
            if probe.exit_code != 0 {
                return Err(DaemonError::FileNotFound(path.to_string()));
            }
            return Ok(Vec::new());
        }

        let mut entries: Vec<FileInfo> = output
            .stdout_str()
            .lines()
            .filter_map(parse_find_line)
            .collect();

        // Hash regular files in one pass so listing etags match stat etags.
        let hash_cmd = format!(
            "find {} -maxdepth 1 -mindepth 1 -type f -exec sha256sum {{}} +",
            shell_quote(&normalized)
        );
        let hashes = self.exec_sh(&docker_id, &hash_cmd).await?;
        if hashes.exit_code == 0 {
            for line in hashes.stdout_str().lines() {
                if let Some((digest, file_path)) = parse_sha256sum_line(line) {
                    if let Some(entry) = entries.iter_mut().find(|e| e.path == file_path) {
                        entry.etag = digest;
                    }
                }
            }
        }

        entries.sort_by(|a, b| match (a.is_dir, b.is_dir) {
            (true, false) => std::cmp::Ordering::Less,
            (false, true) => std::cmp::Ordering::Greater,
            _ => a.path.cmp(&b.path),
        });

        Ok(entries)
    }

    /// Execute an ordered batch of operations with best-effort rollback.
    ///
    /// Paths and etag preconditions are checked before any mutation. On a
    /// mid-batch failure the journal is replayed in reverse; rollback
    /// errors are logged and skipped, and the result reports
    /// `rollback_performed`.
    pub async fn batch(
        &self,
        container_id: &str,
        operations: Vec<BatchOperation>,
    ) -> Result<BatchResult> {
        // A single bad path fails the whole batch up front.
        for op in &operations {
            validate_path(op.path())?;
            if let Some(dest) = op.dest_path() {
                validate_path(dest)?;
            }
        }

        let docker_id = self.resolve_docker_id(container_id).await?;

        // Precondition pass: supplied etags must match, and deletes need
        // an existing file.
        for op in &operations {
            match op {
                BatchOperation::Write {
                    path,
                    if_match_etag: Some(expected),
                    ..
                } => {
                    let normalized = validate_path(path)?;
                    if let Some(actual) = self.current_etag(&docker_id, &normalized).await? {
                        if &actual != expected {
                            return Err(DaemonError::FileConflict {
                                path: normalized,
                                expected: expected.clone(),
                                actual,
                            });
                        }
                    }
                }
                BatchOperation::Delete {
                    path,
                    if_match_etag,
                } => {
                    let normalized = validate_path(path)?;
                    match self.current_etag(&docker_id, &normalized).await? {
                        Some(actual) => {
                            if let Some(expected) = if_match_etag {
                                if &actual != expected {
                                    return Err(DaemonError::FileConflict {
                                        path: normalized,
                                        expected: expected.clone(),
                                        actual,
                                    });
                                }
                            }
                        }
                        None => {
                            // Missing directory targets still stat below.
                            if self.raw_stat(&docker_id, &normalized).await?.is_none() {
                                return Err(DaemonError::FileNotFound(normalized));
                            }
                        }
                    }
                }
                _ => {}
            }
        }

        let mut results: Vec<OperationOutcome> = Vec::with_capacity(operations.len());
        // (path, original content; None = did not exist)
        let mut journal: Vec<(String, Option<Vec<u8>>)> = Vec::new();

        for (index, op) in operations.iter().enumerate() {
            let outcome = self
                .apply_batch_op(container_id, &docker_id, op, &mut journal)
                .await;

            match outcome {
                Ok(result) => results.push(result),
                Err(e) => {
                    warn!(
                        container_id,
                        op = op.kind(),
                        path = op.path(),
                        "batch operation failed, rolling back: {}",
                        e
                    );
                    self.rollback(container_id, &journal).await;

                    results.push(OperationOutcome {
                        op: op.kind(),
                        path: op.path().to_string(),
                        success: false,
                        data: None,
                        error: Some(e.to_string()),
                    });

                    return Ok(BatchResult {
                        success: false,
                        results,
                        failed_index: Some(index),
                        rollback_performed: true,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        audit::record(
            AuditEvent::FsBatch,
            Some(container_id),
            json!({"operations": operations.len()}),
        );

        Ok(BatchResult {
            success: true,
            results,
            failed_index: None,
            rollback_performed: false,
            error: None,
        })
    }

    /// Stream a tar (optionally gzipped) of `path`, filtered by globs.
    pub async fn export_tar(
        &self,
        container_id: &str,
        path: &str,
        include_globs: &[String],
        exclude_globs: &[String],
        compress: bool,
    ) -> Result<TarStream> {
        let normalized = validate_path(path)?;

        // Reject malformed patterns before they reach a shell.
        for pattern in include_globs.iter().chain(exclude_globs) {
            glob::Pattern::new(pattern).map_err(|e| {
                DaemonError::Validation(format!("invalid glob pattern '{pattern}': {e}"))
            })?;
        }

        let docker_id = self.resolve_docker_id(container_id).await?;

        let command = export_command(&normalized, include_globs, exclude_globs, compress);
        let (_, stream) = self
            .docker
            .exec_stream(
                &docker_id,
                vec!["sh".into(), "-c".into(), command],
                WORKSPACE_ROOT,
                None,
                FS_USER,
            )
            .await?;

        audit::record(
            AuditEvent::TransferExport,
            Some(container_id),
            json!({"path": normalized, "compress": compress}),
        );

        let mapped = stream.filter_map(|item| async move {
            match item {
                Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                    Some(Ok(message))
                }
                // tar chatter on stderr is not part of the archive
                Ok(_) => None,
                Err(e) => Some(Err(DaemonError::Docker(e))),
            }
        });

        Ok(Box::pin(mapped))
    }

    /// Import a tar archive under `dest` after validating every member.
    pub async fn import_tar(
        &self,
        container_id: &str,
        dest: &str,
        data: Bytes,
        max_size_mb: usize,
    ) -> Result<ImportReport> {
        let normalized = validate_path(dest)?;
        let docker_id = self.resolve_docker_id(container_id).await?;

        let max_bytes = max_size_mb * 1024 * 1024;
        if data.len() > max_bytes {
            return Err(DaemonError::SizeLimit(format!(
                "tar archive is {} bytes, limit is {max_size_mb}MB",
                data.len()
            )));
        }

        // Member validation walks the whole archive; keep it off the
        // async workers.
        let validation_data = data.clone();
        let validation_dest = normalized.clone();
        tokio::task::spawn_blocking(move || {
            validate_tar_members(&validation_data, &validation_dest)
        })
        .await
        .map_err(|e| DaemonError::Internal(format!("tar validation task failed: {e}")))??;

        let bytes_written = data.len();
        self.docker
            .upload_archive(&docker_id, &normalized, data)
            .await?;

        let count = self
            .exec_sh(
                &docker_id,
                &format!("find {} -type f | wc -l", shell_quote(&normalized)),
            )
            .await?;
        let files_created = count.stdout_str().trim().parse().unwrap_or(-1);

        audit::record(
            AuditEvent::TransferImport,
            Some(container_id),
            json!({"dest": &normalized, "bytes": bytes_written}),
        );
        info!(
            container_id,
            dest = %normalized,
            bytes = bytes_written,
            "imported tar archive"
        );

        Ok(ImportReport {
            bytes_written,
            files_created,
            dest_path: normalized,
        })
    }

    async fn apply_batch_op(
        &self,
        container_id: &str,
        docker_id: &str,
        op: &BatchOperation,
        journal: &mut Vec<(String, Option<Vec<u8>>)>,
    ) -> Result<OperationOutcome> {
        match op {
            BatchOperation::Read { path } => {
                let (content, info) = self.read(container_id, path).await?;
                Ok(OperationOutcome {
                    op: op.kind(),
                    path: info.path.clone(),
                    success: true,
                    data: Some(json!({
                        "content": base64_encode(&content),
                        "etag": info.etag,
                        "size": info.size,
                    })),
                    error: None,
                })
            }
            BatchOperation::Write {
                path,
                content,
                if_match_etag,
            } => {
                let normalized = validate_path(path)?;
                journal.push((
                    normalized.clone(),
                    self.snapshot_file(docker_id, &normalized).await,
                ));

                let etag = self
                    .write(container_id, path, content, if_match_etag.as_deref())
                    .await?;
                Ok(OperationOutcome {
                    op: op.kind(),
                    path: normalized,
                    success: true,
                    data: Some(json!({"etag": etag})),
                    error: None,
                })
            }
            BatchOperation::Delete { path, .. } => {
                let normalized = validate_path(path)?;
                journal.push((
                    normalized.clone(),
                    self.snapshot_file(docker_id, &normalized).await,
                ));

                self.delete(container_id, path).await?;
                Ok(OperationOutcome {
                    op: op.kind(),
                    path: normalized,
                    success: true,
                    data: None,
                    error: None,
                })
            }
            BatchOperation::Move { path, dest_path } => {
                let source = validate_path(path)?;
                let dest = validate_path(dest_path)?;

                let (content, _) = self.read(container_id, path).await?;
                journal.push((source.clone(), Some(content.clone())));
                journal.push((dest.clone(), self.snapshot_file(docker_id, &dest).await));

                self.write(container_id, dest_path, &content, None).await?;
                self.delete(container_id, path).await?;

                Ok(OperationOutcome {
                    op: op.kind(),
                    path: source,
                    success: true,
                    data: Some(json!({"dest_path": dest})),
                    error: None,
                })
            }
            BatchOperation::Copy { path, dest_path } => {
                let source = validate_path(path)?;
                let dest = validate_path(dest_path)?;

                let (content, _) = self.read(container_id, path).await?;
                journal.push((dest.clone(), self.snapshot_file(docker_id, &dest).await));

                self.write(container_id, dest_path, &content, None).await?;

                Ok(OperationOutcome {
                    op: op.kind(),
                    path: source,
                    success: true,
                    data: Some(json!({"dest_path": dest})),
                    error: None,
                })
            }
        }
    }

    /// Replay the journal in reverse. Best effort: failures are logged and
    /// the replay continues.
    async fn rollback(&self, container_id: &str, journal: &[(String, Option<Vec<u8>>)]) {
        for (path, original) in journal.iter().rev() {
            let result = match original {
                None => match self.delete(container_id, path).await {
                    Err(DaemonError::FileNotFound(_)) => Ok(()),
                    other => other,
                },
                Some(content) => self
                    .write(container_id, path, content, None)
                    .await
                    .map(|_| ()),
            };

            if let Err(e) = result {
                warn!(container_id, path = %path, "rollback step failed: {}", e);
            }
        }
    }

    /// Current content of a regular file, or None if absent (or a
    /// directory). Used to journal pre-mutation state.
    async fn snapshot_file(&self, docker_id: &str, normalized: &str) -> Option<Vec<u8>> {
        let output = self
            .exec_sh(docker_id, &format!("cat {}", shell_quote(normalized)))
            .await
            .ok()?;
        if output.exit_code != 0 {
            return None;
        }
        Some(output.stdout)
    }

    /// Content etag of an existing regular file, or None when missing.
    async fn current_etag(&self, docker_id: &str, normalized: &str) -> Result<Option<String>> {
        let output = self
            .exec_sh(docker_id, &format!("sha256sum {}", shell_quote(normalized)))
            .await?;
        if output.exit_code != 0 {
            return Ok(None);
        }
        Ok(parse_sha256sum_line(output.stdout_str().trim()).map(|(digest, _)| digest))
    }

    /// `size|mode|mtime|type` of a path, or None when missing.
    async fn raw_stat(
        &self,
        docker_id: &str,
        normalized: &str,
    ) -> Result<Option<(u64, String, DateTime<Utc>, bool)>> {
        let output = self
            .exec_sh(
                docker_id,
                &format!("stat -c '%s|%a|%Y|%F' {}", shell_quote(normalized)),
            )
            .await?;
        if output.exit_code != 0 {
            return Ok(None);
        }
        Ok(parse_stat_output(output.stdout_str().trim()))
    }

    async fn exec_sh(&self, docker_id: &str, script: &str) -> Result<ExecOutput> {
        self.docker
            .exec_collect(
                docker_id,
                vec!["sh".into(), "-c".into(), script.to_string()],
                WORKSPACE_ROOT,
                None,
                FS_USER,
            )
            .await
    }

    async fn resolve_docker_id(&self, container_id: &str) -> Result<String> {
        let conn = self.db.conn().await;
        self.db
            .containers
            .get(&conn, container_id)?
            .map(|record| record.docker_id)
            .ok_or_else(|| DaemonError::ContainerNotFound(container_id.to_string()))
    }
}

/// Hex SHA-256 of file content, the etag scheme everywhere.
pub fn content_etag(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

fn path_etag(path: &str) -> String {
    hex::encode(Sha256::digest(path.as_bytes()))
}

fn base64_encode(content: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(content)
}

fn guess_mime(path: &str) -> String {
    mime_guess::from_path(path)
        .first_or_octet_stream()
        .to_string()
}

/// Parse `stat -c '%s|%a|%Y|%F'` output.
fn parse_stat_output(raw: &str) -> Option<(u64, String, DateTime<Utc>, bool)> {
    let mut parts = raw.splitn(4, '|');
    let size = parts.next()?.parse().ok()?;
    let mode = parts.next()?.to_string();
    let mtime_secs: i64 = parts.next()?.parse().ok()?;
    let kind = parts.next()?;

    let mtime = Utc.timestamp_opt(mtime_secs, 0).single()?;
    Some((size, mode, mtime, kind.contains("directory")))
}

/// Parse one `find -printf '%p|%s|%m|%T@|%y'` line.
fn parse_find_line(line: &str) -> Option<FileInfo> {
    let mut parts = line.splitn(5, '|');
    let path = parts.next()?.to_string();
    let size: u64 = parts.next()?.parse().ok()?;
    let mode = parts.next()?.to_string();
    let mtime_raw = parts.next()?;
    let kind = parts.next()?;

    let mtime_secs = mtime_raw.split('.').next()?.parse::<i64>().ok()?;
    let mtime = Utc.timestamp_opt(mtime_secs, 0).single()?;
    let is_dir = kind == "d";

    Some(FileInfo {
        mime_type: if is_dir {
            None
        } else {
            Some(guess_mime(&path))
        },
        etag: path_etag(&path),
        path,
        size: if is_dir { 0 } else { size },
        is_dir,
        mode,
        mtime,
    })
}

/// Parse a `sha256sum` line into `(digest, path)`.
fn parse_sha256sum_line(line: &str) -> Option<(String, String)> {
    let (digest, rest) = line.split_once(' ')?;
    if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    Some((digest.to_string(), rest.trim_start().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_etag_changes_with_content() {
        let a = content_etag(b"v1");
        let b = content_etag(b"v2");
        assert_ne!(a, b);
        assert_eq!(a, content_etag(b"v1"));
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_parse_stat_output() {
        let (size, mode, mtime, is_dir) =
            parse_stat_output("1024|644|1700000000|regular file").unwrap();
        assert_eq!(size, 1024);
        assert_eq!(mode, "644");
        assert_eq!(mtime.timestamp(), 1_700_000_000);
        assert!(!is_dir);

        let (_, _, _, is_dir) = parse_stat_output("4096|755|1700000000|directory").unwrap();
        assert!(is_dir);

        assert!(parse_stat_output("garbage").is_none());
    }

    #[test]
    fn test_parse_find_line() {
        let info = parse_find_line("/workspace/a.txt|12|644|1700000000.5|f").unwrap();
        assert_eq!(info.path, "/workspace/a.txt");
        assert_eq!(info.size, 12);
        assert!(!info.is_dir);
        assert_eq!(info.mime_type.as_deref(), Some("text/plain"));

        let dir = parse_find_line("/workspace/sub|4096|755|1700000000.0|d").unwrap();
        assert!(dir.is_dir);
        assert_eq!(dir.size, 0);
        assert!(dir.mime_type.is_none());
    }

    #[test]
    fn test_parse_sha256sum_line() {
        let digest = "a".repeat(64);
        let line = format!("{digest}  /workspace/a.txt");
        let (parsed, path) = parse_sha256sum_line(&line).unwrap();
        assert_eq!(parsed, digest);
        assert_eq!(path, "/workspace/a.txt");

        assert!(parse_sha256sum_line("sha256sum: missing: No such file").is_none());
    }

    fn manager_with_db() -> (FilesystemManager, Arc<Database>) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        // The client is lazy; no engine is contacted until a call is made.
        let docker = DockerService::new().unwrap();
        (FilesystemManager::new(docker, Arc::clone(&db)), db)
    }

    async fn seed_container(db: &Database, id: &str) {
        let conn = db.conn().await;
        conn.execute(
            r#"
            INSERT INTO containers (id, docker_id, image, persistent, created_at, last_seen, status)
            VALUES (?1, ?2, 'alpine', 0, '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z', 'running')
            "#,
            rusqlite::params![id, format!("docker_{id}")],
        )
        .unwrap();
    }

    #[tokio::test]
    async fn test_read_rejects_traversal_before_any_engine_call() {
        let (fm, _db) = manager_with_db();
        let err = fm.read("c_x", "/workspace/../etc/passwd").await.unwrap_err();
        assert_eq!(err.category(), "path_security_error");
    }

    #[tokio::test]
    async fn test_delete_rejects_workspace_root() {
        let (fm, _db) = manager_with_db();
        let err = fm.delete("c_x", "/workspace").await.unwrap_err();
        assert_eq!(err.category(), "path_security_error");
    }

    #[tokio::test]
    async fn test_export_rejects_bad_globs() {
        let (fm, _db) = manager_with_db();
        let res = fm
            .export_tar("c_x", "/workspace", &["[".to_string()], &[], true)
            .await;
        let err = match res {
            Ok(_) => panic!("expected error"),
            Err(e) => e,
        };
        assert_eq!(err.category(), "validation_error");
    }

    #[tokio::test]
    async fn test_unknown_container_fails_lookup() {
        let (fm, _db) = manager_with_db();
        let res = fm
            .export_tar("c_missing", "/workspace", &[], &[], true)
            .await;
        let err = match res {
            Ok(_) => panic!("expected error"),
            Err(e) => e,
        };
        assert_eq!(err.category(), "container_not_found");
    }

    #[tokio::test]
    async fn test_import_enforces_size_cap() {
        let (fm, db) = manager_with_db();
        seed_container(&db, "c_1").await;

        let oversized = Bytes::from(vec![0u8; 2 * 1024 * 1024]);
        let err = fm
            .import_tar("c_1", "/workspace", oversized, 1)
            .await
            .unwrap_err();
        assert_eq!(err.category(), "size_limit");
    }

    #[tokio::test]
    async fn test_import_rejects_escaping_members_before_upload() {
        let (fm, db) = manager_with_db();
        seed_container(&db, "c_1").await;

        let mut builder = tar::Builder::new(Vec::new());
        let content = b"data";
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_entry_type(tar::EntryType::Regular);
        builder
            .append_data(&mut header, "../escape.txt", &content[..])
            .unwrap();
        let data = Bytes::from(builder.into_inner().unwrap());

        let err = fm.import_tar("c_1", "/workspace", data, 16).await.unwrap_err();
        assert_eq!(err.category(), "path_security_error");
    }

    #[test]
    fn test_batch_operation_accessors() {
        let op = BatchOperation::Move {
            path: "/workspace/a".into(),
            dest_path: "/workspace/b".into(),
        };
        assert_eq!(op.path(), "/workspace/a");
        assert_eq!(op.dest_path(), Some("/workspace/b"));
        assert_eq!(op.kind(), "move");

        let op = BatchOperation::Read {
            path: "/workspace/a".into(),
        };
        assert!(op.dest_path().is_none());
    }
}
