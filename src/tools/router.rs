//! HTTP dispatch for the tool catalog

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::Engine;
use bytes::Bytes;
use futures_util::StreamExt;
use tower_http::trace::TraceLayer;

use crate::config::Configuration;
use crate::containers::{ContainerManager, CreateRequest};
use crate::database::Database;
use crate::docker::DockerService;
use crate::error::{DaemonError, Result};
use crate::exec::{ExecManager, ExecSubmission};
use crate::filesystem::{BatchOperation, FilesystemManager};
use crate::reconcile::ReconciliationEngine;
use crate::shutdown::ShutdownCoordinator;
use crate::warmpool::WarmPool;

use super::types::*;

/// Shared state handed to every tool handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Configuration>,
    pub docker: DockerService,
    pub db: Arc<Database>,
    pub containers: Arc<ContainerManager>,
    pub execs: Arc<ExecManager>,
    pub files: Arc<FilesystemManager>,
    pub warm_pool: Arc<WarmPool>,
    pub reconciler: Arc<ReconciliationEngine>,
    pub shutdown: Arc<ShutdownCoordinator>,
}

/// Build the tool router. `health` stays reachable during shutdown;
/// everything else is refused once draining starts.
pub fn build_router(state: AppState) -> Router {
    let tools = Router::new()
        .route("/tools/spawn", post(spawn))
        .route("/tools/attach", post(attach))
        .route("/tools/kill", post(kill))
        .route("/tools/exec", post(exec))
        .route("/tools/exec_cancel", post(exec_cancel))
        .route("/tools/exec_poll", post(exec_poll))
        .route("/tools/fs_read", post(fs_read))
        .route("/tools/fs_write", post(fs_write))
        .route("/tools/fs_delete", post(fs_delete))
        .route("/tools/fs_stat", post(fs_stat))
        .route("/tools/fs_list", post(fs_list))
        .route("/tools/fs_batch", post(fs_batch))
        .route("/tools/fs_export_tar", post(fs_export_tar))
        .route("/tools/fs_import_tar", post(fs_import_tar))
        .route("/tools/reconcile", post(reconcile))
        .route("/tools/garbage_collect", post(garbage_collect))
        .route("/tools/list_containers", post(list_containers))
        .route("/tools/list_execs", post(list_execs))
        .route("/tools/system_status", post(system_status))
        .route("/tools/metrics", post(metrics))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            refuse_when_draining,
        ));

    Router::new()
        .route("/health", get(health).post(health))
        .merge(tools)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn refuse_when_draining(
    State(state): State<AppState>,
    request: axum::extract::Request,
    next: Next,
) -> Response {
    if state.shutdown.is_shutting_down() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "error": true,
                "category": "shutting_down",
                "message": "daemon is draining, not accepting new operations",
            })),
        )
            .into_response();
    }
    next.run(request).await
}

async fn health(State(state): State<AppState>) -> Json<HealthOutput> {
    let docker_connected = state.docker.ping().await.is_ok();

    Json(HealthOutput {
        status: if docker_connected {
            "healthy".into()
        } else {
            "degraded".into()
        },
        docker_connected,
        database_initialized: true,
        version: env!("CARGO_PKG_VERSION").into(),
    })
}

/// Provision a workspace. The warm pool serves default-image transient
/// requests instantly when its slot is filled.
async fn spawn(
    State(state): State<AppState>,
    Json(input): Json<SpawnInput>,
) -> Result<Json<SpawnOutput>> {
    let warm_eligible = !input.persistent
        && input.idempotency_key.is_none()
        && input.image == state.config.default_image_alias;

    if warm_eligible {
        if let Some(container) = state.warm_pool.claim(input.alias.as_deref()).await? {
            return Ok(Json(SpawnOutput {
                container_id: container.id,
                alias: container.alias,
                status: "running".into(),
                warm: true,
            }));
        }
    }

    let container = state
        .containers
        .create(CreateRequest {
            image: input.image,
            alias: input.alias,
            persistent: input.persistent,
            ttl_s: input.ttl_s,
            idempotency_key: input.idempotency_key,
        })
        .await?;

    // An idempotent replay may hand back a container that is already
    // running; starting it again is harmless to the engine but skipped to
    // keep status transitions clean.
    if container.status != crate::database::ContainerStatus::Running {
        state.containers.start(&container.id).await?;
    }

    Ok(Json(SpawnOutput {
        container_id: container.id,
        alias: container.alias,
        status: "running".into(),
        warm: false,
    }))
}

async fn attach(
    State(state): State<AppState>,
    Json(input): Json<AttachInput>,
) -> Result<Json<AttachOutput>> {
    let (container, attachment) = state
        .containers
        .attach(&input.target, &input.client_name, &input.session_id)
        .await?;
    Ok(Json(attachment_output(&container, &attachment)))
}

async fn kill(
    State(state): State<AppState>,
    Json(input): Json<KillInput>,
) -> Result<Json<KillOutput>> {
    if !input.force {
        // Graceful path stops the container before removal.
        state.containers.stop(&input.container_id, 10).await?;
    }
    state.containers.remove(&input.container_id, input.force).await?;

    Ok(Json(KillOutput {
        status: "removed".into(),
    }))
}

async fn exec(
    State(state): State<AppState>,
    Json(input): Json<ExecInput>,
) -> Result<Json<ExecOutput>> {
    let exec_id = state
        .execs
        .submit(ExecSubmission {
            container_id: input.container_id,
            cmd: input.cmd,
            cwd: Some(input.cwd),
            env: input.env,
            as_root: input.as_root,
            timeout_s: input.timeout_s,
            idempotency_key: input.idempotency_key,
        })
        .await?;

    Ok(Json(ExecOutput {
        exec_id,
        status: "running".into(),
    }))
}

async fn exec_cancel(
    State(state): State<AppState>,
    Json(input): Json<ExecCancelInput>,
) -> Result<Json<ExecCancelOutput>> {
    state.execs.cancel(&input.exec_id).await?;
    Ok(Json(ExecCancelOutput {
        exec_id: input.exec_id,
        status: "cancelled".into(),
    }))
}

async fn exec_poll(
    State(state): State<AppState>,
    Json(input): Json<ExecPollInput>,
) -> Result<Json<ExecPollOutput>> {
    let (chunks, complete) = state.execs.poll(&input.exec_id, input.after_seq).await?;
    Ok(Json(ExecPollOutput {
        messages: chunks.iter().map(|c| c.to_wire()).collect(),
        complete,
    }))
}

async fn fs_read(
    State(state): State<AppState>,
    Json(input): Json<FileReadInput>,
) -> Result<Json<FileReadOutput>> {
    let (content, info) = state.files.read(&input.container_id, &input.path).await?;
    Ok(Json(FileReadOutput {
        path: info.path,
        content: base64::engine::general_purpose::STANDARD.encode(&content),
        etag: info.etag,
        size: content.len() as u64,
        mime_type: info.mime_type,
    }))
}

async fn fs_write(
    State(state): State<AppState>,
    Json(input): Json<FileWriteInput>,
) -> Result<Json<FileWriteOutput>> {
    let content = decode_base64(&input.content)?;
    let etag = state
        .files
        .write(
            &input.container_id,
            &input.path,
            &content,
            input.if_match_etag.as_deref(),
        )
        .await?;

    Ok(Json(FileWriteOutput {
        path: input.path,
        etag,
        size: content.len(),
    }))
}

async fn fs_delete(
    State(state): State<AppState>,
    Json(input): Json<FileDeleteInput>,
) -> Result<Json<FileDeleteOutput>> {
    state.files.delete(&input.container_id, &input.path).await?;
    Ok(Json(FileDeleteOutput {
        path: input.path,
        status: "deleted".into(),
    }))
}

async fn fs_stat(
    State(state): State<AppState>,
    Json(input): Json<FileStatInput>,
) -> Result<Json<crate::filesystem::FileInfo>> {
    let info = state.files.stat(&input.container_id, &input.path).await?;
    Ok(Json(info))
}

async fn fs_list(
    State(state): State<AppState>,
    Json(input): Json<FileListInput>,
) -> Result<Json<FileListOutput>> {
    let entries = state.files.list(&input.container_id, &input.path).await?;
    Ok(Json(FileListOutput {
        path: input.path,
        entries,
    }))
}

async fn fs_batch(
    State(state): State<AppState>,
    Json(input): Json<FileBatchInput>,
) -> Result<Json<FileBatchOutput>> {
    let mut operations = Vec::with_capacity(input.operations.len());
    for op in input.operations {
        operations.push(convert_batch_op(op)?);
    }

    let result = state.files.batch(&input.container_id, operations).await?;
    Ok(Json(result))
}

async fn fs_export_tar(
    State(state): State<AppState>,
    Json(input): Json<ExportTarInput>,
) -> Result<Response> {
    let stream = state
        .files
        .export_tar(
            &input.container_id,
            &input.path,
            &input.include_globs,
            &input.exclude_globs,
            input.compress,
        )
        .await?;

    let content_type = if input.compress {
        "application/gzip"
    } else {
        "application/x-tar"
    };

    let body = Body::from_stream(stream.map(|chunk| {
        chunk.map_err(|e| std::io::Error::other(e.to_string()))
    }));

    Ok(([(axum::http::header::CONTENT_TYPE, content_type)], body).into_response())
}

async fn fs_import_tar(
    State(state): State<AppState>,
    Json(input): Json<ImportTarInput>,
) -> Result<Json<ImportTarOutput>> {
    let data = decode_base64(&input.content)?;
    let report = state
        .files
        .import_tar(
            &input.container_id,
            &input.dest,
            Bytes::from(data),
            input.max_size_mb,
        )
        .await?;
    Ok(Json(report))
}

async fn reconcile(
    State(state): State<AppState>,
    Json(_input): Json<ReconcileInput>,
) -> Json<ReconcileOutput> {
    Json(state.reconciler.reconcile().await)
}

async fn garbage_collect(State(state): State<AppState>) -> Json<GarbageCollectOutput> {
    let stats = state.reconciler.reconcile().await;
    Json(GarbageCollectOutput {
        containers_removed: stats.gc_transients,
        execs_cleaned: stats.execs_cleaned,
    })
}

async fn list_containers(
    State(state): State<AppState>,
    Json(input): Json<ListContainersInput>,
) -> Result<Json<ListContainersOutput>> {
    let containers = state.containers.list(input.include_stopped).await?;
    Ok(Json(ListContainersOutput { containers }))
}

async fn list_execs(
    State(state): State<AppState>,
    Json(input): Json<ListExecsInput>,
) -> Result<Json<ListExecsOutput>> {
    let execs = if input.active_only {
        state.execs.list_active_in(&input.container_id).await?
    } else {
        state.execs.list_for_container(&input.container_id).await?
    };
    Ok(Json(ListExecsOutput { execs }))
}

async fn system_status(State(state): State<AppState>) -> Result<Json<SystemStatusOutput>> {
    let docker_connected = state.docker.ping().await.is_ok();
    let active_containers = state.containers.list(false).await?.len();

    Ok(Json(SystemStatusOutput {
        status: if docker_connected {
            "healthy".into()
        } else {
            "degraded".into()
        },
        docker_connected,
        database_initialized: true,
        active_containers,
        in_flight_execs: state.execs.in_flight(),
        warm_container_id: state.warm_pool.warm_container_id().await,
        version: env!("CARGO_PKG_VERSION").into(),
    }))
}

async fn metrics(State(state): State<AppState>) -> Result<Json<MetricsOutput>> {
    use sysinfo::System;

    let active_containers = state.containers.list(false).await?.len();
    let total_containers = state.containers.list(true).await?.len();
    let in_flight = state.execs.in_flight();

    let mut system = System::new();
    system.refresh_memory();

    let mut out = String::new();
    out.push_str("# TYPE workbench_containers_running gauge\n");
    out.push_str(&format!("workbench_containers_running {active_containers}\n"));
    out.push_str("# TYPE workbench_containers_total gauge\n");
    out.push_str(&format!("workbench_containers_total {total_containers}\n"));
    out.push_str("# TYPE workbench_execs_in_flight gauge\n");
    out.push_str(&format!("workbench_execs_in_flight {in_flight}\n"));
    out.push_str("# TYPE workbench_host_memory_used_bytes gauge\n");
    out.push_str(&format!(
        "workbench_host_memory_used_bytes {}\n",
        system.used_memory()
    ));

    Ok(Json(MetricsOutput { metrics: out }))
}

fn convert_batch_op(input: BatchOperationInput) -> Result<BatchOperation> {
    let op = match input.op.as_str() {
        "read" => BatchOperation::Read { path: input.path },
        "write" => BatchOperation::Write {
            path: input.path,
            content: decode_base64(input.content.as_deref().unwrap_or_default())?,
            if_match_etag: input.if_match_etag,
        },
        "delete" => BatchOperation::Delete {
            path: input.path,
            if_match_etag: input.if_match_etag,
        },
        "move" => BatchOperation::Move {
            path: input.path,
            dest_path: input.dest_path.ok_or_else(|| {
                DaemonError::Validation("move operation requires dest_path".into())
            })?,
        },
        "copy" => BatchOperation::Copy {
            path: input.path,
            dest_path: input.dest_path.ok_or_else(|| {
                DaemonError::Validation("copy operation requires dest_path".into())
            })?,
        },
        other => {
            return Err(DaemonError::Validation(format!(
                "unknown batch operation '{other}'"
            )))
        }
    };
    Ok(op)
}

fn decode_base64(raw: &str) -> Result<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(raw)
        .map_err(|e| DaemonError::Validation(format!("invalid base64 content: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_convert_batch_op_known_kinds() {
        let op = convert_batch_op(BatchOperationInput {
            op: "write".into(),
            path: "/workspace/a".into(),
            content: Some(base64::engine::general_purpose::STANDARD.encode("hello")),
            dest_path: None,
            if_match_etag: None,
        })
        .unwrap();
        match op {
            BatchOperation::Write { content, .. } => assert_eq!(content, b"hello"),
            _ => panic!("expected write"),
        }
    }

    #[test]
    fn test_convert_batch_op_rejects_unknown() {
        let err = convert_batch_op(BatchOperationInput {
            op: "chmod".into(),
            path: "/workspace/a".into(),
            content: None,
            dest_path: None,
            if_match_etag: None,
        })
        .unwrap_err();
        assert_eq!(err.category(), "validation_error");
    }

    #[test]
    fn test_move_requires_dest() {
        let err = convert_batch_op(BatchOperationInput {
            op: "move".into(),
            path: "/workspace/a".into(),
            content: None,
            dest_path: None,
            if_match_etag: None,
        })
        .unwrap_err();
        assert_eq!(err.category(), "validation_error");
    }
}
