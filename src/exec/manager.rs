//! Exec admission, streaming workers and cancellation

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bollard::container::LogOutput;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::StreamExt;
use serde_json::json;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::audit::{self, AuditEvent};
use crate::database::{Database, ExecCommand, ExecRecord, ExecUsage};
use crate::docker::{DockerService, WORKSPACE_DIR};
use crate::error::{DaemonError, Result};
use crate::security::SecurityProfile;

use super::{Chunk, OutputStreamer, StreamKind};

/// Hours an exec idempotency key stays valid.
const IDEMPOTENCY_KEY_TTL_HOURS: i64 = 24;

/// A command submission.
#[derive(Debug, Clone)]
pub struct ExecSubmission {
    pub container_id: String,
    pub cmd: Vec<String>,
    pub cwd: Option<String>,
    pub env: Option<HashMap<String, String>>,
    pub as_root: bool,
    pub timeout_s: Option<u64>,
    pub idempotency_key: Option<String>,
}

/// Runs commands inside containers, capping concurrency per container and
/// feeding output into the streamer as it arrives.
pub struct ExecManager {
    docker: DockerService,
    db: Arc<Database>,
    streamer: Arc<OutputStreamer>,
    security: SecurityProfile,
    max_concurrent: usize,
    default_timeout_s: u64,

    semaphores: DashMap<String, Arc<Semaphore>>,
    cancellations: DashMap<String, CancellationToken>,
    // key -> (exec_id, created_at); guarded by an async mutex because the
    // critical section extends across the exec row insert.
    idempotency_keys: Mutex<HashMap<String, (String, DateTime<Utc>)>>,
    in_flight: AtomicUsize,
}

impl ExecManager {
    pub fn new(
        docker: DockerService,
        db: Arc<Database>,
        streamer: Arc<OutputStreamer>,
        security: SecurityProfile,
        max_concurrent: usize,
        default_timeout_s: u64,
    ) -> Self {
        Self {
            docker,
            db,
            streamer,
            security,
            max_concurrent,
            default_timeout_s,
            semaphores: DashMap::new(),
            cancellations: DashMap::new(),
            idempotency_keys: Mutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
        }
    }

    pub fn streamer(&self) -> &Arc<OutputStreamer> {
        &self.streamer
    }

    /// Execs currently admitted or waiting for admission.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Submit a command for asynchronous execution and return its exec id.
    /// A repeated submission with the same idempotency key inside 24h
    /// returns the original exec id without running anything.
    pub async fn submit(self: &Arc<Self>, submission: ExecSubmission) -> Result<String> {
        // The key map lock is held until the exec row is persisted so two
        // clients racing on one key cannot both create an exec.
        let mut key_guard = match &submission.idempotency_key {
            Some(_) => Some(self.idempotency_keys.lock().await),
            None => None,
        };

        if let (Some(key), Some(guard)) = (&submission.idempotency_key, key_guard.as_mut()) {
            if let Some((exec_id, created_at)) = guard.get(key.as_str()) {
                let age = Utc::now() - *created_at;
                if age < chrono::Duration::hours(IDEMPOTENCY_KEY_TTL_HOURS) {
                    info!(exec_id = %exec_id, "returning existing exec for idempotency key");
                    return Ok(exec_id.clone());
                }
                guard.remove(key.as_str());
            }
        }

        let container = {
            let conn = self.db.conn().await;
            self.db
                .containers
                .get(&conn, &submission.container_id)?
                .ok_or_else(|| {
                    DaemonError::ContainerNotFound(submission.container_id.clone())
                })?
        };

        let exec_id = format!("e_{}", Uuid::new_v4());
        let command = ExecCommand {
            cmd: submission.cmd.clone(),
            cwd: submission
                .cwd
                .clone()
                .unwrap_or_else(|| WORKSPACE_DIR.to_string()),
            env: submission.env.clone().unwrap_or_default(),
        };

        let record = ExecRecord {
            exec_id: exec_id.clone(),
            container_id: container.id.clone(),
            command: command.clone(),
            as_root: submission.as_root,
            started_at: Utc::now(),
            ended_at: None,
            exit_code: None,
            usage: None,
        };

        {
            let conn = self.db.conn().await;
            self.db.execs.insert(&conn, &record)?;
        }

        self.streamer.init(&exec_id);

        if let (Some(key), Some(guard)) = (&submission.idempotency_key, key_guard.as_mut()) {
            guard.insert(key.clone(), (exec_id.clone(), Utc::now()));
        }
        drop(key_guard);

        let token = CancellationToken::new();
        self.cancellations.insert(exec_id.clone(), token.clone());
        self.in_flight.fetch_add(1, Ordering::SeqCst);

        audit::record(
            AuditEvent::ExecStart,
            Some(&container.id),
            json!({"exec_id": &exec_id, "cmd": &command.cmd, "as_root": submission.as_root}),
        );

        let manager = Arc::clone(self);
        let docker_id = container.docker_id.clone();
        let worker_exec_id = exec_id.clone();
        let timeout_s = submission.timeout_s.unwrap_or(self.default_timeout_s);
        tokio::spawn(async move {
            manager
                .run_worker(
                    worker_exec_id,
                    container.id,
                    docker_id,
                    command,
                    submission.as_root,
                    timeout_s,
                    token,
                )
                .await;
        });

        Ok(exec_id)
    }

    /// Poll output chunks after a cursor.
    pub async fn poll(&self, exec_id: &str, after_seq: Option<u64>) -> Result<(Vec<Chunk>, bool)> {
        {
            let conn = self.db.conn().await;
            if self.db.execs.get(&conn, exec_id)?.is_none() {
                return Err(DaemonError::ExecNotFound(exec_id.to_string()));
            }
        }

        Ok(self.streamer.poll(exec_id, after_seq))
    }

    /// Cooperatively cancel an exec.
    ///
    /// The cancellation changes observed state: pollers see a
    /// `[CANCELLED]` stderr chunk, then a completion with exit code -2 and
    /// `usage.cancelled`, and no further output is delivered. The engine
    /// cannot always interrupt the underlying process, which may keep
    /// running inside the container until it exits on its own.
    pub async fn cancel(&self, exec_id: &str) -> Result<()> {
        let record = {
            let conn = self.db.conn().await;
            self.db
                .execs
                .get(&conn, exec_id)?
                .ok_or_else(|| DaemonError::ExecNotFound(exec_id.to_string()))?
        };

        if record.is_complete() {
            return Ok(());
        }

        audit::record(
            AuditEvent::ExecCancel,
            Some(&record.container_id),
            json!({"exec_id": exec_id}),
        );

        if let Some(token) = self.cancellations.get(exec_id) {
            token.cancel();
            return Ok(());
        }

        // No live worker (lost over a restart, or already torn down):
        // record the cancellation directly so pollers still observe it.
        self.streamer
            .append(exec_id, StreamKind::Stderr, Bytes::from_static(b"[CANCELLED]\n"));
        let usage = ExecUsage {
            cancelled: true,
            ..Default::default()
        };
        self.streamer.complete(exec_id, -2, usage.clone());
        let conn = self.db.conn().await;
        self.db.execs.complete(&conn, exec_id, -2, &usage)?;
        Ok(())
    }

    /// Execs still running in a container.
    pub async fn list_active_in(&self, container_id: &str) -> Result<Vec<ExecRecord>> {
        let conn = self.db.conn().await;
        self.db.execs.active_for_container(&conn, container_id)
    }

    pub async fn list_for_container(&self, container_id: &str) -> Result<Vec<ExecRecord>> {
        let conn = self.db.conn().await;
        self.db.execs.list_for_container(&conn, container_id)
    }

    /// Drop exec rows completed more than `hours` ago, along with their
    /// output buffers and expired idempotency keys.
    pub async fn cleanup_older_than(&self, hours: i64) -> Result<usize> {
        let old = {
            let conn = self.db.conn().await;
            self.db.execs.completed_older_than(&conn, hours)?
        };

        let mut count = 0;
        for record in &old {
            self.streamer.cleanup(&record.exec_id);
            self.cancellations.remove(&record.exec_id);
            let conn = self.db.conn().await;
            self.db.execs.delete(&conn, &record.exec_id)?;
            count += 1;
        }

        let expired = self.expire_idempotency_keys().await;
        if count > 0 || expired > 0 {
            info!(execs = count, keys = expired, "cleaned up old execs");
        }
        Ok(count)
    }

    /// Remove idempotency keys past their TTL. Returns how many expired.
    pub async fn expire_idempotency_keys(&self) -> usize {
        let cutoff = Utc::now() - chrono::Duration::hours(IDEMPOTENCY_KEY_TTL_HOURS);
        let mut keys = self.idempotency_keys.lock().await;
        let before = keys.len();
        keys.retain(|_, (_, created_at)| *created_at >= cutoff);
        before - keys.len()
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_worker(
        &self,
        exec_id: String,
        container_id: String,
        docker_id: String,
        command: ExecCommand,
        as_root: bool,
        timeout_s: u64,
        token: CancellationToken,
    ) {
        let started = Instant::now();
        let outcome = self
            .drive_exec(
                &exec_id,
                &container_id,
                &docker_id,
                &command,
                as_root,
                timeout_s,
                &token,
                started,
            )
            .await;

        let (exit_code, mut usage) = outcome;
        usage.wall_ms = started.elapsed().as_millis() as u64;

        self.streamer.complete(&exec_id, exit_code, usage.clone());

        {
            let conn = self.db.conn().await;
            if let Err(e) = self.db.execs.complete(&conn, &exec_id, exit_code, &usage) {
                error!(exec_id = %exec_id, "failed to finalize exec row: {}", e);
            }
        }

        audit::record(
            AuditEvent::ExecComplete,
            Some(&container_id),
            json!({"exec_id": &exec_id, "exit_code": exit_code, "wall_ms": usage.wall_ms}),
        );

        self.cancellations.remove(&exec_id);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    /// Run one exec end to end and return `(exit_code, usage)`. Splitting
    /// this out keeps the finalization path in `run_worker` unconditional.
    #[allow(clippy::too_many_arguments)]
    async fn drive_exec(
        &self,
        exec_id: &str,
        container_id: &str,
        docker_id: &str,
        command: &ExecCommand,
        as_root: bool,
        timeout_s: u64,
        token: &CancellationToken,
        started: Instant,
    ) -> (i64, ExecUsage) {
        let mut usage = ExecUsage::default();

        let semaphore = self
            .semaphores
            .entry(container_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.max_concurrent)))
            .clone();

        // Admission is FIFO under contention; a cancel before admission
        // completes the exec without ever reaching the engine.
        let permit = tokio::select! {
            permit = semaphore.acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    usage.error = true;
                    return (-1, usage);
                }
            },
            _ = token.cancelled() => {
                self.emit_cancelled(exec_id);
                usage.cancelled = true;
                return (-2, usage);
            }
        };
        let _permit = permit;

        let user = self.security.exec_user(as_root, container_id);
        let env = if command.env.is_empty() {
            None
        } else {
            Some(&command.env)
        };

        let (engine_exec_id, mut stream) = match self
            .docker
            .exec_stream(docker_id, command.cmd.clone(), &command.cwd, env, &user)
            .await
        {
            Ok(attached) => attached,
            Err(e) => {
                warn!(exec_id, "failed to start exec: {}", e);
                usage.error = true;
                return (-1, usage);
            }
        };

        let deadline = started + Duration::from_secs(timeout_s);
        let timeout = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline));
        tokio::pin!(timeout);

        loop {
            tokio::select! {
                chunk = stream.next() => match chunk {
                    Some(Ok(LogOutput::StdOut { message } | LogOutput::Console { message })) => {
                        usage.stdout_bytes += message.len() as u64;
                        self.streamer.append(exec_id, StreamKind::Stdout, message);
                    }
                    Some(Ok(LogOutput::StdErr { message })) => {
                        usage.stderr_bytes += message.len() as u64;
                        self.streamer.append(exec_id, StreamKind::Stderr, message);
                    }
                    Some(Ok(LogOutput::StdIn { .. })) => {}
                    Some(Err(e)) => {
                        warn!(exec_id, "exec stream failed: {}", e);
                        usage.error = true;
                        return (-1, usage);
                    }
                    None => break,
                },
                _ = token.cancelled() => {
                    self.emit_cancelled(exec_id);
                    usage.cancelled = true;
                    return (-2, usage);
                }
                _ = &mut timeout => {
                    warn!(exec_id, timeout_s, "exec timed out");
                    usage.timeout = true;
                    return (-1, usage);
                }
            }
        }

        let exit_code = match self.docker.exec_exit_code(&engine_exec_id).await {
            Ok(Some(code)) => code,
            Ok(None) => 0,
            Err(e) => {
                warn!(exec_id, "failed to read exec exit code: {}", e);
                usage.error = true;
                -1
            }
        };

        (exit_code, usage)
    }

    fn emit_cancelled(&self, exec_id: &str) {
        self.streamer.append(
            exec_id,
            StreamKind::Stderr,
            Bytes::from_static(b"[CANCELLED]\n"),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (Arc<ExecManager>, Arc<Database>) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        // Lazy client: nothing talks to an engine until a call is made.
        let docker = DockerService::new().unwrap();
        let streamer = Arc::new(OutputStreamer::new());
        let manager = Arc::new(ExecManager::new(
            docker,
            Arc::clone(&db),
            streamer,
            SecurityProfile::default(),
            4,
            600,
        ));
        (manager, db)
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

    fn submission(container_id: &str, key: Option<&str>) -> ExecSubmission {
        ExecSubmission {
            container_id: container_id.to_string(),
            cmd: vec!["true".into()],
            cwd: None,
            env: None,
            as_root: false,
            timeout_s: Some(5),
            idempotency_key: key.map(String::from),
        }
    }

    #[tokio::test]
    async fn test_submit_unknown_container() {
        let (manager, _db) = manager();
        let err = manager.submit(submission("c_missing", None)).await.unwrap_err();
        assert_eq!(err.category(), "container_not_found");
    }

    #[tokio::test]
    async fn test_poll_and_cancel_unknown_exec() {
        let (manager, _db) = manager();

        let err = manager.poll("e_missing", None).await.unwrap_err();
        assert_eq!(err.category(), "exec_not_found");

        let err = manager.cancel("e_missing").await.unwrap_err();
        assert_eq!(err.category(), "exec_not_found");
    }

    #[tokio::test]
    async fn test_idempotent_submission_returns_same_exec() {
        let (manager, db) = manager();
        seed_container(&db, "c_1").await;

        let first = manager
            .submit(submission("c_1", Some("K")))
            .await
            .unwrap();
        let second = manager
            .submit(submission("c_1", Some("K")))
            .await
            .unwrap();
        assert_eq!(first, second);

        // A different key produces a fresh exec.
        let third = manager
            .submit(submission("c_1", Some("K2")))
            .await
            .unwrap();
        assert_ne!(first, third);
    }

    #[tokio::test]
    async fn test_cancel_without_live_worker_records_cancellation() {
        let (manager, db) = manager();
        seed_container(&db, "c_1").await;

        // An exec row with no worker, as left behind by a restart.
        let record = ExecRecord {
            exec_id: "e_orphan".into(),
            container_id: "c_1".into(),
            command: ExecCommand {
                cmd: vec!["sleep".into(), "60".into()],
                cwd: "/workspace".into(),
                env: HashMap::new(),
            },
            as_root: false,
            started_at: Utc::now(),
            ended_at: None,
            exit_code: None,
            usage: None,
        };
        {
            let conn = db.conn().await;
            db.execs.insert(&conn, &record).unwrap();
        }
        manager.streamer().init("e_orphan");

        manager.cancel("e_orphan").await.unwrap();

        let (chunks, complete) = manager.poll("e_orphan", None).await.unwrap();
        assert!(complete);
        let last = chunks.last().unwrap();
        match last {
            Chunk::Completion { exit_code, usage, .. } => {
                assert_eq!(*exit_code, -2);
                assert!(usage.cancelled);
            }
            _ => panic!("expected completion chunk"),
        }
        // The [CANCELLED] marker precedes the completion.
        assert!(chunks.iter().any(|c| matches!(
            c,
            Chunk::Output { stream: StreamKind::Stderr, data, .. } if data.as_ref() == b"[CANCELLED]\n"
        )));

        let conn = db.conn().await;
        let row = db.execs.get(&conn, "e_orphan").unwrap().unwrap();
        assert_eq!(row.exit_code, Some(-2));
        assert!(row.is_complete());

        // Cancelling a completed exec is a no-op.
        drop(conn);
        manager.cancel("e_orphan").await.unwrap();
    }

    #[tokio::test]
    async fn test_cleanup_on_empty_store() {
        let (manager, _db) = manager();
        assert_eq!(manager.cleanup_older_than(24).await.unwrap(), 0);
    }
}
