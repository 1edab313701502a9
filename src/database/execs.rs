//! Exec records

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, Row};

use super::{format_ts, parse_opt_ts, parse_ts};
use crate::error::Result;

/// The command snapshot persisted with every exec.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ExecCommand {
    pub cmd: Vec<String>,
    pub cwd: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Resource usage recorded on completion.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ExecUsage {
    pub wall_ms: u64,
    pub stdout_bytes: u64,
    pub stderr_bytes: u64,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub timeout: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub cancelled: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub error: bool,
}

/// Exec row
#[derive(Debug, Clone, serde::Serialize)]
pub struct ExecRecord {
    pub exec_id: String,
    pub container_id: String,
    pub command: ExecCommand,
    pub as_root: bool,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i64>,
    pub usage: Option<ExecUsage>,
}

impl ExecRecord {
    pub fn is_complete(&self) -> bool {
        self.ended_at.is_some()
    }
}

fn from_row(row: &Row<'_>) -> rusqlite::Result<ExecRecord> {
    let command_json: String = row.get(2)?;
    let usage_json: Option<String> = row.get(7)?;

    Ok(ExecRecord {
        exec_id: row.get(0)?,
        container_id: row.get(1)?,
        command: serde_json::from_str(&command_json).unwrap_or(ExecCommand {
            cmd: Vec::new(),
            cwd: crate::docker::WORKSPACE_DIR.to_string(),
            env: HashMap::new(),
        }),
        as_root: row.get::<_, i64>(3)? != 0,
        started_at: parse_ts(&row.get::<_, String>(4)?),
        ended_at: parse_opt_ts(row.get(5)?),
        exit_code: row.get(6)?,
        usage: usage_json.and_then(|raw| serde_json::from_str(&raw).ok()),
    })
}

const COLUMNS: &str =
    "exec_id, container_id, command, as_root, started_at, ended_at, exit_code, usage";

/// Store for exec rows
pub struct ExecStore;

impl ExecStore {
    pub fn new() -> Self {
        Self
    }

    pub fn insert(&self, conn: &Connection, record: &ExecRecord) -> Result<()> {
        let command_json = serde_json::to_string(&record.command)
            .map_err(|e| crate::error::DaemonError::Internal(e.to_string()))?;

        conn.execute(
            &format!("INSERT INTO execs ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"),
            params![
                record.exec_id,
                record.container_id,
                command_json,
                record.as_root as i64,
                format_ts(record.started_at),
                record.ended_at.map(format_ts),
                record.exit_code,
                record
                    .usage
                    .as_ref()
                    .and_then(|u| serde_json::to_string(u).ok()),
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, conn: &Connection, exec_id: &str) -> Result<Option<ExecRecord>> {
        let mut stmt =
            conn.prepare(&format!("SELECT {COLUMNS} FROM execs WHERE exec_id = ?1"))?;
        match stmt.query_row([exec_id], from_row) {
            Ok(record) => Ok(Some(record)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Finalize an exec. A no-op for rows that already completed, keeping
    /// `(ended_at, exit_code)` immutable once set.
    pub fn complete(
        &self,
        conn: &Connection,
        exec_id: &str,
        exit_code: i64,
        usage: &ExecUsage,
    ) -> Result<()> {
        let usage_json = serde_json::to_string(usage)
            .map_err(|e| crate::error::DaemonError::Internal(e.to_string()))?;

        conn.execute(
            r#"
            UPDATE execs
            SET ended_at = ?2, exit_code = ?3, usage = ?4
            WHERE exec_id = ?1 AND ended_at IS NULL
            "#,
            params![exec_id, format_ts(Utc::now()), exit_code, usage_json],
        )?;
        Ok(())
    }

    pub fn active_for_container(
        &self,
        conn: &Connection,
        container_id: &str,
    ) -> Result<Vec<ExecRecord>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM execs WHERE container_id = ?1 AND ended_at IS NULL"
        ))?;
        let rows = stmt
            .query_map([container_id], from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn count_active(&self, conn: &Connection) -> Result<i64> {
        let count = conn.query_row(
            "SELECT COUNT(*) FROM execs WHERE ended_at IS NULL",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn list_for_container(
        &self,
        conn: &Connection,
        container_id: &str,
    ) -> Result<Vec<ExecRecord>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM execs WHERE container_id = ?1 ORDER BY started_at"
        ))?;
        let rows = stmt
            .query_map([container_id], from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn completed_older_than(&self, conn: &Connection, hours: i64) -> Result<Vec<ExecRecord>> {
        let cutoff = Utc::now() - Duration::hours(hours);
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM execs WHERE ended_at IS NOT NULL AND ended_at < ?1"
        ))?;
        let rows = stmt
            .query_map([format_ts(cutoff)], from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn delete(&self, conn: &Connection, exec_id: &str) -> Result<()> {
        conn.execute("DELETE FROM execs WHERE exec_id = ?1", params![exec_id])?;
        Ok(())
    }
}

impl Default for ExecStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;

    fn record(exec_id: &str) -> ExecRecord {
        ExecRecord {
            exec_id: exec_id.to_string(),
            container_id: "c_1".to_string(),
            command: ExecCommand {
                cmd: vec!["echo".into(), "hello".into()],
                cwd: "/workspace".into(),
                env: HashMap::new(),
            },
            as_root: false,
            started_at: Utc::now(),
            ended_at: None,
            exit_code: None,
            usage: None,
        }
    }

    #[test]
    fn test_insert_roundtrips_command() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.conn.try_lock().unwrap();

        db.execs.insert(&conn, &record("e_1")).unwrap();

        let loaded = db.execs.get(&conn, "e_1").unwrap().unwrap();
        assert_eq!(loaded.command.cmd, vec!["echo", "hello"]);
        assert_eq!(loaded.command.cwd, "/workspace");
        assert!(!loaded.is_complete());
        assert!(loaded.exit_code.is_none());
    }

    #[test]
    fn test_complete_sets_both_fields_once() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.conn.try_lock().unwrap();

        db.execs.insert(&conn, &record("e_1")).unwrap();

        let usage = ExecUsage {
            wall_ms: 12,
            stdout_bytes: 6,
            ..Default::default()
        };
        db.execs.complete(&conn, "e_1", 0, &usage).unwrap();

        let loaded = db.execs.get(&conn, "e_1").unwrap().unwrap();
        assert!(loaded.is_complete());
        assert_eq!(loaded.exit_code, Some(0));
        assert_eq!(loaded.usage.unwrap().wall_ms, 12);

        // A second completion must not overwrite the recorded result.
        db.execs
            .complete(&conn, "e_1", -2, &ExecUsage::default())
            .unwrap();
        let loaded = db.execs.get(&conn, "e_1").unwrap().unwrap();
        assert_eq!(loaded.exit_code, Some(0));
    }

    #[test]
    fn test_active_and_retention_queries() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.conn.try_lock().unwrap();

        db.execs.insert(&conn, &record("e_active")).unwrap();

        let mut done = record("e_done");
        done.ended_at = Some(Utc::now() - Duration::hours(48));
        done.exit_code = Some(0);
        db.execs.insert(&conn, &done).unwrap();

        let active = db.execs.active_for_container(&conn, "c_1").unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].exec_id, "e_active");

        let old = db.execs.completed_older_than(&conn, 24).unwrap();
        assert_eq!(old.len(), 1);
        assert_eq!(old[0].exec_id, "e_done");

        assert_eq!(db.execs.count_active(&conn).unwrap(), 1);
    }
}
