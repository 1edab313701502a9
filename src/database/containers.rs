//! Container records

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};

use super::{format_ts, parse_opt_ts, parse_ts};
use crate::error::Result;

/// Externally visible container status
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Stopped,
    Running,
    Error,
}

impl ContainerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerStatus::Stopped => "stopped",
            ContainerStatus::Running => "running",
            ContainerStatus::Error => "error",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "running" => ContainerStatus::Running,
            "error" => ContainerStatus::Error,
            _ => ContainerStatus::Stopped,
        }
    }
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Container row
#[derive(Debug, Clone, serde::Serialize)]
pub struct ContainerRecord {
    pub id: String,
    pub docker_id: String,
    pub alias: Option<String>,
    pub image: String,
    pub digest: Option<String>,
    pub persistent: bool,
    pub created_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub ttl_s: Option<i64>,
    pub volume_name: Option<String>,
    pub status: ContainerStatus,
    pub idempotency_key: Option<String>,
    pub idempotency_key_created_at: Option<DateTime<Utc>>,
}

const COLUMNS: &str = "id, docker_id, alias, image, digest, persistent, created_at, last_seen, \
                       ttl_s, volume_name, status, idempotency_key, idempotency_key_created_at";

fn from_row(row: &Row<'_>) -> rusqlite::Result<ContainerRecord> {
    Ok(ContainerRecord {
        id: row.get(0)?,
        docker_id: row.get(1)?,
        alias: row.get(2)?,
        image: row.get(3)?,
        digest: row.get(4)?,
        persistent: row.get::<_, i64>(5)? != 0,
        created_at: parse_ts(&row.get::<_, String>(6)?),
        last_seen: parse_ts(&row.get::<_, String>(7)?),
        ttl_s: row.get(8)?,
        volume_name: row.get(9)?,
        status: ContainerStatus::parse(&row.get::<_, String>(10)?),
        idempotency_key: row.get(11)?,
        idempotency_key_created_at: parse_opt_ts(row.get(12)?),
    })
}

/// Store for container rows
pub struct ContainerStore;

impl ContainerStore {
    pub fn new() -> Self {
        Self
    }

    /// Insert a container row. Surfaces UNIQUE violations unchanged so the
    /// caller can resolve alias and idempotency races.
    pub fn insert(
        &self,
        conn: &Connection,
        record: &ContainerRecord,
    ) -> rusqlite::Result<()> {
        conn.execute(
            &format!("INSERT INTO containers ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"),
            params![
                record.id,
                record.docker_id,
                record.alias,
                record.image,
                record.digest,
                record.persistent as i64,
                format_ts(record.created_at),
                format_ts(record.last_seen),
                record.ttl_s,
                record.volume_name,
                record.status.as_str(),
                record.idempotency_key,
                record.idempotency_key_created_at.map(format_ts),
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, conn: &Connection, id: &str) -> Result<Option<ContainerRecord>> {
        self.query_one(conn, &format!("SELECT {COLUMNS} FROM containers WHERE id = ?1"), id)
    }

    pub fn get_by_alias(&self, conn: &Connection, alias: &str) -> Result<Option<ContainerRecord>> {
        self.query_one(
            conn,
            &format!("SELECT {COLUMNS} FROM containers WHERE alias = ?1"),
            alias,
        )
    }

    pub fn get_by_docker_id(
        &self,
        conn: &Connection,
        docker_id: &str,
    ) -> Result<Option<ContainerRecord>> {
        self.query_one(
            conn,
            &format!("SELECT {COLUMNS} FROM containers WHERE docker_id = ?1"),
            docker_id,
        )
    }

    pub fn get_by_idempotency_key(
        &self,
        conn: &Connection,
        key: &str,
    ) -> Result<Option<ContainerRecord>> {
        self.query_one(
            conn,
            &format!("SELECT {COLUMNS} FROM containers WHERE idempotency_key = ?1"),
            key,
        )
    }

    /// Lookup by id first, then by alias.
    pub fn get_by_identifier(
        &self,
        conn: &Connection,
        identifier: &str,
    ) -> Result<Option<ContainerRecord>> {
        if let Some(record) = self.get(conn, identifier)? {
            return Ok(Some(record));
        }
        self.get_by_alias(conn, identifier)
    }

    pub fn list(&self, conn: &Connection, include_stopped: bool) -> Result<Vec<ContainerRecord>> {
        let sql = if include_stopped {
            format!("SELECT {COLUMNS} FROM containers ORDER BY created_at")
        } else {
            format!("SELECT {COLUMNS} FROM containers WHERE status = 'running' ORDER BY created_at")
        };

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], from_row)?.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn list_by_status(
        &self,
        conn: &Connection,
        status: ContainerStatus,
        persistent: Option<bool>,
    ) -> Result<Vec<ContainerRecord>> {
        let mut sql = format!("SELECT {COLUMNS} FROM containers WHERE status = ?1");
        if persistent.is_some() {
            sql.push_str(" AND persistent = ?2");
        }

        let mut stmt = conn.prepare(&sql)?;
        let rows = match persistent {
            Some(p) => stmt
                .query_map(params![status.as_str(), p as i64], from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?,
            None => stmt
                .query_map(params![status.as_str()], from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?,
        };
        Ok(rows)
    }

    /// Non-persistent containers last seen before `cutoff`.
    pub fn transients_older_than(
        &self,
        conn: &Connection,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<ContainerRecord>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM containers WHERE persistent = 0 AND last_seen < ?1"
        ))?;
        let rows = stmt
            .query_map(params![format_ts(cutoff)], from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn update_status(
        &self,
        conn: &Connection,
        id: &str,
        status: ContainerStatus,
    ) -> Result<()> {
        conn.execute(
            "UPDATE containers SET status = ?2, last_seen = ?3 WHERE id = ?1",
            params![id, status.as_str(), format_ts(Utc::now())],
        )?;
        Ok(())
    }

    pub fn update_last_seen(&self, conn: &Connection, id: &str) -> Result<()> {
        conn.execute(
            "UPDATE containers SET last_seen = ?2 WHERE id = ?1",
            params![id, format_ts(Utc::now())],
        )?;
        Ok(())
    }

    /// Release an expired idempotency key so the same key can be used for
    /// a fresh creation.
    pub fn clear_idempotency_key(&self, conn: &Connection, id: &str) -> Result<()> {
        conn.execute(
            "UPDATE containers SET idempotency_key = NULL, idempotency_key_created_at = NULL WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    /// Best-effort alias assignment. Returns false when the alias is
    /// already taken instead of failing.
    pub fn try_set_alias(&self, conn: &Connection, id: &str, alias: &str) -> Result<bool> {
        match conn.execute(
            "UPDATE containers SET alias = ?2 WHERE id = ?1",
            params![id, alias],
        ) {
            Ok(_) => Ok(true),
            Err(e) if super::is_unique_violation(&e, "alias") => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete a container and detach its active attachments in one
    /// transaction.
    pub fn delete_with_attachments(&self, conn: &mut Connection, id: &str) -> Result<()> {
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE attachments SET detached_at = ?2 WHERE container_id = ?1 AND detached_at IS NULL",
            params![id, format_ts(Utc::now())],
        )?;
        tx.execute("DELETE FROM containers WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(())
    }

    pub fn delete(&self, conn: &Connection, id: &str) -> Result<()> {
        conn.execute("DELETE FROM containers WHERE id = ?1", params![id])?;
        Ok(())
    }

    fn query_one(
        &self,
        conn: &Connection,
        sql: &str,
        param: &str,
    ) -> Result<Option<ContainerRecord>> {
        let mut stmt = conn.prepare(sql)?;
        let result = stmt.query_row([param], from_row);
        match result {
            Ok(record) => Ok(Some(record)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl Default for ContainerStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;

    fn record(id: &str, alias: Option<&str>) -> ContainerRecord {
        ContainerRecord {
            id: id.to_string(),
            docker_id: format!("docker_{id}"),
            alias: alias.map(String::from),
            image: "docker.io/library/alpine:latest".to_string(),
            digest: None,
            persistent: false,
            created_at: Utc::now(),
            last_seen: Utc::now(),
            ttl_s: None,
            volume_name: Some(format!("transient_{id}")),
            status: ContainerStatus::Stopped,
            idempotency_key: None,
            idempotency_key_created_at: None,
        }
    }

    #[test]
    fn test_insert_and_lookup_by_identifier() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.conn.try_lock().unwrap();

        db.containers.insert(&conn, &record("c_1", Some("dev"))).unwrap();

        let by_id = db.containers.get_by_identifier(&conn, "c_1").unwrap().unwrap();
        assert_eq!(by_id.alias.as_deref(), Some("dev"));

        let by_alias = db.containers.get_by_identifier(&conn, "dev").unwrap().unwrap();
        assert_eq!(by_alias.id, "c_1");

        assert!(db.containers.get_by_identifier(&conn, "missing").unwrap().is_none());
    }

    #[test]
    fn test_list_filters_stopped() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.conn.try_lock().unwrap();

        db.containers.insert(&conn, &record("c_1", None)).unwrap();
        let mut running = record("c_2", None);
        running.status = ContainerStatus::Running;
        db.containers.insert(&conn, &running).unwrap();

        assert_eq!(db.containers.list(&conn, false).unwrap().len(), 1);
        assert_eq!(db.containers.list(&conn, true).unwrap().len(), 2);
    }

    #[test]
    fn test_try_set_alias_conflict_is_soft() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.conn.try_lock().unwrap();

        db.containers.insert(&conn, &record("c_1", Some("dev"))).unwrap();
        db.containers.insert(&conn, &record("c_2", None)).unwrap();

        assert!(!db.containers.try_set_alias(&conn, "c_2", "dev").unwrap());
        assert!(db.containers.try_set_alias(&conn, "c_2", "dev2").unwrap());
    }

    #[test]
    fn test_delete_with_attachments_detaches() {
        let db = Database::open_in_memory().unwrap();
        let mut conn = db.conn.try_lock().unwrap();

        db.containers.insert(&conn, &record("c_1", None)).unwrap();
        db.attachments
            .attach(&conn, "c_1", "client", "session-1")
            .unwrap();

        db.containers.delete_with_attachments(&mut conn, "c_1").unwrap();

        assert!(db.containers.get(&conn, "c_1").unwrap().is_none());
        let detached: Option<String> = conn
            .query_row(
                "SELECT detached_at FROM attachments WHERE container_id = 'c_1'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert!(detached.is_some());
    }

    #[test]
    fn test_transients_older_than() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.conn.try_lock().unwrap();

        let mut old = record("c_old", None);
        old.last_seen = Utc::now() - chrono::Duration::days(10);
        db.containers.insert(&conn, &old).unwrap();

        let mut persistent = record("c_persist", None);
        persistent.persistent = true;
        persistent.volume_name = Some("persist_c_persist".into());
        persistent.last_seen = Utc::now() - chrono::Duration::days(10);
        db.containers.insert(&conn, &persistent).unwrap();

        db.containers.insert(&conn, &record("c_fresh", None)).unwrap();

        let cutoff = Utc::now() - chrono::Duration::days(7);
        let old_transients = db.containers.transients_older_than(&conn, cutoff).unwrap();
        assert_eq!(old_transients.len(), 1);
        assert_eq!(old_transients[0].id, "c_old");
    }
}
