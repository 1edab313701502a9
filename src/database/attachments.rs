//! Attachment records

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};

use super::{format_ts, parse_opt_ts, parse_ts};
use crate::error::Result;

/// A client session attached to a container
#[derive(Debug, Clone, serde::Serialize)]
pub struct AttachmentRecord {
    pub id: i64,
    pub container_id: String,
    pub client_name: String,
    pub session_id: String,
    pub attached_at: DateTime<Utc>,
    pub detached_at: Option<DateTime<Utc>>,
}

fn from_row(row: &Row<'_>) -> rusqlite::Result<AttachmentRecord> {
    Ok(AttachmentRecord {
        id: row.get(0)?,
        container_id: row.get(1)?,
        client_name: row.get(2)?,
        session_id: row.get(3)?,
        attached_at: parse_ts(&row.get::<_, String>(4)?),
        detached_at: parse_opt_ts(row.get(5)?),
    })
}

/// Store for attachment rows
pub struct AttachmentStore;

impl AttachmentStore {
    pub fn new() -> Self {
        Self
    }

    pub fn attach(
        &self,
        conn: &Connection,
        container_id: &str,
        client_name: &str,
        session_id: &str,
    ) -> Result<AttachmentRecord> {
        let now = Utc::now();
        conn.execute(
            r#"
            INSERT INTO attachments (container_id, client_name, session_id, attached_at)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![container_id, client_name, session_id, format_ts(now)],
        )?;

        Ok(AttachmentRecord {
            id: conn.last_insert_rowid(),
            container_id: container_id.to_string(),
            client_name: client_name.to_string(),
            session_id: session_id.to_string(),
            attached_at: now,
            detached_at: None,
        })
    }

    pub fn active_for_container(
        &self,
        conn: &Connection,
        container_id: &str,
    ) -> Result<Vec<AttachmentRecord>> {
        let mut stmt = conn.prepare(
            r#"
            SELECT id, container_id, client_name, session_id, attached_at, detached_at
            FROM attachments
            WHERE container_id = ?1 AND detached_at IS NULL
            "#,
        )?;
        let rows = stmt
            .query_map([container_id], from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn detach(&self, conn: &Connection, attachment_id: i64) -> Result<()> {
        conn.execute(
            "UPDATE attachments SET detached_at = ?2 WHERE id = ?1 AND detached_at IS NULL",
            params![attachment_id, format_ts(Utc::now())],
        )?;
        Ok(())
    }

    pub fn detach_all_for_container(&self, conn: &Connection, container_id: &str) -> Result<usize> {
        let count = conn.execute(
            "UPDATE attachments SET detached_at = ?2 WHERE container_id = ?1 AND detached_at IS NULL",
            params![container_id, format_ts(Utc::now())],
        )?;
        Ok(count)
    }
}

impl Default for AttachmentStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;

    fn seed_container(conn: &Connection, id: &str) {
        conn.execute(
            r#"
            INSERT INTO containers (id, docker_id, image, persistent, created_at, last_seen, status)
            VALUES (?1, ?2, 'alpine', 0, '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z', 'running')
            "#,
            params![id, format!("docker_{id}")],
        )
        .unwrap();
    }

    #[test]
    fn test_attach_and_detach() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.conn.try_lock().unwrap();
        seed_container(&conn, "c_1");

        let attachment = db.attachments.attach(&conn, "c_1", "cli", "s-1").unwrap();
        assert!(attachment.detached_at.is_none());

        let active = db.attachments.active_for_container(&conn, "c_1").unwrap();
        assert_eq!(active.len(), 1);

        db.attachments.detach(&conn, attachment.id).unwrap();
        assert!(db
            .attachments
            .active_for_container(&conn, "c_1")
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_detach_all() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.conn.try_lock().unwrap();
        seed_container(&conn, "c_1");

        db.attachments.attach(&conn, "c_1", "cli", "s-1").unwrap();
        db.attachments.attach(&conn, "c_1", "ide", "s-2").unwrap();

        let detached = db.attachments.detach_all_for_container(&conn, "c_1").unwrap();
        assert_eq!(detached, 2);
        assert!(db
            .attachments
            .active_for_container(&conn, "c_1")
            .unwrap()
            .is_empty());
    }
}
