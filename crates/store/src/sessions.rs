//! Session and project records.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use weft_domain::{Error, Project, Result, Session, SessionStatus};

use crate::db::storage;
use crate::events::EventStore;

impl EventStore {
    // ── Sessions ───────────────────────────────────────────────────

    pub fn create_session(&self, session: &Session) -> Result<()> {
        let configuration = serde_json::to_string(&session.configuration)?;
        let conn = self.db.conn.lock();
        conn.execute(
            "INSERT INTO sessions (id, project_id, name, configuration, status, input_tokens, \
             output_tokens, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                session.id,
                session.project_id,
                session.name,
                configuration,
                session.status.as_str(),
                session.input_tokens as i64,
                session.output_tokens as i64,
                session.created_at.to_rfc3339(),
                session.updated_at.to_rfc3339(),
            ],
        )
        .map_err(storage)?;
        Ok(())
    }

    pub fn get_session(&self, id: &str) -> Result<Option<Session>> {
        let conn = self.db.conn.lock();
        conn.query_row(
            "SELECT id, project_id, name, configuration, status, input_tokens, output_tokens, \
             created_at, updated_at \
             FROM sessions WHERE id = ?1",
            params![id],
            row_to_session,
        )
        .optional()
        .map_err(storage)
    }

    pub fn list_sessions(&self) -> Result<Vec<Session>> {
        let conn = self.db.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, project_id, name, configuration, status, input_tokens, output_tokens, \
                 created_at, updated_at \
                 FROM sessions ORDER BY created_at, id",
            )
            .map_err(storage)?;
        let rows = stmt
            .query_map([], row_to_session)
            .map_err(storage)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(storage)?;
        Ok(rows)
    }

    /// Update mutable session fields (name, configuration, status) and
    /// touch `updated_at`.
    pub fn update_session(&self, session: &Session) -> Result<()> {
        let configuration = serde_json::to_string(&session.configuration)?;
        let conn = self.db.conn.lock();
        let changed = conn
            .execute(
                "UPDATE sessions SET name = ?2, configuration = ?3, status = ?4, updated_at = ?5 \
                 WHERE id = ?1",
                params![
                    session.id,
                    session.name,
                    configuration,
                    session.status.as_str(),
                    Utc::now().to_rfc3339(),
                ],
            )
            .map_err(storage)?;
        if changed == 0 {
            return Err(Error::config_bare(format!(
                "session '{}' not found",
                session.id
            )));
        }
        Ok(())
    }

    /// Add a turn's token usage to the session's cumulative counters.
    pub fn record_session_usage(&self, id: &str, input_tokens: u64, output_tokens: u64) -> Result<()> {
        let conn = self.db.conn.lock();
        conn.execute(
            "UPDATE sessions SET input_tokens = input_tokens + ?2, \
             output_tokens = output_tokens + ?3, updated_at = ?4 WHERE id = ?1",
            params![
                id,
                input_tokens as i64,
                output_tokens as i64,
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(storage)?;
        Ok(())
    }

    /// Bump a session's `updated_at`.
    pub fn touch_session(&self, id: &str) -> Result<()> {
        let conn = self.db.conn.lock();
        conn.execute(
            "UPDATE sessions SET updated_at = ?2 WHERE id = ?1",
            params![id, Utc::now().to_rfc3339()],
        )
        .map_err(storage)?;
        Ok(())
    }

    pub fn archive_session(&self, id: &str) -> Result<()> {
        let conn = self.db.conn.lock();
        conn.execute(
            "UPDATE sessions SET status = 'archived', updated_at = ?2 WHERE id = ?1",
            params![id, Utc::now().to_rfc3339()],
        )
        .map_err(storage)?;
        Ok(())
    }

    // ── Projects ───────────────────────────────────────────────────

    pub fn create_project(&self, project: &Project) -> Result<()> {
        let conn = self.db.conn.lock();
        conn.execute(
            "INSERT INTO projects (id, name, created_at) VALUES (?1, ?2, ?3)",
            params![project.id, project.name, project.created_at.to_rfc3339()],
        )
        .map_err(storage)?;
        Ok(())
    }

    pub fn get_project(&self, id: &str) -> Result<Option<Project>> {
        let conn = self.db.conn.lock();
        conn.query_row(
            "SELECT id, name, created_at FROM projects WHERE id = ?1",
            params![id],
            |row| {
                let created: String = row.get(2)?;
                Ok(Project {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    created_at: parse_ts(&created),
                })
            },
        )
        .optional()
        .map_err(storage)
    }
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
    let configuration: String = row.get(3)?;
    let status: String = row.get(4)?;
    let input_tokens: i64 = row.get(5)?;
    let output_tokens: i64 = row.get(6)?;
    let created: String = row.get(7)?;
    let updated: String = row.get(8)?;
    Ok(Session {
        id: row.get(0)?,
        project_id: row.get(1)?,
        name: row.get(2)?,
        configuration: serde_json::from_str(&configuration)
            .unwrap_or(serde_json::Value::Null),
        status: SessionStatus::parse(&status).unwrap_or(SessionStatus::Active),
        input_tokens: input_tokens.max(0) as u64,
        output_tokens: output_tokens.max(0) as u64,
        created_at: parse_ts(&created),
        updated_at: parse_ts(&updated),
    })
}
