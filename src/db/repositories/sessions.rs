use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use crate::db::{
    connection::Database,
    helpers::{parse_datetime, parse_optional_datetime, parse_status, to_i64, to_u64},
    models::{MonitorSession, SessionStatus},
};

const SESSION_COLUMNS: &str =
    "id, started_at, stopped_at, status, frames_processed, skipped_cycles, created_at, updated_at";

fn row_to_session(row: &Row) -> Result<MonitorSession> {
    let started_at: String = row.get("started_at")?;
    let stopped_at: Option<String> = row.get("stopped_at")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;
    let status: String = row.get("status")?;
    let frames_processed: i64 = row.get("frames_processed")?;
    let skipped_cycles: i64 = row.get("skipped_cycles")?;

    Ok(MonitorSession {
        id: row.get("id")?,
        started_at: parse_datetime(&started_at, "started_at")?,
        stopped_at: parse_optional_datetime(stopped_at, "stopped_at")?,
        status: parse_status(&status)?,
        frames_processed: to_u64(frames_processed, "frames_processed")?,
        skipped_cycles: to_u64(skipped_cycles, "skipped_cycles")?,
        created_at: parse_datetime(&created_at, "created_at")?,
        updated_at: parse_datetime(&updated_at, "updated_at")?,
    })
}

impl Database {
    pub async fn insert_session(&self, session: &MonitorSession) -> Result<()> {
        let record = session.clone();
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO monitor_sessions (id, started_at, stopped_at, status, frames_processed, skipped_cycles, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    record.id,
                    record.started_at.to_rfc3339(),
                    record.stopped_at.as_ref().map(|dt| dt.to_rfc3339()),
                    record.status.as_str(),
                    to_i64(record.frames_processed)?,
                    to_i64(record.skipped_cycles)?,
                    record.created_at.to_rfc3339(),
                    record.updated_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn update_session_progress(
        &self,
        session_id: &str,
        frames_processed: u64,
        skipped_cycles: u64,
        updated_at: DateTime<Utc>,
    ) -> Result<()> {
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            conn.execute(
                "UPDATE monitor_sessions
                 SET frames_processed = ?1,
                     skipped_cycles = ?2,
                     updated_at = ?3
                 WHERE id = ?4",
                params![
                    to_i64(frames_processed)?,
                    to_i64(skipped_cycles)?,
                    updated_at.to_rfc3339(),
                    session_id,
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn mark_session_status(
        &self,
        session_id: &str,
        status: SessionStatus,
        stopped_at: Option<DateTime<Utc>>,
        updated_at: DateTime<Utc>,
    ) -> Result<()> {
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            let rows_affected = conn.execute(
                "UPDATE monitor_sessions
                 SET status = ?1,
                     stopped_at = ?2,
                     updated_at = ?3
                 WHERE id = ?4",
                params![
                    status.as_str(),
                    stopped_at.map(|dt| dt.to_rfc3339()),
                    updated_at.to_rfc3339(),
                    session_id,
                ],
            )?;

            if rows_affected == 0 {
                return Err(anyhow!("Session not found"));
            }
            Ok(())
        })
        .await
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Option<MonitorSession>> {
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM monitor_sessions WHERE id = ?1"
            ))?;

            let session = stmt
                .query_row(params![session_id], |row| Ok(row_to_session(row)))
                .optional()?;
            session.transpose()
        })
        .await
    }

    /// Sessions still marked `Running`, newest first.
    pub async fn get_incomplete_sessions(&self) -> Result<Vec<MonitorSession>> {
        self.execute(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SESSION_COLUMNS}
                 FROM monitor_sessions
                 WHERE status = 'Running'
                 ORDER BY started_at DESC"
            ))?;

            let mut rows = stmt.query([])?;
            let mut sessions = Vec::new();
            while let Some(row) = rows.next()? {
                sessions.push(row_to_session(row)?);
            }

            Ok(sessions)
        })
        .await
    }

    /// Closes out sessions a crash left running. Returns how many were touched.
    pub async fn interrupt_incomplete_sessions(&self, stopped_at: DateTime<Utc>) -> Result<usize> {
        self.execute(move |conn| {
            let updated = conn.execute(
                "UPDATE monitor_sessions
                 SET status = ?1,
                     stopped_at = ?2,
                     updated_at = ?2
                 WHERE status = 'Running'",
                params![SessionStatus::Interrupted.as_str(), stopped_at.to_rfc3339()],
            )?;
            Ok(updated)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn open() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(dir.path().join("journal.sqlite3")).unwrap();
        (dir, db)
    }

    #[tokio::test]
    async fn session_lifecycle_round_trips() {
        let (_dir, db) = open();
        let started = Utc::now();
        db.insert_session(&MonitorSession::started("s1", started)).await.unwrap();

        db.update_session_progress("s1", 12, 3, started + Duration::seconds(12))
            .await
            .unwrap();
        let stopped = started + Duration::seconds(20);
        db.mark_session_status("s1", SessionStatus::Completed, Some(stopped), stopped)
            .await
            .unwrap();

        let session = db.get_session("s1").await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.frames_processed, 12);
        assert_eq!(session.skipped_cycles, 3);
        assert_eq!(session.stopped_at.map(|t| t.timestamp()), Some(stopped.timestamp()));
        assert!(db.get_session("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn crashed_sessions_become_interrupted() {
        let (_dir, db) = open();
        let now = Utc::now();
        db.insert_session(&MonitorSession::started("old", now - Duration::hours(1)))
            .await
            .unwrap();
        db.insert_session(&MonitorSession::started("new", now)).await.unwrap();

        let incomplete = db.get_incomplete_sessions().await.unwrap();
        let ids: Vec<_> = incomplete.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["new", "old"]);

        assert_eq!(db.interrupt_incomplete_sessions(now).await.unwrap(), 2);
        assert!(db.get_incomplete_sessions().await.unwrap().is_empty());
        assert_eq!(
            db.get_session("old").await.unwrap().unwrap().status,
            SessionStatus::Interrupted
        );
    }

    #[tokio::test]
    async fn status_update_for_unknown_session_fails() {
        let (_dir, db) = open();
        let now = Utc::now();
        assert!(db
            .mark_session_status("ghost", SessionStatus::Completed, Some(now), now)
            .await
            .is_err());
    }
}
