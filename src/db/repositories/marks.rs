use anyhow::Result;
use rusqlite::params;

use crate::db::{connection::Database, helpers::parse_datetime};
use crate::models::{AttendanceMark, Identity, IdentityId, SessionId};

impl Database {
    /// Journals a mark. A second mark for the same (session, identity) is
    /// ignored; returns whether a row was written.
    pub async fn insert_mark(&self, mark: &AttendanceMark) -> Result<bool> {
        let record = mark.clone();
        self.execute(move |conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO attendance_marks (session_id, identity_id, display_name, marked_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    record.session_id.as_str(),
                    record.identity.id.as_str(),
                    record.identity.display_name,
                    record.marked_at.to_rfc3339(),
                ],
            )?;
            Ok(inserted > 0)
        })
        .await
    }

    pub async fn get_marks_for_session(&self, session_id: &str) -> Result<Vec<AttendanceMark>> {
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT identity_id, display_name, marked_at
                 FROM attendance_marks
                 WHERE session_id = ?1
                 ORDER BY marked_at ASC, id ASC",
            )?;

            let mut rows = stmt.query(params![session_id])?;
            let mut marks = Vec::new();
            while let Some(row) = rows.next()? {
                let identity_id: String = row.get(0)?;
                let marked_at: String = row.get(2)?;
                marks.push(AttendanceMark {
                    session_id: SessionId::new(session_id.clone()),
                    identity: Identity {
                        id: IdentityId::new(identity_id),
                        display_name: row.get(1)?,
                    },
                    marked_at: parse_datetime(&marked_at, "marked_at")?,
                });
            }

            Ok(marks)
        })
        .await
    }
}
