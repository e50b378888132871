use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::error::StoreError;
use crate::models::{PendingApprovalRecord, Session, SessionStatus};

const SCHEMA_VERSION: i32 = 2;
const BUSY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

const SESSION_COLUMNS: &str =
    "id, project_path, thread_id, channel_id, created_at, last_active, status, last_reply_at";

pub type Result<T> = std::result::Result<T, StoreError>;

/// Durable session registry. Every public method is one atomic statement (or
/// transaction) behind the connection mutex, so the reconciliation loop and the
/// control plane can share one `Database`.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        // journal_mode answers with a row, so it cannot go through execute().
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;

        let db = Database {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.lock()?;
        let version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;

        if version < 1 {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS sessions (
                    id TEXT PRIMARY KEY,
                    project_path TEXT NOT NULL,
                    thread_id TEXT NOT NULL,
                    channel_id TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    last_active TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'active',
                    last_reply_at INTEGER
                );

                -- One outstanding approval per thread, rebuilt into memory on startup
                CREATE TABLE IF NOT EXISTS pending_approvals (
                    thread_id TEXT PRIMARY KEY,
                    session_id TEXT NOT NULL,
                    tool_name TEXT NOT NULL,
                    command TEXT NOT NULL,
                    sink_handle TEXT NOT NULL,
                    requested_at TEXT NOT NULL,
                    reply_floor INTEGER,
                    FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
                );

                CREATE UNIQUE INDEX IF NOT EXISTS idx_sessions_active_thread
                    ON sessions(thread_id) WHERE status = 'active';
                CREATE INDEX IF NOT EXISTS idx_sessions_status_last_active
                    ON sessions(status, last_active);
                CREATE INDEX IF NOT EXISTS idx_pending_session ON pending_approvals(session_id);
                "#,
            )?;
        } else if version < 2 {
            conn.execute(
                "ALTER TABLE pending_approvals ADD COLUMN reply_floor INTEGER",
                [],
            )?;
        }

        if version < SCHEMA_VERSION {
            conn.execute(&format!("PRAGMA user_version = {}", SCHEMA_VERSION), [])?;
        }

        conn.execute("PRAGMA foreign_keys = ON", [])?;

        Ok(())
    }

    // Sessions
    pub fn create(
        &self,
        id: &str,
        project_path: &str,
        thread_id: &str,
        channel_id: &str,
    ) -> Result<Session> {
        let now = Utc::now();
        let stamp = timestamp(now);
        let conn = self.lock()?;

        let inserted = conn.execute(
            "INSERT INTO sessions (id, project_path, thread_id, channel_id, created_at, last_active, status) VALUES (?1, ?2, ?3, ?4, ?5, ?5, 'active')",
            params![id, project_path, thread_id, channel_id, stamp],
        );

        match inserted {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == ErrorCode::ConstraintViolation =>
            {
                let id_taken: bool = conn.query_row(
                    "SELECT EXISTS(SELECT 1 FROM sessions WHERE id = ?1)",
                    [id],
                    |row| row.get(0),
                )?;
                return Err(if id_taken {
                    StoreError::AlreadyExists(id.to_string())
                } else {
                    StoreError::ThreadActive(thread_id.to_string())
                });
            }
            Err(err) => return Err(err.into()),
        }

        Ok(Session {
            id: id.to_string(),
            project_path: project_path.to_string(),
            thread_id: thread_id.to_string(),
            channel_id: channel_id.to_string(),
            created_at: parse_datetime(stamp.clone()),
            last_active: parse_datetime(stamp),
            status: SessionStatus::Active,
            last_reply_at: None,
        })
    }

    pub fn get(&self, id: &str) -> Result<Session> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {} FROM sessions WHERE id = ?1", SESSION_COLUMNS),
            [id],
            session_from_row,
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    pub fn get_by_active_thread(&self, thread_id: &str) -> Result<Session> {
        let conn = self.lock()?;
        conn.query_row(
            &format!(
                "SELECT {} FROM sessions WHERE thread_id = ?1 AND status = 'active'",
                SESSION_COLUMNS
            ),
            [thread_id],
            session_from_row,
        )
        .optional()?
        .ok_or_else(|| StoreError::NoActiveSession(thread_id.to_string()))
    }

    /// Active sessions, most recently active first.
    pub fn list_active(&self) -> Result<Vec<Session>> {
        self.list(Some(SessionStatus::Active))
    }

    pub fn list(&self, status_filter: Option<SessionStatus>) -> Result<Vec<Session>> {
        let conn = self.lock()?;
        let sessions = match status_filter {
            Some(status) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM sessions WHERE status = ?1 ORDER BY last_active DESC, id",
                    SESSION_COLUMNS
                ))?;
                let rows = stmt
                    .query_map([status.as_str()], session_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                rows
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM sessions ORDER BY last_active DESC, id",
                    SESSION_COLUMNS
                ))?;
                let rows = stmt
                    .query_map([], session_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                rows
            }
        };
        Ok(sessions)
    }

    /// Bumps `last_active` to now. The stored value never moves backwards.
    pub fn touch(&self, id: &str) -> Result<()> {
        let now = timestamp(Utc::now());
        let conn = self.lock()?;
        let rows = conn.execute(
            "UPDATE sessions SET last_active = MAX(last_active, ?1) WHERE id = ?2",
            params![now, id],
        )?;
        if rows == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    /// Marks an active session ended. Terminal sessions are left as they are.
    /// Returns the status the session has afterwards.
    pub fn end(&self, id: &str) -> Result<SessionStatus> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE sessions SET status = 'ended' WHERE id = ?1 AND status = 'active'",
            [id],
        )?;
        let status: Option<String> = conn
            .query_row("SELECT status FROM sessions WHERE id = ?1", [id], |row| {
                row.get(0)
            })
            .optional()?;

        match status {
            Some(status) => Ok(status.parse().unwrap_or(SessionStatus::Ended)),
            None => Err(StoreError::NotFound(id.to_string())),
        }
    }

    /// Times out every active session idle for at least `timeout`. A timeout
    /// reaching past the representable date range expires nothing.
    pub fn expire_inactive(&self, timeout: Duration) -> Result<usize> {
        let Some(cutoff) = Utc::now().checked_sub_signed(timeout) else {
            return Ok(0);
        };
        let cutoff = timestamp(cutoff);
        let conn = self.lock()?;
        let count = conn.execute(
            "UPDATE sessions SET status = 'timeout' WHERE status = 'active' AND last_active <= ?1",
            [cutoff],
        )?;
        Ok(count)
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        let conn = self.lock()?;
        let rows = conn.execute("DELETE FROM sessions WHERE id = ?1", [id])?;
        if rows == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    /// Advances the session's reply cursor. Older cursors are ignored.
    pub fn mark_reply_seen(&self, id: &str, create_at: i64) -> Result<()> {
        let conn = self.lock()?;
        let rows = conn.execute(
            "UPDATE sessions SET last_reply_at = MAX(COALESCE(last_reply_at, ?1), ?1) WHERE id = ?2",
            params![create_at, id],
        )?;
        if rows == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    // Pending approvals
    pub fn save_pending(&self, record: &PendingApprovalRecord) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO pending_approvals (thread_id, session_id, tool_name, command, sink_handle, requested_at, reply_floor) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.thread_id,
                record.session_id,
                record.tool_name,
                record.command,
                record.sink_handle,
                timestamp(record.requested_at),
                record.reply_floor,
            ],
        )?;
        Ok(())
    }

    pub fn delete_pending(&self, thread_id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let rows = conn.execute(
            "DELETE FROM pending_approvals WHERE thread_id = ?1",
            [thread_id],
        )?;
        Ok(rows > 0)
    }

    /// Pending approvals whose session is still active.
    pub fn load_pending(&self) -> Result<Vec<PendingApprovalRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT p.thread_id, p.session_id, p.tool_name, p.command, p.sink_handle, p.requested_at, p.reply_floor
            FROM pending_approvals p
            JOIN sessions s ON s.id = p.session_id
            WHERE s.status = 'active'
            ORDER BY p.requested_at
            "#,
        )?;
        let records = stmt
            .query_map([], |row| {
                Ok(PendingApprovalRecord {
                    thread_id: row.get(0)?,
                    session_id: row.get(1)?,
                    tool_name: row.get(2)?,
                    command: row.get(3)?,
                    sink_handle: row.get(4)?,
                    requested_at: parse_datetime(row.get::<_, String>(5)?),
                    reply_floor: row.get(6)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Drops pending approvals whose session is no longer active.
    pub fn prune_pending(&self) -> Result<usize> {
        let conn = self.lock()?;
        let count = conn.execute(
            "DELETE FROM pending_approvals WHERE session_id NOT IN (SELECT id FROM sessions WHERE status = 'active')",
            [],
        )?;
        Ok(count)
    }
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<Session> {
    let status: String = row.get(6)?;
    let status = status.parse::<SessionStatus>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, e.into())
    })?;

    Ok(Session {
        id: row.get(0)?,
        project_path: row.get(1)?,
        thread_id: row.get(2)?,
        channel_id: row.get(3)?,
        created_at: parse_datetime(row.get::<_, String>(4)?),
        last_active: parse_datetime(row.get::<_, String>(5)?),
        status,
        last_reply_at: row.get(7)?,
    })
}

/// Fixed-width UTC form, so string order matches time order in SQL comparisons.
fn timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_datetime(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
