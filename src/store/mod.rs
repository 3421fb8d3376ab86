use std::path::Path;

use rusqlite::{Connection, OptionalExtension, params};
use tokio::sync::Mutex;

use crate::runs::{RunSession, SessionEvent, SessionStatus, now_ms};

/// Errors from event-store operations.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("session already exists: {0}")]
    AlreadyExists(String),

    #[error("session not found: {0}")]
    NotFound(String),

    #[error("session is terminated: {0}")]
    SessionTerminated(String),

    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sessions (
    runId     TEXT PRIMARY KEY,
    kind      TEXT NOT NULL,
    status    TEXT NOT NULL,
    createdAt INTEGER NOT NULL,
    updatedAt INTEGER NOT NULL,
    meta      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS session_events (
    id      INTEGER PRIMARY KEY,
    runId   TEXT NOT NULL,
    seq     INTEGER NOT NULL,
    channel TEXT NOT NULL,
    type    TEXT NOT NULL,
    payload BLOB NOT NULL,
    ts      INTEGER NOT NULL,
    UNIQUE(runId, seq)
);

CREATE INDEX IF NOT EXISTS idx_session_events_run_seq ON session_events(runId, seq);
CREATE INDEX IF NOT EXISTS idx_session_events_run_ts ON session_events(runId, ts);
";

/// Append-only persistence for run sessions and their event logs.
///
/// A single SQLite connection guarded by an async mutex serializes all
/// writes, which trivially satisfies the per-run append ordering the manager
/// relies on. Reads go through the same connection; backlog fetches page via
/// `limit` so one huge history cannot pin the lock.
pub struct EventStore {
    conn: Mutex<Connection>,
}

impl EventStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert a new session row in `starting`.
    pub async fn create_session(
        &self,
        run_id: &str,
        kind: &str,
        meta: &serde_json::Value,
    ) -> Result<RunSession, StoreError> {
        let now = now_ms();
        let meta_text = meta.to_string();
        let conn = self.conn.lock().await;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO sessions (runId, kind, status, createdAt, updatedAt, meta)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                run_id,
                kind,
                SessionStatus::Starting.as_str(),
                now,
                now,
                meta_text
            ],
        )?;
        if inserted == 0 {
            return Err(StoreError::AlreadyExists(run_id.to_string()));
        }
        Ok(RunSession {
            run_id: run_id.to_string(),
            kind: kind.to_string(),
            status: SessionStatus::Starting,
            created_at: now,
            updated_at: now,
            meta: meta.clone(),
        })
    }

    pub async fn get_session(&self, run_id: &str) -> Result<RunSession, StoreError> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT runId, kind, status, createdAt, updatedAt, meta
             FROM sessions WHERE runId = ?1",
            params![run_id],
            row_to_session,
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(run_id.to_string()))
    }

    /// Transition a session's status. Idempotent when the status is unchanged;
    /// terminal states absorb every other transition attempt.
    pub async fn update_status(
        &self,
        run_id: &str,
        status: SessionStatus,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let current: Option<String> = conn
            .query_row(
                "SELECT status FROM sessions WHERE runId = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .optional()?;
        let current = current.ok_or_else(|| StoreError::NotFound(run_id.to_string()))?;
        let current =
            SessionStatus::parse(&current).ok_or_else(|| StoreError::Corrupt(current.clone()))?;

        if current == status {
            return Ok(());
        }
        if current.is_terminal() {
            return Err(StoreError::SessionTerminated(run_id.to_string()));
        }

        conn.execute(
            "UPDATE sessions SET status = ?2, updatedAt = ?3 WHERE runId = ?1",
            params![run_id, status.as_str(), now_ms()],
        )?;
        Ok(())
    }

    /// Append one event, assigning the next `seq` atomically with the insert.
    /// `ts` is clamped so it never decreases within a run.
    pub async fn append_event(
        &self,
        run_id: &str,
        channel: &str,
        event_type: &str,
        payload: &[u8],
    ) -> Result<SessionEvent, StoreError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let status: Option<String> = tx
            .query_row(
                "SELECT status FROM sessions WHERE runId = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .optional()?;
        let status = status.ok_or_else(|| StoreError::NotFound(run_id.to_string()))?;
        let status =
            SessionStatus::parse(&status).ok_or_else(|| StoreError::Corrupt(status.clone()))?;
        if status.is_terminal() {
            return Err(StoreError::SessionTerminated(run_id.to_string()));
        }

        let (next_seq, last_ts): (i64, i64) = tx.query_row(
            "SELECT COALESCE(MAX(seq), 0) + 1, COALESCE(MAX(ts), 0)
             FROM session_events WHERE runId = ?1",
            params![run_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let ts = now_ms().max(last_ts);

        tx.execute(
            "INSERT INTO session_events (runId, seq, channel, type, payload, ts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![run_id, next_seq, channel, event_type, payload, ts],
        )?;
        tx.execute(
            "UPDATE sessions SET updatedAt = ?2 WHERE runId = ?1",
            params![run_id, ts],
        )?;
        tx.commit()?;

        Ok(SessionEvent {
            run_id: run_id.to_string(),
            seq: next_seq,
            channel: channel.to_string(),
            event_type: event_type.to_string(),
            payload: payload.to_vec(),
            ts,
        })
    }

    /// Events with `seq > after_seq`, ascending, up to `limit` rows.
    pub async fn events_since(
        &self,
        run_id: &str,
        after_seq: i64,
        limit: Option<usize>,
    ) -> Result<Vec<SessionEvent>, StoreError> {
        let conn = self.conn.lock().await;
        // Unknown runs are an error, not an empty history.
        let exists: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM sessions WHERE runId = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Err(StoreError::NotFound(run_id.to_string()));
        }

        let limit = limit.map(|n| n as i64).unwrap_or(-1);
        let mut stmt = conn.prepare(
            "SELECT runId, seq, channel, type, payload, ts
             FROM session_events
             WHERE runId = ?1 AND seq > ?2
             ORDER BY seq ASC
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![run_id, after_seq, limit], row_to_event)?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row?);
        }
        Ok(events)
    }

    pub async fn list_sessions(
        &self,
        status: Option<SessionStatus>,
        kind: Option<&str>,
    ) -> Result<Vec<RunSession>, StoreError> {
        let conn = self.conn.lock().await;
        let mut sql = String::from(
            "SELECT runId, kind, status, createdAt, updatedAt, meta FROM sessions WHERE 1=1",
        );
        let mut args: Vec<String> = Vec::new();
        if let Some(status) = status {
            sql.push_str(&format!(" AND status = ?{}", args.len() + 1));
            args.push(status.as_str().to_string());
        }
        if let Some(kind) = kind {
            sql.push_str(&format!(" AND kind = ?{}", args.len() + 1));
            args.push(kind.to_string());
        }
        sql.push_str(" ORDER BY createdAt DESC");

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args.iter()), row_to_session)?;
        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(row?);
        }
        Ok(sessions)
    }

    /// Read-only close: transition to `stopped`.
    pub async fn close(&self, run_id: &str) -> Result<(), StoreError> {
        match self.update_status(run_id, SessionStatus::Stopped).await {
            Ok(()) => Ok(()),
            // Already terminal counts as closed.
            Err(StoreError::SessionTerminated(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunSession> {
    let status_text: String = row.get(2)?;
    let meta_text: String = row.get(5)?;
    Ok(RunSession {
        run_id: row.get(0)?,
        kind: row.get(1)?,
        status: SessionStatus::parse(&status_text).unwrap_or(SessionStatus::Error),
        created_at: row.get(3)?,
        updated_at: row.get(4)?,
        meta: serde_json::from_str(&meta_text).unwrap_or(serde_json::Value::Null),
    })
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionEvent> {
    Ok(SessionEvent {
        run_id: row.get(0)?,
        seq: row.get(1)?,
        channel: row.get(2)?,
        event_type: row.get(3)?,
        payload: row.get(4)?,
        ts: row.get(5)?,
    })
}
