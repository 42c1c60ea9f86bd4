//! Durable log storage backed by SQLite.
//!
//! Envelopes are stored whole as JSON with a few indexed columns pulled out
//! for querying. A retention cap keeps the table bounded; the oldest rows
//! are evicted as new ones arrive.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection};
use rusqlite::types::Type;
use tracing::debug;

use crate::types::LogEnvelope;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS logs (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp   INTEGER NOT NULL,
    method      TEXT NOT NULL,
    url         TEXT NOT NULL,
    status      INTEGER NOT NULL,
    duration    REAL NOT NULL,
    device_id   TEXT,
    envelope    TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_logs_timestamp ON logs(timestamp);
CREATE INDEX IF NOT EXISTS idx_logs_device ON logs(device_id);
"#;

pub struct LogStore {
    conn: Mutex<Connection>,
    /// Maximum rows kept; 0 means unlimited.
    retention: usize,
}

impl LogStore {
    /// Open (or create) a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P, retention: usize) -> rusqlite::Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Self::init(conn, retention)
    }

    /// In-memory store, used by tests.
    pub fn in_memory(retention: usize) -> rusqlite::Result<Self> {
        Self::init(Connection::open_in_memory()?, retention)
    }

    fn init(conn: Connection, retention: usize) -> rusqlite::Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            retention,
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("LogStore mutex poisoned")
    }

    /// Append one envelope, evicting the oldest rows past the retention cap.
    pub fn insert(&self, envelope: &LogEnvelope) -> rusqlite::Result<()> {
        let payload = serde_json::to_string(envelope)
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
        let conn = self.conn();
        conn.execute(
            "INSERT INTO logs (timestamp, method, url, status, duration, device_id, envelope)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                envelope.timestamp,
                envelope.method,
                envelope.url,
                envelope.status,
                envelope.duration,
                envelope.device_id,
                payload,
            ],
        )?;

        if self.retention > 0 {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM logs", [], |row| row.get(0))?;
            let excess = count - self.retention as i64;
            if excess > 0 {
                let evicted = conn.execute(
                    "DELETE FROM logs WHERE id IN (
                         SELECT id FROM logs ORDER BY timestamp ASC, id ASC LIMIT ?1
                     )",
                    params![excess],
                )?;
                debug!(evicted, "Evicted logs past retention cap");
            }
        }
        Ok(())
    }

    /// The most recent `limit` envelopes in chronological order.
    pub fn recent(&self, limit: usize) -> rusqlite::Result<Vec<LogEnvelope>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT envelope FROM logs ORDER BY timestamp DESC, id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            let payload: String = row.get(0)?;
            serde_json::from_str(&payload)
                .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))
        })?;
        let mut envelopes: Vec<LogEnvelope> = rows.collect::<rusqlite::Result<_>>()?;
        envelopes.reverse();
        Ok(envelopes)
    }

    pub fn count(&self) -> rusqlite::Result<u64> {
        let count: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM logs", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub fn clear(&self) -> rusqlite::Result<()> {
        self.conn().execute("DELETE FROM logs", [])?;
        Ok(())
    }
}
