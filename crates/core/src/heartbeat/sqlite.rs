//! SQLite-backed heartbeat registry, sharing the job database.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection};

use super::{HeartbeatRegistry, WorkerHeartbeat};
use crate::job::{configure_connection, db_err, from_ms, to_ms, JobError};

pub struct SqliteHeartbeatRegistry {
    conn: Mutex<Connection>,
}

impl SqliteHeartbeatRegistry {
    pub fn new(path: &Path) -> Result<Self, JobError> {
        let conn = Connection::open(path).map_err(db_err)?;
        configure_connection(&conn)?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> Result<Self, JobError> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn initialize_schema(conn: &Connection) -> Result<(), JobError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS worker_heartbeats (
                worker_id TEXT PRIMARY KEY,
                role TEXT NOT NULL,
                state TEXT NOT NULL,
                job_id INTEGER,
                pid INTEGER NOT NULL,
                hostname TEXT NOT NULL,
                last_seen_ms INTEGER NOT NULL
            );
            "#,
        )
        .map_err(db_err)
    }

    fn row_to_heartbeat(row: &rusqlite::Row) -> rusqlite::Result<WorkerHeartbeat> {
        let text_col = |idx: usize| -> rusqlite::Result<String> { row.get(idx) };
        let role = text_col(1)?
            .parse()
            .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(1, Type::Text, e.into()))?;
        let state = text_col(2)?
            .parse()
            .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, e.into()))?;

        Ok(WorkerHeartbeat {
            worker_id: row.get(0)?,
            role,
            state,
            job_id: row.get(3)?,
            pid: row.get(4)?,
            hostname: row.get(5)?,
            last_seen: from_ms(row.get(6)?),
        })
    }
}

impl HeartbeatRegistry for SqliteHeartbeatRegistry {
    fn record(&self, heartbeat: &WorkerHeartbeat) -> Result<(), JobError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO worker_heartbeats (worker_id, role, state, job_id, pid, hostname, last_seen_ms)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(worker_id) DO UPDATE SET
                role = excluded.role,
                state = excluded.state,
                job_id = excluded.job_id,
                pid = excluded.pid,
                hostname = excluded.hostname,
                last_seen_ms = excluded.last_seen_ms
            WHERE excluded.last_seen_ms >= worker_heartbeats.last_seen_ms
            "#,
            params![
                heartbeat.worker_id,
                heartbeat.role.as_str(),
                heartbeat.state.as_str(),
                heartbeat.job_id,
                heartbeat.pid,
                heartbeat.hostname,
                to_ms(heartbeat.last_seen),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn list(&self) -> Result<Vec<WorkerHeartbeat>, JobError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT worker_id, role, state, job_id, pid, hostname, last_seen_ms \
                 FROM worker_heartbeats ORDER BY last_seen_ms DESC, worker_id ASC",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], Self::row_to_heartbeat)
            .map_err(db_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(db_err)
    }

    fn prune(&self, cutoff: DateTime<Utc>) -> Result<usize, JobError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM worker_heartbeats WHERE last_seen_ms < ?1",
            params![to_ms(cutoff)],
        )
        .map_err(db_err)
    }
}
