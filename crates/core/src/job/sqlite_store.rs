//! SQLite-backed job store implementation.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use tracing::{debug, info, warn};

use super::{
    Actor, EnqueueRequest, Job, JobError, JobFilter, JobId, JobStatus, JobStore, Outcome, Stage,
};
use crate::machine::{self, Phase, PipelinePolicy, Step};
use crate::worker::Role;

const JOB_COLUMNS: &str = "id, channel_slug, release_ref, metadata, stage, status, owner, \
     lease_expires_at_ms, attempt_count, max_attempts, reclaim_count, retry_at_ms, \
     encoder_attempt, artifact_path, upload_url, qa_state, approval_state, publish_state, \
     published_at_ms, ttl_expires_at_ms, artifact_purged_at_ms, error_message, \
     created_at_ms, updated_at_ms";

/// SQLite-backed job store.
///
/// Each process opens its own store on the shared database file; SQLite's
/// write lock plus conditional updates provide the cross-process guarantees.
pub struct SqliteJobStore {
    conn: Mutex<Connection>,
    policy: PipelinePolicy,
}

pub(crate) fn to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

pub(crate) fn from_ms(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}

fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

/// Maps rusqlite errors, separating lock contention from real failures.
pub(crate) fn db_err(e: rusqlite::Error) -> JobError {
    match e.sqlite_error_code() {
        Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
            JobError::Busy(e.to_string())
        }
        _ => JobError::Database(e.to_string()),
    }
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(e, rusqlite::Error::SqliteFailure(code, _) if code.code == ErrorCode::ConstraintViolation)
}

fn parse_col<T: FromStr<Err = String>>(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    text.parse()
        .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

/// Opens a connection with the pragmas every process must agree on.
pub(crate) fn configure_connection(conn: &Connection) -> Result<(), JobError> {
    conn.busy_timeout(Duration::from_secs(30)).map_err(db_err)?;
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        PRAGMA synchronous=NORMAL;
        "#,
    )
    .map_err(db_err)
}

impl SqliteJobStore {
    /// Create a new SQLite job store, creating the database file and tables if needed.
    pub fn new(path: &Path) -> Result<Self, JobError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| JobError::Database(e.to_string()))?;
        }
        let conn = Connection::open(path).map_err(db_err)?;
        configure_connection(&conn)?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            policy: PipelinePolicy::default(),
        })
    }

    /// Create an in-memory SQLite job store (useful for testing).
    pub fn in_memory() -> Result<Self, JobError> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            policy: PipelinePolicy::default(),
        })
    }

    /// Replace the retry/TTL policy.
    pub fn with_policy(mut self, policy: PipelinePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> &PipelinePolicy {
        &self.policy
    }

    fn initialize_schema(conn: &Connection) -> Result<(), JobError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                channel_slug TEXT NOT NULL,
                release_ref TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}',
                stage TEXT NOT NULL,
                status TEXT NOT NULL,
                owner TEXT,
                lease_expires_at_ms INTEGER,
                attempt_count INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL,
                reclaim_count INTEGER NOT NULL DEFAULT 0,
                retry_at_ms INTEGER,
                encoder_attempt INTEGER NOT NULL DEFAULT 0,
                artifact_path TEXT,
                upload_url TEXT,
                qa_state TEXT NOT NULL DEFAULT 'none',
                approval_state TEXT NOT NULL DEFAULT 'none',
                publish_state TEXT NOT NULL DEFAULT 'none',
                published_at_ms INTEGER,
                ttl_expires_at_ms INTEGER,
                artifact_purged_at_ms INTEGER,
                error_message TEXT,
                created_at_ms INTEGER NOT NULL,
                updated_at_ms INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_claim ON jobs(stage, status, created_at_ms, id);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_active_release
                ON jobs(channel_slug, release_ref)
                WHERE status NOT IN ('failed_permanent', 'done');
            "#,
        )
        .map_err(db_err)
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }

    fn build_where_clause(filter: &JobFilter) -> (String, Vec<Box<dyn rusqlite::ToSql>>) {
        let mut conditions = Vec::new();
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(stage) = filter.stage {
            conditions.push("stage = ?");
            params.push(Box::new(stage.as_str()));
        }

        if let Some(status) = filter.status {
            conditions.push("status = ?");
            params.push(Box::new(status.as_str()));
        }

        if let Some(ref channel) = filter.channel_slug {
            conditions.push("channel_slug = ?");
            params.push(Box::new(channel.clone()));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        (where_clause, params)
    }

    fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<Job> {
        let metadata_json: String = row.get(3)?;
        let metadata = serde_json::from_str(&metadata_json)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, e.into()))?;
        let opt_time = |idx: usize| -> rusqlite::Result<Option<DateTime<Utc>>> {
            Ok(row.get::<_, Option<i64>>(idx)?.map(from_ms))
        };

        Ok(Job {
            id: row.get(0)?,
            channel_slug: row.get(1)?,
            release_ref: row.get(2)?,
            metadata,
            stage: parse_col(row, 4)?,
            status: parse_col(row, 5)?,
            owner: row.get(6)?,
            lease_expires_at: opt_time(7)?,
            attempt_count: row.get(8)?,
            max_attempts: row.get(9)?,
            reclaim_count: row.get(10)?,
            retry_at: opt_time(11)?,
            encoder_attempt: row.get(12)?,
            artifact_path: row.get::<_, Option<String>>(13)?.map(PathBuf::from),
            upload_url: row.get(14)?,
            qa_state: parse_col(row, 15)?,
            approval_state: parse_col(row, 16)?,
            publish_state: parse_col(row, 17)?,
            published_at: opt_time(18)?,
            ttl_expires_at: opt_time(19)?,
            artifact_purged_at: opt_time(20)?,
            error_message: row.get(21)?,
            created_at: from_ms(row.get(22)?),
            updated_at: from_ms(row.get(23)?),
        })
    }

    fn fetch(conn: &Connection, id: JobId) -> Result<Option<Job>, JobError> {
        conn.query_row(
            &format!("SELECT {} FROM jobs WHERE id = ?", JOB_COLUMNS),
            params![id],
            Self::row_to_job,
        )
        .optional()
        .map_err(db_err)
    }

    fn fetch_required(conn: &Connection, id: JobId) -> Result<Job, JobError> {
        Self::fetch(conn, id)?.ok_or(JobError::NotFound(id))
    }

    /// Classifies a failed owner-guarded write.
    fn ownership_error(conn: &Connection, id: JobId, worker_id: &str) -> JobError {
        match Self::fetch(conn, id) {
            Ok(Some(_)) => JobError::lease_lost(id, worker_id),
            Ok(None) => JobError::NotFound(id),
            Err(e) => e,
        }
    }

    /// Fails jobs whose next reclamation would exceed the thrash limit.
    fn fail_thrashing(
        conn: &Connection,
        stage: Stage,
        now_ms: i64,
        limit: u32,
    ) -> Result<Vec<JobId>, JobError> {
        let mut stmt = conn
            .prepare(
                r#"
                UPDATE jobs
                SET status = 'failed_permanent', owner = NULL, lease_expires_at_ms = NULL,
                    error_message = 'stale claim: lease expired ' || (reclaim_count + 1) || ' times without progress',
                    updated_at_ms = ?1
                WHERE stage = ?2 AND status IN ('claimed', 'running')
                  AND lease_expires_at_ms < ?1 AND reclaim_count + 1 >= ?3
                RETURNING id
                "#,
            )
            .map_err(db_err)?;
        let ids = stmt
            .query_map(params![now_ms, stage.as_str(), limit], |row| row.get(0))
            .map_err(db_err)?
            .collect::<Result<Vec<JobId>, _>>()
            .map_err(db_err)?;
        Ok(ids)
    }

    /// Persists every mutable column of `next`, guarded on the row still
    /// matching `current`'s stage, status and owner.
    fn write_guarded(conn: &Connection, current: &Job, next: &Job) -> Result<Option<Job>, JobError> {
        conn.query_row(
            &format!(
                r#"
                UPDATE jobs
                SET stage = ?1, status = ?2, owner = ?3, lease_expires_at_ms = ?4,
                    attempt_count = ?5, reclaim_count = ?6, retry_at_ms = ?7,
                    encoder_attempt = ?8, artifact_path = ?9, upload_url = ?10,
                    qa_state = ?11, approval_state = ?12, publish_state = ?13,
                    published_at_ms = ?14, ttl_expires_at_ms = ?15, error_message = ?16,
                    updated_at_ms = ?17
                WHERE id = ?18 AND stage = ?19 AND status = ?20 AND owner IS ?21
                RETURNING {}
                "#,
                JOB_COLUMNS
            ),
            params![
                next.stage.as_str(),
                next.status.as_str(),
                next.owner,
                next.lease_expires_at.map(to_ms),
                next.attempt_count,
                next.reclaim_count,
                next.retry_at.map(to_ms),
                next.encoder_attempt,
                next.artifact_path
                    .as_ref()
                    .map(|p| p.to_string_lossy().into_owned()),
                next.upload_url,
                next.qa_state.as_str(),
                next.approval_state.as_str(),
                next.publish_state.as_str(),
                next.published_at.map(to_ms),
                next.ttl_expires_at.map(to_ms),
                next.error_message,
                to_ms(next.updated_at),
                current.id,
                current.stage.as_str(),
                current.status.as_str(),
                current.owner,
            ],
            Self::row_to_job,
        )
        .optional()
        .map_err(db_err)
    }
}

impl JobStore for SqliteJobStore {
    fn enqueue(&self, request: EnqueueRequest) -> Result<Job, JobError> {
        let conn = self.lock();
        let now = to_ms(Utc::now());
        let metadata_json = serde_json::to_string(&request.metadata)
            .map_err(|e| JobError::Database(e.to_string()))?;
        let max_attempts = request.max_attempts.unwrap_or(self.policy.max_attempts).max(1);

        let result = conn.query_row(
            &format!(
                r#"
                INSERT INTO jobs (channel_slug, release_ref, metadata, stage, status,
                                  max_attempts, created_at_ms, updated_at_ms)
                VALUES (?1, ?2, ?3, 'import', 'pending', ?4, ?5, ?5)
                RETURNING {}
                "#,
                JOB_COLUMNS
            ),
            params![
                request.channel_slug,
                request.release_ref,
                metadata_json,
                max_attempts,
                now
            ],
            Self::row_to_job,
        );

        match result {
            Ok(job) => {
                info!("Job {} enqueued for {}", job.id, job.label());
                Ok(job)
            }
            Err(e) if is_constraint_violation(&e) => Err(JobError::DuplicateRelease {
                channel: request.channel_slug,
                release_ref: request.release_ref,
            }),
            Err(e) => Err(db_err(e)),
        }
    }

    fn get(&self, id: JobId) -> Result<Option<Job>, JobError> {
        let conn = self.lock();
        Self::fetch(&conn, id)
    }

    fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, JobError> {
        let conn = self.lock();

        let (where_clause, params) = Self::build_where_clause(filter);

        let sql = format!(
            "SELECT {} FROM jobs {} ORDER BY created_at_ms ASC, id ASC LIMIT ? OFFSET ?",
            JOB_COLUMNS, where_clause
        );

        let mut stmt = conn.prepare(&sql).map_err(db_err)?;

        let mut all_params: Vec<Box<dyn rusqlite::ToSql>> = params;
        all_params.push(Box::new(filter.limit));
        all_params.push(Box::new(filter.offset));

        let param_refs: Vec<&dyn rusqlite::ToSql> = all_params.iter().map(|p| p.as_ref()).collect();

        let rows = stmt
            .query_map(param_refs.as_slice(), Self::row_to_job)
            .map_err(db_err)?;

        let mut jobs = Vec::new();
        for row_result in rows {
            jobs.push(row_result.map_err(db_err)?);
        }

        Ok(jobs)
    }

    fn count(&self, filter: &JobFilter) -> Result<i64, JobError> {
        let conn = self.lock();

        let (where_clause, params) = Self::build_where_clause(filter);
        let sql = format!("SELECT COUNT(*) FROM jobs {}", where_clause);
        let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();

        conn.query_row(&sql, param_refs.as_slice(), |row| row.get(0))
            .map_err(db_err)
    }

    fn claim(
        &self,
        role: Role,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Option<Job>, JobError> {
        let stage = role.stage();
        let mut conn = self.lock();
        let now = to_ms(Utc::now());
        let lease_until = now.saturating_add(duration_ms(lease));

        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;

        for id in Self::fail_thrashing(&tx, stage, now, self.policy.stale_reclaim_limit)? {
            warn!(
                job_id = id,
                stage = %stage,
                "Job {} failed permanently: lease expired {} times in a row",
                id,
                self.policy.stale_reclaim_limit
            );
        }

        let claimed = tx
            .query_row(
                &format!(
                    r#"
                    UPDATE jobs
                    SET reclaim_count = CASE WHEN status IN ('claimed', 'running')
                                             THEN reclaim_count + 1 ELSE reclaim_count END,
                        status = 'claimed', owner = ?1, lease_expires_at_ms = ?2,
                        retry_at_ms = NULL, updated_at_ms = ?3
                    WHERE id = (
                        SELECT id FROM jobs
                        WHERE stage = ?4
                          AND (
                            (status IN ('pending', 'retrying')
                              AND (retry_at_ms IS NULL OR retry_at_ms <= ?3)
                              AND (ttl_expires_at_ms IS NULL OR ttl_expires_at_ms <= ?3))
                            OR (status IN ('claimed', 'running') AND lease_expires_at_ms < ?3)
                          )
                        ORDER BY created_at_ms ASC, id ASC
                        LIMIT 1
                    )
                    RETURNING {}
                    "#,
                    JOB_COLUMNS
                ),
                params![worker_id, lease_until, now, stage.as_str()],
                Self::row_to_job,
            )
            .optional()
            .map_err(db_err)?;

        tx.commit().map_err(db_err)?;

        if let Some(ref job) = claimed {
            if job.reclaim_count > 0 {
                warn!(
                    job_id = job.id,
                    stage = %stage,
                    attempt = job.attempt_no(),
                    "Job {} reclaimed by {} after lease expiry ({} in a row)",
                    job.id,
                    worker_id,
                    job.reclaim_count
                );
            } else {
                debug!("Job {} claimed by {}", job.id, worker_id);
            }
        }

        Ok(claimed)
    }

    fn start(&self, id: JobId, worker_id: &str) -> Result<Job, JobError> {
        let conn = self.lock();
        let now = to_ms(Utc::now());
        let started = conn
            .query_row(
                &format!(
                    "UPDATE jobs SET status = 'running', updated_at_ms = ?1 \
                     WHERE id = ?2 AND owner = ?3 AND status IN ('claimed', 'running') \
                     RETURNING {}",
                    JOB_COLUMNS
                ),
                params![now, id, worker_id],
                Self::row_to_job,
            )
            .optional()
            .map_err(db_err)?;

        started.ok_or_else(|| Self::ownership_error(&conn, id, worker_id))
    }

    fn heartbeat(
        &self,
        id: JobId,
        worker_id: &str,
        extension: Duration,
    ) -> Result<DateTime<Utc>, JobError> {
        let conn = self.lock();
        let now = to_ms(Utc::now());
        let until = now.saturating_add(duration_ms(extension));
        let changed = conn
            .execute(
                "UPDATE jobs SET lease_expires_at_ms = ?1, updated_at_ms = ?2 \
                 WHERE id = ?3 AND owner = ?4 AND status IN ('claimed', 'running')",
                params![until, now, id, worker_id],
            )
            .map_err(db_err)?;

        if changed == 1 {
            Ok(from_ms(until))
        } else {
            Err(Self::ownership_error(&conn, id, worker_id))
        }
    }

    fn transition(&self, id: JobId, actor: &Actor, outcome: Outcome) -> Result<Job, JobError> {
        let mut conn = self.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;

        let current = Self::fetch_required(&tx, id)?;

        if let Actor::Worker(worker_id) = actor {
            if current.owner.as_deref() != Some(worker_id.as_str()) || !current.status.is_leased()
            {
                return Err(JobError::lease_lost(id, worker_id));
            }
        }

        machine::authorize(&current, actor, &outcome).map_err(|e| JobError::invalid(id, e))?;

        let now = Utc::now();
        let next = machine::advance(&current, &outcome, &self.policy, now)
            .map_err(|e| JobError::invalid(id, e))?;

        let written = Self::write_guarded(&tx, &current, &next)?
            .ok_or_else(|| JobError::Busy(format!("job {} changed during transition", id)))?;
        tx.commit().map_err(db_err)?;

        let from = Phase::of(&current);
        let to = Phase::of(&written);
        match &outcome {
            Outcome::Failed { reason, .. } => warn!(
                job_id = id,
                stage = %current.stage,
                attempt = current.attempt_no(),
                "Job {} {} -> {} by {}: {}",
                id,
                from,
                to,
                actor.name(),
                reason
            ),
            _ => info!("Job {} {} -> {} by {}", id, from, to, actor.name()),
        }

        Ok(written)
    }

    fn release(&self, id: JobId, worker_id: &str) -> Result<Job, JobError> {
        let conn = self.lock();
        let now = to_ms(Utc::now());
        let released = conn
            .query_row(
                &format!(
                    "UPDATE jobs SET status = 'pending', owner = NULL, lease_expires_at_ms = NULL, \
                     reclaim_count = 0, updated_at_ms = ?1 \
                     WHERE id = ?2 AND owner = ?3 AND status IN ('claimed', 'running') \
                     RETURNING {}",
                    JOB_COLUMNS
                ),
                params![now, id, worker_id],
                Self::row_to_job,
            )
            .optional()
            .map_err(db_err)?;

        match released {
            Some(job) => {
                info!("Job {} released by {}", id, worker_id);
                Ok(job)
            }
            None => Err(Self::ownership_error(&conn, id, worker_id)),
        }
    }

    fn cancel(&self, id: JobId, reason: &str) -> Result<Job, JobError> {
        let mut conn = self.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;
        let current = Self::fetch_required(&tx, id)?;
        if current.is_terminal() {
            return Err(JobError::InvalidTransition {
                job_id: id,
                from: Phase::of(&current),
                to: Phase::new(current.stage, Step::Failed),
            });
        }

        let mut next = current.clone();
        next.status = JobStatus::FailedPermanent;
        next.owner = None;
        next.lease_expires_at = None;
        next.retry_at = None;
        next.error_message = Some(format!("cancelled: {}", reason));
        next.updated_at = Utc::now();

        let written = Self::write_guarded(&tx, &current, &next)?
            .ok_or_else(|| JobError::Busy(format!("job {} changed during cancel", id)))?;
        tx.commit().map_err(db_err)?;

        warn!(job_id = id, stage = %current.stage, "Job {} cancelled: {}", id, reason);
        Ok(written)
    }

    fn force_unlock(&self, id: JobId) -> Result<Job, JobError> {
        let mut conn = self.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;
        let current = Self::fetch_required(&tx, id)?;
        if current.is_terminal() {
            return Err(JobError::InvalidTransition {
                job_id: id,
                from: Phase::of(&current),
                to: Phase::new(current.stage, Step::Pending),
            });
        }
        if !current.status.is_leased() {
            return Ok(current);
        }

        let mut next = current.clone();
        next.status = JobStatus::Pending;
        next.owner = None;
        next.lease_expires_at = None;
        next.reclaim_count = 0;
        next.updated_at = Utc::now();

        let written = Self::write_guarded(&tx, &current, &next)?
            .ok_or_else(|| JobError::Busy(format!("job {} changed during unlock", id)))?;
        tx.commit().map_err(db_err)?;

        info!(
            "Job {} unlocked (was held by {})",
            id,
            current.owner.as_deref().unwrap_or("nobody")
        );
        Ok(written)
    }

    fn mark_artifact_purged(&self, id: JobId) -> Result<(), JobError> {
        let conn = self.lock();
        let now = to_ms(Utc::now());
        let changed = conn
            .execute(
                "UPDATE jobs SET artifact_purged_at_ms = COALESCE(artifact_purged_at_ms, ?1), \
                 updated_at_ms = ?1 WHERE id = ?2",
                params![now, id],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(JobError::NotFound(id));
        }
        Ok(())
    }
}
