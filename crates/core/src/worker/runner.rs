//! The claim / execute / transition loop shared by every worker role.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::config::WorkerConfig;
use super::handler::{Handler, HandlerTable, RoleHandler};
use super::lease::LeaseKeeper;
use super::types::{Role, WorkerError};
use crate::heartbeat::{HeartbeatRegistry, WorkerHeartbeat, WorkerState};
use crate::job::{Actor, Job, JobError, JobId, JobStore, Outcome};
use crate::joblog::JobLogs;
use crate::machine::Phase;

/// What one loop iteration did with the job it claimed.
#[derive(Debug, Clone, PartialEq)]
pub enum Processed {
    /// The outcome was applied; carries the job as written.
    Transitioned(Job),
    /// Another worker took the job over; nothing was written.
    LeaseLost(JobId),
    /// Shutdown outlasted the grace period; the job went back to pending
    /// without consuming an attempt.
    Released(JobId),
}

enum Run {
    Finished(Outcome),
    LeaseLost,
    Interrupted,
}

/// A single-role worker.
///
/// Every iteration claims at most one job, so a worker never holds more than
/// one lease at a time.
pub struct WorkerLoop {
    role: Role,
    worker_id: String,
    config: WorkerConfig,
    store: Arc<dyn JobStore>,
    heartbeats: Arc<dyn HeartbeatRegistry>,
    handler: Arc<RoleHandler>,
    logs: JobLogs,

    running: AtomicBool,
    stopping: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
}

impl WorkerLoop {
    pub fn new(
        role: Role,
        config: WorkerConfig,
        store: Arc<dyn JobStore>,
        heartbeats: Arc<dyn HeartbeatRegistry>,
        handlers: &HandlerTable,
        logs: JobLogs,
    ) -> Result<Self, WorkerError> {
        let handler = handlers.get(role).ok_or(WorkerError::NoHandler(role))?;
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            role,
            worker_id: role.new_worker_id(),
            config,
            store,
            heartbeats,
            handler,
            logs,
            running: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            shutdown_tx,
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    fn beat(&self, state: WorkerState, job_id: Option<JobId>) {
        let hb = WorkerHeartbeat::now(&self.worker_id, self.role, state, job_id);
        if let Err(e) = self.heartbeats.record(&hb) {
            debug!("Failed to record heartbeat of {}: {}", self.worker_id, e);
        }
    }

    async fn abandon(&self, job: &Job) -> Processed {
        warn!(
            job_id = job.id,
            stage = %job.stage,
            "Worker {} abandoned job {}: lease lost",
            self.worker_id,
            job.id
        );
        self.logs
            .note(job.id, &format!("ABANDONED by {}: lease lost", self.worker_id))
            .await;
        self.beat(WorkerState::Idle, None);
        Processed::LeaseLost(job.id)
    }

    /// Returns an interrupted job to the queue.
    async fn hand_back(&self, job: &Job) -> Result<Option<Processed>, WorkerError> {
        self.beat(WorkerState::Stopping, None);
        match self.store.release(job.id, &self.worker_id) {
            Ok(_) => {
                warn!(
                    job_id = job.id,
                    stage = %job.stage,
                    "Worker {} interrupted job {} on shutdown; released",
                    self.worker_id,
                    job.id
                );
                self.logs
                    .note(job.id, &format!("RELEASED by {}: shutdown", self.worker_id))
                    .await;
                Ok(Some(Processed::Released(job.id)))
            }
            Err(JobError::LeaseLost { .. }) => Ok(Some(Processed::LeaseLost(job.id))),
            Err(e) => Err(e.into()),
        }
    }

    /// Claims and processes at most one job. `Ok(None)` means nothing was
    /// claimable.
    pub async fn run_once(&self) -> Result<Option<Processed>, WorkerError> {
        let claimed = self
            .store
            .claim(self.role, &self.worker_id, self.config.lease())?;
        let Some(job) = claimed else {
            self.beat(WorkerState::Idle, None);
            return Ok(None);
        };

        let job = match self.store.start(job.id, &self.worker_id) {
            Ok(job) => job,
            Err(JobError::LeaseLost { .. }) => return Ok(Some(Processed::LeaseLost(job.id))),
            Err(e) => return Err(e.into()),
        };
        self.beat(WorkerState::Busy, Some(job.id));
        self.logs
            .note(
                job.id,
                &format!(
                    "START {} attempt {}/{} by {}",
                    job.stage,
                    job.attempt_no(),
                    job.max_attempts,
                    self.worker_id
                ),
            )
            .await;

        let mut keeper = LeaseKeeper::spawn(
            self.store.clone(),
            self.heartbeats.clone(),
            job.id,
            self.worker_id.clone(),
            self.role,
            self.config.lease(),
            self.config.heartbeat_interval(),
        );

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let interrupted = async {
            if !self.stopping.load(Ordering::SeqCst) {
                let _ = shutdown_rx.recv().await;
            }
            tokio::time::sleep(self.config.shutdown_grace()).await;
        };

        let run = tokio::select! {
            outcome = self.handler.execute(&job) => Run::Finished(outcome),
            _ = keeper.lost() => Run::LeaseLost,
            _ = interrupted => Run::Interrupted,
        };
        drop(keeper);

        let outcome = match run {
            Run::Finished(outcome) => outcome,
            Run::LeaseLost => return Ok(Some(self.abandon(&job).await)),
            Run::Interrupted => return self.hand_back(&job).await,
        };

        let result = self
            .store
            .transition(job.id, &Actor::worker(&self.worker_id), outcome.clone());
        self.beat(WorkerState::Idle, None);

        match result {
            Ok(written) => {
                let line = match &outcome {
                    Outcome::Failed { reason, .. } => format!(
                        "{} -> {}: {}",
                        Phase::of(&job),
                        Phase::of(&written),
                        reason
                    ),
                    _ => format!("{} -> {}", Phase::of(&job), Phase::of(&written)),
                };
                self.logs.note(job.id, &line).await;
                Ok(Some(Processed::Transitioned(written)))
            }
            Err(JobError::LeaseLost { .. }) => {
                warn!(
                    job_id = job.id,
                    "Worker {} finished job {} after losing its lease; outcome dropped",
                    self.worker_id,
                    job.id
                );
                self.logs
                    .note(
                        job.id,
                        &format!("DROPPED {} outcome of {}: lease lost", outcome.kind(), self.worker_id),
                    )
                    .await;
                Ok(Some(Processed::LeaseLost(job.id)))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Polls until [`stop`](Self::stop) is called. A job in progress gets
    /// `shutdown_grace` to finish; past that it is released.
    pub async fn run(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Worker {} already running", self.worker_id);
            return;
        }
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        info!(
            "Worker {} started (poll {:?}, lease {:?})",
            self.worker_id,
            self.config.poll_interval(),
            self.config.lease()
        );

        while self.running.load(Ordering::SeqCst) {
            let worked = match self.run_once().await {
                Ok(Some(_)) => true,
                Ok(None) => false,
                Err(e) if e.is_transient() => {
                    debug!("Worker {}: {}", self.worker_id, e);
                    false
                }
                Err(e) => {
                    error!("Worker {} iteration failed: {}", self.worker_id, e);
                    false
                }
            };

            if worked {
                continue;
            }
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = tokio::time::sleep(self.config.poll_interval()) => {}
            }
        }

        self.beat(WorkerState::Stopping, None);
        info!("Worker {} stopped", self.worker_id);
    }

    /// Requests shutdown. The loop cannot be restarted afterwards.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());
    }
}
