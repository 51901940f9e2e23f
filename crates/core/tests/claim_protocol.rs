//! Claim protocol integration tests.
//!
//! These tests run against a SQLite file shared by several store handles,
//! the way separate worker processes share one database:
//! - Exclusive claims under concurrent polling
//! - Lease expiry, reclamation and the thrash guard
//! - Bounded retries
//! - Transition table enforcement for workers and operators

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use tempfile::TempDir;
use tokio_test::{assert_err, assert_ok};

use pressline_core::{
    job::{
        EnqueueRequest, Job, JobError, JobFilter, JobStatus, JobStore, Outcome, ReleaseMetadata,
        SqliteJobStore, Stage, StageOutput,
    },
    machine::{self, Phase, PipelinePolicy, RetryPolicy, Step},
    Actor, Role,
};

const LEASE: Duration = Duration::from_secs(60);

fn open(path: &Path) -> SqliteJobStore {
    SqliteJobStore::new(path).expect("Failed to open job store")
}

fn enqueue(store: &SqliteJobStore, release: &str) -> Job {
    store
        .enqueue(EnqueueRequest::new("c1", release, ReleaseMetadata::new(release)))
        .expect("Failed to enqueue")
}

/// Claims, starts and completes the job waiting for `role`.
fn complete(store: &SqliteJobStore, role: Role, worker_id: &str) -> Job {
    let job = store
        .claim(role, worker_id, LEASE)
        .unwrap()
        .unwrap_or_else(|| panic!("nothing to claim for {}", role));
    store.start(job.id, worker_id).unwrap();
    store
        .transition(
            job.id,
            &Actor::worker(worker_id),
            Outcome::Completed(StageOutput::empty()),
        )
        .unwrap()
}

fn assert_invalid(result: Result<Job, JobError>, from: &str, to: &str) {
    match result {
        Err(JobError::InvalidTransition {
            from: actual_from,
            to: actual_to,
            ..
        }) => {
            assert_eq!(actual_from.to_string(), from);
            assert_eq!(actual_to.to_string(), to);
        }
        other => panic!("expected InvalidTransition {from} -> {to}, got {other:?}"),
    }
}

#[test]
fn test_concurrent_claims_are_exclusive() {
    const JOBS: usize = 5;
    const WORKERS: usize = 16;

    let dir = TempDir::new().unwrap();
    let db = dir.path().join("jobs.db");
    let seed = open(&db);
    for i in 0..JOBS {
        enqueue(&seed, &format!("r{}", i));
    }

    // One handle per worker, opened up front like separate processes.
    let stores: Vec<_> = (0..WORKERS).map(|_| open(&db)).collect();
    let barrier = Arc::new(Barrier::new(WORKERS));

    let handles: Vec<_> = stores
        .into_iter()
        .enumerate()
        .map(|(i, store)| {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let worker_id = format!("import:w{}", i);
                barrier.wait();
                store
                    .claim(Role::Import, &worker_id, LEASE)
                    .expect("claim failed")
                    .map(|job| (job.id, job.owner, worker_id))
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let claimed: Vec<_> = results.iter().flatten().collect();

    assert_eq!(claimed.len(), JOBS);
    assert_eq!(results.iter().filter(|r| r.is_none()).count(), WORKERS - JOBS);

    let ids: HashSet<_> = claimed.iter().map(|(id, _, _)| *id).collect();
    assert_eq!(ids.len(), JOBS, "a job was handed to two workers");
    for (_, owner, worker_id) in &claimed {
        assert_eq!(owner.as_deref(), Some(worker_id.as_str()));
    }

    for job in seed.list(&JobFilter::new()).unwrap() {
        assert_eq!(job.status, JobStatus::Claimed);
    }
}

#[test]
fn test_live_lease_blocks_other_workers() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("jobs.db");
    let a = open(&db);
    let b = open(&db);
    enqueue(&a, "r1");

    assert!(a.claim(Role::Import, "import:a", LEASE).unwrap().is_some());
    assert!(b.claim(Role::Import, "import:b", LEASE).unwrap().is_none());
}

#[test]
fn test_expired_lease_is_reclaimed_and_old_owner_loses() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("jobs.db");
    let a = open(&db);
    let b = open(&db);
    let job = enqueue(&a, "r1");

    let claimed = a
        .claim(Role::Import, "import:a", Duration::from_millis(50))
        .unwrap()
        .unwrap();
    assert_ok!(a.start(claimed.id, "import:a"));

    // import:a stops heartbeating.
    thread::sleep(Duration::from_millis(120));

    let taken = b.claim(Role::Import, "import:b", LEASE).unwrap().unwrap();
    assert_eq!(taken.id, job.id);
    assert_eq!(taken.owner.as_deref(), Some("import:b"));
    assert_eq!(taken.reclaim_count, 1);
    assert_eq!(taken.attempt_count, 0);

    assert!(matches!(
        a.heartbeat(job.id, "import:a", LEASE),
        Err(JobError::LeaseLost { .. })
    ));
    assert!(matches!(
        a.transition(
            job.id,
            &Actor::worker("import:a"),
            Outcome::Completed(StageOutput::empty())
        ),
        Err(JobError::LeaseLost { .. })
    ));

    assert_ok!(b.start(job.id, "import:b"));
    assert_ok!(b.heartbeat(job.id, "import:b", LEASE));
    let done = b
        .transition(
            job.id,
            &Actor::worker("import:b"),
            Outcome::Completed(StageOutput::empty()),
        )
        .unwrap();
    assert_eq!(done.stage, Stage::Render);
    assert_eq!(done.status, JobStatus::Pending);
    assert_eq!(done.reclaim_count, 0);
}

#[test]
fn test_repeated_lease_expiry_fails_job() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir.path().join("jobs.db"))
        .with_policy(PipelinePolicy::default().with_stale_reclaim_limit(3));
    let job = enqueue(&store, "r1");
    let short = Duration::from_millis(30);

    for (i, expected_reclaims) in [0, 1, 2].into_iter().enumerate() {
        let claimed = store
            .claim(Role::Import, &format!("import:crash{}", i), short)
            .unwrap()
            .unwrap();
        assert_eq!(claimed.reclaim_count, expected_reclaims);
        thread::sleep(Duration::from_millis(60));
    }

    assert!(store.claim(Role::Import, "import:last", LEASE).unwrap().is_none());

    let failed = store.get(job.id).unwrap().unwrap();
    assert_eq!(failed.status, JobStatus::FailedPermanent);
    assert!(failed.owner.is_none());
    assert!(failed
        .error_message
        .as_deref()
        .unwrap()
        .contains("lease expired 3 times"));
}

#[test]
fn test_retries_are_bounded() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir.path().join("jobs.db"))
        .with_policy(PipelinePolicy::default().with_retry(RetryPolicy::immediate()));
    let job = store
        .enqueue(
            EnqueueRequest::new("c1", "r1", ReleaseMetadata::new("r1")).with_max_attempts(3),
        )
        .unwrap();

    for attempt in 1..=3u32 {
        let worker = format!("import:w{}", attempt);
        let claimed = store.claim(Role::Import, &worker, LEASE).unwrap().unwrap();
        assert_eq!(claimed.attempt_no(), attempt);
        store.start(claimed.id, &worker).unwrap();

        let written = store
            .transition(
                claimed.id,
                &Actor::worker(&worker),
                Outcome::retryable(format!("importer: timeout #{}", attempt)),
            )
            .unwrap();
        assert_eq!(written.attempt_count, attempt);
        if attempt < 3 {
            assert_eq!(written.status, JobStatus::Retrying);
        } else {
            assert_eq!(written.status, JobStatus::FailedPermanent);
        }
    }

    assert!(store.claim(Role::Import, "import:w4", LEASE).unwrap().is_none());

    let failed = store.get(job.id).unwrap().unwrap();
    assert_eq!(failed.attempt_count, 3);
    assert_eq!(failed.error_message.as_deref(), Some("importer: timeout #3"));
    assert_eq!(Phase::of(&failed), Phase::new(Stage::Import, Step::Failed));
}

#[test]
fn test_fatal_failure_skips_remaining_attempts() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir.path().join("jobs.db"));
    let job = enqueue(&store, "r1");

    let claimed = store.claim(Role::Import, "import:a", LEASE).unwrap().unwrap();
    store.start(claimed.id, "import:a").unwrap();
    let written = store
        .transition(
            job.id,
            &Actor::worker("import:a"),
            Outcome::fatal("importer: release not found"),
        )
        .unwrap();

    assert_eq!(written.status, JobStatus::FailedPermanent);
    assert_eq!(written.attempt_count, 1);
    assert!(store.claim(Role::Import, "import:b", LEASE).unwrap().is_none());
}

#[test]
fn test_stages_cannot_be_skipped() {
    assert_err!(machine::check(
        Phase::new(Stage::Render, Step::Pending),
        Phase::new(Stage::Upload, Step::Pending),
    ));
    assert_err!(machine::check(
        Phase::new(Stage::Qa, Step::Failed),
        Phase::new(Stage::Upload, Step::Pending),
    ));

    let dir = TempDir::new().unwrap();
    let store = open(&dir.path().join("jobs.db"));
    let job = enqueue(&store, "r1");

    assert_invalid(
        store.approve(job.id, "ops"),
        "import:pending",
        "approval:approved",
    );
    assert_invalid(
        store.mark_published(job.id, "ops"),
        "import:pending",
        "publish:done",
    );

    // Each completion moves exactly one stage forward.
    let mut expected = [Stage::Render, Stage::Qa, Stage::Upload, Stage::Approval].into_iter();
    for role in [Role::Import, Role::Render, Role::Qa, Role::Upload] {
        let written = complete(&store, role, &format!("{}:w", role));
        assert_eq!(written.stage, expected.next().unwrap());
        assert_eq!(written.status, JobStatus::Pending);
    }

    // Approval is never claimable by a worker.
    assert!(store.claim(Role::Publish, "publish:w", LEASE).unwrap().is_none());
    assert_invalid(
        store.mark_published(job.id, "ops"),
        "approval:pending",
        "publish:done",
    );

    let approved = store.approve(job.id, "ops").unwrap();
    assert_eq!(Phase::of(&approved), Phase::new(Stage::Publish, Step::Pending));
    assert_invalid(
        store.approve(job.id, "ops"),
        "publish:pending",
        "approval:approved",
    );
}

#[test]
fn test_approval_before_upload_is_rejected_not_queued() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir.path().join("jobs.db"));
    let job = enqueue(&store, "r1");
    for role in [Role::Import, Role::Render, Role::Qa] {
        complete(&store, role, "w");
    }

    let uploading = store.claim(Role::Upload, "upload:w", LEASE).unwrap().unwrap();
    store.start(uploading.id, "upload:w").unwrap();

    assert_invalid(
        store.approve(job.id, "ops"),
        "upload:running",
        "approval:approved",
    );

    let uploaded = store
        .transition(
            job.id,
            &Actor::worker("upload:w"),
            Outcome::Completed(StageOutput::uploaded("https://video.example/abc")),
        )
        .unwrap();
    assert_eq!(Phase::of(&uploaded), Phase::new(Stage::Approval, Step::Pending));
    assert_eq!(uploaded.upload_url.as_deref(), Some("https://video.example/abc"));

    // The early request left no trace.
    let approved = store.approve(job.id, "ops").unwrap();
    assert_eq!(approved.stage, Stage::Publish);
}

#[test]
fn test_mark_published_rejected_while_publish_worker_holds_lease() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir.path().join("jobs.db"));
    let job = enqueue(&store, "r1");
    for role in [Role::Import, Role::Render, Role::Qa, Role::Upload] {
        complete(&store, role, "w");
    }
    store.approve(job.id, "ops").unwrap();

    let publishing = store.claim(Role::Publish, "publish:w", LEASE).unwrap().unwrap();
    assert_eq!(publishing.id, job.id);

    assert_invalid(
        store.mark_published(job.id, "ops"),
        "publish:running",
        "publish:done",
    );

    let published = store
        .transition(
            job.id,
            &Actor::worker("publish:w"),
            Outcome::Completed(StageOutput::empty()),
        )
        .unwrap();
    assert_eq!(Phase::of(&published), Phase::new(Stage::Cleanup, Step::Pending));
    assert!(published.published_at.is_some());
    assert!(published.ttl_expires_at.is_some());
}

#[test]
fn test_reject_ends_job_and_frees_release() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir.path().join("jobs.db"));
    let job = enqueue(&store, "r1");
    for role in [Role::Import, Role::Render, Role::Qa, Role::Upload] {
        complete(&store, role, "w");
    }

    let rejected = store
        .reject(job.id, "ops", Some("wrong cover".to_string()))
        .unwrap();
    assert_eq!(rejected.status, JobStatus::Done);
    assert_eq!(Phase::of(&rejected), Phase::new(Stage::Approval, Step::Rejected));
    assert_eq!(rejected.error_message.as_deref(), Some("wrong cover"));

    assert_invalid(
        store.approve(job.id, "ops"),
        "approval:rejected",
        "approval:approved",
    );

    // A terminal job no longer blocks a new one for the same release.
    let again = enqueue(&store, "r1");
    assert_ne!(again.id, job.id);
}
