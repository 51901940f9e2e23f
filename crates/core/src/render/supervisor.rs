//! Launches render processes, watches them and falls back to the software encoder.

use std::collections::VecDeque;
use std::io;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::config::RenderConfig;
use super::encoder::EncoderPlan;
use super::error::RenderError;
use super::probe::{ArtifactInfo, ArtifactProbe, FfprobeProbe, SizeProbe};
use super::program::{format_percent, FfmpegProgram, ProgressParser, RenderProgram};
use super::types::{
    AttemptOutcome, CommandSpec, EncoderKind, RenderAttempt, RenderReport, RenderRequest,
};
use super::watchdog::{growth_paths, observed_bytes, OutputGrowthWatchdog};
use crate::job::JobId;
use crate::joblog::JobLogs;

const STDERR_TAIL_LINES: usize = 20;
const PROGRESS_LOG_STEP: f64 = 5.0;
const READER_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// How the child ended, as seen by the watch loop.
struct WatchedExit {
    status: ExitStatus,
    stuck_for: Option<Duration>,
}

/// Runs at most two render attempts per request.
pub struct RenderSupervisor {
    config: RenderConfig,
    program: Arc<dyn RenderProgram>,
    probe: Arc<dyn ArtifactProbe>,
    encoders: EncoderPlan,
    logs: JobLogs,
}

impl RenderSupervisor {
    pub fn new(
        config: RenderConfig,
        program: Arc<dyn RenderProgram>,
        probe: Arc<dyn ArtifactProbe>,
        encoders: EncoderPlan,
        logs: JobLogs,
    ) -> Self {
        Self {
            config,
            program,
            probe,
            encoders,
            logs,
        }
    }

    /// ffmpeg program, ffprobe validation and detected encoders.
    pub async fn from_config(config: RenderConfig, logs: JobLogs) -> Self {
        let encoders = EncoderPlan::detect(&config).await;
        let probe: Arc<dyn ArtifactProbe> = if config.probe_artifact {
            Arc::new(FfprobeProbe::new(&config.ffprobe_path))
        } else {
            Arc::new(SizeProbe)
        };
        let program = Arc::new(FfmpegProgram::new(config.clone()));
        Self::new(config, program, probe, encoders, logs)
    }

    pub fn config(&self) -> &RenderConfig {
        &self.config
    }

    pub fn encoders(&self) -> &EncoderPlan {
        &self.encoders
    }

    /// Renders `request.output`, trying the primary encoder then the fallback.
    pub async fn render(&self, request: &RenderRequest) -> Result<RenderReport, RenderError> {
        let job_id = request.job_id;
        if let Some(parent) = request.output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut attempts = Vec::with_capacity(2);
        for (attempt_no, kind) in [(1, EncoderKind::Primary), (2, EncoderKind::Fallback)] {
            let (attempt, info) = self.run_attempt(request, attempt_no, kind).await;
            self.record_attempt(&attempt).await;

            if attempt.outcome.is_success() {
                let (size_bytes, sha256) = digest_file(&request.output).await?;
                info!(
                    job_id,
                    attempt = attempt_no,
                    codec = %attempt.codec,
                    size_bytes,
                    "Render of job {} succeeded on attempt {}",
                    job_id,
                    attempt_no
                );
                let codec = attempt.codec.clone();
                attempts.push(attempt);
                return Ok(RenderReport {
                    job_id,
                    output: request.output.clone(),
                    encoder: kind,
                    codec,
                    size_bytes,
                    sha256,
                    duration_secs: info.and_then(|i| i.duration_secs),
                    attempts,
                });
            }

            warn!(
                job_id,
                attempt = attempt_no,
                codec = %attempt.codec,
                log = %attempt.log_path.display(),
                "Render attempt {} for job {} failed: {}",
                attempt_no,
                job_id,
                attempt.outcome
            );
            attempts.push(attempt);
        }

        error!(job_id, "Render of job {} failed on both encoders", job_id);
        Err(RenderError::RenderFailed { attempts })
    }

    async fn run_attempt(
        &self,
        request: &RenderRequest,
        attempt_no: u32,
        kind: EncoderKind,
    ) -> (RenderAttempt, Option<ArtifactInfo>) {
        let job_id = request.job_id;
        let encoder = self.encoders.profile(kind);
        let log_path = self
            .logs
            .layout()
            .attempt_log(job_id, attempt_no, &encoder.codec);
        let mut attempt = RenderAttempt::new(job_id, attempt_no, kind, &encoder.codec, log_path);

        remove_partial_output(&request.output).await;
        let spec = self.program.build(request, encoder);
        self.logs
            .note(job_id, &format!("CMD: {}", spec.display()))
            .await;
        info!(
            job_id,
            attempt = attempt_no,
            codec = %encoder.codec,
            "Starting render attempt {} for job {}: {}",
            attempt_no,
            job_id,
            spec.display()
        );

        let exit = match self.launch_and_watch(&spec, request, &mut attempt).await {
            Ok(exit) => exit,
            Err(e) => {
                attempt.outcome = AttemptOutcome::LaunchFailed {
                    reason: e.to_string(),
                };
                return (attempt, None);
            }
        };

        if let Some(idle) = exit.stuck_for {
            attempt.outcome = AttemptOutcome::Stuck {
                idle_secs: idle.as_secs_f64(),
            };
            return (attempt, None);
        }
        if !exit.status.success() {
            attempt.outcome = AttemptOutcome::ExitFailure {
                code: exit.status.code(),
            };
            return (attempt, None);
        }

        match self.validate(&request.output).await {
            Ok(info) => {
                attempt.observed_output_bytes = attempt.observed_output_bytes.max(info.size_bytes);
                attempt.outcome = AttemptOutcome::Succeeded;
                (attempt, Some(info))
            }
            Err(outcome) => {
                attempt.outcome = outcome;
                (attempt, None)
            }
        }
    }

    async fn launch_and_watch(
        &self,
        spec: &CommandSpec,
        request: &RenderRequest,
        attempt: &mut RenderAttempt,
    ) -> io::Result<WatchedExit> {
        if let Some(parent) = attempt.log_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let stderr_log = tokio::fs::File::create(&attempt.log_path).await?;

        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        attempt.started_at = Utc::now();

        let stderr_task = child.stderr.take().map(|stderr| {
            tokio::spawn(capture_stderr(
                stderr,
                stderr_log,
                self.config.echo_stderr,
                request.job_id,
            ))
        });
        let progress_task = child.stdout.take().map(|stdout| {
            tokio::spawn(track_progress(
                stdout,
                self.logs.clone(),
                request.job_id,
                request.expected_duration_secs,
            ))
        });

        let exit = self.watch(&mut child, request, attempt).await;

        if let Some(task) = stderr_task {
            attempt.stderr_tail = join_reader(task).await.unwrap_or_default();
        }
        if let Some(task) = progress_task {
            join_reader(task).await;
        }
        exit
    }

    /// Samples output growth until the child exits, terminating it when stuck.
    async fn watch(
        &self,
        child: &mut Child,
        request: &RenderRequest,
        attempt: &mut RenderAttempt,
    ) -> io::Result<WatchedExit> {
        let job_id = request.job_id;
        let mut watchdog = OutputGrowthWatchdog::new(
            Instant::now(),
            self.config.grace_period(),
            self.config.idle_threshold(),
            self.config.min_growth(),
        );
        let mut ticker = tokio::time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut stuck: Option<(Instant, Duration)> = None;
        let mut killed = false;

        loop {
            ticker.tick().await;
            if let Some(status) = child.try_wait()? {
                return Ok(WatchedExit {
                    status,
                    stuck_for: stuck.map(|(_, idle)| idle),
                });
            }

            let now = Instant::now();
            let bytes = observed_bytes(&request.output).await;
            attempt.observed_output_bytes = bytes;
            if watchdog.update(bytes, now) {
                attempt.last_growth_at = Some(Utc::now());
            }

            match stuck {
                None if watchdog.is_stuck(now) => {
                    let idle = watchdog.idle_for(now);
                    warn!(
                        job_id,
                        attempt = attempt.attempt_no,
                        bytes,
                        "Render of job {} stuck: no output growth for {:.1}s, sending SIGTERM",
                        job_id,
                        idle.as_secs_f64()
                    );
                    self.logs
                        .note(
                            job_id,
                            &format!(
                                "WATCHDOG: attempt {} made no progress for {:.1}s at {} bytes, terminating",
                                attempt.attempt_no,
                                idle.as_secs_f64(),
                                bytes
                            ),
                        )
                        .await;
                    terminate(child);
                    stuck = Some((now, idle));
                }
                Some((since, _))
                    if !killed && now.saturating_duration_since(since) >= self.config.kill_grace() =>
                {
                    warn!(
                        job_id,
                        attempt = attempt.attempt_no,
                        "Render process of job {} still alive after kill grace, killing",
                        job_id
                    );
                    self.logs
                        .note(job_id, "WATCHDOG: kill grace elapsed, killing")
                        .await;
                    if let Err(e) = child.start_kill() {
                        debug!("Failed to kill render process of job {}: {}", job_id, e);
                    }
                    killed = true;
                }
                _ => {}
            }
        }
    }

    /// Clean exit is not enough: the artifact must exist, be non-trivial and probe cleanly.
    async fn validate(&self, output: &Path) -> Result<ArtifactInfo, AttemptOutcome> {
        let size = match tokio::fs::metadata(output).await {
            Ok(meta) => meta.len(),
            Err(_) => return Err(AttemptOutcome::MissingArtifact),
        };
        if size == 0 {
            return Err(AttemptOutcome::MissingArtifact);
        }
        if size < self.config.min_artifact_bytes {
            return Err(AttemptOutcome::InvalidArtifact {
                reason: format!(
                    "artifact is {} bytes, expected at least {}",
                    size, self.config.min_artifact_bytes
                ),
            });
        }
        self.probe
            .inspect(output)
            .await
            .map_err(|e| AttemptOutcome::InvalidArtifact {
                reason: e.to_string(),
            })
    }

    async fn record_attempt(&self, attempt: &RenderAttempt) {
        let line = match serde_json::to_string(attempt) {
            Ok(json) => format!("ATTEMPT {}", json),
            Err(_) => format!("ATTEMPT {}", attempt.summary()),
        };
        self.logs.note(attempt.job_id, &line).await;
    }
}

async fn remove_partial_output(output: &Path) {
    for path in growth_paths(output) {
        match tokio::fs::remove_file(&path).await {
            Ok(()) => debug!("Removed stale render output {}", path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
        }
    }
}

#[cfg(unix)]
fn terminate(child: &mut Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            debug!("SIGTERM to pid {} failed: {}", pid, e);
        }
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) {
    let _ = child.start_kill();
}

/// Copies stderr verbatim into the attempt log and keeps the last lines.
async fn capture_stderr(
    stderr: ChildStderr,
    mut log: tokio::fs::File,
    echo: bool,
    job_id: JobId,
) -> Vec<String> {
    let mut reader = BufReader::new(stderr);
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
    let mut buf = Vec::new();
    let mut log_ok = true;

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(job_id, "Failed to read render stderr: {}", e);
                break;
            }
        }
        if log_ok {
            if let Err(e) = log.write_all(&buf).await {
                warn!(job_id, "Render stderr is no longer being persisted: {}", e);
                log_ok = false;
            }
        }

        let line = String::from_utf8_lossy(&buf).trim_end().to_string();
        if line.is_empty() {
            continue;
        }
        if echo {
            debug!(job_id, "render stderr: {}", line);
        }
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }

    if log_ok {
        if let Err(e) = log.flush().await {
            warn!(job_id, "Failed to flush render stderr log: {}", e);
        }
    }
    tail.into_iter().collect()
}

/// Turns `-progress pipe:1` output into percentage lines in the job log.
async fn track_progress(
    stdout: ChildStdout,
    logs: JobLogs,
    job_id: JobId,
    expected_duration_secs: Option<f64>,
) {
    let mut lines = BufReader::new(stdout).lines();
    let mut parser = ProgressParser::new(expected_duration_secs);
    let mut last_logged: Option<f64> = None;

    while let Ok(Some(line)) = lines.next_line().await {
        let Some(percent) = parser.feed(&line) else {
            continue;
        };
        let due = last_logged.map_or(true, |prev| {
            percent - prev >= PROGRESS_LOG_STEP || (percent >= 100.0 && prev < 100.0)
        });
        if due {
            logs.note(job_id, &format_percent(percent)).await;
            last_logged = Some(percent);
        }
    }
}

async fn join_reader<T>(mut task: JoinHandle<T>) -> Option<T> {
    match tokio::time::timeout(READER_JOIN_TIMEOUT, &mut task).await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(_)) => None,
        Err(_) => {
            task.abort();
            None
        }
    }
}

async fn digest_file(path: &Path) -> io::Result<(u64, String)> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok((total, format!("{:x}", hasher.finalize())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::StorageLayout;
    use crate::render::encoder::cpu_profile;
    use crate::render::types::EncoderProfile;
    use crate::testing::ScriptProgram;
    use tempfile::TempDir;

    fn fast_config() -> RenderConfig {
        RenderConfig::default()
            .with_watchdog(0.2, 1.0, 0.5)
            .with_poll_interval_ms(50)
            .with_min_artifact_bytes(1024)
    }

    fn plan() -> EncoderPlan {
        let primary = EncoderProfile {
            codec: "fakehw".to_string(),
            args: vec![],
            hardware: true,
        };
        EncoderPlan::new(primary, cpu_profile())
    }

    fn supervisor(dir: &TempDir, program: ScriptProgram) -> RenderSupervisor {
        RenderSupervisor::new(
            fast_config(),
            Arc::new(program),
            Arc::new(SizeProbe),
            plan(),
            JobLogs::new(StorageLayout::new(dir.path())),
        )
    }

    fn request(dir: &TempDir, job_id: JobId) -> RenderRequest {
        RenderRequest {
            job_id,
            image: dir.path().join("cover.png"),
            audio: dir.path().join("audio.flac"),
            output: StorageLayout::new(dir.path()).artifact_path(job_id),
            expected_duration_secs: Some(10.0),
        }
    }

    const WRITE_4K: &str = r#"echo "encoding" >&2; head -c 4096 /dev/zero > "$OUT""#;

    #[tokio::test]
    async fn test_first_attempt_success() {
        let dir = TempDir::new().unwrap();
        let program = ScriptProgram::new(
            r#"echo "out_time_ms=5000000"; echo "progress=end"; head -c 4096 /dev/zero > "$OUT""#,
            "exit 1",
        );
        let sup = supervisor(&dir, program);
        let report = sup.render(&request(&dir, 1)).await.unwrap();

        assert_eq!(report.encoder, EncoderKind::Primary);
        assert_eq!(report.codec, "fakehw");
        assert_eq!(report.size_bytes, 4096);
        assert_eq!(report.sha256.len(), 64);
        assert_eq!(report.attempts.len(), 1);

        let log = std::fs::read_to_string(sup.logs.path(1)).unwrap();
        assert!(log.contains("CMD: /bin/sh -c"));
        assert!(log.contains("50.0 %"));
        assert!(log.contains("ATTEMPT {"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_falls_back() {
        let dir = TempDir::new().unwrap();
        let program = ScriptProgram::new(r#"echo "no device" >&2; exit 3"#, WRITE_4K);
        let sup = supervisor(&dir, program);
        let report = sup.render(&request(&dir, 2)).await.unwrap();

        assert_eq!(report.encoder, EncoderKind::Fallback);
        assert_eq!(report.attempts.len(), 2);
        assert_eq!(
            report.attempts[0].outcome,
            AttemptOutcome::ExitFailure { code: Some(3) }
        );
        assert_eq!(report.attempts[0].stderr_tail, vec!["no device".to_string()]);

        let stderr = std::fs::read_to_string(&report.attempts[0].log_path).unwrap();
        assert_eq!(stderr, "no device\n");
    }

    #[tokio::test]
    async fn test_clean_exit_without_artifact_fails() {
        let dir = TempDir::new().unwrap();
        let program = ScriptProgram::new("exit 0", r#"head -c 10 /dev/zero > "$OUT""#);
        let sup = supervisor(&dir, program);
        let err = sup.render(&request(&dir, 3)).await.unwrap_err();

        match err {
            RenderError::RenderFailed { attempts } => {
                assert_eq!(attempts.len(), 2);
                assert_eq!(attempts[0].outcome, AttemptOutcome::MissingArtifact);
                assert!(matches!(
                    attempts[1].outcome,
                    AttemptOutcome::InvalidArtifact { .. }
                ));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_launch_failure_is_an_attempt() {
        let dir = TempDir::new().unwrap();
        let sup = RenderSupervisor::new(
            fast_config(),
            Arc::new(FfmpegProgram::new(RenderConfig {
                ffmpeg_path: "/definitely/not/ffmpeg".into(),
                ..RenderConfig::default()
            })),
            Arc::new(SizeProbe),
            EncoderPlan::cpu_only(),
            JobLogs::new(StorageLayout::new(dir.path())),
        );
        let err = sup.render(&request(&dir, 4)).await.unwrap_err();
        match err {
            RenderError::RenderFailed { attempts } => {
                assert!(attempts
                    .iter()
                    .all(|a| matches!(a.outcome, AttemptOutcome::LaunchFailed { .. })));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_stuck_process_ignoring_sigterm_is_killed() {
        let dir = TempDir::new().unwrap();
        let program = ScriptProgram::new(
            "trap '' TERM; while :; do sleep 0.1; done",
            WRITE_4K,
        );
        let sup = supervisor(&dir, program);

        let started = Instant::now();
        let report = sup.render(&request(&dir, 5)).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(10));

        assert_eq!(report.encoder, EncoderKind::Fallback);
        assert!(matches!(
            report.attempts[0].outcome,
            AttemptOutcome::Stuck { idle_secs } if idle_secs >= 1.0
        ));
        assert_eq!(report.attempts[0].observed_output_bytes, 0);

        let log = std::fs::read_to_string(sup.logs.path(5)).unwrap();
        assert!(log.contains("WATCHDOG: attempt 1 made no progress"));
        assert!(log.contains("kill grace elapsed"));
    }

    #[tokio::test]
    async fn test_stderr_tail_survives_unwritable_log() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stderr.log");
        std::fs::write(&path, b"").unwrap();
        // Opened read-only, so every write fails.
        let log = tokio::fs::File::open(&path).await.unwrap();

        let mut child = Command::new("sh")
            .arg("-c")
            .arg("echo one >&2; echo two >&2")
            .stderr(Stdio::piped())
            .spawn()
            .unwrap();
        let stderr = child.stderr.take().unwrap();

        let tail = capture_stderr(stderr, log, false, 1).await;
        child.wait().await.unwrap();

        assert_eq!(tail, vec!["one".to_string(), "two".to_string()]);
        assert_eq!(std::fs::read(&path).unwrap(), b"");
    }
}
