//! Stall detection based on output growth.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Tracks output size samples and decides when a process is stuck.
///
/// The watchdog is pure: callers feed it byte counts and instants.
#[derive(Debug, Clone)]
pub struct OutputGrowthWatchdog {
    started: Instant,
    grace: Duration,
    idle: Duration,
    min_delta: u64,
    last_bytes: u64,
    last_growth: Instant,
    seen_output: bool,
}

impl OutputGrowthWatchdog {
    pub fn new(started: Instant, grace: Duration, idle: Duration, min_delta: u64) -> Self {
        Self {
            started,
            grace,
            idle: idle.max(Duration::from_secs(1)),
            min_delta: min_delta.max(1),
            last_bytes: 0,
            last_growth: started,
            seen_output: false,
        }
    }

    /// Feed a size sample. Returns true when it counts as growth.
    pub fn update(&mut self, bytes: u64, now: Instant) -> bool {
        let grew = if !self.seen_output && bytes > 0 {
            self.seen_output = true;
            true
        } else {
            bytes >= self.last_bytes.saturating_add(self.min_delta)
        };
        if grew {
            self.last_bytes = bytes;
            self.last_growth = now;
        }
        grew
    }

    /// Time since the last counted growth (or since start).
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_growth)
    }

    pub fn is_stuck(&self, now: Instant) -> bool {
        if now.saturating_duration_since(self.started) < self.grace {
            return false;
        }
        self.idle_for(now) >= self.idle
    }

    pub fn last_bytes(&self) -> u64 {
        self.last_bytes
    }
}

/// The artifact plus the temporary siblings encoders write before renaming.
pub fn growth_paths(output: &Path) -> [PathBuf; 3] {
    let sibling = |suffix: &str| {
        let mut name = output.as_os_str().to_owned();
        name.push(suffix);
        PathBuf::from(name)
    };
    [output.to_path_buf(), sibling(".tmp"), sibling(".part")]
}

/// Combined size of the artifact and its temporary siblings.
pub async fn observed_bytes(output: &Path) -> u64 {
    let mut total = 0;
    for path in growth_paths(output) {
        if let Ok(meta) = tokio::fs::metadata(&path).await {
            total += meta.len();
        }
    }
    total
}
