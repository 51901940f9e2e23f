//! Append-only per-job log files.

use std::io;
use std::path::PathBuf;

use chrono::{SecondsFormat, Utc};
use tokio::io::AsyncWriteExt;

use crate::job::JobId;
use crate::layout::StorageLayout;

/// Writes and tails `job.log` files.
#[derive(Debug, Clone)]
pub struct JobLogs {
    layout: StorageLayout,
}

impl JobLogs {
    pub fn new(layout: StorageLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    pub fn path(&self, job_id: JobId) -> PathBuf {
        self.layout.job_log(job_id)
    }

    /// Appends one timestamped line.
    pub async fn append(&self, job_id: JobId, line: &str) -> io::Result<()> {
        let path = self.path(job_id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        let stamp = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        file.write_all(format!("{} | {}\n", stamp, line.trim_end()).as_bytes())
            .await?;
        file.flush().await
    }

    /// Like [`append`](Self::append), but only warns on I/O errors.
    pub async fn note(&self, job_id: JobId, line: &str) {
        if let Err(e) = self.append(job_id, line).await {
            tracing::warn!("Failed to append to log of job {}: {}", job_id, e);
        }
    }

    /// Last `n` lines of the job log. A missing log yields no lines.
    pub async fn tail(&self, job_id: JobId, n: usize) -> io::Result<Vec<String>> {
        let contents = match tokio::fs::read_to_string(self.path(job_id)).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let lines: Vec<&str> = contents.lines().collect();
        let start = lines.len().saturating_sub(n);
        Ok(lines[start..].iter().map(|l| l.to_string()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_append_and_tail() {
        let dir = TempDir::new().unwrap();
        let logs = JobLogs::new(StorageLayout::new(dir.path()));

        for i in 0..5 {
            logs.append(3, &format!("line {}", i)).await.unwrap();
        }

        let tail = logs.tail(3, 2).await.unwrap();
        assert_eq!(tail.len(), 2);
        assert!(tail[0].ends_with("| line 3"));
        assert!(tail[1].ends_with("| line 4"));
    }

    #[tokio::test]
    async fn test_tail_of_missing_log_is_empty() {
        let dir = TempDir::new().unwrap();
        let logs = JobLogs::new(StorageLayout::new(dir.path()));
        assert!(logs.tail(99, 10).await.unwrap().is_empty());
    }
}
