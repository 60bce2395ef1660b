//! Bounded per-job execution history.
//!
//! Each job owns a ring buffer of [`ExecutionRecord`]s. When the buffer is full the
//! oldest record is evicted regardless of its outcome. Records are never mutated after
//! being appended.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::VecDeque;

use super::{ExecutionRecord, JobId};
use crate::error::Result;

/// Default number of records retained per job.
pub const DEFAULT_RETENTION_PER_JOB: usize = 1000;

/// Storage for execution records.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Append a record, evicting the oldest one if the job's buffer is full.
    async fn append(&self, record: ExecutionRecord) -> Result<()>;

    /// Most recent records for a job, newest first, at most `limit` of them.
    async fn list(&self, job_id: JobId, limit: usize) -> Result<Vec<ExecutionRecord>>;

    /// Number of retained records for a job.
    async fn count(&self, job_id: JobId) -> Result<usize>;

    /// Drop every record of a job. Returns how many were removed.
    async fn purge(&self, job_id: JobId) -> Result<usize>;
}

/// In-memory history store.
#[derive(Debug)]
pub struct InMemoryHistoryStore {
    records: DashMap<JobId, VecDeque<ExecutionRecord>>,
    retention: usize,
}

impl InMemoryHistoryStore {
    pub fn new(retention: usize) -> Self {
        Self {
            records: DashMap::new(),
            retention: retention.max(1),
        }
    }

    pub fn retention(&self) -> usize {
        self.retention
    }
}

impl Default for InMemoryHistoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_RETENTION_PER_JOB)
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn append(&self, record: ExecutionRecord) -> Result<()> {
        let mut buffer = self.records.entry(record.job_id).or_default();
        while buffer.len() >= self.retention {
            buffer.pop_front();
        }
        buffer.push_back(record);
        Ok(())
    }

    async fn list(&self, job_id: JobId, limit: usize) -> Result<Vec<ExecutionRecord>> {
        Ok(self
            .records
            .get(&job_id)
            .map(|buffer| buffer.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn count(&self, job_id: JobId) -> Result<usize> {
        Ok(self.records.get(&job_id).map(|b| b.len()).unwrap_or(0))
    }

    async fn purge(&self, job_id: JobId) -> Result<usize> {
        Ok(self
            .records
            .remove(&job_id)
            .map(|(_, buffer)| buffer.len())
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::ExecutionOutcome;
    use chrono::{Duration, TimeZone, Utc};

    fn record(job_id: JobId, n: i64) -> ExecutionRecord {
        let started = Utc.timestamp_opt(1_700_000_000 + n, 0).unwrap();
        if n % 3 == 0 {
            ExecutionRecord::unsuccessful(
                job_id,
                1,
                started,
                started + Duration::milliseconds(10),
                ExecutionOutcome::Failure,
                format!("run {}", n),
            )
        } else {
            ExecutionRecord::success(job_id, 1, started, started + Duration::milliseconds(10))
        }
    }

    #[tokio::test]
    async fn test_retention_keeps_most_recent() {
        let store = InMemoryHistoryStore::new(1000);
        let job_id = JobId::new();

        for n in 0..1500 {
            store.append(record(job_id, n)).await.unwrap();
        }

        assert_eq!(store.count(job_id).await.unwrap(), 1000);
        let all = store.list(job_id, usize::MAX).await.unwrap();
        assert_eq!(all.len(), 1000);
        assert_eq!(all.first().unwrap(), &record(job_id, 1499));
        assert_eq!(all.last().unwrap(), &record(job_id, 500));
    }

    #[tokio::test]
    async fn test_list_newest_first_with_limit() {
        let store = InMemoryHistoryStore::default();
        let job_id = JobId::new();
        for n in 0..5 {
            store.append(record(job_id, n)).await.unwrap();
        }

        let recent = store.list(job_id, 2).await.unwrap();
        assert_eq!(recent, vec![record(job_id, 4), record(job_id, 3)]);
        assert!(store.list(JobId::new(), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_jobs_are_isolated_and_purge() {
        let store = InMemoryHistoryStore::new(10);
        let a = JobId::new();
        let b = JobId::new();
        for n in 0..3 {
            store.append(record(a, n)).await.unwrap();
        }
        store.append(record(b, 0)).await.unwrap();

        assert_eq!(store.purge(a).await.unwrap(), 3);
        assert_eq!(store.count(a).await.unwrap(), 0);
        assert_eq!(store.count(b).await.unwrap(), 1);
        assert_eq!(store.purge(a).await.unwrap(), 0);
    }
}
