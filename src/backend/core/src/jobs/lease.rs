//! Per-job execution leases.
//!
//! A lease is a mutual-exclusion token keyed by job id. Holding one means an execution
//! cycle for that job is in flight; dropping the [`JobLease`] releases it.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;

use super::JobId;

/// Table of currently held leases.
#[derive(Debug, Default)]
pub struct LeaseTable {
    held: DashMap<JobId, DateTime<Utc>>,
}

impl LeaseTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Acquire the lease for `job_id`, or `None` if someone already holds it.
    pub fn try_acquire(self: &Arc<Self>, job_id: JobId) -> Option<JobLease> {
        match self.held.entry(job_id) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(Utc::now());
                Some(JobLease {
                    job_id,
                    table: Arc::clone(self),
                })
            }
        }
    }

    pub fn is_held(&self, job_id: JobId) -> bool {
        self.held.contains_key(&job_id)
    }

    /// When the current lease was taken.
    pub fn acquired_at(&self, job_id: JobId) -> Option<DateTime<Utc>> {
        self.held.get(&job_id).map(|at| *at)
    }

    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}

/// A held lease. Released on drop.
#[derive(Debug)]
pub struct JobLease {
    job_id: JobId,
    table: Arc<LeaseTable>,
}

impl JobLease {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }
}

impl Drop for JobLease {
    fn drop(&mut self) {
        self.table.held.remove(&self.job_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_is_exclusive_until_dropped() {
        let table = LeaseTable::new();
        let id = JobId::new();

        let lease = table.try_acquire(id).unwrap();
        assert!(table.is_held(id));
        assert!(table.try_acquire(id).is_none());
        assert!(table.acquired_at(id).is_some());

        // Other jobs are unaffected.
        let other = table.try_acquire(JobId::new()).unwrap();
        assert_eq!(table.len(), 2);

        drop(lease);
        assert!(!table.is_held(id));
        assert!(table.try_acquire(id).is_some());
        drop(other);
    }
}
