//! Dispatch queue with priority ordering, and the dead letter queue.
//!
//! The dispatch queue holds due jobs waiting for a free executor. Items are ordered by
//! priority (critical first), then by due time (earliest first), then by insertion
//! order. A job appears in the queue at most once.

use chrono::{DateTime, Utc};
use metrics::gauge;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use tokio::sync::Semaphore;
use uuid::Uuid;

use super::lease::JobLease;
use super::{ExecutionOutcome, JobId, JobPriority};

// ═══════════════════════════════════════════════════════════════════════════════
// Dispatch Items
// ═══════════════════════════════════════════════════════════════════════════════

/// A due job waiting for an executor.
#[derive(Debug)]
pub struct DispatchItem {
    pub job_id: JobId,
    pub priority: JobPriority,
    /// The `next_run_at` that made the job due
    pub due_at: DateTime<Utc>,
    /// 1 for a regular dispatch, higher for retries
    pub attempt: u32,
    /// Lease carried by retries so the execution cycle keeps exclusive ownership
    pub lease: Option<JobLease>,
}

impl DispatchItem {
    /// A regular dispatch produced by the scheduler loop.
    pub fn scheduled(job_id: JobId, priority: JobPriority, due_at: DateTime<Utc>) -> Self {
        Self {
            job_id,
            priority,
            due_at,
            attempt: 1,
            lease: None,
        }
    }

    /// A retry of an execution cycle whose lease is still held.
    pub fn retry(job_id: JobId, priority: JobPriority, attempt: u32, lease: JobLease) -> Self {
        Self {
            job_id,
            priority,
            due_at: Utc::now(),
            attempt,
            lease: Some(lease),
        }
    }

    pub fn is_retry(&self) -> bool {
        self.lease.is_some()
    }
}

#[derive(Debug)]
struct QueueEntry {
    item: DispatchItem,
    seq: u64,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    /// Max-heap order: the "greatest" entry is dispatched first.
    fn cmp(&self, other: &Self) -> Ordering {
        self.item
            .priority
            .cmp(&other.item.priority)
            .then_with(|| other.item.due_at.cmp(&self.item.due_at))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug, Default)]
struct QueueInner {
    heap: BinaryHeap<QueueEntry>,
    queued: HashSet<JobId>,
    next_seq: u64,
}

impl QueueInner {
    fn insert(&mut self, item: DispatchItem) -> bool {
        if !self.queued.insert(item.job_id) {
            return false;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(QueueEntry { item, seq });
        true
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Dispatch Queue
// ═══════════════════════════════════════════════════════════════════════════════

/// Priority queue feeding the worker pool.
///
/// [`pop`](Self::pop) waits while the queue is empty and returns `None` once the queue is
/// closed.
#[derive(Debug)]
pub struct DispatchQueue {
    inner: Mutex<QueueInner>,
    /// One permit per queued item
    available: Semaphore,
    closed: AtomicBool,
}

impl Default for DispatchQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatchQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            available: Semaphore::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Enqueue an item. Returns `false` if the job is already queued or the queue is closed.
    pub fn push(&self, item: DispatchItem) -> bool {
        self.push_batch(std::iter::once(item)) == 1
    }

    /// Enqueue several items under one lock, preserving their order for ties.
    /// Returns how many were accepted.
    pub fn push_batch(&self, items: impl IntoIterator<Item = DispatchItem>) -> usize {
        if self.is_closed() {
            return 0;
        }
        let (accepted, depth) = {
            let mut inner = self.inner.lock();
            let mut accepted = 0;
            for item in items {
                if inner.insert(item) {
                    accepted += 1;
                }
            }
            (accepted, inner.heap.len())
        };
        self.available.add_permits(accepted);
        gauge!("tempo_queue_depth").set(depth as f64);
        accepted
    }

    /// Wait for the highest-ranked item.
    pub async fn pop(&self) -> Option<DispatchItem> {
        let permit = self.available.acquire().await.ok()?;
        permit.forget();
        self.take()
    }

    /// Take the highest-ranked item without waiting.
    pub fn try_pop(&self) -> Option<DispatchItem> {
        let permit = self.available.try_acquire().ok()?;
        permit.forget();
        self.take()
    }

    fn take(&self) -> Option<DispatchItem> {
        let mut inner = self.inner.lock();
        let entry = inner.heap.pop()?;
        inner.queued.remove(&entry.item.job_id);
        gauge!("tempo_queue_depth").set(inner.heap.len() as f64);
        Some(entry.item)
    }

    pub fn is_queued(&self, job_id: JobId) -> bool {
        self.inner.lock().queued.contains(&job_id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(AtomicOrdering::Acquire)
    }

    /// Close the queue, waking every waiting executor, and hand back whatever was left.
    pub fn close(&self) -> Vec<DispatchItem> {
        self.closed.store(true, AtomicOrdering::Release);
        self.available.close();

        let mut inner = self.inner.lock();
        inner.queued.clear();
        let mut remaining = Vec::with_capacity(inner.heap.len());
        while let Some(entry) = inner.heap.pop() {
            remaining.push(entry.item);
        }
        gauge!("tempo_queue_depth").set(0.0);
        remaining
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Dead Letter Queue
// ═══════════════════════════════════════════════════════════════════════════════

/// An execution cycle whose final attempt did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub id: Uuid,
    pub job_id: JobId,
    pub job_name: String,
    pub handler: String,
    /// Attempts made in the cycle
    pub attempts: u32,
    pub outcome: ExecutionOutcome,
    pub error_detail: Option<String>,
    pub moved_at: DateTime<Utc>,
}

/// Bounded FIFO of failed execution cycles. The oldest entry is dropped when full.
#[derive(Debug)]
pub struct DeadLetterQueue {
    entries: Mutex<VecDeque<DeadLetterEntry>>,
    max_size: usize,
}

impl DeadLetterQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            max_size,
        }
    }

    pub fn push(&self, entry: DeadLetterEntry) {
        if self.max_size == 0 {
            return;
        }
        let mut entries = self.entries.lock();
        if entries.len() >= self.max_size {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Newest entries first.
    pub fn recent(&self, limit: usize) -> Vec<DeadLetterEntry> {
        self.entries.lock().iter().rev().take(limit).cloned().collect()
    }

    pub fn get(&self, id: Uuid) -> Option<DeadLetterEntry> {
        self.entries.lock().iter().find(|e| e.id == id).cloned()
    }

    /// Take a single entry out of the queue.
    pub fn remove(&self, id: Uuid) -> Option<DeadLetterEntry> {
        let mut entries = self.entries.lock();
        let index = entries.iter().position(|e| e.id == id)?;
        entries.remove(index)
    }

    /// Drop every entry, returning how many there were.
    pub fn clear(&self) -> usize {
        let mut entries = self.entries.lock();
        let cleared = entries.len();
        entries.clear();
        cleared
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
