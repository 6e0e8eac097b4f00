//! Priority queues of jobs waiting for allocation.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use super::Job;

/// Queue thresholds and starvation rules.
#[derive(Debug, Clone)]
pub struct QueuePolicy {
    /// Jobs not updated for this long are bumped before queueing.
    pub starvation_after: Duration,
    pub starvation_bump: i64,
    /// Added to a job each time a later job in its queue is allocated first.
    pub skip_bump: i64,
    /// Priorities above this go to the high queue.
    pub high_above: i64,
    /// Priorities from this up to `high_above` go to the medium queue.
    pub medium_from: i64,
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self {
            starvation_after: Duration::from_secs(3600),
            starvation_bump: 10,
            skip_bump: 1,
            high_above: 100,
            medium_from: 50,
        }
    }
}

/// A job popped from a queue. `changed` is set when queueing altered the job
/// so it must be saved even if it is not allocated.
#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub job: Job,
    pub changed: bool,
}

struct Entry {
    priority: i64,
    seq: u64,
    queued: QueuedJob,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Highest priority first; equal priorities in insertion order.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Jobs ordered by allocation priority, highest first.
#[derive(Default)]
pub struct JobQueue {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, queued: QueuedJob) {
        self.heap.push(Entry {
            priority: queued.job.allocation_priority(),
            seq: self.next_seq,
            queued,
        });
        self.next_seq += 1;
    }

    pub fn pop(&mut self) -> Option<QueuedJob> {
        self.heap.pop().map(|e| e.queued)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Priorities in pop order, without consuming the queue.
    pub fn priorities(&self) -> Vec<i64> {
        let mut entries: Vec<&Entry> = self.heap.iter().collect();
        entries.sort_by(|a, b| b.cmp(a));
        entries.iter().map(|e| e.priority).collect()
    }
}

/// The three queues, drained high to medium to low.
#[derive(Default)]
pub struct PriorityQueues {
    pub high: JobQueue,
    pub medium: JobQueue,
    pub low: JobQueue,
}

impl PriorityQueues {
    pub fn len(&self) -> usize {
        self.high.len() + self.medium.len() + self.low.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn is_starved(job: &Job, now: DateTime<Utc>, after: Duration) -> bool {
    now.signed_duration_since(job.last_updated())
        .to_std()
        .is_ok_and(|idle| idle >= after)
}

/// Bucket jobs by priority after bumping any that have been idle too long.
pub fn build_priority_queues(
    jobs: Vec<Job>,
    now: DateTime<Utc>,
    policy: &QueuePolicy,
) -> PriorityQueues {
    let mut queues = PriorityQueues::default();

    for mut job in jobs {
        let mut changed = false;
        if is_starved(&job, now, policy.starvation_after) {
            let bumped = job.allocation_priority() + policy.starvation_bump;
            debug!(
                job_id = %job.job_id(),
                from = job.allocation_priority(),
                to = bumped,
                "Bumping priority of starved job"
            );
            job.set_allocation_priority(bumped);
            changed = true;
        }

        let priority = job.allocation_priority();
        let queue = if priority > policy.high_above {
            &mut queues.high
        } else if priority >= policy.medium_from {
            &mut queues.medium
        } else {
            &mut queues.low
        };
        queue.push(QueuedJob { job, changed });
    }

    queues
}
