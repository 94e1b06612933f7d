//! Pending queue ordered by policy-adjusted effective priority.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::core::error::ResourceError;
use crate::util::serde::TaskId;

/// A pending task's position in the queue.
#[derive(Debug, Clone)]
pub struct RankedTask {
    /// Task id.
    pub id: TaskId,
    /// Dependencies satisfied; ready tasks always sort ahead of blocked ones.
    pub ready: bool,
    /// Policy-adjusted effective priority.
    pub score: f64,
    /// Time the task entered the queue.
    pub queued_at_ms: u128,
}

impl PartialEq for RankedTask {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for RankedTask {}

impl PartialOrd for RankedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RankedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        // Ready first, then higher score, then FIFO (reversed for max-heap).
        self.ready
            .cmp(&other.ready)
            .then_with(|| self.score.total_cmp(&other.score))
            .then_with(|| other.queued_at_ms.cmp(&self.queued_at_ms))
            .then_with(|| other.id.cmp(&self.id))
    }
}

/// Bounded max-heap of pending tasks.
#[derive(Debug)]
pub struct PendingQueue {
    max_depth: usize,
    heap: BinaryHeap<RankedTask>,
}

impl PendingQueue {
    /// Create a queue holding at most `max_depth` tasks.
    pub fn new(max_depth: usize) -> Self {
        Self {
            max_depth,
            heap: BinaryHeap::with_capacity(max_depth.min(1024)),
        }
    }

    /// Insert a task.
    ///
    /// # Errors
    /// [`ResourceError::QueueFull`] at the configured depth.
    pub fn push(&mut self, task: RankedTask) -> Result<(), ResourceError> {
        if self.heap.len() >= self.max_depth {
            return Err(ResourceError::QueueFull(self.heap.len()));
        }
        self.heap.push(task);
        Ok(())
    }

    /// Remove the highest ranked task.
    pub fn pop(&mut self) -> Option<RankedTask> {
        self.heap.pop()
    }

    /// Drop a task wherever it sits. Returns whether it was present.
    pub fn remove(&mut self, id: &str) -> bool {
        let before = self.heap.len();
        self.heap.retain(|t| t.id != id);
        before != self.heap.len()
    }

    /// Replace the contents with freshly ranked entries.
    pub fn rebuild(&mut self, ranked: Vec<RankedTask>) {
        self.heap = BinaryHeap::from(ranked);
    }

    /// Current entries, best first, leaving the queue untouched.
    pub fn ordered(&self) -> Vec<RankedTask> {
        let mut entries = self.heap.clone().into_sorted_vec();
        entries.reverse();
        entries
    }

    /// Number of queued tasks.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Maximum depth.
    pub const fn max_depth(&self) -> usize {
        self.max_depth
    }
}
