//! Pending decode work and seek reconciliation

use std::collections::VecDeque;
use tracing::debug;

use super::SegmentTask;

/// What [`DecodeQueue::reconcile`] did with a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The batch continues the queue
    Appended,
    /// The batch starts inside the queue; `dropped` pending tasks were cut
    Truncated { dropped: usize },
    /// Backward seek close to the decode head: the queue was replaced and the
    /// caller must start a new generation
    Replaced { new_start: u32 },
    /// Backward seek with decoded frames still owed before `new_start`: in-flight
    /// work runs up to `abort_after_frame`, then the new batch takes over
    Deferred { abort_after_frame: u32 },
}

/// Ordered pending [`SegmentTask`]s for one pool.
#[derive(Debug, Default)]
pub struct DecodeQueue {
    tasks: VecDeque<SegmentTask>,
    /// Start of the most recently dispatched task, used as the head once the
    /// queue drains
    dispatched_start: Option<u32>,
    abort_after_frame: Option<u32>,
}

impl DecodeQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop everything and start over with `tasks`.
    pub fn replace(&mut self, tasks: Vec<SegmentTask>) {
        self.tasks = tasks.into();
        self.dispatched_start = None;
        self.abort_after_frame = None;
    }

    /// Merge a new batch, treating backward jumps as seeks.
    ///
    /// `last_decoded` is the highest global frame already delivered in the current
    /// generation.
    pub fn reconcile(
        &mut self,
        tasks: Vec<SegmentTask>,
        last_decoded: Option<u32>,
    ) -> ReconcileOutcome {
        let Some(new_start) = tasks.first().map(|t| t.global_start) else {
            return ReconcileOutcome::Appended;
        };

        let head = self.tasks.front().map(|t| t.global_start).or(self.dispatched_start);
        let tail = self.tasks.back().map(|t| t.global_start).or(self.dispatched_start);

        let (Some(head), Some(tail)) = (head, tail) else {
            self.tasks.extend(tasks);
            return ReconcileOutcome::Appended;
        };

        if new_start >= tail {
            self.tasks.extend(tasks);
            return ReconcileOutcome::Appended;
        }

        if new_start < head {
            return match last_decoded {
                Some(decoded) if new_start > decoded && new_start - decoded > 1 => {
                    // Every pending task starts after the cut; only in-flight
                    // work keeps running, bounded by the caller.
                    let abort_after_frame = new_start - 1;
                    self.tasks = tasks.into();
                    self.abort_after_frame = Some(abort_after_frame);
                    debug!(new_start, abort_after_frame, "Deferred seek");
                    ReconcileOutcome::Deferred { abort_after_frame }
                }
                _ => {
                    self.replace(tasks);
                    debug!(new_start, "Immediate seek");
                    ReconcileOutcome::Replaced { new_start }
                }
            };
        }

        let cut = self
            .tasks
            .iter()
            .position(|t| t.global_start >= new_start)
            .unwrap_or(self.tasks.len());
        let dropped = self.tasks.len() - cut;
        self.tasks.truncate(cut);
        self.tasks.extend(tasks);
        ReconcileOutcome::Truncated { dropped }
    }

    /// Take the next task for dispatch.
    pub fn pop_next(&mut self) -> Option<SegmentTask> {
        let task = self.tasks.pop_front()?;
        self.dispatched_start = Some(task.global_start);
        Some(task)
    }

    /// Upcoming tasks, for prefetch.
    pub fn peek_ahead(&self, count: usize) -> impl Iterator<Item = &SegmentTask> {
        self.tasks.iter().take(count)
    }

    /// Pending deferred cut, if any.
    pub fn abort_after_frame(&self) -> Option<u32> {
        self.abort_after_frame
    }

    /// Forget the deferred cut once decoding has reached it.
    pub fn settle_abort(&mut self, last_decoded: u32) -> bool {
        match self.abort_after_frame {
            Some(abort) if last_decoded >= abort => {
                self.abort_after_frame = None;
                true
            }
            _ => false,
        }
    }

    /// Forget the deferred cut once no in-flight work is bounded by it.
    pub fn clear_abort(&mut self) {
        self.abort_after_frame = None;
    }

    pub fn clear(&mut self) {
        self.replace(Vec::new());
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SegmentTask> {
        self.tasks.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::task;

    fn starts(queue: &DecodeQueue) -> Vec<&str> {
        queue.iter().map(|t| &*t.name).collect()
    }

    #[test]
    fn overlap_truncates_then_appends() {
        let mut queue = DecodeQueue::new();
        queue.replace(vec![task("A", 0, 10, 1), task("B", 10, 20, 2)]);

        let outcome = queue.reconcile(vec![task("C", 5, 15, 3)], None);
        assert_eq!(outcome, ReconcileOutcome::Truncated { dropped: 1 });
        assert_eq!(starts(&queue), vec!["A", "C"]);
    }

    #[test]
    fn continuation_appends() {
        let mut queue = DecodeQueue::new();
        queue.replace(vec![task("A", 0, 10, 1), task("B", 10, 20, 2)]);

        assert_eq!(queue.reconcile(vec![task("C", 20, 30, 3)], None), ReconcileOutcome::Appended);
        assert_eq!(starts(&queue), vec!["A", "B", "C"]);
    }

    #[test]
    fn drained_queue_uses_last_dispatched_start() {
        let mut queue = DecodeQueue::new();
        queue.replace(vec![task("A", 50, 60, 1)]);
        queue.pop_next();
        assert!(queue.is_empty());

        let outcome = queue.reconcile(vec![task("B", 60, 70, 2)], Some(55));
        assert_eq!(outcome, ReconcileOutcome::Appended);

        queue.pop_next();
        let outcome = queue.reconcile(vec![task("C", 10, 20, 3)], Some(62));
        assert_eq!(outcome, ReconcileOutcome::Replaced { new_start: 10 });
    }

    #[test]
    fn backward_seek_next_to_decode_head_replaces() {
        let mut queue = DecodeQueue::new();
        queue.replace(vec![task("A", 20, 30, 1), task("B", 30, 40, 2)]);

        let outcome = queue.reconcile(vec![task("C", 10, 20, 3)], Some(9));
        assert_eq!(outcome, ReconcileOutcome::Replaced { new_start: 10 });
        assert_eq!(starts(&queue), vec!["C"]);
        assert_eq!(queue.abort_after_frame(), None);
    }

    #[test]
    fn backward_seek_with_gap_defers_cut() {
        let mut queue = DecodeQueue::new();
        queue.replace(vec![task("A", 0, 10, 1), task("B", 10, 20, 2), task("C", 20, 30, 3)]);
        queue.pop_next();
        queue.pop_next();

        // A and B are in flight with frames up to 3 decoded; the new timeline
        // starts at 15, so in-flight work may run up to 14 and C is dropped.
        let outcome = queue.reconcile(vec![task("D", 15, 25, 4)], Some(3));
        assert_eq!(outcome, ReconcileOutcome::Deferred { abort_after_frame: 14 });
        assert_eq!(starts(&queue), vec!["D"]);

        assert!(!queue.settle_abort(10));
        assert!(queue.settle_abort(14));
        assert_eq!(queue.abort_after_frame(), None);
    }

    #[test]
    fn empty_queue_appends() {
        let mut queue = DecodeQueue::new();
        assert_eq!(queue.reconcile(vec![task("A", 40, 50, 1)], None), ReconcileOutcome::Appended);
        assert_eq!(queue.len(), 1);
    }
}
