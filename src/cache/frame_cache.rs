//! Interval-keyed frame cache with forward-only consumption

use std::collections::{BTreeMap, HashSet};

use tracing::{debug, trace};

use super::StreamKind;
use crate::types::{FramePayload, FrameRecord};

/// Result of [`FrameCache::append_batch`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppendOutcome {
    /// Records stored
    pub inserted: usize,
    /// Stored records that replaced one at the same start frame
    pub replaced: usize,
    /// Older-version records evicted by a newer one
    pub evicted: usize,
    /// Records refused because a newer version already covers them
    pub rejected: usize,
}

/// Buffer for one stream type, keyed by `start_frame`.
///
/// At most one record is held per start frame; a later arrival at the same start
/// replaces the earlier one. Reads prune everything that lies entirely before the
/// requested index, so consumption only moves forward.
#[derive(Debug)]
pub struct FrameCache<T> {
    kind: StreamKind,
    entries: BTreeMap<u32, FrameRecord<T>>,
}

impl<T: FramePayload> FrameCache<T> {
    /// Create an empty cache for `kind`.
    pub fn new(kind: StreamKind) -> Self {
        Self { kind, entries: BTreeMap::new() }
    }

    /// Stream this cache buffers.
    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    /// Insert a batch of records.
    ///
    /// Versioned records evict every older-version record starting at or after
    /// their own start, and are themselves rejected when a newer version already
    /// overlaps them from at or after their start.
    pub fn append_batch(
        &mut self,
        records: impl IntoIterator<Item = FrameRecord<T>>,
    ) -> AppendOutcome {
        let mut outcome = AppendOutcome::default();

        for record in records {
            if let Some(version) = record.payload.version() {
                let overlap_end = record.end_frame.max(record.start_frame.saturating_add(1));
                let superseded = self
                    .entries
                    .range(record.start_frame..overlap_end)
                    .any(|(_, existing)| existing.payload.version().is_some_and(|v| v > version));
                if superseded {
                    trace!(
                        stream = ?self.kind,
                        start = record.start_frame,
                        version,
                        "Rejected stale record"
                    );
                    outcome.rejected += 1;
                    continue;
                }

                let stale: Vec<u32> = self
                    .entries
                    .range(record.start_frame..)
                    .filter(|(_, existing)| existing.payload.version().is_some_and(|v| v < version))
                    .map(|(start, _)| *start)
                    .collect();
                for start in stale {
                    self.entries.remove(&start);
                    outcome.evicted += 1;
                }
            }

            if self.entries.insert(record.start_frame, record).is_some() {
                outcome.replaced += 1;
            }
            outcome.inserted += 1;
        }

        if outcome.evicted > 0 || outcome.rejected > 0 {
            debug!(
                stream = ?self.kind,
                evicted = outcome.evicted,
                rejected = outcome.rejected,
                "Superseded records while appending"
            );
        }
        outcome
    }

    /// Remove every record that lies entirely before `index`.
    pub fn prune_before(&mut self, index: u32) -> usize {
        let expired: Vec<u32> = self
            .entries
            .range(..index)
            .filter(|(_, record)| !record.contains(index))
            .map(|(start, _)| *start)
            .collect();
        for start in &expired {
            self.entries.remove(start);
        }
        expired.len()
    }

    /// Prune, then remove and return the record starting exactly at `index`.
    pub fn take_at(&mut self, index: u32) -> Option<FrameRecord<T>> {
        let pruned = self.prune_before(index);
        if pruned > 0 {
            trace!(stream = ?self.kind, index, pruned, "Pruned expired records");
        }
        self.entries.remove(&index)
    }

    /// Remove and return the last record whose start lies in `[lo, hi]`.
    pub fn take_interval(&mut self, lo: u32, hi: u32) -> Option<FrameRecord<T>> {
        if lo > hi {
            return None;
        }
        let start = self.entries.range(lo..=hi).next_back().map(|(start, _)| *start)?;
        self.entries.remove(&start)
    }

    /// Record whose interval contains `index`, without consuming it.
    pub fn covering(&self, index: u32) -> Option<&FrameRecord<T>> {
        self.entries.range(..=index).rev().map(|(_, record)| record).find(|r| r.contains(index))
    }

    /// Drop every record starting before `index`.
    pub fn clear_before(&mut self, index: u32) {
        self.entries = self.entries.split_off(&index);
    }

    /// Drop every record starting at or after `index`.
    pub fn truncate_from(&mut self, index: u32) -> usize {
        self.entries.split_off(&index).len()
    }

    /// Drop everything.
    pub fn clear_all(&mut self) {
        self.entries.clear();
    }

    /// Truncate the queue when `batch` starts outside the covered interval.
    ///
    /// The covered interval is `[first.start_frame, last.end_frame]` of the queue.
    /// When the batch's first start falls outside it, every queued record starting
    /// at or after the batch start is dropped. Returns the number dropped.
    pub fn check_validity(&mut self, batch: &[FrameRecord<T>]) -> usize {
        let Some(new_start) = batch.first().map(|r| r.start_frame) else {
            return 0;
        };
        let (Some(first), Some(last_end)) = (self.first_start(), self.last_end()) else {
            return 0;
        };

        if new_start >= first && new_start <= last_end {
            return 0;
        }

        let dropped = self.truncate_from(new_start);
        if dropped > 0 {
            debug!(stream = ?self.kind, new_start, dropped, "Truncated discontinuous queue");
        }
        dropped
    }

    /// Start of the earliest record.
    pub fn first_start(&self) -> Option<u32> {
        self.entries.keys().next().copied()
    }

    /// End of the latest-starting record.
    pub fn last_end(&self) -> Option<u32> {
        self.entries.values().next_back().map(|r| r.end_frame)
    }

    /// Number of distinct clips referenced by buffered records.
    pub fn clip_count(&self) -> usize {
        self.entries.values().filter_map(|r| r.payload.clip()).collect::<HashSet<_>>().len()
    }

    /// Number of buffered records.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate buffered records in start order.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &FrameRecord<T>> {
        self.entries.values()
    }
}
