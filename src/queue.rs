//! Bounded offline buffer between the sampler and the publisher.
//!
//! The queue absorbs samples produced faster than they can be published,
//! without unbounded growth. Overflow evicts the *oldest* entry: during a long
//! outage the buffer degrades to a bounded recency window rather than freezing
//! on stale data.
//!
//! Draining is split into `peek_batch` and `commit` so that entries are only
//! removed once the transport has confirmed them. A disconnect mid-send leaves
//! everything in place for the next session.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use tracing::debug;

use crate::MetricSample;

/// A sample waiting to be published.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub sample: MetricSample,
    pub enqueued_at: DateTime<Utc>,
}

/// Bounded FIFO buffer of pending samples.
#[derive(Debug)]
pub struct OfflineQueue {
    entries: VecDeque<QueueEntry>,
    capacity: usize,

    /// Total entries evicted due to overflow since startup.
    dropped: u64,
}

impl OfflineQueue {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be positive");
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            dropped: 0,
        }
    }

    /// Append a sample, evicting the oldest entry if the queue is full.
    ///
    /// Returns `true` if an entry was evicted. Queue-full is an expected
    /// operating condition during long outages, not an error.
    pub fn enqueue(&mut self, sample: MetricSample) -> bool {
        let evicted = if self.entries.len() == self.capacity {
            self.entries.pop_front();
            self.dropped += 1;
            debug!(
                dropped = self.dropped,
                "offline queue full, evicted oldest sample"
            );
            true
        } else {
            false
        };

        self.entries.push_back(QueueEntry {
            sample,
            enqueued_at: Utc::now(),
        });

        evicted
    }

    /// The oldest `max_n` entries, in FIFO order, without removing them.
    pub fn peek_batch(&self, max_n: usize) -> impl Iterator<Item = &QueueEntry> {
        self.entries.iter().take(max_n)
    }

    /// Remove the oldest `up_to` entries after the transport confirmed them.
    pub fn commit(&mut self, up_to: usize) {
        let n = up_to.min(self.entries.len());
        self.entries.drain(..n);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total samples evicted since startup.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
