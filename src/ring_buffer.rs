//! Rolling sample window
//!
//! Holds the most recent `max_seconds × sample_rate` calibrated samples. Every
//! sample gets a global index at insertion that is never reused, even after the
//! oldest entries are evicted or the buffer is cleared. Only [`RingBuffer::reset`]
//! starts the count over.

use crate::config::PipelineConfig;
use crate::types::{BufferedSample, CalibratedSample};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

struct Inner {
    samples: VecDeque<BufferedSample>,
    next_index: u64,
}

/// Fixed-capacity, mutex-guarded sample store.
///
/// Shared between the ingest thread (writer) and any number of readers via
/// `Arc<RingBuffer>`. All operations take the single internal lock.
pub struct RingBuffer {
    inner: Mutex<Inner>,
    capacity: usize,
}

impl RingBuffer {
    /// Create a buffer holding at most `capacity` samples
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(Inner {
                samples: VecDeque::with_capacity(capacity),
                next_index: 0,
            }),
            capacity,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(config.buffer_capacity())
    }

    // A panic while holding the lock cannot leave `Inner` half-updated, so a
    // poisoned lock is still safe to use.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append a sample, evicting the oldest when full. Returns its global index.
    pub fn push(&self, sample: CalibratedSample) -> u64 {
        let mut inner = self.lock();
        let global_index = inner.next_index;
        inner.next_index += 1;

        if inner.samples.len() == self.capacity {
            inner.samples.pop_front();
        }
        inner.samples.push_back(BufferedSample {
            global_index,
            sample,
        });
        global_index
    }

    /// Samples within `seconds` of the newest one, in insertion order
    pub fn get_recent(&self, seconds: f64) -> Vec<BufferedSample> {
        let inner = self.lock();
        let Some(newest) = inner.samples.back() else {
            return Vec::new();
        };
        let cutoff = newest.sample.device_time_ms - (seconds * 1000.0) as i64;

        let mut recent: Vec<BufferedSample> = inner
            .samples
            .iter()
            .rev()
            .take_while(|s| s.sample.device_time_ms >= cutoff)
            .cloned()
            .collect();
        recent.reverse();
        recent
    }

    /// Samples with `start_ms <= device_time_ms <= end_ms`
    pub fn get_range(&self, start_ms: i64, end_ms: i64) -> Vec<BufferedSample> {
        self.lock()
            .samples
            .iter()
            .filter(|s| (start_ms..=end_ms).contains(&s.sample.device_time_ms))
            .cloned()
            .collect()
    }

    /// Samples whose global index lies in `[start, start + count)`
    pub fn get_by_index(&self, start: u64, count: usize) -> Vec<BufferedSample> {
        let end = start.saturating_add(count as u64);
        self.lock()
            .samples
            .iter()
            .filter(|s| s.global_index >= start && s.global_index < end)
            .cloned()
            .collect()
    }

    pub fn latest(&self) -> Option<BufferedSample> {
        self.lock().samples.back().cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Index the next pushed sample will receive
    pub fn next_index(&self) -> u64 {
        self.lock().next_index
    }

    /// Device time of the oldest and newest sample
    pub fn time_range(&self) -> Option<(i64, i64)> {
        let inner = self.lock();
        let first = inner.samples.front()?;
        let last = inner.samples.back()?;
        Some((first.sample.device_time_ms, last.sample.device_time_ms))
    }

    /// Global index of the oldest and newest sample
    pub fn index_range(&self) -> Option<(u64, u64)> {
        let inner = self.lock();
        let first = inner.samples.front()?;
        let last = inner.samples.back()?;
        Some((first.global_index, last.global_index))
    }

    /// Drop all samples; indices keep counting from where they were
    pub fn clear(&self) {
        self.lock().samples.clear();
    }

    /// Drop all samples and restart indices at 0.
    ///
    /// Unlike every other operation this reuses global indices, so any index
    /// a reader kept from before the reset may now name a different sample.
    /// Only call it when no reader holds indices, e.g. before a new session.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.samples.clear();
        inner.next_index = 0;
    }
}
