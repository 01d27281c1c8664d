// Per-lead bounded history buffers
//
// One ring per lead, each behind its own lock. Writers (append, clear) take
// the lead's write lock briefly; readers copy out a length-stable snapshot
// under the read lock and never hold a reference into the ring.
// Lock order is always lead ring, then tracker.

use crate::abnormality::{AbnormalityRange, AbnormalityTracker};
use crate::types::{Alert, LeadSample, LeadSampleBatch, PipelineError, StreamResult, NUM_LEADS};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Metrics for one lead buffer
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BufferMetrics {
    pub total_appended: u64,
    pub total_evicted: u64,
    pub size: usize,
    pub capacity: usize,
}

/// Result of appending one batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendOutcome {
    pub lead_index: usize,
    pub appended: usize,
    /// Samples pushed out of the front of the ring; eviction is the defined
    /// overflow behavior, not a failure.
    pub evicted: usize,
    pub size: usize,
    pub ranges_registered: usize,
}

/// Fixed-capacity FIFO of samples for one lead
#[derive(Debug)]
struct LeadRing {
    samples: VecDeque<LeadSample>,
    capacity: usize,
    total_appended: u64,
    total_evicted: u64,
}

impl LeadRing {
    fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::new(),
            capacity,
            total_appended: 0,
            total_evicted: 0,
        }
    }

    fn push(&mut self, sample: LeadSample) -> bool {
        if self.capacity == 0 {
            // Evicted as soon as it arrives
            self.total_appended += 1;
            self.total_evicted += 1;
            return true;
        }
        let evicted = if self.samples.len() >= self.capacity {
            self.samples.pop_front();
            self.total_evicted += 1;
            true
        } else {
            false
        };
        self.samples.push_back(sample);
        self.total_appended += 1;
        evicted
    }

    /// Absolute sequence number of the oldest retained sample.
    fn first_sequence(&self) -> u64 {
        self.total_appended - self.samples.len() as u64
    }

    fn reset(&mut self) {
        self.samples.clear();
        self.total_appended = 0;
        self.total_evicted = 0;
    }
}

/// Immutable copy of one lead's history
#[derive(Debug, Clone)]
pub struct LeadSnapshot {
    pub lead_index: usize,
    pub samples: Arc<[LeadSample]>,
    pub first_sequence: u64,
    pub total_appended: u64,
    pub capacity: usize,
    pub ranges: Vec<AbnormalityRange>,
}

impl LeadSnapshot {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Samples in `[start, end)`, clamped to the snapshot.
    pub fn window(&self, start: usize, end: usize) -> &[LeadSample] {
        let end = end.min(self.samples.len());
        let start = start.min(end);
        &self.samples[start..end]
    }
}

/// Owner of every lead buffer and of the abnormality ranges over them
pub struct LeadBufferStore {
    leads: Vec<RwLock<LeadRing>>,
    tracker: Mutex<AbnormalityTracker>,
    capacity: usize,
    total_batches: AtomicU64,
}

impl LeadBufferStore {
    pub fn new(capacity: usize, abnormality_threshold: f32) -> Self {
        Self {
            leads: (0..NUM_LEADS)
                .map(|_| RwLock::new(LeadRing::new(capacity)))
                .collect(),
            tracker: Mutex::new(AbnormalityTracker::new(abnormality_threshold)),
            capacity,
            total_batches: AtomicU64::new(0),
        }
    }

    fn lead(&self, lead_index: usize) -> StreamResult<&RwLock<LeadRing>> {
        self.leads
            .get(lead_index)
            .ok_or(PipelineError::LeadOutOfRange(lead_index))
    }

    /// Push a batch onto its lead, evicting the oldest samples at capacity.
    pub fn append(&self, batch: LeadSampleBatch) -> StreamResult<AppendOutcome> {
        let lead_index = batch.lead_index;
        let mut ring = self.lead(lead_index)?.write();

        let appended = batch.values.len();
        let evicted = batch
            .values
            .into_iter()
            .filter(|&sample| ring.push(sample))
            .count();

        let size = ring.samples.len();
        let first_sequence = ring.first_sequence();

        let ranges_registered = {
            let mut tracker = self.tracker.lock();
            if evicted > 0 {
                tracker.prune(lead_index, first_sequence);
            }
            match &batch.abnormalities {
                Some(scores) => tracker.update(lead_index, scores, size, ring.total_appended),
                None => 0,
            }
        };

        self.total_batches.fetch_add(1, Ordering::Relaxed);

        Ok(AppendOutcome {
            lead_index,
            appended,
            evicted,
            size,
            ranges_registered,
        })
    }

    /// Length-stable copy of a lead's samples and its current ranges.
    pub fn snapshot(&self, lead_index: usize) -> StreamResult<LeadSnapshot> {
        let ring = self.lead(lead_index)?.read();
        let first_sequence = ring.first_sequence();
        let ranges = self
            .tracker
            .lock()
            .ranges(lead_index, first_sequence, ring.samples.len());

        Ok(LeadSnapshot {
            lead_index,
            samples: ring.samples.iter().copied().collect(),
            first_sequence,
            total_appended: ring.total_appended,
            capacity: ring.capacity,
            ranges,
        })
    }

    /// Copy of `[start, end)` for one lead, clamped to what is buffered.
    pub fn read_range(&self, lead_index: usize, start: usize, end: usize) -> StreamResult<Vec<LeadSample>> {
        let ring = self.lead(lead_index)?.read();
        let end = end.min(ring.samples.len());
        let start = start.min(end);
        Ok(ring.samples.range(start..end).copied().collect())
    }

    pub fn ranges(&self, lead_index: usize) -> StreamResult<Vec<AbnormalityRange>> {
        let ring = self.lead(lead_index)?.read();
        let first_sequence = ring.first_sequence();
        Ok(self
            .tracker
            .lock()
            .ranges(lead_index, first_sequence, ring.samples.len()))
    }

    pub fn alerts(&self, lead_index: usize) -> Vec<Alert> {
        self.tracker.lock().alerts(lead_index)
    }

    /// Current number of samples held for a lead (0 for unknown leads).
    pub fn len(&self, lead_index: usize) -> usize {
        self.leads
            .get(lead_index)
            .map(|ring| ring.read().samples.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self, lead_index: usize) -> bool {
        self.len(lead_index) == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn metrics(&self, lead_index: usize) -> StreamResult<BufferMetrics> {
        let ring = self.lead(lead_index)?.read();
        Ok(BufferMetrics {
            total_appended: ring.total_appended,
            total_evicted: ring.total_evicted,
            size: ring.samples.len(),
            capacity: ring.capacity,
        })
    }

    pub fn total_batches(&self) -> u64 {
        self.total_batches.load(Ordering::Relaxed)
    }

    /// Borrow the store without append or clear access.
    pub fn reader(&self) -> BufferReader<'_> {
        BufferReader { store: self }
    }

    /// Pre-allocate the first `lead_count` rings to full capacity.
    pub fn reserve(&self, lead_count: usize) {
        for ring in self.leads.iter().take(lead_count) {
            let mut ring = ring.write();
            let additional = ring.capacity.saturating_sub(ring.samples.len());
            ring.samples.reserve(additional);
        }
    }

    /// Reset one lead and its ranges.
    pub fn clear(&self, lead_index: usize) -> StreamResult<()> {
        let mut ring = self.lead(lead_index)?.write();
        ring.reset();
        self.tracker.lock().clear(lead_index);
        Ok(())
    }

    /// Reset every lead, e.g. when switching recording sessions.
    pub fn clear_all(&self) {
        for ring in &self.leads {
            ring.write().reset();
        }
        self.tracker.lock().clear_all();
        self.total_batches.store(0, Ordering::Relaxed);
    }
}

/// Read-only view of a `LeadBufferStore`
#[derive(Clone, Copy)]
pub struct BufferReader<'a> {
    store: &'a LeadBufferStore,
}

impl BufferReader<'_> {
    pub fn len(&self, lead_index: usize) -> usize {
        self.store.len(lead_index)
    }

    pub fn is_empty(&self, lead_index: usize) -> bool {
        self.store.is_empty(lead_index)
    }

    pub fn capacity(&self) -> usize {
        self.store.capacity()
    }

    pub fn snapshot(&self, lead_index: usize) -> StreamResult<LeadSnapshot> {
        self.store.snapshot(lead_index)
    }

    pub fn read_range(
        &self,
        lead_index: usize,
        start: usize,
        end: usize,
    ) -> StreamResult<Vec<LeadSample>> {
        self.store.read_range(lead_index, start, end)
    }

    pub fn ranges(&self, lead_index: usize) -> StreamResult<Vec<AbnormalityRange>> {
        self.store.ranges(lead_index)
    }

    pub fn metrics(&self, lead_index: usize) -> StreamResult<BufferMetrics> {
        self.store.metrics(lead_index)
    }
}
