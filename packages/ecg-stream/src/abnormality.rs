// Abnormality range tracking
//
// Ranges are recorded against absolute sample sequence numbers so eviction
// from the ring shifts them without bookkeeping; they are translated to
// buffer-relative indices when read.
//
// The "most recent 25% of the buffer" rule is a display placeholder for
// where a reported code is highlighted. It is not a QRS or morphology
// detector and must not be presented as one.

use crate::types::{AbnormalityScores, Alert, NUM_LEADS};
use serde::{Deserialize, Serialize};

/// Fraction of the buffer (from the front) left unhighlighted.
const HIGHLIGHT_START_FRACTION: f64 = 0.75;

/// Highlighted, half-open index interval into a lead buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbnormalityRange {
    pub lead_index: usize,
    pub start_index: usize,
    pub end_index: usize,
    pub code: String,
    pub probability: f32,
}

impl AbnormalityRange {
    pub fn len(&self) -> usize {
        self.end_index - self.start_index
    }

    pub fn is_empty(&self) -> bool {
        self.end_index <= self.start_index
    }

    /// Intersection with `[start, end)`, if any.
    pub fn overlap(&self, start: usize, end: usize) -> Option<(usize, usize)> {
        let lo = self.start_index.max(start);
        let hi = self.end_index.min(end);
        (lo < hi).then_some((lo, hi))
    }
}

#[derive(Debug, Clone)]
struct TrackedRange {
    code: String,
    probability: f32,
    start_sequence: u64,
    end_sequence: u64,
}

#[derive(Debug, Clone, Default)]
struct LeadAbnormalities {
    ranges: Vec<TrackedRange>,
    alerts: Vec<Alert>,
}

/// Per-lead abnormality ranges, owned by the buffer store.
#[derive(Debug, Clone)]
pub struct AbnormalityTracker {
    threshold: f32,
    leads: Vec<LeadAbnormalities>,
}

impl AbnormalityTracker {
    pub fn new(threshold: f32) -> Self {
        Self {
            threshold,
            leads: vec![LeadAbnormalities::default(); NUM_LEADS],
        }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Apply the latest scores for a lead.
    ///
    /// Any code at or above the threshold replaces the lead's ranges with one
    /// entry per abnormal code (in report order), each covering
    /// `[floor(0.75 * size), size)`. No abnormal code clears the lead.
    /// Returns the number of ranges registered.
    pub fn update(
        &mut self,
        lead_index: usize,
        abnormalities: &AbnormalityScores,
        buffer_size: usize,
        total_appended: u64,
    ) -> usize {
        let threshold = self.threshold;
        let Some(lead) = self.leads.get_mut(lead_index) else {
            return 0;
        };

        lead.ranges.clear();
        lead.alerts = abnormalities
            .iter()
            .filter(|(_, probability)| **probability >= threshold)
            .map(|(code, &probability)| Alert {
                code: code.clone(),
                probability,
            })
            .collect();

        let start = (buffer_size as f64 * HIGHLIGHT_START_FRACTION).floor() as usize;
        if start >= buffer_size {
            return 0;
        }

        let first_sequence = total_appended - buffer_size as u64;
        lead.ranges = lead
            .alerts
            .iter()
            .map(|alert| TrackedRange {
                code: alert.code.clone(),
                probability: alert.probability,
                start_sequence: first_sequence + start as u64,
                end_sequence: total_appended,
            })
            .collect();

        if !lead.ranges.is_empty() {
            log::debug!(
                "Lead {}: {} abnormal range(s) over [{}, {})",
                lead_index,
                lead.ranges.len(),
                start,
                buffer_size
            );
        }
        lead.ranges.len()
    }

    /// Discard ranges that lie entirely before `first_sequence`.
    pub fn prune(&mut self, lead_index: usize, first_sequence: u64) {
        if let Some(lead) = self.leads.get_mut(lead_index) {
            lead.ranges
                .retain(|range| range.end_sequence > first_sequence);
        }
    }

    /// Buffer-relative ranges for a lead whose oldest sample has sequence
    /// number `first_sequence`. Partially evicted ranges start at 0.
    pub fn ranges(
        &self,
        lead_index: usize,
        first_sequence: u64,
        buffer_size: usize,
    ) -> Vec<AbnormalityRange> {
        let Some(lead) = self.leads.get(lead_index) else {
            return Vec::new();
        };

        lead.ranges
            .iter()
            .filter(|range| range.end_sequence > first_sequence)
            .filter_map(|range| {
                let start_index = range.start_sequence.saturating_sub(first_sequence) as usize;
                let end_index =
                    ((range.end_sequence - first_sequence) as usize).min(buffer_size);
                (start_index < end_index).then(|| AbnormalityRange {
                    lead_index,
                    start_index,
                    end_index,
                    code: range.code.clone(),
                    probability: range.probability,
                })
            })
            .collect()
    }

    /// Codes at or above the threshold in the lead's latest report.
    pub fn alerts(&self, lead_index: usize) -> Vec<Alert> {
        self.leads
            .get(lead_index)
            .map(|lead| lead.alerts.clone())
            .unwrap_or_default()
    }

    pub fn clear(&mut self, lead_index: usize) {
        if let Some(lead) = self.leads.get_mut(lead_index) {
            *lead = LeadAbnormalities::default();
        }
    }

    pub fn clear_all(&mut self) {
        self.leads
            .iter_mut()
            .for_each(|lead| *lead = LeadAbnormalities::default());
    }
}
