// Common types for the waveform pipeline

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::normalizer::ParseError;

/// Number of standard ECG leads.
pub const NUM_LEADS: usize = 12;

/// Default per-lead history capacity in samples.
pub const MAX_TOTAL_DATA_POINTS: usize = 10_000;

/// Probability at or above which an abnormality code is highlighted.
pub const ABNORMALITY_THRESHOLD: f32 = 0.7;

/// Lead displayed when a session starts (Lead II, the usual rhythm strip).
pub const DEFAULT_LEAD_INDEX: usize = 1;

/// Display names, indexed by canonical 0-based lead index.
pub const LEAD_NAMES: [&str; NUM_LEADS] = [
    "I", "II", "III", "aVR", "aVL", "aVF", "V1", "V2", "V3", "V4", "V5", "V6",
];

/// Single voltage reading in millivolts.
pub type LeadSample = f32;

/// Abnormality code → probability, in the order the codes were reported.
pub type AbnormalityScores = IndexMap<String, f32>;

/// Result type for pipeline operations
pub type StreamResult<T> = Result<T, PipelineError>;

/// Canonical unit of ingestion: the samples one message carried for one lead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeadSampleBatch {
    pub lead_index: usize,
    pub values: Vec<LeadSample>,

    /// `None` means the message did not report a heart rate.
    #[serde(default)]
    pub heart_rate: Option<u32>,

    /// `None` means the message carried no abnormality block, which leaves
    /// the tracker untouched. An empty map clears the lead's ranges.
    #[serde(default)]
    pub abnormalities: Option<AbnormalityScores>,
}

impl LeadSampleBatch {
    pub fn new(lead_index: usize, values: Vec<LeadSample>) -> Self {
        Self {
            lead_index,
            values,
            heart_rate: None,
            abnormalities: None,
        }
    }

    pub fn with_heart_rate(mut self, heart_rate: u32) -> Self {
        self.heart_rate = Some(heart_rate);
        self
    }

    pub fn with_abnormalities(mut self, abnormalities: AbnormalityScores) -> Self {
        self.abnormalities = Some(abnormalities);
        self
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Errors that can occur at the session level
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Replay conflict: {0}")]
    ReplayConflict(String),

    #[error("Lead {0} has no buffered samples")]
    EmptyBuffer(usize),

    #[error("Lead index {0} out of range (expected 0..12)")]
    LeadOutOfRange(usize),

    #[error("Live ingestion is active; disconnect before loading a recording")]
    LiveIngestionActive,

    #[error("Transport failure: {0}")]
    TransportFailure(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Channel closed")]
    ChannelClosed,
}

/// Transport connection state as seen by the pipeline.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Abnormality code currently at or above the highlight threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub code: String,
    pub probability: f32,
}

impl Alert {
    /// Percentage label as shown next to the trace, e.g. `RBBB: 85%`.
    pub fn label(&self) -> String {
        format!("{}: {}%", self.code, (self.probability * 100.0) as u32)
    }
}

/// Counters for an ingestion session
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SessionStats {
    pub messages_received: u64,
    pub parse_failures: u64,
    pub batches_appended: u64,
    pub samples_appended: u64,
    pub samples_evicted: u64,
    pub dropped_while_disconnected: u64,
    pub reconnect_attempts: u64,
    pub connected_since: Option<chrono::DateTime<chrono::Utc>>,
}

/// Events emitted to the UI collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    ConnectionChanged { state: ConnectionState },
    TransportFailure { message: String, retry_in_ms: u64 },
    ReplayConflict { message: String },
    ReplayCompleted { lead_index: usize, position: usize },
}

/// Human-readable name of a lead, falling back to a 1-based number.
pub fn lead_name(lead_index: usize) -> String {
    LEAD_NAMES
        .get(lead_index)
        .map(|name| name.to_string())
        .unwrap_or_else(|| format!("Lead {}", lead_index + 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lead_names() {
        assert_eq!(lead_name(0), "I");
        assert_eq!(lead_name(DEFAULT_LEAD_INDEX), "II");
        assert_eq!(lead_name(11), "V6");
        assert_eq!(lead_name(12), "Lead 13");
    }

    #[test]
    fn test_alert_label_truncates() {
        let alert = Alert {
            code: "RBBB".to_string(),
            probability: 0.859,
        };
        assert_eq!(alert.label(), "RBBB: 85%");
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = SessionEvent::ConnectionChanged {
            state: ConnectionState::Connecting,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "connection_changed");
        assert_eq!(json["state"], "connecting");
    }
}
