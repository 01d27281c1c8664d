// Real-time multi-lead ECG waveform pipeline
//
// Ingests device messages in several wire shapes, keeps a bounded history
// per lead, tracks abnormality highlight ranges, and computes the scrolled,
// zoomed or replayed window a renderer should draw.
//
// Architecture:
// - `normalizer`: wire message → per-lead sample batches
// - `buffer`: bounded per-lead ring buffers with snapshot reads
// - `abnormality`: highlight ranges from abnormality scores
// - `view_window`: scroll/zoom → sample window, latest-value publication
// - `replay`: timed playback over a frozen buffer snapshot
// - `render`: window samples → device-space polylines
// - `source`: pluggable transports (WebSocket, capture file, simulated)
// - `controller`: the session tying it all together

pub mod abnormality;
pub mod buffer;
pub mod config;
pub mod controller;
pub mod normalizer;
pub mod render;
pub mod replay;
pub mod source;
pub mod types;
pub mod view_window;

pub use abnormality::{AbnormalityRange, AbnormalityTracker};
pub use buffer::{AppendOutcome, BufferMetrics, BufferReader, LeadBufferStore, LeadSnapshot};
pub use config::{ReplayConfig, SessionConfig};
pub use controller::EcgSession;
pub use normalizer::{normalize, normalize_str, ParseError};
pub use render::{project, Geometry, Polyline, SegmentStyle, Trace, VerticalScale};
pub use replay::{ReplayEngine, ReplayPhase, ReplayState};
pub use source::{create_source, RawMessage, SourceMetadata, StreamSource, StreamSourceConfig};
pub use types::{
    lead_name, AbnormalityScores, Alert, ConnectionState, LeadSample, LeadSampleBatch,
    PipelineError, SessionEvent, SessionStats, StreamResult, NUM_LEADS,
};
pub use view_window::{Gesture, ViewWindow, WindowMode, WindowSubscription};
