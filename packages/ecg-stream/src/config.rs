// Session configuration
//
// Every field has a default so partial JSON files are accepted.

use crate::types::{PipelineError, StreamResult, ABNORMALITY_THRESHOLD, MAX_TOTAL_DATA_POINTS};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Fewest samples a window may show, whatever the zoom.
pub const MIN_VISIBLE_SAMPLES: usize = 100;

pub const MIN_ZOOM: f32 = 0.5;
pub const MAX_ZOOM: f32 = 5.0;

pub const MIN_REPLAY_SPEED: f32 = 0.25;
pub const MAX_REPLAY_SPEED: f32 = 4.0;

/// Replay pacing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReplayConfig {
    /// Tick period at speed 1.0
    pub frame_delay_ms: u64,

    /// Samples advanced per tick at speed 1.0
    pub step: usize,

    pub initial_speed: f32,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            frame_delay_ms: 50,
            step: 10,
            initial_speed: 1.0,
        }
    }
}

impl ReplayConfig {
    pub fn frame_delay(&self) -> Duration {
        Duration::from_millis(self.frame_delay_ms)
    }
}

/// Configuration for one ingestion/display session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Per-lead ring buffer capacity
    pub buffer_capacity: usize,

    /// Samples visible at zoom 1.0
    pub base_visible_samples: usize,

    /// Viewport width used until the renderer reports a real size
    pub viewport_width_px: f32,

    pub abnormality_threshold: f32,

    /// Fixed delay before each reconnect attempt (no cap on attempts)
    pub reconnect_delay_ms: u64,

    /// Reconnect after transport failures
    pub reconnect: bool,

    /// Raw messages queued between transport and normalizer
    pub ingest_channel_capacity: usize,

    /// Session-wide event queue length
    pub event_channel_capacity: usize,

    pub replay: ReplayConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: MAX_TOTAL_DATA_POINTS,
            base_visible_samples: 500,
            viewport_width_px: 1000.0,
            abnormality_threshold: ABNORMALITY_THRESHOLD,
            reconnect_delay_ms: 5000,
            reconnect: true,
            ingest_channel_capacity: 100,
            event_channel_capacity: 64,
            replay: ReplayConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Load a JSON config file; missing fields fall back to defaults.
    pub fn from_file(path: impl AsRef<Path>) -> StreamResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config: SessionConfig = serde_json::from_str(&text).map_err(|e| {
            PipelineError::InvalidConfig(format!("{}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> StreamResult<()> {
        if self.buffer_capacity == 0 {
            return Err(PipelineError::InvalidConfig(
                "buffer_capacity must be greater than 0".to_string(),
            ));
        }
        if self.base_visible_samples < MIN_VISIBLE_SAMPLES {
            return Err(PipelineError::InvalidConfig(format!(
                "base_visible_samples must be at least {}",
                MIN_VISIBLE_SAMPLES
            )));
        }
        if !(self.viewport_width_px.is_finite() && self.viewport_width_px > 0.0) {
            return Err(PipelineError::InvalidConfig(
                "viewport_width_px must be a positive number".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.abnormality_threshold) {
            return Err(PipelineError::InvalidConfig(
                "abnormality_threshold must be within [0, 1]".to_string(),
            ));
        }
        if self.ingest_channel_capacity == 0 || self.event_channel_capacity == 0 {
            return Err(PipelineError::InvalidConfig(
                "channel capacities must be greater than 0".to_string(),
            ));
        }
        if self.replay.frame_delay_ms == 0 || self.replay.step == 0 {
            return Err(PipelineError::InvalidConfig(
                "replay frame_delay_ms and step must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}
