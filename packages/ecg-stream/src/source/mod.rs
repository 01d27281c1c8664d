// Pluggable transports feeding raw device messages into a session
//
// A `StreamSource` only moves bytes: it never parses waveform data and never
// reconnects on its own. The session's ingestion task owns both concerns.
// New sources are added by implementing the trait, adding a variant to
// `StreamSourceConfig` and a match arm in `create_source`.
//
// Current implementations:
// - WebSocket: live device or bridge
// - File: capture replay, one message per line
// - Simulated: synthetic 12-lead PQRST generator for demos and tests

mod file;
mod simulated;
mod websocket;

use crate::types::StreamResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::mpsc;

pub use file::FileStreamSource;
pub use simulated::SimulatedStreamSource;
pub use websocket::WebSocketStreamSource;

/// Configuration for the available transports
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum StreamSourceConfig {
    #[serde(rename = "websocket")]
    WebSocket { url: String },

    /// Recorded capture, one raw message per line
    #[serde(rename = "file")]
    File {
        path: String,
        /// Delay between messages in milliseconds
        #[serde(default)]
        rate_limit_ms: Option<u64>,
        /// Start over at end of file
        #[serde(default)]
        loop_playback: bool,
    },

    #[serde(rename = "simulated")]
    Simulated {
        #[serde(default = "default_interval_ms")]
        interval_ms: u64,
        #[serde(default = "default_lead_count")]
        lead_count: usize,
    },
}

fn default_interval_ms() -> u64 {
    100
}

fn default_lead_count() -> usize {
    crate::types::NUM_LEADS
}

/// One undecoded transport message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawMessage {
    Text(String),
    Binary(Vec<u8>),
}

impl RawMessage {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            RawMessage::Text(text) => text.as_bytes(),
            RawMessage::Binary(data) => data,
        }
    }
}

impl From<String> for RawMessage {
    fn from(text: String) -> Self {
        RawMessage::Text(text)
    }
}

impl From<&str> for RawMessage {
    fn from(text: &str) -> Self {
        RawMessage::Text(text.to_string())
    }
}

/// Metadata about a transport
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct SourceMetadata {
    pub source_type: String,

    /// Leads the source is expected to deliver, if known
    #[serde(default)]
    pub lead_count: Option<usize>,

    /// Source-specific properties (URL, file path, ...)
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

/// Trait for all transports
#[async_trait]
pub trait StreamSource: Send + Sync {
    /// Establish the connection. A failure here counts as a transport failure.
    async fn connect(&mut self) -> StreamResult<()>;

    /// Forward raw messages until the stream ends (`Ok`), the transport
    /// fails (`Err`), or the receiver is dropped (`Ok`).
    async fn start(&mut self, sender: mpsc::Sender<RawMessage>) -> StreamResult<()>;

    /// Close the connection
    async fn stop(&mut self) -> StreamResult<()>;

    fn is_connected(&self) -> bool;

    fn metadata(&self) -> SourceMetadata;
}

/// Build a transport from configuration
pub fn create_source(config: StreamSourceConfig) -> StreamResult<Box<dyn StreamSource>> {
    match config {
        StreamSourceConfig::WebSocket { url } => Ok(Box::new(WebSocketStreamSource::new(url))),

        StreamSourceConfig::File {
            path,
            rate_limit_ms,
            loop_playback,
        } => Ok(Box::new(FileStreamSource::new(
            path,
            rate_limit_ms,
            loop_playback,
        ))),

        StreamSourceConfig::Simulated {
            interval_ms,
            lead_count,
        } => Ok(Box::new(SimulatedStreamSource::new(interval_ms, lead_count)?)),
    }
}
