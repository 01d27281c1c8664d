// Synthetic multi-lead source
//
// Emits structured multi-lead JSON at a fixed interval: a repeating PQRST
// pattern scaled per lead, a random heart rate in 60..100 and, now and then,
// abnormality scores above the highlight threshold.

use super::{RawMessage, SourceMetadata, StreamSource};
use crate::types::{PipelineError, StreamResult, NUM_LEADS};
use async_trait::async_trait;
use rand::Rng;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::{interval, Duration, MissedTickBehavior};

/// One beat, in millivolts
const PQRST_PATTERN: [f32; 21] = [
    0.0, 0.0, 0.1, 0.2, 0.0, -0.1, -0.1, 0.0, 0.5, 1.5, 1.0, -0.5, -1.0, -0.3, 0.0, 0.2, 0.4,
    0.3, 0.0, -0.1, 0.0,
];

const SAMPLES_PER_MESSAGE: usize = 20;

pub struct SimulatedStreamSource {
    interval_ms: u64,
    lead_count: usize,
    is_connected: bool,
    messages_sent: u64,
}

impl SimulatedStreamSource {
    pub fn new(interval_ms: u64, lead_count: usize) -> StreamResult<Self> {
        if lead_count == 0 || lead_count > NUM_LEADS {
            return Err(PipelineError::InvalidConfig(format!(
                "simulated lead_count must be 1..={}, got {}",
                NUM_LEADS, lead_count
            )));
        }
        if interval_ms == 0 {
            return Err(PipelineError::InvalidConfig(
                "simulated interval_ms must be positive".to_string(),
            ));
        }
        Ok(Self {
            interval_ms,
            lead_count,
            is_connected: false,
            messages_sent: 0,
        })
    }
}

/// Samples for a 0-based lead: the pattern plus `lead * 10%` of itself.
pub fn lead_samples(lead_index: usize) -> Vec<f32> {
    let gain = 1.0 + lead_index as f32 * 0.1;
    (0..SAMPLES_PER_MESSAGE)
        .map(|i| PQRST_PATTERN[i % PQRST_PATTERN.len()] * gain)
        .collect()
}

/// Build one structured multi-lead message.
pub fn build_message<R: Rng>(rng: &mut R, lead_count: usize) -> Value {
    let leads: Vec<Value> = (0..lead_count)
        .map(|lead_index| json!({ "lead": lead_index + 1, "data": lead_samples(lead_index) }))
        .collect();

    let heart_rate: u32 = rng.random_range(60..100);
    let abnormal = rng.random_bool(0.3);
    let rbbb = if abnormal {
        0.75 + rng.random::<f32>() * 0.2
    } else {
        0.1
    };
    let af = if !abnormal && rng.random_bool(0.2) {
        0.8
    } else {
        0.05
    };

    let sb = if heart_rate < 65 { 0.9 } else { 0.0 };
    let st = if heart_rate > 95 { 0.9 } else { 0.0 };

    json!({
        "timestamp": chrono::Utc::now().timestamp_millis(),
        "heartRate": heart_rate,
        "leads": leads,
        "abnormalities": {
            "RBBB": rbbb,
            "AF": af,
            "1dAVb": 0.05,
            "LBBB": 0.02,
            "SB": sb,
            "ST": st,
        }
    })
}

#[async_trait]
impl StreamSource for SimulatedStreamSource {
    async fn connect(&mut self) -> StreamResult<()> {
        self.is_connected = true;
        log::info!(
            "Simulated source ready ({} leads every {} ms)",
            self.lead_count,
            self.interval_ms
        );
        Ok(())
    }

    async fn start(&mut self, sender: mpsc::Sender<RawMessage>) -> StreamResult<()> {
        if !self.is_connected {
            self.connect().await?;
        }

        let mut ticker = interval(Duration::from_millis(self.interval_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let message = build_message(&mut rand::rng(), self.lead_count).to_string();
            if sender.send(RawMessage::Text(message)).await.is_err() {
                log::info!("Message receiver closed, stopping simulation");
                return Ok(());
            }
            self.messages_sent += 1;
        }
    }

    async fn stop(&mut self) -> StreamResult<()> {
        log::info!(
            "Stopping simulated source after {} messages",
            self.messages_sent
        );
        self.is_connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.is_connected
    }

    fn metadata(&self) -> SourceMetadata {
        SourceMetadata {
            source_type: "simulated".to_string(),
            lead_count: Some(self.lead_count),
            properties: [("interval_ms".to_string(), self.interval_ms.to_string())]
                .into_iter()
                .collect(),
        }
    }
}
