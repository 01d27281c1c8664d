// Sample normalizer
//
// Turns one inbound transport message into canonical per-lead batches.
// Accepted producers:
//
//   Shape A  { "heartRate": 72, "leads": [{ "lead": 1, "data": [..] }], "abnormalities": {..} }
//   Shape B  { "timestamp": 1700000000000, "heartRate": 72, "ecgData": [[..], [..]] }
//   Text     0:0.1,0.2,0.3|1:0.0,0.4      (stored recordings may write lead0:..lead1:..)
//
// Detection runs in that order and fails closed: a shape that matches none of
// them is `UnknownFormat`, a shape that matches but does not decode is
// `MalformedValue`. Leads outside 0..NUM_LEADS are dropped with a warning.

use crate::types::{AbnormalityScores, LeadSample, LeadSampleBatch, NUM_LEADS};
use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ParseError {
    #[error("Unrecognized message format")]
    UnknownFormat,

    #[error("Malformed value: {0}")]
    MalformedValue(String),

    #[error("Lead index {0} out of range")]
    LeadOutOfRange(i64),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MultiLeadMessage {
    #[serde(default)]
    heart_rate: Option<u32>,
    leads: Vec<LeadEntry>,
    #[serde(default)]
    abnormalities: Option<IndexMap<String, f64>>,
}

#[derive(Debug, Deserialize)]
struct LeadEntry {
    /// 1-based on the wire
    lead: i64,
    data: Vec<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IndexedMessage {
    #[serde(default)]
    #[allow(dead_code)]
    timestamp: Option<i64>,
    #[serde(default)]
    heart_rate: Option<u32>,
    ecg_data: Vec<Vec<f64>>,
}

/// The closed set of message schemas the normalizer understands.
#[derive(Debug)]
enum WireMessage {
    MultiLead(MultiLeadMessage),
    Indexed(IndexedMessage),
    Delimited(Vec<(i64, Vec<LeadSample>)>),
}

/// Normalize a raw transport payload.
pub fn normalize(raw: &[u8]) -> Result<Vec<LeadSampleBatch>, ParseError> {
    let text = std::str::from_utf8(raw)
        .map_err(|e| ParseError::MalformedValue(format!("payload is not UTF-8: {}", e)))?;
    normalize_str(text)
}

/// Normalize a text payload.
pub fn normalize_str(text: &str) -> Result<Vec<LeadSampleBatch>, ParseError> {
    let message = decode(text)?;
    into_batches(message)
}

/// Map a lead index from the wire onto the canonical 0-based range.
pub fn checked_lead_index(index: i64) -> Result<usize, ParseError> {
    if (0..NUM_LEADS as i64).contains(&index) {
        Ok(index as usize)
    } else {
        Err(ParseError::LeadOutOfRange(index))
    }
}

fn decode(text: &str) -> Result<WireMessage, ParseError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(ParseError::UnknownFormat);
    }

    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        let value: Value = serde_json::from_str(trimmed)
            .map_err(|e| ParseError::MalformedValue(format!("invalid JSON: {}", e)))?;
        return decode_json(value);
    }

    parse_delimited(trimmed).map(WireMessage::Delimited)
}

fn decode_json(value: Value) -> Result<WireMessage, ParseError> {
    let Value::Object(object) = &value else {
        return Err(ParseError::UnknownFormat);
    };

    if object.contains_key("leads") {
        serde_json::from_value(value)
            .map(WireMessage::MultiLead)
            .map_err(|e| ParseError::MalformedValue(format!("multi-lead message: {}", e)))
    } else if object.contains_key("ecgData") {
        serde_json::from_value(value)
            .map(WireMessage::Indexed)
            .map_err(|e| ParseError::MalformedValue(format!("indexed message: {}", e)))
    } else {
        Err(ParseError::UnknownFormat)
    }
}

fn split_segments(text: &str) -> Vec<&str> {
    if text.contains('|') {
        text.split('|').collect()
    } else if text.starts_with("lead") {
        text.split("lead").collect()
    } else {
        vec![text]
    }
}

fn looks_delimited(segment: &str) -> bool {
    let segment = segment.strip_prefix("lead").unwrap_or(segment);
    match segment.split_once(':') {
        Some((index, _)) => {
            let digits = index.trim().trim_start_matches('-');
            !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit())
        }
        None => false,
    }
}

fn parse_delimited(text: &str) -> Result<Vec<(i64, Vec<LeadSample>)>, ParseError> {
    let segments: Vec<&str> = split_segments(text)
        .into_iter()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();

    match segments.first() {
        Some(first) if looks_delimited(first) => {}
        _ => return Err(ParseError::UnknownFormat),
    }

    segments
        .into_iter()
        .map(|segment| {
            let segment = segment.strip_prefix("lead").unwrap_or(segment);
            let (index, values) = segment.split_once(':').ok_or_else(|| {
                ParseError::MalformedValue(format!("segment '{}' has no lead index", segment))
            })?;
            let index: i64 = index.trim().parse().map_err(|_| {
                ParseError::MalformedValue(format!("invalid lead index '{}'", index.trim()))
            })?;
            let values = values
                .split(',')
                .map(str::trim)
                .filter(|token| !token.is_empty())
                .map(parse_sample)
                .collect::<Result<Vec<_>, _>>()?;
            Ok((index, values))
        })
        .collect()
}

fn parse_sample(token: &str) -> Result<LeadSample, ParseError> {
    match token.parse::<f32>() {
        Ok(value) if value.is_finite() => Ok(value),
        _ => Err(ParseError::MalformedValue(format!(
            "invalid sample '{}'",
            token
        ))),
    }
}

fn clamp_scores(raw: IndexMap<String, f64>) -> AbnormalityScores {
    raw.into_iter()
        .map(|(code, probability)| {
            let clamped = probability.clamp(0.0, 1.0) as f32;
            if !(0.0..=1.0).contains(&probability) {
                log::debug!(
                    "Clamped abnormality '{}' probability {} to {}",
                    code,
                    probability,
                    clamped
                );
            }
            (code, clamped)
        })
        .collect()
}

fn accept_lead(index: i64) -> Option<usize> {
    match checked_lead_index(index) {
        Ok(lead_index) => Some(lead_index),
        Err(e) => {
            log::warn!("Dropping lead entry: {}", e);
            None
        }
    }
}

/// Narrow JSON numbers to samples, rejecting anything that is not finite
/// once narrowed.
fn narrow_samples(data: Vec<f64>) -> Result<Vec<LeadSample>, ParseError> {
    data.into_iter()
        .map(|value| match value as f32 {
            sample if sample.is_finite() => Ok(sample),
            _ => Err(ParseError::MalformedValue(format!(
                "invalid sample '{}'",
                value
            ))),
        })
        .collect()
}

fn into_batches(message: WireMessage) -> Result<Vec<LeadSampleBatch>, ParseError> {
    let mut batches = Vec::new();
    match message {
        WireMessage::MultiLead(message) => {
            let abnormalities = message.abnormalities.map(clamp_scores);
            for entry in message.leads {
                let Some(lead_index) = accept_lead(entry.lead - 1) else {
                    continue;
                };
                batches.push(LeadSampleBatch {
                    lead_index,
                    values: narrow_samples(entry.data)?,
                    heart_rate: message.heart_rate,
                    abnormalities: abnormalities.clone(),
                });
            }
        }
        WireMessage::Indexed(message) => {
            for (index, data) in message.ecg_data.into_iter().enumerate() {
                let Some(lead_index) = accept_lead(index as i64) else {
                    continue;
                };
                batches.push(LeadSampleBatch {
                    lead_index,
                    values: narrow_samples(data)?,
                    heart_rate: message.heart_rate,
                    abnormalities: None,
                });
            }
        }
        WireMessage::Delimited(entries) => {
            batches.extend(entries.into_iter().filter_map(|(index, values)| {
                let lead_index = accept_lead(index)?;
                Some(LeadSampleBatch::new(lead_index, values))
            }));
        }
    }
    Ok(batches)
}
