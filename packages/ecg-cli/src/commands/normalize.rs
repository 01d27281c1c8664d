use crate::cli::NormalizeArgs;
use crate::exit_codes;
use crate::output;
use ecg_stream::{lead_name, normalize_str, AbnormalityScores, LeadSampleBatch};
use serde::Serialize;

#[derive(Serialize)]
struct BatchOutput {
    lead_index: usize,
    lead_name: String,
    sample_count: usize,
    values: Vec<f32>,
    heart_rate: Option<u32>,
    abnormalities: Option<AbnormalityScores>,
}

impl From<LeadSampleBatch> for BatchOutput {
    fn from(batch: LeadSampleBatch) -> Self {
        Self {
            lead_index: batch.lead_index,
            lead_name: lead_name(batch.lead_index),
            sample_count: batch.values.len(),
            values: batch.values,
            heart_rate: batch.heart_rate,
            abnormalities: batch.abnormalities,
        }
    }
}

#[derive(Serialize)]
struct MessageOutput {
    line: usize,
    batches: Vec<BatchOutput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

pub fn execute(args: NormalizeArgs) -> i32 {
    let text = match (&args.message, &args.file) {
        (Some(message), None) => message.clone(),
        (None, Some(path)) => match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) => {
                eprintln!("Error: Failed to read '{}': {}", path, e);
                return exit_codes::INPUT_ERROR;
            }
        },
        _ => {
            eprintln!("Error: Provide a message or --file");
            return exit_codes::INPUT_ERROR;
        }
    };

    let results: Vec<MessageOutput> = text
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| match normalize_str(line) {
            Ok(batches) => MessageOutput {
                line: i + 1,
                batches: batches.into_iter().map(BatchOutput::from).collect(),
                error: None,
            },
            Err(e) => MessageOutput {
                line: i + 1,
                batches: Vec::new(),
                error: Some(e.to_string()),
            },
        })
        .collect();

    let failures = results.iter().filter(|r| r.error.is_some()).count();
    for result in results.iter().filter(|r| r.error.is_some()) {
        log::warn!(
            "Line {}: {}",
            result.line,
            result.error.as_deref().unwrap_or_default()
        );
    }

    if !output::emit(&results, args.compact, args.output.as_deref()) {
        return exit_codes::EXECUTION_ERROR;
    }

    if results.is_empty() || failures == results.len() {
        exit_codes::INPUT_ERROR
    } else if failures > 0 {
        exit_codes::PARTIAL_FAILURE
    } else {
        exit_codes::SUCCESS
    }
}
