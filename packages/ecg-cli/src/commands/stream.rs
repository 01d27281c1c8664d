use crate::cli::StreamArgs;
use crate::exit_codes;
use crate::output;
use ecg_stream::{
    create_source, lead_name, Alert, ConnectionState, EcgSession, SessionConfig, SessionEvent,
    SessionStats, StreamSourceConfig, NUM_LEADS,
};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{sleep, Duration};

#[derive(Serialize)]
struct LeadSummary {
    lead_index: usize,
    lead_name: String,
    samples: usize,
}

#[derive(Serialize)]
struct StreamOutput {
    session_id: String,
    source: StreamSourceConfig,
    stats: SessionStats,
    heart_rate: Option<u32>,
    alerts: Vec<Alert>,
    leads: Vec<LeadSummary>,
}

fn source_config(args: &StreamArgs) -> Option<StreamSourceConfig> {
    if let Some(url) = &args.url {
        Some(StreamSourceConfig::WebSocket { url: url.clone() })
    } else if let Some(path) = &args.capture {
        Some(StreamSourceConfig::File {
            path: path.clone(),
            rate_limit_ms: args.rate_limit_ms,
            loop_playback: args.loop_playback,
        })
    } else if args.simulate {
        Some(StreamSourceConfig::Simulated {
            interval_ms: args.interval_ms,
            lead_count: args.leads,
        })
    } else {
        None
    }
}

pub async fn execute(args: StreamArgs, mut config: SessionConfig) -> i32 {
    if args.no_reconnect {
        config.reconnect = false;
    }

    let Some(source_config) = source_config(&args) else {
        eprintln!("Error: Choose a source with --url, --capture or --simulate");
        return exit_codes::INPUT_ERROR;
    };

    let source = match create_source(source_config.clone()) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("Error: {}", e);
            return exit_codes::INPUT_ERROR;
        }
    };

    let session = match EcgSession::new(config) {
        Ok(session) => session,
        Err(e) => {
            eprintln!("Error: {}", e);
            return exit_codes::INPUT_ERROR;
        }
    };

    let mut events = session.subscribe_events();
    if let Err(e) = session.connect(source, args.leads).await {
        eprintln!("Error: {}", e);
        return exit_codes::CONNECTION_ERROR;
    }

    let deadline = async {
        match args.duration_secs {
            Some(secs) => sleep(Duration::from_secs(secs)).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    let mut transport_failures = 0u64;
    loop {
        tokio::select! {
            _ = &mut deadline => {
                log::info!("Duration elapsed");
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                log::info!("Interrupted");
                break;
            }
            event = events.recv() => match event {
                Ok(event) => {
                    if args.events {
                        match output::to_json(&event, true) {
                            Ok(json) => println!("{}", json),
                            Err(e) => log::warn!("{}", e),
                        }
                    }
                    match event {
                        SessionEvent::TransportFailure { message, .. } => {
                            transport_failures += 1;
                            eprintln!("Warning: {}", message);
                        }
                        SessionEvent::ConnectionChanged { state: ConnectionState::Disconnected } => break,
                        _ => {}
                    }
                }
                Err(RecvError::Lagged(skipped)) => log::warn!("Skipped {} events", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    }

    session.disconnect().await;

    let stats = session.stats();
    let result = StreamOutput {
        session_id: session.id.clone(),
        source: source_config,
        heart_rate: session.heart_rate(),
        alerts: session.alerts(),
        leads: (0..NUM_LEADS)
            .map(|lead_index| LeadSummary {
                lead_index,
                lead_name: lead_name(lead_index),
                samples: session.buffers().len(lead_index),
            })
            .collect(),
        stats,
    };

    if !output::emit(&result, args.compact, None) {
        return exit_codes::EXECUTION_ERROR;
    }

    if transport_failures > 0 && result.stats.messages_received == 0 {
        exit_codes::CONNECTION_ERROR
    } else {
        exit_codes::SUCCESS
    }
}
