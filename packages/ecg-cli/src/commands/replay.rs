use crate::cli::ReplayArgs;
use crate::exit_codes;
use crate::output;
use ecg_stream::{
    lead_name, EcgSession, Geometry, PipelineError, ReplayState, SessionConfig, SessionEvent,
    Trace, VerticalScale, ViewWindow,
};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;

#[derive(Serialize)]
struct AlertOutput {
    code: String,
    probability: f32,
    label: String,
}

#[derive(Serialize)]
struct ReplayOutput {
    file: String,
    lead_index: usize,
    lead_name: String,
    batches_loaded: usize,
    buffer_size: usize,
    frames: usize,
    final_window: Option<ViewWindow>,
    replay: ReplayState,
    heart_rate: Option<u32>,
    alerts: Vec<AlertOutput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    trace: Option<Trace>,
}

pub async fn execute(args: ReplayArgs, mut config: SessionConfig) -> i32 {
    if let Some(width) = args.width {
        config.viewport_width_px = width;
    }

    let session = match EcgSession::new(config) {
        Ok(session) => session,
        Err(e) => {
            eprintln!("Error: {}", e);
            return exit_codes::INPUT_ERROR;
        }
    };

    let text = match std::fs::read_to_string(&args.file) {
        Ok(text) => text,
        Err(e) => {
            eprintln!("Error: Failed to read '{}': {}", args.file, e);
            return exit_codes::INPUT_ERROR;
        }
    };

    let batches_loaded = match session.load_recording(&text).await {
        Ok(count) => count,
        Err(e) => {
            eprintln!("Error: {}", e);
            return exit_codes::INPUT_ERROR;
        }
    };

    if let Err(e) = session.set_lead(args.lead).await {
        eprintln!("Error: {}", e);
        return exit_codes::INPUT_ERROR;
    }
    if let Err(e) = session.set_zoom(args.zoom) {
        eprintln!("Error: {}", e);
        return exit_codes::EXECUTION_ERROR;
    }
    session.set_replay_speed(args.speed);

    let mut window = match session.observe_window(args.lead) {
        Ok(window) => window,
        Err(e) => {
            eprintln!("Error: {}", e);
            return exit_codes::INPUT_ERROR;
        }
    };
    let mut events = session.subscribe_events();

    log::info!(
        "Replaying lead {} of {} ({} samples)",
        lead_name(args.lead),
        args.file,
        session.buffers().len(args.lead)
    );

    match session.start_replay().await {
        Ok(()) => {}
        Err(e @ PipelineError::EmptyBuffer(_)) => {
            eprintln!("Error: {}", e);
            return exit_codes::INPUT_ERROR;
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            return exit_codes::EXECUTION_ERROR;
        }
    }

    let mut frames = 0usize;
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(SessionEvent::ReplayCompleted { .. }) | Err(RecvError::Closed) => break,
                Ok(_) | Err(RecvError::Lagged(_)) => {}
            },
            Some(_) = window.next() => frames += 1,
        }
    }

    let trace = if args.render {
        let geometry = Geometry {
            width_px: session.config().viewport_width_px,
            height_px: args.height,
        };
        match session.render(args.lead, geometry, VerticalScale::default()) {
            Ok(trace) => Some(trace),
            Err(e) => {
                eprintln!("Error: {}", e);
                return exit_codes::EXECUTION_ERROR;
            }
        }
    } else {
        None
    };

    let result = ReplayOutput {
        file: args.file.clone(),
        lead_index: args.lead,
        lead_name: lead_name(args.lead),
        batches_loaded,
        buffer_size: session.buffers().len(args.lead),
        frames,
        final_window: window.latest(),
        replay: session.replay_state(),
        heart_rate: session.heart_rate(),
        alerts: session
            .alerts()
            .into_iter()
            .map(|alert| AlertOutput {
                label: alert.label(),
                code: alert.code,
                probability: alert.probability,
            })
            .collect(),
        trace,
    };

    if !output::emit(&result, args.compact, args.output.as_deref()) {
        return exit_codes::EXECUTION_ERROR;
    }
    exit_codes::SUCCESS
}
