// Replay engine
//
// Plays back a frozen snapshot of one lead buffer by advancing a playhead on
// a timer and publishing a window anchored at it. At most one replay task
// exists at a time; a new start cancels and joins the previous one before
// spawning.

use crate::buffer::LeadBufferStore;
use crate::config::{ReplayConfig, MAX_REPLAY_SPEED, MIN_REPLAY_SPEED};
use crate::types::{PipelineError, SessionEvent, StreamResult};
use crate::view_window::{ViewWindowController, WindowPublisher};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayPhase {
    Idle,
    Playing,
    /// Reached the end of the snapshot. Behaves like `Idle`.
    Finished,
}

/// Observable replay state
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReplayState {
    pub phase: ReplayPhase,
    pub lead_index: Option<usize>,
    pub position: usize,
    pub buffer_size: usize,
    pub speed: f32,
}

impl ReplayState {
    pub fn is_active(&self) -> bool {
        self.phase == ReplayPhase::Playing
    }
}

struct ReplayTask {
    cancel_token: CancellationToken,
    handle: JoinHandle<()>,
}

/// What the replay task needs from the session
#[derive(Clone)]
struct ReplayContext {
    view: Arc<Mutex<ViewWindowController>>,
    windows: Arc<WindowPublisher>,
    events: broadcast::Sender<SessionEvent>,
    state: Arc<RwLock<ReplayState>>,
    config: ReplayConfig,
}

pub struct ReplayEngine {
    store: Arc<LeadBufferStore>,
    context: ReplayContext,
    task: tokio::sync::Mutex<Option<ReplayTask>>,
}

impl ReplayEngine {
    pub fn new(
        store: Arc<LeadBufferStore>,
        view: Arc<Mutex<ViewWindowController>>,
        windows: Arc<WindowPublisher>,
        events: broadcast::Sender<SessionEvent>,
        config: ReplayConfig,
    ) -> Self {
        let state = ReplayState {
            phase: ReplayPhase::Idle,
            lead_index: None,
            position: 0,
            buffer_size: 0,
            speed: clamp_speed(config.initial_speed).unwrap_or(1.0),
        };

        Self {
            store,
            context: ReplayContext {
                view,
                windows,
                events,
                state: Arc::new(RwLock::new(state)),
                config,
            },
            task: tokio::sync::Mutex::new(None),
        }
    }

    pub fn state(&self) -> ReplayState {
        *self.context.state.read()
    }

    pub fn is_playing(&self) -> bool {
        self.state().is_active()
    }

    /// Whether a replay currently drives the given lead's window.
    pub fn is_playing_lead(&self, lead_index: usize) -> bool {
        let state = self.state();
        state.is_active() && state.lead_index == Some(lead_index)
    }

    /// Start replaying `lead_index` from the beginning.
    ///
    /// Rejected with `ReplayConflict` while live ingestion is active or a
    /// replay is already playing; nothing changes in that case.
    pub async fn start(&self, lead_index: usize, live_ingestion_active: bool) -> StreamResult<()> {
        let mut slot = self.task.lock().await;

        if live_ingestion_active {
            return Err(PipelineError::ReplayConflict(
                "live ingestion is active".to_string(),
            ));
        }
        let current = self.state();
        if current.is_active() {
            return Err(PipelineError::ReplayConflict(format!(
                "replay already playing on lead {}",
                current.lead_index.unwrap_or_default()
            )));
        }

        let snapshot = self.store.snapshot(lead_index)?;
        if snapshot.is_empty() {
            return Err(PipelineError::EmptyBuffer(lead_index));
        }

        if let Some(previous) = slot.take() {
            previous.cancel_token.cancel();
            if let Err(e) = previous.handle.await {
                log::error!("Previous replay task failed: {}", e);
            }
        }

        let buffer_size = snapshot.len();
        {
            let mut state = self.context.state.write();
            state.phase = ReplayPhase::Playing;
            state.lead_index = Some(lead_index);
            state.position = 0;
            state.buffer_size = buffer_size;
        }
        let window = self.context.view.lock().anchored(lead_index, 0, buffer_size);
        self.context.windows.publish(window);

        log::info!(
            "Replay started on lead {} ({} samples, speed {:.2}x)",
            lead_index,
            buffer_size,
            self.state().speed
        );

        let cancel_token = CancellationToken::new();
        let handle = tokio::spawn(run_replay(
            self.context.clone(),
            lead_index,
            buffer_size,
            cancel_token.clone(),
        ));
        *slot = Some(ReplayTask {
            cancel_token,
            handle,
        });

        Ok(())
    }

    /// Cancel the replay and wait for its task to exit. Idempotent.
    pub async fn stop(&self) {
        let mut slot = self.task.lock().await;
        if let Some(task) = slot.take() {
            task.cancel_token.cancel();
            if let Err(e) = task.handle.await {
                log::error!("Replay task failed: {}", e);
            }
        }

        let mut state = self.context.state.write();
        if state.phase == ReplayPhase::Playing {
            log::info!("Replay stopped at position {}", state.position);
        }
        state.phase = ReplayPhase::Idle;
    }

    /// Set the playback speed, clamped to [0.25, 4]. Takes effect on the
    /// next tick. Returns the speed in effect.
    pub fn set_speed(&self, speed: f32) -> f32 {
        let mut state = self.context.state.write();
        match clamp_speed(speed) {
            Some(clamped) => {
                if clamped != speed {
                    log::debug!("Replay speed {} clamped to {}", speed, clamped);
                }
                state.speed = clamped;
            }
            None => log::debug!("Ignoring invalid replay speed {}", speed),
        }
        state.speed
    }
}

impl Drop for ReplayEngine {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.cancel_token.cancel();
        }
    }
}

fn clamp_speed(speed: f32) -> Option<f32> {
    speed
        .is_finite()
        .then(|| speed.clamp(MIN_REPLAY_SPEED, MAX_REPLAY_SPEED))
}

async fn run_replay(
    context: ReplayContext,
    lead_index: usize,
    buffer_size: usize,
    cancel_token: CancellationToken,
) {
    let frame_delay = context.config.frame_delay();
    let mut position = 0usize;

    loop {
        let speed = context.state.read().speed;

        tokio::select! {
            biased;

            _ = cancel_token.cancelled() => {
                log::debug!("Replay on lead {} cancelled at {}", lead_index, position);
                return;
            }

            _ = tokio::time::sleep(frame_delay.div_f32(speed)) => {}
        }

        let advance = ((speed * context.config.step as f32).round() as usize).max(1);
        position = (position + advance).min(buffer_size);
        context.state.write().position = position;

        let window = context.view.lock().anchored(lead_index, position, buffer_size);
        context.windows.publish(window);

        if position >= buffer_size {
            context.state.write().phase = ReplayPhase::Finished;
            log::info!("Replay on lead {} finished", lead_index);
            // No subscribers is fine
            let _ = context.events.send(SessionEvent::ReplayCompleted {
                lead_index,
                position,
            });
            return;
        }
    }
}
