// Session controller - owns one pipeline instance per session
//
// The session manages:
// - Transport lifecycle (connect, reconnect after a fixed delay, disconnect)
// - Ingestion: raw message → normalizer → lead buffers (+ abnormality ranges)
// - Window publication per lead (latest value, no backlog)
// - Replay in review mode
// - Event emission to the UI collaborator
// - Task cancellation via CancellationToken, joined before anything restarts

use crate::buffer::{BufferReader, LeadBufferStore};
use crate::config::SessionConfig;
use crate::normalizer::{normalize, ParseError};
use crate::render::{project, Geometry, Trace, VerticalScale};
use crate::replay::{ReplayEngine, ReplayState};
use crate::source::{RawMessage, StreamSource};
use crate::types::{
    Alert, ConnectionState, LeadSampleBatch, PipelineError, SessionEvent, SessionStats,
    StreamResult, DEFAULT_LEAD_INDEX, NUM_LEADS,
};
use crate::view_window::{
    Gesture, ViewWindow, ViewWindowController, WindowPublisher, WindowSubscription,
};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct SessionCounters {
    messages_received: AtomicU64,
    parse_failures: AtomicU64,
    batches_appended: AtomicU64,
    samples_appended: AtomicU64,
    samples_evicted: AtomicU64,
    dropped_while_disconnected: AtomicU64,
    reconnect_attempts: AtomicU64,
}

/// State shared between the session handle and its ingestion task
struct SessionShared {
    store: Arc<LeadBufferStore>,
    view: Arc<Mutex<ViewWindowController>>,
    windows: Arc<WindowPublisher>,
    events: broadcast::Sender<SessionEvent>,
    connection: RwLock<ConnectionState>,
    connected_since: RwLock<Option<DateTime<Utc>>>,
    heart_rate: RwLock<Option<u32>>,
    counters: SessionCounters,
}

impl SessionShared {
    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn connection_state(&self) -> ConnectionState {
        *self.connection.read()
    }

    fn is_live(&self) -> bool {
        self.connection_state() != ConnectionState::Disconnected
    }

    fn set_connection(&self, state: ConnectionState) {
        {
            let mut current = self.connection.write();
            if *current == state {
                return;
            }
            *current = state;
        }

        match state {
            ConnectionState::Connected => *self.connected_since.write() = Some(Utc::now()),
            ConnectionState::Disconnected => *self.connected_since.write() = None,
            ConnectionState::Connecting => {}
        }
        log::info!("Connection state: {:?}", state);
        self.emit(SessionEvent::ConnectionChanged { state });
    }

    /// Gated entry point: batches are only accepted while live.
    fn append(&self, batch: LeadSampleBatch) -> bool {
        if !self.is_live() {
            self.counters
                .dropped_while_disconnected
                .fetch_add(1, Ordering::Relaxed);
            log::debug!(
                "Dropping batch for lead {} while disconnected",
                batch.lead_index
            );
            return false;
        }
        self.write_batch(batch)
    }

    fn write_batch(&self, batch: LeadSampleBatch) -> bool {
        if let Some(heart_rate) = batch.heart_rate {
            *self.heart_rate.write() = Some(heart_rate);
        }

        let outcome = match self.store.append(batch) {
            Ok(outcome) => outcome,
            Err(e) => {
                log::warn!("Rejected batch: {}", e);
                return false;
            }
        };

        self.counters.batches_appended.fetch_add(1, Ordering::Relaxed);
        self.counters
            .samples_appended
            .fetch_add(outcome.appended as u64, Ordering::Relaxed);
        self.counters
            .samples_evicted
            .fetch_add(outcome.evicted as u64, Ordering::Relaxed);

        self.publish_refresh(outcome.lead_index);
        true
    }

    fn publish_refresh(&self, lead_index: usize) {
        let window = {
            let mut view = self.view.lock();
            let width = view.viewport_width_px();
            view.compute(lead_index, Gesture::Refresh, width)
        };
        if let Ok(window) = window {
            self.windows.publish(window);
        }
    }

    fn ingest(&self, raw: &[u8]) -> Result<usize, ParseError> {
        self.counters.messages_received.fetch_add(1, Ordering::Relaxed);
        match normalize(raw) {
            Ok(batches) => {
                let count = batches.len();
                for batch in batches {
                    self.append(batch);
                }
                Ok(count)
            }
            Err(e) => {
                self.counters.parse_failures.fetch_add(1, Ordering::Relaxed);
                log::warn!("Dropping unparseable message: {}", e);
                Err(e)
            }
        }
    }
}

struct IngestTask {
    cancel_token: CancellationToken,
    handle: JoinHandle<()>,
}

/// One ECG display session
pub struct EcgSession {
    pub id: String,
    config: SessionConfig,
    shared: Arc<SessionShared>,
    replay: ReplayEngine,
    selected_lead: AtomicUsize,
    ingest_task: tokio::sync::Mutex<Option<IngestTask>>,
    /// Held across connect, disconnect, replay start and recording import so
    /// the live check and the transition it guards happen as one step.
    lifecycle: tokio::sync::Mutex<()>,
}

impl EcgSession {
    pub fn new(config: SessionConfig) -> StreamResult<Self> {
        config.validate()?;

        let store = Arc::new(LeadBufferStore::new(
            config.buffer_capacity,
            config.abnormality_threshold,
        ));
        let view = Arc::new(Mutex::new(ViewWindowController::new(
            store.clone(),
            config.base_visible_samples,
            config.viewport_width_px,
        )));
        let windows = Arc::new(WindowPublisher::new());
        let (events, _) = broadcast::channel(config.event_channel_capacity);

        let replay = ReplayEngine::new(
            store.clone(),
            view.clone(),
            windows.clone(),
            events.clone(),
            config.replay.clone(),
        );

        let id = uuid::Uuid::new_v4().to_string();
        log::info!("Created ECG session {}", id);

        Ok(Self {
            id,
            config,
            shared: Arc::new(SessionShared {
                store,
                view,
                windows,
                events,
                connection: RwLock::new(ConnectionState::Disconnected),
                connected_since: RwLock::new(None),
                heart_rate: RwLock::new(None),
                counters: SessionCounters::default(),
            }),
            replay,
            selected_lead: AtomicUsize::new(DEFAULT_LEAD_INDEX),
            ingest_task: tokio::sync::Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Read access to the lead buffers. Writes go through `append`,
    /// `ingest` and `load_recording` so the connection gate holds.
    pub fn buffers(&self) -> BufferReader<'_> {
        self.shared.store.reader()
    }

    // ---- connection ----

    /// Start live ingestion from `source`. Any previous ingestion and replay
    /// tasks are cancelled and joined first.
    pub async fn connect(
        &self,
        source: Box<dyn StreamSource>,
        lead_count_hint: usize,
    ) -> StreamResult<()> {
        let _lifecycle = self.lifecycle.lock().await;
        let mut slot = self.ingest_task.lock().await;
        if let Some(previous) = slot.take() {
            previous.cancel_token.cancel();
            if let Err(e) = previous.handle.await {
                log::error!("Previous ingestion task failed: {}", e);
            }
        }
        self.replay.stop().await;

        let metadata = source.metadata();
        let lead_count = metadata
            .lead_count
            .unwrap_or(lead_count_hint)
            .min(NUM_LEADS);
        self.shared.store.reserve(lead_count);

        log::info!(
            "Session {}: connecting {} source ({} leads expected)",
            self.id,
            metadata.source_type,
            lead_count
        );

        self.shared.view.lock().set_live(true);
        self.shared.set_connection(ConnectionState::Connecting);

        let cancel_token = CancellationToken::new();
        let handle = tokio::spawn(run_ingestion(
            self.shared.clone(),
            source,
            cancel_token.clone(),
            IngestionSettings {
                reconnect: self.config.reconnect,
                reconnect_delay: self.config.reconnect_delay(),
                channel_capacity: self.config.ingest_channel_capacity,
            },
        ));
        *slot = Some(IngestTask {
            cancel_token,
            handle,
        });

        Ok(())
    }

    /// Stop ingestion and any replay, waiting for both tasks to exit.
    /// Buffered history is kept for review.
    pub async fn disconnect(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        let task = self.ingest_task.lock().await.take();
        if let Some(task) = task {
            task.cancel_token.cancel();
            if let Err(e) = task.handle.await {
                log::error!("Ingestion task failed: {}", e);
            }
        }
        self.replay.stop().await;

        self.shared.view.lock().set_live(false);
        self.shared.set_connection(ConnectionState::Disconnected);
        log::info!("Session {} disconnected", self.id);
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.shared.connection_state()
    }

    pub fn is_live(&self) -> bool {
        self.shared.is_live()
    }

    // ---- ingestion ----

    /// Append one batch. Returns `false` when the session is not live or the
    /// batch names an unknown lead.
    pub fn append(&self, batch: LeadSampleBatch) -> bool {
        self.shared.append(batch)
    }

    /// Normalize and append one raw message. Returns the number of batches
    /// the message produced.
    pub fn ingest(&self, raw: &[u8]) -> Result<usize, ParseError> {
        self.shared.ingest(raw)
    }

    /// Replace all buffers with a stored recording for review. Each non-empty
    /// line is one message. Only allowed while disconnected.
    pub async fn load_recording(&self, raw: &str) -> StreamResult<usize> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.is_live() {
            return Err(PipelineError::LiveIngestionActive);
        }
        self.replay.stop().await;
        self.shared.store.clear_all();
        *self.shared.heart_rate.write() = None;

        let mut loaded = 0;
        let mut first_error = None;
        for line in raw.lines().map(str::trim).filter(|l| !l.is_empty()) {
            match normalize(line.as_bytes()) {
                Ok(batches) => {
                    for batch in batches {
                        if self.shared.write_batch(batch) {
                            loaded += 1;
                        }
                    }
                }
                Err(e) => {
                    self.shared
                        .counters
                        .parse_failures
                        .fetch_add(1, Ordering::Relaxed);
                    log::warn!("Skipping unparseable recording line: {}", e);
                    first_error.get_or_insert(e);
                }
            }
        }

        for lead_index in 0..NUM_LEADS {
            self.shared.publish_refresh(lead_index);
        }

        match first_error {
            Some(e) if loaded == 0 => Err(e.into()),
            _ => {
                log::info!("Loaded recording: {} batches", loaded);
                Ok(loaded)
            }
        }
    }

    // ---- observation ----

    pub fn observe_window(&self, lead_index: usize) -> StreamResult<WindowSubscription> {
        self.shared.windows.subscribe(lead_index)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    pub fn selected_lead(&self) -> usize {
        self.selected_lead.load(Ordering::Relaxed)
    }

    pub fn heart_rate(&self) -> Option<u32> {
        *self.shared.heart_rate.read()
    }

    /// Codes at or above the threshold for the selected lead.
    pub fn alerts(&self) -> Vec<Alert> {
        self.shared.store.alerts(self.selected_lead())
    }

    pub fn stats(&self) -> SessionStats {
        let c = &self.shared.counters;
        SessionStats {
            messages_received: c.messages_received.load(Ordering::Relaxed),
            parse_failures: c.parse_failures.load(Ordering::Relaxed),
            batches_appended: c.batches_appended.load(Ordering::Relaxed),
            samples_appended: c.samples_appended.load(Ordering::Relaxed),
            samples_evicted: c.samples_evicted.load(Ordering::Relaxed),
            dropped_while_disconnected: c.dropped_while_disconnected.load(Ordering::Relaxed),
            reconnect_attempts: c.reconnect_attempts.load(Ordering::Relaxed),
            connected_since: *self.shared.connected_since.read(),
        }
    }

    /// Project a lead's most recently published window for drawing.
    pub fn render(
        &self,
        lead_index: usize,
        geometry: Geometry,
        scale: VerticalScale,
    ) -> StreamResult<Trace> {
        let window = match self.shared.windows.latest(lead_index) {
            Some(window) => window,
            None => {
                let mut view = self.shared.view.lock();
                let width = view.viewport_width_px();
                view.compute(lead_index, Gesture::Refresh, width)?
            }
        };
        let snapshot = self.shared.store.snapshot(lead_index)?;
        let samples = snapshot.window(window.start_index, window.end_index);
        Ok(project(&window, samples, &snapshot.ranges, geometry, scale))
    }

    // ---- view ----

    /// Switch the displayed lead. A running replay is cancelled.
    pub async fn set_lead(&self, lead_index: usize) -> StreamResult<ViewWindow> {
        if lead_index >= NUM_LEADS {
            return Err(PipelineError::LeadOutOfRange(lead_index));
        }
        self.replay.stop().await;
        self.selected_lead.store(lead_index, Ordering::Relaxed);
        log::debug!("Selected lead {}", lead_index);
        self.apply_gesture(Gesture::Refresh)
    }

    pub fn set_zoom(&self, zoom: f32) -> StreamResult<ViewWindow> {
        self.apply_gesture(Gesture::ZoomTo(zoom))
    }

    pub fn zoom_by(&self, factor: f32) -> StreamResult<ViewWindow> {
        self.apply_gesture(Gesture::ZoomBy(factor))
    }

    pub fn scroll(&self, delta_px: f32) -> StreamResult<ViewWindow> {
        self.apply_gesture(Gesture::ScrollBy(delta_px))
    }

    pub fn reset_view(&self) -> StreamResult<ViewWindow> {
        self.apply_gesture(Gesture::Reset)
    }

    pub fn resume_follow(&self) -> StreamResult<ViewWindow> {
        self.apply_gesture(Gesture::ResumeFollow)
    }

    pub fn resize(&self, viewport_width_px: f32) -> StreamResult<ViewWindow> {
        self.shared.view.lock().resize(viewport_width_px);
        self.apply_gesture(Gesture::Refresh)
    }

    /// While a replay drives the selected lead the replay task publishes;
    /// the gesture still updates view state for its next tick.
    fn apply_gesture(&self, gesture: Gesture) -> StreamResult<ViewWindow> {
        let lead_index = self.selected_lead();
        let window = {
            let mut view = self.shared.view.lock();
            let width = view.viewport_width_px();
            view.compute(lead_index, gesture, width)?
        };
        if !self.replay.is_playing_lead(lead_index) {
            self.shared.windows.publish(window);
        }
        Ok(window)
    }

    // ---- replay ----

    /// Replay the selected lead. Rejected while live ingestion is active.
    pub async fn start_replay(&self) -> StreamResult<()> {
        let _lifecycle = self.lifecycle.lock().await;
        let lead_index = self.selected_lead();
        match self.replay.start(lead_index, self.is_live()).await {
            Err(PipelineError::ReplayConflict(message)) => {
                log::warn!("Replay rejected: {}", message);
                self.shared.emit(SessionEvent::ReplayConflict {
                    message: message.clone(),
                });
                Err(PipelineError::ReplayConflict(message))
            }
            other => other,
        }
    }

    pub async fn stop_replay(&self) {
        self.replay.stop().await;
    }

    pub fn set_replay_speed(&self, speed: f32) -> f32 {
        self.replay.set_speed(speed)
    }

    pub fn replay_state(&self) -> ReplayState {
        self.replay.state()
    }
}

impl Drop for EcgSession {
    fn drop(&mut self) {
        if let Some(task) = self.ingest_task.get_mut().take() {
            task.cancel_token.cancel();
        }
    }
}

struct IngestionSettings {
    reconnect: bool,
    reconnect_delay: Duration,
    channel_capacity: usize,
}

/// Connect, pump, and on transport failure wait a fixed delay and try again.
/// Exactly one reconnect is pending per failure.
async fn run_ingestion(
    shared: Arc<SessionShared>,
    mut source: Box<dyn StreamSource>,
    cancel_token: CancellationToken,
    settings: IngestionSettings,
) {
    loop {
        shared.set_connection(ConnectionState::Connecting);

        let outcome = tokio::select! {
            biased;
            _ = cancel_token.cancelled() => break,
            result = pump(&shared, source.as_mut(), settings.channel_capacity) => result,
        };

        match outcome {
            Ok(()) => {
                log::info!("Source stream ended");
                break;
            }
            Err(e) => {
                let retry_in_ms = settings.reconnect_delay.as_millis() as u64;
                log::warn!("Transport failure: {}", e);
                shared.emit(SessionEvent::TransportFailure {
                    message: e.to_string(),
                    retry_in_ms: if settings.reconnect { retry_in_ms } else { 0 },
                });
                if !settings.reconnect {
                    break;
                }
                shared.set_connection(ConnectionState::Connecting);

                tokio::select! {
                    biased;
                    _ = cancel_token.cancelled() => break,
                    _ = tokio::time::sleep(settings.reconnect_delay) => {}
                }
                shared
                    .counters
                    .reconnect_attempts
                    .fetch_add(1, Ordering::Relaxed);
                log::info!("Reconnecting");
            }
        }
    }

    if let Err(e) = source.stop().await {
        log::warn!("Error stopping source: {}", e);
    }
    if !cancel_token.is_cancelled() {
        shared.view.lock().set_live(false);
        shared.set_connection(ConnectionState::Disconnected);
    }
}

/// One connection's worth of messages, drained in arrival order.
async fn pump(
    shared: &SessionShared,
    source: &mut dyn StreamSource,
    channel_capacity: usize,
) -> StreamResult<()> {
    source.connect().await?;
    shared.set_connection(ConnectionState::Connected);

    let (tx, mut rx) = mpsc::channel::<RawMessage>(channel_capacity);
    let drain = async {
        while let Some(message) = rx.recv().await {
            // Failures are counted and logged inside
            let _ = shared.ingest(message.as_bytes());
        }
    };

    let (result, ()) = tokio::join!(source.start(tx), drain);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::view_window::WindowMode;

    fn session() -> EcgSession {
        EcgSession::new(SessionConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_append_is_gated_while_disconnected() {
        let session = session();
        assert!(!session.append(LeadSampleBatch::new(0, vec![0.1, 0.2])));
        assert!(session.buffers().is_empty(0));
        assert_eq!(session.stats().dropped_while_disconnected, 1);
    }

    #[tokio::test]
    async fn test_ingest_while_disconnected_counts_but_drops() {
        let session = session();
        assert_eq!(session.ingest(b"0:0.1,0.2|1:0.3").unwrap(), 2);
        assert!(session.buffers().is_empty(0));

        let stats = session.stats();
        assert_eq!(stats.messages_received, 1);
        assert_eq!(stats.dropped_while_disconnected, 2);
    }

    #[tokio::test]
    async fn test_parse_failure_is_isolated() {
        let session = session();
        assert!(session.ingest(b"not an ecg message").is_err());
        assert_eq!(session.stats().parse_failures, 1);
        assert!((0..NUM_LEADS).all(|lead| session.buffers().is_empty(lead)));
    }

    #[tokio::test]
    async fn test_load_recording_for_review() {
        let session = session();
        let mut subscription = session.observe_window(DEFAULT_LEAD_INDEX).unwrap();

        let recording = "lead0:0.1,0.2,0.3|lead1:0.4,0.5\n\ngarbage\n";
        assert_eq!(session.load_recording(recording).await.unwrap(), 2);
        assert_eq!(session.buffers().len(0), 3);
        assert_eq!(session.buffers().len(1), 2);
        assert_eq!(session.stats().parse_failures, 1);

        let window = subscription.next().await.unwrap();
        assert_eq!(window.mode, WindowMode::Review);
        assert_eq!(window.end_index, 2);

        assert!(session.load_recording("garbage").await.is_err());
    }

    #[tokio::test]
    async fn test_set_lead_validates_and_publishes() {
        let session = session();
        session.load_recording("3:1.0,2.0,3.0").await.unwrap();

        assert!(matches!(
            session.set_lead(12).await,
            Err(PipelineError::LeadOutOfRange(12))
        ));
        let window = session.set_lead(3).await.unwrap();
        assert_eq!(session.selected_lead(), 3);
        assert_eq!(window.buffer_size, 3);
        assert_eq!(session.observe_window(3).unwrap().latest(), Some(window));
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_lead_cancels_replay() {
        let session = session();
        session
            .load_recording(&format!("1:{}", vec!["0.1"; 2000].join(",")))
            .await
            .unwrap();

        session.start_replay().await.unwrap();
        assert!(session.replay_state().is_active());

        session.set_lead(4).await.unwrap();
        assert!(!session.replay_state().is_active());
    }

    #[tokio::test]
    async fn test_render_selected_lead() {
        let session = session();
        session
            .load_recording(r#"{"leads": [{"lead": 2, "data": [0.0, 1.0]}], "abnormalities": {"AF": 0.9}}"#)
            .await
            .unwrap();

        let trace = session
            .render(
                1,
                Geometry {
                    width_px: 100.0,
                    height_px: 100.0,
                },
                VerticalScale::default(),
            )
            .unwrap();
        assert_eq!(trace.polylines.len(), 2);
        assert_eq!(trace.polylines[0].points.len(), 2);
        let alerts = session.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].code, "AF");
    }

    #[tokio::test]
    async fn test_replay_speed_is_clamped() {
        let session = session();
        assert_eq!(session.set_replay_speed(10.0), 4.0);
        assert_eq!(session.replay_state().speed, 4.0);
        assert_eq!(session.set_replay_speed(f32::NAN), 4.0);
    }
}
