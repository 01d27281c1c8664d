use async_trait::async_trait;
use ecg_stream::{
    ConnectionState, EcgSession, PipelineError, RawMessage, ReplayPhase, SessionConfig,
    SessionEvent, SourceMetadata, StreamResult, StreamSource, WindowMode,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

enum StreamEnd {
    Fail,
    Finish,
    Hold,
    /// Resend the whole script on this period until stopped
    Repeat(Duration),
}

enum Attempt {
    Refuse,
    Stream(Vec<&'static str>, StreamEnd),
}

/// Transport that plays a fixed script, one entry per connection attempt
struct ScriptedSource {
    attempts: VecDeque<Attempt>,
    current: Option<(Vec<&'static str>, StreamEnd)>,
    connects: Arc<AtomicUsize>,
    stopped: Arc<AtomicBool>,
}

impl ScriptedSource {
    fn new(attempts: Vec<Attempt>) -> (Self, Arc<AtomicUsize>, Arc<AtomicBool>) {
        let connects = Arc::new(AtomicUsize::new(0));
        let stopped = Arc::new(AtomicBool::new(false));
        let source = Self {
            attempts: attempts.into(),
            current: None,
            connects: connects.clone(),
            stopped: stopped.clone(),
        };
        (source, connects, stopped)
    }
}

#[async_trait]
impl StreamSource for ScriptedSource {
    async fn connect(&mut self) -> StreamResult<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        match self
            .attempts
            .pop_front()
            .unwrap_or(Attempt::Stream(vec![], StreamEnd::Hold))
        {
            Attempt::Refuse => Err(PipelineError::Connection("refused".to_string())),
            Attempt::Stream(messages, end) => {
                self.current = Some((messages, end));
                Ok(())
            }
        }
    }

    async fn start(&mut self, sender: mpsc::Sender<RawMessage>) -> StreamResult<()> {
        let (messages, end) = self
            .current
            .take()
            .unwrap_or((vec![], StreamEnd::Hold));
        loop {
            for message in &messages {
                if sender.send(RawMessage::from(*message)).await.is_err() {
                    return Ok(());
                }
            }
            match &end {
                StreamEnd::Fail => {
                    return Err(PipelineError::TransportFailure("socket reset".to_string()))
                }
                StreamEnd::Finish => return Ok(()),
                StreamEnd::Hold => std::future::pending().await,
                StreamEnd::Repeat(period) => tokio::time::sleep(*period).await,
            }
        }
    }

    async fn stop(&mut self) -> StreamResult<()> {
        self.stopped.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.current.is_some()
    }

    fn metadata(&self) -> SourceMetadata {
        SourceMetadata {
            source_type: "scripted".to_string(),
            ..Default::default()
        }
    }
}

const SHAPE_A: &str = r#"{"heartRate": 72, "leads": [{"lead": 1, "data": [0.1, 0.2, 0.3]}, {"lead": 2, "data": [0.4, 0.5]}], "abnormalities": {"RBBB": 0.85}}"#;

async fn wait_for_state(events: &mut broadcast::Receiver<SessionEvent>, wanted: ConnectionState) {
    loop {
        if let SessionEvent::ConnectionChanged { state } = events.recv().await.unwrap() {
            if state == wanted {
                return;
            }
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_single_reconnect_after_fixed_delay() {
    let session = EcgSession::new(SessionConfig::default()).unwrap();
    let mut events = session.subscribe_events();
    let (source, connects, _) = ScriptedSource::new(vec![
        Attempt::Refuse,
        Attempt::Stream(vec![], StreamEnd::Hold),
    ]);

    let started = Instant::now();
    session.connect(Box::new(source), 12).await.unwrap();

    loop {
        match events.recv().await.unwrap() {
            SessionEvent::TransportFailure { retry_in_ms, .. } => {
                assert_eq!(retry_in_ms, 5000);
                break;
            }
            SessionEvent::ConnectionChanged { state } => {
                assert_eq!(state, ConnectionState::Connecting)
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
    assert_eq!(session.stats().reconnect_attempts, 0);
    // Still live while a reconnect is pending
    assert_eq!(session.connection_state(), ConnectionState::Connecting);

    wait_for_state(&mut events, ConnectionState::Connected).await;
    assert!(started.elapsed() >= Duration::from_millis(5000));
    assert_eq!(connects.load(Ordering::SeqCst), 2);
    assert_eq!(session.stats().reconnect_attempts, 1);
    assert!(session.stats().connected_since.is_some());

    session.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn test_failure_mid_stream_reconnects_once() {
    let config = SessionConfig {
        reconnect_delay_ms: 1000,
        ..Default::default()
    };
    let session = EcgSession::new(config).unwrap();
    let mut events = session.subscribe_events();
    let (source, connects, _) = ScriptedSource::new(vec![
        Attempt::Stream(vec![SHAPE_A], StreamEnd::Fail),
        Attempt::Stream(vec![SHAPE_A], StreamEnd::Hold),
    ]);

    session.connect(Box::new(source), 12).await.unwrap();
    wait_for_state(&mut events, ConnectionState::Connected).await;
    wait_for_state(&mut events, ConnectionState::Connected).await;

    // Let the second batch drain
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(connects.load(Ordering::SeqCst), 2);
    assert_eq!(session.stats().reconnect_attempts, 1);
    assert_eq!(session.buffers().len(0), 6);
    assert_eq!(session.heart_rate(), Some(72));

    session.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_cancels_ingestion() {
    let session = EcgSession::new(SessionConfig::default()).unwrap();
    let mut events = session.subscribe_events();
    let (source, _, stopped) = ScriptedSource::new(vec![Attempt::Stream(
        vec![SHAPE_A],
        StreamEnd::Hold,
    )]);

    session.connect(Box::new(source), 12).await.unwrap();
    wait_for_state(&mut events, ConnectionState::Connected).await;

    session.disconnect().await;
    assert_eq!(session.connection_state(), ConnectionState::Disconnected);
    assert!(stopped.load(Ordering::SeqCst));
    assert!(session.stats().connected_since.is_none());

    // History survives for review, new data is refused
    let before = session.buffers().len(0);
    assert!(!session.append(ecg_stream::LeadSampleBatch::new(0, vec![1.0])));
    assert_eq!(session.buffers().len(0), before);
}

#[tokio::test(start_paused = true)]
async fn test_live_messages_reach_the_window() {
    let session = EcgSession::new(SessionConfig::default()).unwrap();
    let mut window = session.observe_window(0).unwrap();
    let (source, _, _) = ScriptedSource::new(vec![Attempt::Stream(
        vec!["not ecg", SHAPE_A, "{\"foo\": 1}"],
        StreamEnd::Hold,
    )]);

    session.connect(Box::new(source), 12).await.unwrap();

    let latest = window.next().await.unwrap();
    assert_eq!(latest.mode, WindowMode::Live);
    assert_eq!((latest.start_index, latest.end_index), (0, 3));

    tokio::time::sleep(Duration::from_millis(10)).await;
    let stats = session.stats();
    assert_eq!(stats.messages_received, 3);
    assert_eq!(stats.parse_failures, 2);
    assert_eq!(stats.batches_appended, 2);
    assert_eq!(stats.samples_appended, 5);

    let ranges = session.buffers().ranges(0).unwrap();
    assert_eq!(ranges.len(), 1);
    assert_eq!(ranges[0].code, "RBBB");

    session.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn test_replay_rejected_while_connected() {
    let session = EcgSession::new(SessionConfig::default()).unwrap();
    let mut events = session.subscribe_events();
    let (source, _, _) = ScriptedSource::new(vec![Attempt::Stream(
        vec![SHAPE_A],
        StreamEnd::Hold,
    )]);

    session.connect(Box::new(source), 12).await.unwrap();
    wait_for_state(&mut events, ConnectionState::Connected).await;

    let before = session.replay_state();
    let result = session.start_replay().await;
    assert!(matches!(result, Err(PipelineError::ReplayConflict(_))));
    assert_eq!(session.replay_state(), before);

    loop {
        if let SessionEvent::ReplayConflict { .. } = events.recv().await.unwrap() {
            break;
        }
    }
    session.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn test_stream_end_returns_to_review_then_replays() {
    let session = EcgSession::new(SessionConfig::default()).unwrap();
    let mut events = session.subscribe_events();
    let (source, connects, _) = ScriptedSource::new(vec![Attempt::Stream(
        vec![SHAPE_A, SHAPE_A],
        StreamEnd::Finish,
    )]);

    session.connect(Box::new(source), 12).await.unwrap();
    wait_for_state(&mut events, ConnectionState::Disconnected).await;
    assert_eq!(connects.load(Ordering::SeqCst), 1);
    assert_eq!(session.stats().reconnect_attempts, 0);

    // Lead II is selected by default and holds 4 samples
    session.start_replay().await.unwrap();
    loop {
        if let SessionEvent::ReplayCompleted {
            lead_index,
            position,
        } = events.recv().await.unwrap()
        {
            assert_eq!(lead_index, 1);
            assert_eq!(position, 4);
            break;
        }
    }
    assert_eq!(session.replay_state().phase, ReplayPhase::Finished);

    session.stop_replay().await;
    session.stop_replay().await;
    assert_eq!(session.replay_state().phase, ReplayPhase::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_load_recording_refused_while_live() {
    let session = EcgSession::new(SessionConfig::default()).unwrap();
    let (source, _, _) = ScriptedSource::new(vec![]);
    session.connect(Box::new(source), 12).await.unwrap();

    assert!(matches!(
        session.load_recording("0:1.0").await,
        Err(PipelineError::LiveIngestionActive)
    ));
    session.disconnect().await;
    assert_eq!(session.load_recording("0:1.0").await.unwrap(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_connect_replaces_previous_ingestion() {
    let session = EcgSession::new(SessionConfig::default()).unwrap();
    let mut events = session.subscribe_events();
    let period = Duration::from_millis(100);

    let (first, _, first_stopped) = ScriptedSource::new(vec![Attempt::Stream(
        vec!["0:0.1,0.2"],
        StreamEnd::Repeat(period),
    )]);
    session.connect(Box::new(first), 12).await.unwrap();
    wait_for_state(&mut events, ConnectionState::Connected).await;
    tokio::time::sleep(Duration::from_millis(350)).await;
    assert!(session.buffers().len(0) >= 6);

    let (second, second_connects, _) = ScriptedSource::new(vec![Attempt::Stream(
        vec!["1:0.5"],
        StreamEnd::Repeat(period),
    )]);
    session.connect(Box::new(second), 12).await.unwrap();
    assert!(first_stopped.load(Ordering::SeqCst));

    let lead0_before = session.buffers().len(0);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(session.buffers().len(0), lead0_before);
    assert!(session.buffers().len(1) >= 10);
    assert_eq!(second_connects.load(Ordering::SeqCst), 1);
    assert_eq!(session.connection_state(), ConnectionState::Connected);

    session.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn test_replay_start_racing_connect_is_rejected() {
    let session = EcgSession::new(SessionConfig::default()).unwrap();
    let recording = format!("1:{}", vec!["0.1"; 5000].join(","));
    session.load_recording(&recording).await.unwrap();
    session.start_replay().await.unwrap();
    assert_eq!(session.replay_state().phase, ReplayPhase::Playing);

    let (source, _, _) = ScriptedSource::new(vec![Attempt::Stream(vec![], StreamEnd::Hold)]);
    let ((), connected, restarted) = tokio::join!(
        session.stop_replay(),
        session.connect(Box::new(source), 12),
        session.start_replay(),
    );
    connected.unwrap();
    assert!(matches!(restarted, Err(PipelineError::ReplayConflict(_))));

    assert!(session.is_live());
    assert!(!session.replay_state().is_active());

    // Stays rejected for as long as the connection is live
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(!session.replay_state().is_active());
    assert!(session.start_replay().await.is_err());

    session.disconnect().await;
    assert_eq!(session.connection_state(), ConnectionState::Disconnected);
    session.start_replay().await.unwrap();
    assert!(session.replay_state().is_active());
    session.stop_replay().await;
}
