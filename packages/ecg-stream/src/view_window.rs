// View window controller
//
// Maps per-lead scroll/zoom state and the viewport width onto a
// `[start_index, end_index)` window over that lead's buffer. Out-of-range
// gestures are clamped, never rejected.

use crate::buffer::LeadBufferStore;
use crate::config::{MAX_ZOOM, MIN_VISIBLE_SAMPLES, MIN_ZOOM};
use crate::types::{PipelineError, StreamResult, NUM_LEADS};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;

/// How a window was positioned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowMode {
    /// Pinned to the newest samples while ingestion runs
    Live,
    /// Positioned by the user's scroll offset
    Review,
    /// Anchored at the replay playhead
    Replay,
}

/// User intent applied to a lead's view
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Gesture {
    ScrollBy(f32),
    ZoomTo(f32),
    /// Multiplicative zoom, e.g. a pinch scale factor
    ZoomBy(f32),
    /// Double tap: zoom 1.0, scroll 0
    Reset,
    /// Re-enable auto-follow after scrolling back
    ResumeFollow,
    /// Recompute only
    Refresh,
}

/// Persistent per-lead view state
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ViewState {
    pub zoom: f32,
    pub scroll_offset_px: f32,
    pub follow_live: bool,
}

impl Default for ViewState {
    fn default() -> Self {
        Self {
            zoom: 1.0,
            scroll_offset_px: 0.0,
            follow_live: true,
        }
    }
}

/// Renderable slice of a lead buffer
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ViewWindow {
    pub lead_index: usize,
    pub scroll_offset_px: f32,
    pub zoom: f32,
    pub visible_sample_count: usize,
    pub start_index: usize,
    pub end_index: usize,
    pub buffer_size: usize,
    pub pixels_per_sample: f32,
    pub viewport_width_px: f32,
    pub mode: WindowMode,
}

impl ViewWindow {
    pub fn len(&self) -> usize {
        self.end_index - self.start_index
    }

    pub fn is_empty(&self) -> bool {
        self.end_index == self.start_index
    }

    pub fn max_scroll_offset_px(&self) -> f32 {
        max_scroll_offset(self.buffer_size, self.visible_sample_count, self.pixels_per_sample)
    }
}

fn max_scroll_offset(buffer_size: usize, visible: usize, pixels_per_sample: f32) -> f32 {
    buffer_size.saturating_sub(visible) as f32 * pixels_per_sample
}

pub struct ViewWindowController {
    store: Arc<LeadBufferStore>,
    base_visible: usize,
    viewport_width_px: f32,
    live: bool,
    states: [ViewState; NUM_LEADS],
}

impl ViewWindowController {
    pub fn new(store: Arc<LeadBufferStore>, base_visible: usize, viewport_width_px: f32) -> Self {
        Self {
            store,
            base_visible: base_visible.max(MIN_VISIBLE_SAMPLES),
            viewport_width_px,
            live: false,
            states: [ViewState::default(); NUM_LEADS],
        }
    }

    /// Samples shown at a zoom level: `clamp(BASE / zoom, 100, BASE * 2)`.
    pub fn visible_sample_count(&self, zoom: f32) -> usize {
        let zoom = zoom.clamp(MIN_ZOOM, MAX_ZOOM);
        let visible = (self.base_visible as f32 / zoom).round() as usize;
        visible.clamp(MIN_VISIBLE_SAMPLES, self.base_visible * 2)
    }

    pub fn viewport_width_px(&self) -> f32 {
        self.viewport_width_px
    }

    pub fn is_live(&self) -> bool {
        self.live
    }

    /// Enter or leave live-append mode. Entering re-arms auto-follow on
    /// every lead.
    pub fn set_live(&mut self, live: bool) {
        if live && !self.live {
            self.states.iter_mut().for_each(|s| s.follow_live = true);
        }
        self.live = live;
    }

    pub fn resize(&mut self, viewport_width_px: f32) {
        if viewport_width_px.is_finite() && viewport_width_px > 0.0 {
            self.viewport_width_px = viewport_width_px;
        } else {
            log::debug!("Ignoring invalid viewport width {}", viewport_width_px);
        }
    }

    pub fn state(&self, lead_index: usize) -> Option<ViewState> {
        self.states.get(lead_index).copied()
    }

    /// Apply a gesture to a lead and return the resulting window.
    pub fn compute(
        &mut self,
        lead_index: usize,
        gesture: Gesture,
        viewport_width_px: f32,
    ) -> StreamResult<ViewWindow> {
        if lead_index >= NUM_LEADS {
            return Err(PipelineError::LeadOutOfRange(lead_index));
        }
        let buffer_size = self.store.len(lead_index);
        self.resize(viewport_width_px);
        Ok(self.apply(lead_index, gesture, buffer_size))
    }

    /// Window ending at a replay playhead; view state is not modified.
    pub fn anchored(
        &self,
        lead_index: usize,
        position: usize,
        buffer_size: usize,
    ) -> ViewWindow {
        let state = self.states.get(lead_index).copied().unwrap_or_default();
        let visible = self.visible_sample_count(state.zoom);
        let pixels_per_sample = self.viewport_width_px / visible as f32;
        let end_index = position.min(buffer_size);
        let start_index = end_index.saturating_sub(visible);

        ViewWindow {
            lead_index,
            scroll_offset_px: start_index as f32 * pixels_per_sample,
            zoom: state.zoom,
            visible_sample_count: visible,
            start_index,
            end_index,
            buffer_size,
            pixels_per_sample,
            viewport_width_px: self.viewport_width_px,
            mode: WindowMode::Replay,
        }
    }

    fn apply(&mut self, lead_index: usize, gesture: Gesture, buffer_size: usize) -> ViewWindow {
        let width = self.viewport_width_px;
        let live = self.live;
        let current_visible = self.visible_sample_count(self.states[lead_index].zoom);

        match gesture {
            Gesture::ZoomTo(zoom) => self.zoom_lead(lead_index, zoom, buffer_size),
            Gesture::ZoomBy(factor) => {
                if factor.is_finite() && factor > 0.0 {
                    let zoom = self.states[lead_index].zoom * factor;
                    self.zoom_lead(lead_index, zoom, buffer_size);
                } else {
                    log::debug!("Ignoring invalid zoom factor {}", factor);
                }
            }
            Gesture::ScrollBy(delta) => {
                let state = &mut self.states[lead_index];
                if !delta.is_finite() {
                    log::debug!("Ignoring invalid scroll delta {}", delta);
                } else {
                    if delta < 0.0 && live && buffer_size > current_visible && state.follow_live {
                        log::debug!("Lead {}: auto-follow suspended", lead_index);
                        state.follow_live = false;
                    }
                    state.scroll_offset_px += delta;
                }
            }
            Gesture::Reset => {
                let state = &mut self.states[lead_index];
                state.zoom = 1.0;
                state.scroll_offset_px = 0.0;
            }
            Gesture::ResumeFollow => self.states[lead_index].follow_live = true,
            Gesture::Refresh => {}
        }

        let state = &mut self.states[lead_index];
        let visible = {
            let zoom = state.zoom.clamp(MIN_ZOOM, MAX_ZOOM);
            ((self.base_visible as f32 / zoom).round() as usize)
                .clamp(MIN_VISIBLE_SAMPLES, self.base_visible * 2)
        };
        let pixels_per_sample = width / visible as f32;
        let max_offset = max_scroll_offset(buffer_size, visible, pixels_per_sample);

        let following = live && state.follow_live;
        if following {
            state.scroll_offset_px = max_offset;
        }
        state.scroll_offset_px = state.scroll_offset_px.clamp(0.0, max_offset);

        let start_index = ((state.scroll_offset_px / pixels_per_sample).floor() as usize)
            .min(buffer_size.saturating_sub(visible));
        let end_index = (start_index + visible).min(buffer_size);

        ViewWindow {
            lead_index,
            scroll_offset_px: state.scroll_offset_px,
            zoom: state.zoom,
            visible_sample_count: visible,
            start_index,
            end_index,
            buffer_size,
            pixels_per_sample,
            viewport_width_px: width,
            mode: if following {
                WindowMode::Live
            } else {
                WindowMode::Review
            },
        }
    }

    /// Change zoom while keeping the first visible sample in place.
    fn zoom_lead(&mut self, lead_index: usize, zoom: f32, buffer_size: usize) {
        if !zoom.is_finite() {
            log::debug!("Ignoring invalid zoom {}", zoom);
            return;
        }
        let clamped = zoom.clamp(MIN_ZOOM, MAX_ZOOM);
        if clamped != zoom {
            log::debug!("Zoom {} clamped to {}", zoom, clamped);
        }

        let width = self.viewport_width_px;
        let old_visible = self.visible_sample_count(self.states[lead_index].zoom);
        let new_visible = self.visible_sample_count(clamped);

        let state = &mut self.states[lead_index];
        let old_start = ((state.scroll_offset_px / (width / old_visible as f32)).floor() as usize)
            .min(buffer_size.saturating_sub(old_visible));
        state.zoom = clamped;
        state.scroll_offset_px = old_start as f32 * (width / new_visible as f32);
    }
}

/// Latest-value window channels, one per lead.
///
/// Publishing replaces whatever the subscriber has not read yet, so a slow
/// renderer only ever sees the newest window.
pub struct WindowPublisher {
    senders: Vec<watch::Sender<Option<ViewWindow>>>,
}

impl WindowPublisher {
    pub fn new() -> Self {
        Self {
            senders: (0..NUM_LEADS).map(|_| watch::channel(None).0).collect(),
        }
    }

    pub fn publish(&self, window: ViewWindow) {
        if let Some(sender) = self.senders.get(window.lead_index) {
            sender.send_replace(Some(window));
        }
    }

    pub fn latest(&self, lead_index: usize) -> Option<ViewWindow> {
        self.senders
            .get(lead_index)
            .and_then(|sender| *sender.borrow())
    }

    pub fn subscribe(&self, lead_index: usize) -> StreamResult<WindowSubscription> {
        let sender = self
            .senders
            .get(lead_index)
            .ok_or(PipelineError::LeadOutOfRange(lead_index))?;
        Ok(WindowSubscription {
            lead_index,
            receiver: sender.subscribe(),
        })
    }
}

impl Default for WindowPublisher {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving side of `observe_window`
pub struct WindowSubscription {
    lead_index: usize,
    receiver: watch::Receiver<Option<ViewWindow>>,
}

impl WindowSubscription {
    pub fn lead_index(&self) -> usize {
        self.lead_index
    }

    /// Most recent window without waiting.
    pub fn latest(&self) -> Option<ViewWindow> {
        *self.receiver.borrow()
    }

    /// Wait for the next window newer than the last one seen. Returns `None`
    /// once the session is gone.
    pub async fn next(&mut self) -> Option<ViewWindow> {
        loop {
            self.receiver.changed().await.ok()?;
            if let Some(window) = *self.receiver.borrow_and_update() {
                return Some(window);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LeadSampleBatch, ABNORMALITY_THRESHOLD};

    fn controller_with(samples: usize, base_visible: usize, width: f32) -> ViewWindowController {
        let store = Arc::new(LeadBufferStore::new(10_000, ABNORMALITY_THRESHOLD));
        store
            .append(LeadSampleBatch::new(0, vec![0.0; samples]))
            .unwrap();
        ViewWindowController::new(store, base_visible, width)
    }

    #[test]
    fn test_zoom_floor_at_100_samples() {
        let mut controller = controller_with(1000, 500, 200.0);

        let window = controller.compute(0, Gesture::ZoomTo(5.0), 200.0).unwrap();
        assert_eq!(window.visible_sample_count, 100);
        assert_eq!(window.pixels_per_sample, 2.0);

        let window = controller.compute(0, Gesture::ZoomTo(50.0), 200.0).unwrap();
        assert_eq!(window.zoom, MAX_ZOOM);
        assert_eq!(window.visible_sample_count, 100);
    }

    #[test]
    fn test_zoom_floor_with_small_base() {
        let mut controller = controller_with(1000, 300, 200.0);

        let window = controller.compute(0, Gesture::ZoomTo(2.0), 200.0).unwrap();
        assert_eq!(window.visible_sample_count, 150);

        // 300 / 5 would be 60
        let window = controller.compute(0, Gesture::ZoomTo(5.0), 200.0).unwrap();
        assert_eq!(window.zoom, MAX_ZOOM);
        assert_eq!(window.visible_sample_count, 100);
        assert_eq!(controller.visible_sample_count(4.0), 100);
    }

    #[test]
    fn test_zoom_out_ceiling() {
        let mut controller = controller_with(5000, 500, 1000.0);
        let window = controller.compute(0, Gesture::ZoomTo(0.1), 1000.0).unwrap();
        assert_eq!(window.zoom, MIN_ZOOM);
        assert_eq!(window.visible_sample_count, 1000);
    }

    #[test]
    fn test_scroll_is_clamped() {
        let mut controller = controller_with(1000, 500, 500.0);

        let window = controller.compute(0, Gesture::ScrollBy(-50.0), 500.0).unwrap();
        assert_eq!(window.scroll_offset_px, 0.0);
        assert_eq!(window.start_index, 0);
        assert_eq!(window.mode, WindowMode::Review);

        let window = controller.compute(0, Gesture::ScrollBy(1e9), 500.0).unwrap();
        assert_eq!(window.scroll_offset_px, window.max_scroll_offset_px());
        assert_eq!(window.start_index, 500);
        assert_eq!(window.end_index, 1000);
    }

    #[test]
    fn test_reset_gesture() {
        let mut controller = controller_with(2000, 500, 500.0);
        controller.compute(0, Gesture::ZoomTo(3.0), 500.0).unwrap();
        controller.compute(0, Gesture::ScrollBy(700.0), 500.0).unwrap();

        let window = controller.compute(0, Gesture::Reset, 500.0).unwrap();
        assert_eq!(window.zoom, 1.0);
        assert_eq!(window.scroll_offset_px, 0.0);
        assert_eq!(window.start_index, 0);
    }

    #[test]
    fn test_zoom_keeps_first_sample() {
        let mut controller = controller_with(5000, 500, 500.0);
        // 1 px per sample at zoom 1.0: scroll to sample 1200
        let window = controller.compute(0, Gesture::ScrollBy(1200.0), 500.0).unwrap();
        assert_eq!(window.start_index, 1200);

        let window = controller.compute(0, Gesture::ZoomTo(2.0), 500.0).unwrap();
        assert_eq!(window.visible_sample_count, 250);
        assert_eq!(window.start_index, 1200);
    }

    #[test]
    fn test_live_mode_starts_at_zero_until_full() {
        let mut controller = controller_with(300, 500, 500.0);
        controller.set_live(true);

        let window = controller.compute(0, Gesture::Refresh, 500.0).unwrap();
        assert_eq!((window.start_index, window.end_index), (0, 300));
        assert_eq!(window.mode, WindowMode::Live);

        // Scrolling back cannot move past available data and keeps following
        let window = controller.compute(0, Gesture::ScrollBy(-100.0), 500.0).unwrap();
        assert_eq!(window.start_index, 0);
        assert!(controller.state(0).unwrap().follow_live);
    }

    #[test]
    fn test_live_follow_and_review() {
        let mut controller = controller_with(2000, 500, 500.0);
        controller.set_live(true);

        let window = controller.compute(0, Gesture::Refresh, 500.0).unwrap();
        assert_eq!((window.start_index, window.end_index), (1500, 2000));
        assert_eq!(window.scroll_offset_px, window.max_scroll_offset_px());

        let window = controller.compute(0, Gesture::ScrollBy(-300.0), 500.0).unwrap();
        assert_eq!(window.mode, WindowMode::Review);
        assert_eq!(window.start_index, 1200);

        // More data arrives: the reviewed window stays put
        controller
            .store
            .append(LeadSampleBatch::new(0, vec![0.0; 100]))
            .unwrap();
        let window = controller.compute(0, Gesture::Refresh, 500.0).unwrap();
        assert_eq!(window.start_index, 1200);

        let window = controller.compute(0, Gesture::ResumeFollow, 500.0).unwrap();
        assert_eq!(window.mode, WindowMode::Live);
        assert_eq!(window.end_index, 2100);
    }

    #[test]
    fn test_window_bounds_hold_for_all_zoom_and_scroll() {
        for samples in [0, 1, 99, 100, 500, 777, 3000] {
            let mut controller = controller_with(samples, 500, 320.0);
            let mut zoom = MIN_ZOOM;
            while zoom <= MAX_ZOOM {
                controller.compute(0, Gesture::ZoomTo(zoom), 320.0).unwrap();
                for delta in [-1e6, 13.7, 250.0, 1e6, -41.3] {
                    let window = controller.compute(0, Gesture::ScrollBy(delta), 320.0).unwrap();
                    assert!(window.start_index <= window.end_index);
                    assert!(window.end_index <= window.buffer_size);
                    assert!(window.scroll_offset_px >= 0.0);
                    assert!(window.scroll_offset_px <= window.max_scroll_offset_px());
                    assert!(window.len() <= window.visible_sample_count);
                }
                zoom += 0.25;
            }
        }
    }

    #[test]
    fn test_anchored_window() {
        let controller = controller_with(1000, 500, 500.0);

        let window = controller.anchored(0, 200, 1000);
        assert_eq!((window.start_index, window.end_index), (0, 200));
        assert_eq!(window.mode, WindowMode::Replay);

        let window = controller.anchored(0, 800, 1000);
        assert_eq!((window.start_index, window.end_index), (300, 800));

        let window = controller.anchored(0, 5000, 1000);
        assert_eq!(window.end_index, 1000);
    }

    #[tokio::test]
    async fn test_subscription_has_latest_value_semantics() {
        let publisher = WindowPublisher::new();
        let mut subscription = publisher.subscribe(2).unwrap();
        assert_eq!(subscription.latest(), None);

        let controller = controller_with(1000, 500, 500.0);
        for position in [100, 200, 300] {
            let mut window = controller.anchored(0, position, 1000);
            window.lead_index = 2;
            publisher.publish(window);
        }

        let window = subscription.next().await.unwrap();
        assert_eq!(window.end_index, 300);
        assert_eq!(publisher.latest(2), Some(window));
        assert!(publisher.subscribe(12).is_err());
    }

    #[test]
    fn test_unknown_lead() {
        let mut controller = controller_with(10, 500, 500.0);
        assert!(matches!(
            controller.compute(12, Gesture::Refresh, 500.0),
            Err(PipelineError::LeadOutOfRange(12))
        ));
    }

    #[test]
    fn test_invalid_inputs_are_ignored() {
        let mut controller = controller_with(1000, 500, 500.0);
        let before = controller.compute(0, Gesture::Refresh, 500.0).unwrap();

        let after = controller.compute(0, Gesture::ZoomBy(f32::NAN), f32::NAN).unwrap();
        assert_eq!(before, after);
        let after = controller.compute(0, Gesture::ZoomBy(-2.0), 0.0).unwrap();
        assert_eq!(before, after);
    }
}
