// Render projection: window samples → device-space polylines.
// Pure; the drawing collaborator strokes the result.

use crate::abnormality::AbnormalityRange;
use crate::types::LeadSample;
use crate::view_window::{ViewWindow, WindowMode};
use serde::{Deserialize, Serialize};

/// Standard ECG paper: 5 mm major grid at 2.5 px/mm, 0.5 mV per major
/// square, 10 mm per mV.
const PIXELS_PER_GRID: f32 = 5.0 * 2.5;
const MILLIVOLTS_PER_GRID: f32 = 0.5;

/// Fraction of the viewport height an auto-fitted trace spans.
const AUTO_FIT_FILL: f32 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Geometry {
    pub width_px: f32,
    pub height_px: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VerticalScale {
    /// Fixed pixels per millivolt (paper calibration)
    Calibrated { px_per_mv: f32 },
    /// Stretch the window's min..max over most of the height
    AutoFit,
}

impl Default for VerticalScale {
    fn default() -> Self {
        Self::Calibrated {
            px_per_mv: PIXELS_PER_GRID * 2.0 / MILLIVOLTS_PER_GRID,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SegmentStyle {
    Normal,
    Abnormal { code: String, probability: f32 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Polyline {
    pub style: SegmentStyle,
    pub points: Vec<Point>,
}

/// Everything needed to stroke one lead's window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    pub window: ViewWindow,
    pub baseline_y: f32,
    pub px_per_mv: f32,
    /// The full trace first, then abnormal overlays in range order
    pub polylines: Vec<Polyline>,
}

fn resolve_scale(scale: VerticalScale, samples: &[LeadSample], height: f32) -> f32 {
    match scale {
        VerticalScale::Calibrated { px_per_mv } => px_per_mv,
        VerticalScale::AutoFit => {
            let (min, max) = samples
                .iter()
                .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
                    (lo.min(v), hi.max(v))
                });
            let range = max - min;
            if range > 0.0 {
                height / range * AUTO_FIT_FILL
            } else {
                1.0
            }
        }
    }
}

/// Project `samples` (the contents of `window`, oldest first) into device
/// space. Live windows are right-aligned so the newest sample sits at the
/// right edge.
pub fn project(
    window: &ViewWindow,
    samples: &[LeadSample],
    ranges: &[AbnormalityRange],
    geometry: Geometry,
    scale: VerticalScale,
) -> Trace {
    let count = samples.len().min(window.len());
    let samples = &samples[..count];
    let step = geometry.width_px / window.visible_sample_count.max(1) as f32;
    let baseline_y = geometry.height_px / 2.0;
    let px_per_mv = resolve_scale(scale, samples, geometry.height_px);

    let x0 = match window.mode {
        WindowMode::Live => geometry.width_px - count as f32 * step,
        WindowMode::Review | WindowMode::Replay => 0.0,
    };

    let points: Vec<Point> = samples
        .iter()
        .enumerate()
        .map(|(i, &v)| Point {
            x: x0 + i as f32 * step,
            y: baseline_y - v * px_per_mv,
        })
        .collect();

    let window_end = window.start_index + count;
    let overlays = ranges.iter().filter_map(|range| {
        let (lo, hi) = range.overlap(window.start_index, window_end)?;
        Some(Polyline {
            style: SegmentStyle::Abnormal {
                code: range.code.clone(),
                probability: range.probability,
            },
            points: points[lo - window.start_index..hi - window.start_index].to_vec(),
        })
    });

    let mut polylines = Vec::with_capacity(1 + ranges.len());
    if !points.is_empty() {
        polylines.push(Polyline {
            style: SegmentStyle::Normal,
            points: points.clone(),
        });
    }
    polylines.extend(overlays);

    Trace {
        window: *window,
        baseline_y,
        px_per_mv,
        polylines,
    }
}
