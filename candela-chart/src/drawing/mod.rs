//! User-drawn chart annotations.
//!
//! A drawing lives in two coordinate representations: timestamp-space for
//! persistence (timestamps survive candle eviction and reloads) and
//! index-space for rendering against the current candle window. The
//! conversions here go point-by-point through the coordinate mapper and are
//! applied to whole drawing sets at the load/save boundaries.

pub mod history;
pub mod persist;

pub use history::{DrawingHistory, HistoryEntry};
pub use persist::DrawingStore;

use crate::coords::{index_from_timestamp, timestamp_from_index};
use crate::series::CandleSeries;
use serde::{Deserialize, Serialize};
use smol_str::{SmolStr, format_smolstr};

/// Annotation shape.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DrawingKind {
    TrendLine,
    HorizontalLine,
    Fibonacci,
    Circle,
}

/// One anchor of a drawing: `x` is a fractional data-index or a millisecond
/// timestamp depending on which space the containing set is in, `y` is a
/// price in both.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DrawingPoint {
    pub x: f64,
    pub y: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DrawingStyle {
    pub color: SmolStr,
    pub line_width: f64,
}

impl Default for DrawingStyle {
    fn default() -> Self {
        Self {
            color: SmolStr::new_static("#2962ff"),
            line_width: 1.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Drawing {
    pub id: SmolStr,
    pub kind: DrawingKind,
    pub points: Vec<DrawingPoint>,
    #[serde(default)]
    pub style: DrawingStyle,
}

impl Drawing {
    /// New drawing with a fresh random id.
    pub fn new(kind: DrawingKind, points: Vec<DrawingPoint>) -> Self {
        Self {
            id: format_smolstr!("dw-{:08x}", rand::random::<u32>()),
            kind,
            points,
            style: DrawingStyle::default(),
        }
    }

    fn map_x(&self, mut convert: impl FnMut(f64) -> f64) -> Self {
        Self {
            id: self.id.clone(),
            kind: self.kind,
            points: self
                .points
                .iter()
                .map(|p| DrawingPoint {
                    x: convert(p.x),
                    y: p.y,
                })
                .collect(),
            style: self.style.clone(),
        }
    }
}

/// Convert a persisted (timestamp-space) set into index-space for rendering.
/// A drawing with no points passes through untouched.
pub fn to_index_space(drawings: &[Drawing], series: &CandleSeries) -> Vec<Drawing> {
    drawings
        .iter()
        .map(|d| d.map_x(|ts| index_from_timestamp(series, ts as i64)))
        .collect()
}

/// Convert a rendered (index-space) set back into timestamp-space for
/// persistence.
pub fn to_timestamp_space(drawings: &[Drawing], series: &CandleSeries) -> Vec<Drawing> {
    drawings
        .iter()
        .map(|d| d.map_x(|idx| timestamp_from_index(series, idx) as f64))
        .collect()
}

/// Standard retracement ratios between two anchor prices, returned as
/// (ratio, price) pairs from the `high` anchor toward the `low` anchor.
pub fn fibonacci_levels(anchor_a: f64, anchor_b: f64) -> Vec<(f64, f64)> {
    const RATIOS: [f64; 7] = [0.0, 0.236, 0.382, 0.5, 0.618, 0.786, 1.0];
    let high = anchor_a.max(anchor_b);
    let low = anchor_a.min(anchor_b);
    RATIOS
        .iter()
        .map(|&ratio| (ratio, high - ratio * (high - low)))
        .collect()
}
