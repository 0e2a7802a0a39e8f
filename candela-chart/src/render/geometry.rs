//! Pure per-frame geometry computation.
//!
//! Everything in this module is a total function of its inputs so it can run
//! on the worker task: no shared structures, no panics, and degenerate input
//! degrades to "no frame" instead of an error.

use crate::candle::Candle;
use crate::coords::PriceScale;
use crate::view::ViewState;
use derive_more::Constructor;
use serde::{Deserialize, Serialize};

/// Fraction of the visible price range added above and below so candles
/// never touch the chart edges.
pub const RANGE_PAD_RATIO: f64 = 0.15;

const EMA_PERIOD: usize = 20;
const EMA_MULTIPLIER: f64 = 2.0 / (EMA_PERIOD as f64 + 1.0);

/// Pixel size of the drawable surface.
#[derive(Copy, Clone, Debug, PartialEq, Constructor)]
pub struct PixelDims {
    pub width: f64,
    pub height: f64,
}

/// Up/down tag resolved by the consumer into its palette.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CandleColor {
    Up,
    Down,
}

/// Pixel geometry for one visible candle. Y values grow downward; the body
/// spans open/close and the wick spans high/low.
#[derive(Copy, Clone, Debug, PartialEq, Constructor)]
pub struct CandleGeometry {
    pub x: f64,
    pub body_top: f64,
    pub body_bottom: f64,
    pub wick_top: f64,
    pub wick_bottom: f64,
    pub color: CandleColor,
}

/// One geometry computation request, handed to the worker by value.
#[derive(Clone, Debug)]
pub struct GeometryRequest {
    pub candles: Vec<Candle>,
    pub view: ViewState,
    pub dims: PixelDims,
    /// Height reserved at the bottom for a subordinate indicator pane.
    pub reserved_band: f64,
}

/// Output of one geometry pass.
#[derive(Clone, Debug)]
pub struct GeometryFrame {
    pub candles: Vec<CandleGeometry>,
    /// EMA overlay polyline in pixel space.
    pub ema: Vec<(f64, f64)>,
    pub scale: PriceScale,
    pub slot_width: f64,
}

/// EMA values memoized behind a content fingerprint.
///
/// Identity of the input vector means nothing across worker messages, so the
/// cache keys on (len, last timestamp, last close): the last close is
/// included because the open candle mutates in place without changing either
/// of the other two.
#[derive(Debug, Default)]
pub struct EmaCache {
    fingerprint: Option<(usize, i64, u64)>,
    values: Vec<f64>,
}

impl EmaCache {
    pub fn values(&mut self, candles: &[Candle]) -> &[f64] {
        let fingerprint = candles
            .last()
            .map(|last| (candles.len(), last.timestamp, last.close.to_bits()));
        if fingerprint.is_none() {
            self.fingerprint = None;
            self.values.clear();
            return &self.values;
        }
        if self.fingerprint != fingerprint {
            self.values = ema(candles);
            self.fingerprint = fingerprint;
        }
        &self.values
    }
}

fn ema(candles: &[Candle]) -> Vec<f64> {
    let mut out = Vec::with_capacity(candles.len());
    let mut current: Option<f64> = None;
    for candle in candles {
        let next = match current {
            None => candle.close,
            Some(prev) => candle.close * EMA_MULTIPLIER + prev * (1.0 - EMA_MULTIPLIER),
        };
        out.push(next);
        current = Some(next);
    }
    out
}

/// Visible price range with padding: `[min(low) - pad, max(high) + pad]`,
/// `pad = 0.15 x (max - min)`.
pub fn padded_price_range(candles: &[Candle]) -> Option<(f64, f64)> {
    let mut min_low = f64::INFINITY;
    let mut max_high = f64::NEG_INFINITY;
    for candle in candles {
        min_low = min_low.min(candle.low);
        max_high = max_high.max(candle.high);
    }
    if !min_low.is_finite() || !max_high.is_finite() {
        return None;
    }
    let pad = RANGE_PAD_RATIO * (max_high - min_low);
    Some((min_low - pad, max_high + pad))
}

/// Compute one geometry frame.
///
/// Returns `None` for degenerate input (no candles, unusable dimensions, a
/// reserved band swallowing the whole surface); the caller treats that as
/// "no update this frame".
pub fn compute_frame(request: &GeometryRequest, ema_cache: &mut EmaCache) -> Option<GeometryFrame> {
    let GeometryRequest {
        candles,
        view,
        dims,
        reserved_band,
    } = request;

    if candles.is_empty() || view.visible_bars == 0 {
        return None;
    }
    let chart_height = dims.height - reserved_band;
    if !dims.width.is_finite() || dims.width <= 0.0 || !chart_height.is_finite() || chart_height <= 0.0 {
        return None;
    }

    let (min_price, max_price) = padded_price_range(candles)?;
    let scale = PriceScale::new(min_price, max_price, chart_height, view.offset_y, view.scale_y);

    let scale_x = if view.scale_x.is_finite() && view.scale_x > 0.0 {
        view.scale_x
    } else {
        1.0
    };
    let slot_width = dims.width * scale_x / view.visible_bars as f64;
    // slots left empty when the viewport starts before the first candle
    let lead_gap = (-view.start_index).max(0) as f64;

    let geometry = candles
        .iter()
        .enumerate()
        .map(|(i, candle)| {
            let x = (i as f64 + lead_gap + 0.5) * slot_width;
            let color = if candle.is_up() {
                CandleColor::Up
            } else {
                CandleColor::Down
            };
            CandleGeometry::new(
                x,
                scale.price_to_y(candle.open.max(candle.close)),
                scale.price_to_y(candle.open.min(candle.close)),
                scale.price_to_y(candle.high),
                scale.price_to_y(candle.low),
                color,
            )
        })
        .collect();

    let ema = ema_cache
        .values(candles)
        .iter()
        .enumerate()
        .map(|(i, value)| {
            let x = (i as f64 + lead_gap + 0.5) * slot_width;
            (x, scale.price_to_y(*value))
        })
        .collect();

    Some(GeometryFrame {
        candles: geometry,
        ema,
        scale,
        slot_width,
    })
}
