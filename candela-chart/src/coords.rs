//! Conversions between wall-clock time, fractional data-index and pixel
//! space.
//!
//! Drawings persist in timestamp-space and render in index-space, and every
//! pointer gesture passes through the price axis, so these conversions must
//! round trip exactly (up to the millisecond rounding of stored timestamps).

use crate::series::CandleSeries;
use chrono::Utc;

/// Fractional index of `timestamp` within the series.
///
/// Exact timestamp hits return the integer index; anything between two
/// candles interpolates linearly between them. Timestamps outside the loaded
/// window clamp to the first/last index, mirroring [`timestamp_from_index`].
/// An empty series maps everything to `0.0`.
pub fn index_from_timestamp(series: &CandleSeries, timestamp: i64) -> f64 {
    let len = series.len();
    if len == 0 {
        return 0.0;
    }
    let last_index = len - 1;

    let upper = series.lower_bound(timestamp);
    if upper == 0 {
        return 0.0;
    }
    if upper == len {
        return last_index as f64;
    }

    // lower_bound returns the first candle at or after the timestamp
    let right = series.get(upper).map(|c| c.timestamp).unwrap_or(timestamp);
    if right == timestamp {
        return upper as f64;
    }
    let left = series
        .get(upper - 1)
        .map(|c| c.timestamp)
        .unwrap_or(timestamp);
    let gap = (right - left) as f64;
    if gap <= 0.0 {
        return upper as f64;
    }
    (upper - 1) as f64 + (timestamp - left) as f64 / gap
}

/// Timestamp at fractional `index`, interpolating between the floor and ceil
/// candles and clamping outside the array bounds.
///
/// An empty series returns the current wall-clock time so callers always get
/// a usable anchor; a single-candle series returns that candle's timestamp
/// for any index.
pub fn timestamp_from_index(series: &CandleSeries, index: f64) -> i64 {
    let len = series.len();
    if len == 0 {
        return Utc::now().timestamp_millis();
    }
    let last_index = (len - 1) as f64;
    if index <= 0.0 || len == 1 {
        return series.get(0).map(|c| c.timestamp).unwrap_or_default();
    }
    if index >= last_index {
        return series.get(len - 1).map(|c| c.timestamp).unwrap_or_default();
    }

    let floor = index.floor() as usize;
    let frac = index - index.floor();
    let left = series.get(floor).map(|c| c.timestamp).unwrap_or_default();
    if frac == 0.0 {
        return left;
    }
    let right = series.get(floor + 1).map(|c| c.timestamp).unwrap_or(left);
    left + ((right - left) as f64 * frac).round() as i64
}

/// Affine transform between price and vertical pixel position.
///
/// `price_to_y` and `y_to_price` are exact inverses of each other, which
/// gesture hit-testing relies on. Degenerate parameters (zero height, flat
/// price range, non-positive zoom) are sanitized at construction so the
/// transform can never divide by zero.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct PriceScale {
    pub min_price: f64,
    pub max_price: f64,
    pub chart_height: f64,
    pub offset_y: f64,
    pub scale_y: f64,
}

impl PriceScale {
    pub fn new(min_price: f64, max_price: f64, chart_height: f64, offset_y: f64, scale_y: f64) -> Self {
        let chart_height = if chart_height.is_finite() && chart_height > 0.0 {
            chart_height
        } else {
            1.0
        };
        let scale_y = if scale_y.is_finite() && scale_y > 0.0 {
            scale_y
        } else {
            1.0
        };
        let (min_price, max_price) = if min_price.is_finite() && max_price.is_finite() {
            (min_price.min(max_price), min_price.max(max_price))
        } else {
            (0.0, 1.0)
        };
        Self {
            min_price,
            max_price,
            chart_height,
            offset_y: if offset_y.is_finite() { offset_y } else { 0.0 },
            scale_y,
        }
    }

    fn span(&self) -> f64 {
        let span = self.max_price - self.min_price;
        if span > 0.0 { span } else { 1.0 }
    }

    /// Pixel y for a price, top of the chart being `max_price`.
    pub fn price_to_y(&self, price: f64) -> f64 {
        let normalized = (self.max_price - price) / self.span();
        normalized * self.chart_height * self.scale_y + self.offset_y
    }

    /// Price under a pixel y. Inverse of [`PriceScale::price_to_y`].
    pub fn y_to_price(&self, y: f64) -> f64 {
        let normalized = (y - self.offset_y) / (self.chart_height * self.scale_y);
        self.max_price - normalized * self.span()
    }
}
