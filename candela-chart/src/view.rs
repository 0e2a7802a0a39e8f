//! Viewport state mutated by pan/zoom gestures and read by every frame
//! request.

use serde::{Deserialize, Serialize};

const MIN_VISIBLE_BARS: usize = 10;
const MAX_VISIBLE_BARS: usize = 500;

/// Current chart viewport.
///
/// `start_index` may run negative while the user pans left of the loaded
/// data; the series intersects the window with what it actually holds.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ViewState {
    pub scale_x: f64,
    pub scale_y: f64,
    pub offset_y: f64,
    pub start_index: i64,
    pub visible_bars: usize,
}

impl Default for ViewState {
    fn default() -> Self {
        Self {
            scale_x: 1.0,
            scale_y: 1.0,
            offset_y: 0.0,
            start_index: 0,
            visible_bars: 120,
        }
    }
}

impl ViewState {
    /// Shift the window left or right by whole bars.
    pub fn pan(&mut self, delta_bars: i64) {
        self.start_index = self.start_index.saturating_add(delta_bars);
    }

    /// Grow or shrink the window around its left edge.
    pub fn zoom(&mut self, delta_bars: i64) {
        let bars = self.visible_bars as i64 + delta_bars;
        self.visible_bars = bars.clamp(MIN_VISIBLE_BARS as i64, MAX_VISIBLE_BARS as i64) as usize;
    }

    /// Pin the window to the most recent candles.
    pub fn follow_latest(&mut self, series_len: usize) {
        self.start_index = series_len as i64 - self.visible_bars as i64;
        if self.start_index < 0 {
            self.start_index = 0;
        }
    }

    /// True when the right edge of the window is at or past the last candle,
    /// i.e. the chart should keep following live data.
    pub fn is_following(&self, series_len: usize) -> bool {
        self.start_index + self.visible_bars as i64 >= series_len as i64
    }
}
