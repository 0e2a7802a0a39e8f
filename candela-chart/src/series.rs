//! In-memory candle series for one (symbol, resolution) pair.
//!
//! The series is the single owner of its candles: the feed layer pushes into
//! it through [`CandleSeries::upsert_last`] and everything downstream (mapper,
//! geometry worker, drawings) reads from it. Old data falls off the front once
//! it ages past the retention window so a long-running chart never grows
//! without bound.

use crate::candle::{Candle, DAY_MS, Resolution};
use smol_str::SmolStr;
use std::collections::VecDeque;
use tracing::debug;

/// Default lookback before candles are evicted from the front.
pub const DEFAULT_RETENTION_MS: i64 = 7 * DAY_MS;

/// Result of pushing one candle into the series.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// New period: the candle was appended at the back.
    Appended,
    /// Same period as the last candle: replaced in place.
    Replaced,
    /// Out-of-order or malformed input, dropped without touching the series.
    Rejected,
}

/// Ordered OHLCV series with amortized O(1) front eviction.
#[derive(Clone, Debug)]
pub struct CandleSeries {
    symbol: SmolStr,
    resolution: Resolution,
    candles: VecDeque<Candle>,
    retention_ms: i64,
}

impl CandleSeries {
    pub fn new(symbol: impl Into<SmolStr>, resolution: Resolution) -> Self {
        Self {
            symbol: symbol.into(),
            resolution,
            candles: VecDeque::new(),
            retention_ms: DEFAULT_RETENTION_MS,
        }
    }

    /// Override the retention window (milliseconds).
    pub fn with_retention_ms(mut self, retention_ms: i64) -> Self {
        self.retention_ms = retention_ms;
        self
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn first(&self) -> Option<&Candle> {
        self.candles.front()
    }

    pub fn last(&self) -> Option<&Candle> {
        self.candles.back()
    }

    pub fn get(&self, index: usize) -> Option<&Candle> {
        self.candles.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Candle> {
        self.candles.iter()
    }

    /// Append a candle strictly after the current last one.
    ///
    /// Rejects malformed candles and timestamps at or before the current last
    /// timestamp. Runs retention eviction after a successful append.
    pub fn append(&mut self, candle: Candle) -> UpsertOutcome {
        if !candle.is_valid() {
            debug!(symbol = %self.symbol, timestamp = candle.timestamp, "dropping malformed candle");
            return UpsertOutcome::Rejected;
        }
        if let Some(last) = self.candles.back() {
            if candle.timestamp <= last.timestamp {
                return UpsertOutcome::Rejected;
            }
        }
        self.candles.push_back(candle);
        self.evict_expired();
        UpsertOutcome::Appended
    }

    /// Merge one live candle into the series.
    ///
    /// Equal timestamp to the last stored candle means the same period is
    /// still forming and the last candle is replaced in place. A greater
    /// timestamp starts a new period and appends. A smaller timestamp is an
    /// out-of-order message and is dropped, never an error.
    pub fn upsert_last(&mut self, candle: Candle) -> UpsertOutcome {
        if !candle.is_valid() {
            debug!(symbol = %self.symbol, timestamp = candle.timestamp, "dropping malformed candle");
            return UpsertOutcome::Rejected;
        }
        match self.candles.back_mut() {
            None => {
                self.candles.push_back(candle);
                UpsertOutcome::Appended
            }
            Some(last) if candle.timestamp == last.timestamp => {
                *last = candle;
                UpsertOutcome::Replaced
            }
            Some(last) if candle.timestamp > last.timestamp => {
                self.candles.push_back(candle);
                self.evict_expired();
                UpsertOutcome::Appended
            }
            Some(_) => UpsertOutcome::Rejected,
        }
    }

    /// Drop candles with `timestamp < cutoff` from the front.
    pub fn evict_before(&mut self, cutoff: i64) {
        while let Some(front) = self.candles.front() {
            if front.timestamp >= cutoff {
                break;
            }
            self.candles.pop_front();
        }
    }

    fn evict_expired(&mut self) {
        if let Some(last) = self.candles.back() {
            let cutoff = last.timestamp - self.retention_ms;
            self.evict_before(cutoff);
        }
    }

    /// First index whose timestamp is `>= timestamp`, or `len` when every
    /// candle is older. The candles are sorted so this is a plain binary
    /// search (the deque indexes in O(1)).
    pub fn lower_bound(&self, timestamp: i64) -> usize {
        let mut lo = 0usize;
        let mut hi = self.candles.len();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.candles[mid].timestamp < timestamp {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    /// Copy the visible slice out for the geometry worker.
    ///
    /// The worker runs on its own task and must never hold references into
    /// the series, so the window is handed over by value. The viewport covers
    /// index range `[start_index, start_index + visible_bars)`; the part of
    /// that range lying outside the data (panned left of the first candle or
    /// right of the last) simply contributes no candles.
    pub fn visible_window(&self, start_index: i64, visible_bars: usize) -> Vec<Candle> {
        if self.candles.is_empty() || visible_bars == 0 {
            return Vec::new();
        }
        let len = self.candles.len() as i64;
        let lo = start_index.clamp(0, len);
        let hi = start_index
            .saturating_add(visible_bars as i64)
            .clamp(0, len);
        if lo >= hi {
            return Vec::new();
        }
        self.candles
            .range(lo as usize..hi as usize)
            .copied()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candle::MINUTE_MS;

    fn candle(timestamp: i64, close: f64) -> Candle {
        Candle {
            timestamp,
            open: close - 1.0,
            high: close + 2.0,
            low: close - 2.0,
            close,
            volume: 10.0,
        }
    }

    fn series_with(timestamps: &[i64]) -> CandleSeries {
        let mut series = CandleSeries::new("BTCUSD", Resolution::M1);
        for &ts in timestamps {
            assert_eq!(series.append(candle(ts, 100.0)), UpsertOutcome::Appended);
        }
        series
    }

    fn assert_monotonic(series: &CandleSeries) {
        let timestamps: Vec<i64> = series.iter().map(|c| c.timestamp).collect();
        for pair in timestamps.windows(2) {
            assert!(pair[0] < pair[1], "timestamps not strictly increasing");
        }
    }

    #[test]
    fn test_upsert_last_outcomes() {
        let mut series = CandleSeries::new("BTCUSD", Resolution::M1);

        // empty series accepts any first candle
        assert_eq!(series.upsert_last(candle(60_000, 100.0)), UpsertOutcome::Appended);
        // same period replaces in place
        assert_eq!(series.upsert_last(candle(60_000, 101.5)), UpsertOutcome::Replaced);
        assert_eq!(series.len(), 1);
        assert_eq!(series.last().map(|c| c.close), Some(101.5));
        // next period appends
        assert_eq!(series.upsert_last(candle(120_000, 102.0)), UpsertOutcome::Appended);
        assert_eq!(series.len(), 2);
        // out-of-order message is a silent no-op
        assert_eq!(series.upsert_last(candle(60_000, 999.0)), UpsertOutcome::Rejected);
        assert_eq!(series.len(), 2);
        assert_eq!(series.last().map(|c| c.close), Some(102.0));
        assert_monotonic(&series);
    }

    #[test]
    fn test_upsert_last_drops_malformed() {
        let mut series = series_with(&[60_000]);
        let mut bad = candle(120_000, 100.0);
        bad.high = bad.low - 1.0;
        assert_eq!(series.upsert_last(bad), UpsertOutcome::Rejected);
        assert_eq!(series.len(), 1);
    }

    #[test]
    fn test_append_rejects_equal_timestamp() {
        let mut series = series_with(&[60_000, 120_000]);
        assert_eq!(series.append(candle(120_000, 50.0)), UpsertOutcome::Rejected);
        assert_eq!(series.len(), 2);
    }

    #[test]
    fn test_retention_evicts_from_front() {
        let mut series =
            CandleSeries::new("BTCUSD", Resolution::M1).with_retention_ms(5 * MINUTE_MS);

        for i in 0..10 {
            series.upsert_last(candle(i * MINUTE_MS, 100.0));
        }
        // candles older than last_ts - 5min are gone: 9min retains [4min, 9min]
        assert_eq!(series.len(), 6);
        assert_eq!(series.first().map(|c| c.timestamp), Some(4 * MINUTE_MS));
        assert_monotonic(&series);
    }

    #[test]
    fn test_evict_before_is_a_front_slide() {
        let mut series = series_with(&[100, 200, 300, 400]);
        series.evict_before(250);
        assert_eq!(series.len(), 2);
        assert_eq!(series.first().map(|c| c.timestamp), Some(300));
        // cutoff before every candle does nothing
        series.evict_before(0);
        assert_eq!(series.len(), 2);
    }

    #[test]
    fn test_lower_bound() {
        let series = series_with(&[100, 200, 300]);
        assert_eq!(series.lower_bound(50), 0);
        assert_eq!(series.lower_bound(100), 0);
        assert_eq!(series.lower_bound(150), 1);
        assert_eq!(series.lower_bound(300), 2);
        assert_eq!(series.lower_bound(301), 3);
    }

    #[test]
    fn test_visible_window_clamps() {
        let series = series_with(&[100, 200, 300, 400]);

        let full: Vec<i64> = series
            .visible_window(0, 10)
            .iter()
            .map(|c| c.timestamp)
            .collect();
        assert_eq!(full, vec![100, 200, 300, 400]);

        // a window partly left of the data keeps only the overlap
        let left: Vec<i64> = series
            .visible_window(-2, 5)
            .iter()
            .map(|c| c.timestamp)
            .collect();
        assert_eq!(left, vec![100, 200, 300]);

        // a window entirely outside the data yields nothing
        assert!(series.visible_window(-3, 2).is_empty());
        assert!(series.visible_window(9, 4).is_empty());
        assert!(series.visible_window(0, 0).is_empty());
    }
}
