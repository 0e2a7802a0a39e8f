//! Core candle data model shared by the store, the mapper and the feed layer.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One OHLCV bar for a fixed time bucket.
///
/// `timestamp` is the bucket start in milliseconds UTC. The last candle of a
/// series may still be forming and is mutated in place until its period rolls
/// over; every earlier candle is immutable.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    /// Shape invariant: `low <= min(open, close) <= max(open, close) <= high`,
    /// all fields finite, volume non-negative.
    ///
    /// Ingestion paths drop candles that fail this instead of erroring, so a
    /// single bad message can never poison the render path.
    pub fn is_valid(&self) -> bool {
        let finite = [self.open, self.high, self.low, self.close, self.volume]
            .iter()
            .all(|v| v.is_finite());
        finite
            && self.volume >= 0.0
            && self.low <= self.open.min(self.close)
            && self.high >= self.open.max(self.close)
    }

    /// Up candles close at or above their open.
    pub fn is_up(&self) -> bool {
        self.close >= self.open
    }
}

/// Bucket width of a candle series.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Resolution {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
}

pub const MINUTE_MS: i64 = 60_000;
pub const HOUR_MS: i64 = 60 * MINUTE_MS;
pub const DAY_MS: i64 = 24 * HOUR_MS;

impl Resolution {
    /// Wire suffix used in feed channel names (eg. `candlestick_5m`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::M1 => "1m",
            Resolution::M5 => "5m",
            Resolution::M15 => "15m",
            Resolution::H1 => "1h",
            Resolution::H4 => "4h",
            Resolution::D1 => "1d",
        }
    }

    /// Bucket width in milliseconds.
    pub fn period_ms(&self) -> i64 {
        match self {
            Resolution::M1 => MINUTE_MS,
            Resolution::M5 => 5 * MINUTE_MS,
            Resolution::M15 => 15 * MINUTE_MS,
            Resolution::H1 => HOUR_MS,
            Resolution::H4 => 4 * HOUR_MS,
            Resolution::D1 => DAY_MS,
        }
    }

    /// Align a millisecond timestamp down to the start of its bucket.
    pub fn align(&self, timestamp: i64) -> i64 {
        let period = self.period_ms();
        timestamp - timestamp.rem_euclid(period)
    }
}

impl FromStr for Resolution {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1m" => Ok(Resolution::M1),
            "5m" => Ok(Resolution::M5),
            "15m" => Ok(Resolution::M15),
            "1h" => Ok(Resolution::H1),
            "4h" => Ok(Resolution::H4),
            "1d" => Ok(Resolution::D1),
            _ => Err(()),
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(open: f64, high: f64, low: f64, close: f64) -> Candle {
        Candle {
            timestamp: 1_700_000_000_000,
            open,
            high,
            low,
            close,
            volume: 1.0,
        }
    }

    #[test]
    fn test_candle_is_valid() {
        struct TestCase {
            input: Candle,
            expected: bool,
        }

        let cases = vec![
            // TC0: well formed up candle
            TestCase {
                input: candle(100.0, 110.0, 95.0, 105.0),
                expected: true,
            },
            // TC1: well formed down candle
            TestCase {
                input: candle(105.0, 110.0, 95.0, 100.0),
                expected: true,
            },
            // TC2: doji where all four prices coincide
            TestCase {
                input: candle(100.0, 100.0, 100.0, 100.0),
                expected: true,
            },
            // TC3: high below the body
            TestCase {
                input: candle(100.0, 99.0, 95.0, 105.0),
                expected: false,
            },
            // TC4: low above the body
            TestCase {
                input: candle(100.0, 110.0, 101.0, 105.0),
                expected: false,
            },
            // TC5: non-finite field
            TestCase {
                input: candle(100.0, f64::NAN, 95.0, 105.0),
                expected: false,
            },
            // TC6: negative volume
            TestCase {
                input: Candle {
                    volume: -1.0,
                    ..candle(100.0, 110.0, 95.0, 105.0)
                },
                expected: false,
            },
        ];

        for (index, test) in cases.into_iter().enumerate() {
            assert_eq!(test.input.is_valid(), test.expected, "TC{index} failed");
        }
    }

    #[test]
    fn test_resolution_round_trip() {
        for resolution in [
            Resolution::M1,
            Resolution::M5,
            Resolution::M15,
            Resolution::H1,
            Resolution::H4,
            Resolution::D1,
        ] {
            assert_eq!(
                resolution.as_str().parse::<Resolution>(),
                Ok(resolution),
                "{resolution} did not round trip"
            );
        }
        assert!("7m".parse::<Resolution>().is_err());
    }

    #[test]
    fn test_resolution_align() {
        // 2023-11-14 22:13:20 UTC
        let ts = 1_700_000_000_000;
        assert_eq!(Resolution::M1.align(ts), 1_699_999_980_000);
        assert_eq!(Resolution::M5.align(ts), 1_699_999_800_000);
        assert_eq!(Resolution::H1.align(ts), 1_699_999_200_000);
        assert_eq!(Resolution::M5.align(1_699_999_800_000), 1_699_999_800_000);
    }
}
