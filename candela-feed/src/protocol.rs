//! Wire protocol of the market-data venue: outbound subscription
//! envelopes, inbound tagged messages and the timestamp normalization
//! applied to everything that crosses the socket.

use candela_chart::candle::{Candle, Resolution};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Value, json};
use smol_str::{SmolStr, format_smolstr};
use std::fmt;

/// Raw timestamps above this are microseconds.
const MICROSECOND_FLOOR: i64 = 1_000_000_000_000_000;

/// Raw timestamps below this are seconds.
const MILLISECOND_FLOOR: i64 = 10_000_000_000;

/// Channel of the market-data feed.
///
/// Closed set by design: a typo'd channel name cannot silently register a
/// handler that never fires.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum FeedChannel {
    Candlestick(Resolution),
    Ticker,
}

impl FeedChannel {
    /// Channel name on the wire, eg. "candlestick_5m".
    pub fn name(&self) -> SmolStr {
        match self {
            FeedChannel::Candlestick(resolution) => {
                format_smolstr!("candlestick_{}", resolution.as_str())
            }
            FeedChannel::Ticker => SmolStr::new_static("ticker"),
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        if let Some(resolution) = name.strip_prefix("candlestick_") {
            resolution.parse().ok().map(FeedChannel::Candlestick)
        } else if name == "ticker" {
            Some(FeedChannel::Ticker)
        } else {
            None
        }
    }
}

impl fmt::Display for FeedChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Composite routing key for one `(channel, symbol)` stream.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    pub channel: FeedChannel,
    pub symbol: SmolStr,
}

impl SubscriptionKey {
    pub fn candles<S>(symbol: S, resolution: Resolution) -> Self
    where
        S: Into<SmolStr>,
    {
        Self {
            channel: FeedChannel::Candlestick(resolution),
            symbol: symbol.into(),
        }
    }

    pub fn ticker<S>(symbol: S) -> Self
    where
        S: Into<SmolStr>,
    {
        Self {
            channel: FeedChannel::Ticker,
            symbol: symbol.into(),
        }
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.channel.name(), self.symbol)
    }
}

/// Builds the outbound subscribe envelope:
/// `{"type":"subscribe","payload":{"channels":[{"name":..,"symbols":[..]}]}}`.
pub fn subscribe_request(keys: &[SubscriptionKey]) -> String {
    request("subscribe", keys)
}

/// Symmetric unsubscribe envelope.
pub fn unsubscribe_request(keys: &[SubscriptionKey]) -> String {
    request("unsubscribe", keys)
}

fn request(op: &str, keys: &[SubscriptionKey]) -> String {
    let channels: Vec<Value> = channel_groups(keys)
        .into_iter()
        .map(|(name, symbols)| json!({ "name": name, "symbols": symbols }))
        .collect();

    json!({
        "type": op,
        "payload": {
            "channels": channels,
        },
    })
    .to_string()
}

/// Groups keys into `(channel name, symbols)` pairs, preserving first-seen
/// order and de-duplicating symbols within a channel.
fn channel_groups(keys: &[SubscriptionKey]) -> Vec<(SmolStr, Vec<SmolStr>)> {
    let mut groups: Vec<(SmolStr, Vec<SmolStr>)> = Vec::new();
    for key in keys {
        let name = key.channel.name();
        match groups.iter_mut().find(|(group, _)| *group == name) {
            Some((_, symbols)) => {
                if !symbols.contains(&key.symbol) {
                    symbols.push(key.symbol.clone());
                }
            }
            None => groups.push((name, vec![key.symbol.clone()])),
        }
    }
    groups
}

/// Normalizes a raw venue timestamp to milliseconds.
///
/// The venue is inconsistent about units, so magnitude decides:
/// above `1e15` the value is microseconds, below `1e10` it is seconds,
/// anything in between is already milliseconds.
pub fn normalize_timestamp_ms(raw: i64) -> i64 {
    if raw > MICROSECOND_FLOOR {
        raw / 1_000
    } else if raw < MILLISECOND_FLOOR {
        raw * 1_000
    } else {
        raw
    }
}

/// Deserialize an `f64` that may arrive as a JSON number or string.
pub(crate) fn de_flexible_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrString {
        Number(f64),
        String(String),
    }

    match NumberOrString::deserialize(deserializer)? {
        NumberOrString::Number(value) => Ok(value),
        NumberOrString::String(value) => value.parse().map_err(serde::de::Error::custom),
    }
}

/// Deserialize a venue timestamp (number or string, any unit) into
/// normalized milliseconds.
pub(crate) fn de_timestamp_ms<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrString {
        Number(i64),
        String(String),
    }

    let raw = match NumberOrString::deserialize(deserializer)? {
        NumberOrString::Number(value) => value,
        NumberOrString::String(value) => value.parse().map_err(serde::de::Error::custom)?,
    };
    Ok(normalize_timestamp_ms(raw))
}

/// ### Raw Payload Example
/// ```json
/// {
///     "type": "candlestick_1m",
///     "candle_start_time": 1700000000,
///     "open": "42000.1",
///     "high": "42100.0",
///     "low": "41950.5",
///     "close": "42050.0",
///     "volume": "13.37",
///     "symbol": "BTCUSDT"
/// }
/// ```
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct WireCandle {
    #[serde(rename = "candle_start_time", deserialize_with = "de_timestamp_ms")]
    pub start_time: i64,

    #[serde(deserialize_with = "de_flexible_f64")]
    pub open: f64,

    #[serde(deserialize_with = "de_flexible_f64")]
    pub high: f64,

    #[serde(deserialize_with = "de_flexible_f64")]
    pub low: f64,

    #[serde(deserialize_with = "de_flexible_f64")]
    pub close: f64,

    #[serde(deserialize_with = "de_flexible_f64")]
    pub volume: f64,

    pub symbol: SmolStr,
}

impl From<&WireCandle> for Candle {
    fn from(wire: &WireCandle) -> Self {
        Candle {
            timestamp: wire.start_time,
            open: wire.open,
            high: wire.high,
            low: wire.low,
            close: wire.close,
            volume: wire.volume,
        }
    }
}

/// ### Raw Payload Example
/// ```json
/// { "type": "ticker", "symbol": "BTCUSDT", "price": "64250.5" }
/// ```
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct WireTick {
    pub symbol: SmolStr,

    #[serde(deserialize_with = "de_flexible_f64")]
    pub price: f64,
}

/// Messages received on the market-data socket, classified by their
/// `type` tag. Anything unrecognized maps to [`FeedMessage::Ignore`] so
/// the read loop stays total.
#[derive(Clone, Debug, PartialEq)]
pub enum FeedMessage {
    Candle {
        resolution: Resolution,
        candle: WireCandle,
    },
    Tick(WireTick),
    SubscribeAck,
    Ignore,
}

impl FeedMessage {
    /// Routing key of the stream this message belongs to, if any.
    pub fn subscription_key(&self) -> Option<SubscriptionKey> {
        match self {
            FeedMessage::Candle { resolution, candle } => {
                Some(SubscriptionKey::candles(candle.symbol.clone(), *resolution))
            }
            FeedMessage::Tick(tick) => Some(SubscriptionKey::ticker(tick.symbol.clone())),
            FeedMessage::SubscribeAck | FeedMessage::Ignore => None,
        }
    }
}

impl<'de> Deserialize<'de> for FeedMessage {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;

        let Some(kind) = value.get("type").and_then(Value::as_str) else {
            return Ok(FeedMessage::Ignore);
        };

        if let Some(suffix) = kind.strip_prefix("candlestick_") {
            let Ok(resolution) = suffix.parse::<Resolution>() else {
                return Ok(FeedMessage::Ignore);
            };
            let candle = WireCandle::deserialize(&value).map_err(serde::de::Error::custom)?;
            return Ok(FeedMessage::Candle { resolution, candle });
        }

        match kind {
            "ticker" => {
                let tick = WireTick::deserialize(&value).map_err(serde::de::Error::custom)?;
                Ok(FeedMessage::Tick(tick))
            }
            "subscriptions" => Ok(FeedMessage::SubscribeAck),
            _ => Ok(FeedMessage::Ignore),
        }
    }
}
