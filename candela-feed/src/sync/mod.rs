//! State Sync Channel: a second duplex connection carrying application
//! state deltas (not market data) between the client and a coordinating
//! server.
//!
//! Inbound frames use the envelope `{event, data}` and classify into a
//! closed [`SyncMessage`] enum; unknown events are dropped, so a typo'd
//! event name can never silently grow a handler that no message reaches.
//! Outbound bucket snapshots pass through a fingerprint diff and only hit
//! the wire when their content changed.

pub mod client;
pub mod state;

use crate::protocol::WireTick;
use fnv::{FnvHashMap, FnvHasher};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Value, json};
use std::fmt;
use std::hash::Hasher;
use tracing::warn;

pub use client::{SyncClient, SyncConfig, SyncUpdate};
pub use state::{Applied, SyncState};

/// Named application state buckets carried by the channel.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateBucket {
    Orders,
    Positions,
    Notes,
    Tasks,
    Watchlist,
}

impl StateBucket {
    pub fn name(&self) -> &'static str {
        match self {
            StateBucket::Orders => "orders",
            StateBucket::Positions => "positions",
            StateBucket::Notes => "notes",
            StateBucket::Tasks => "tasks",
            StateBucket::Watchlist => "watchlist",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "orders" => Some(StateBucket::Orders),
            "positions" => Some(StateBucket::Positions),
            "notes" => Some(StateBucket::Notes),
            "tasks" => Some(StateBucket::Tasks),
            "watchlist" => Some(StateBucket::Watchlist),
            _ => None,
        }
    }
}

impl fmt::Display for StateBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    #[default]
    Info,
    Warning,
    Error,
}

/// User-visible notification delivered over the sync channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    #[serde(default)]
    pub level: NotificationLevel,
    pub message: String,
}

/// Messages received on the sync socket, classified by their `event` tag.
#[derive(Clone, Debug, PartialEq)]
pub enum SyncMessage {
    Notification(Notification),
    Tick(WireTick),
    Bucket { bucket: StateBucket, data: Value },
    Ignore,
}

impl<'de> Deserialize<'de> for SyncMessage {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;

        let Some(event) = value.get("event").and_then(Value::as_str) else {
            return Ok(SyncMessage::Ignore);
        };
        let data = value.get("data").cloned().unwrap_or(Value::Null);

        match event {
            "notification" => {
                let notification =
                    Notification::deserialize(&data).map_err(serde::de::Error::custom)?;
                Ok(SyncMessage::Notification(notification))
            }
            "tick" => {
                let tick = WireTick::deserialize(&data).map_err(serde::de::Error::custom)?;
                Ok(SyncMessage::Tick(tick))
            }
            other => match StateBucket::from_name(other) {
                Some(bucket) => Ok(SyncMessage::Bucket { bucket, data }),
                None => Ok(SyncMessage::Ignore),
            },
        }
    }
}

/// Builds the outbound envelope for one bucket snapshot.
pub fn bucket_envelope(bucket: StateBucket, data: &Value) -> String {
    json!({ "event": bucket.name(), "data": data }).to_string()
}

/// Outbound change detection.
///
/// Fingerprints each bucket's serialized form (FNV) and compares it with
/// the fingerprint of the last transmission; unchanged buckets produce no
/// wire traffic. `reset` forgets everything, so after a reconnect the first
/// snapshot of every bucket is sent again.
#[derive(Default)]
pub struct ChangeDetector {
    fingerprints: FnvHashMap<StateBucket, u64>,
}

impl ChangeDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.fingerprints.clear();
    }

    /// Serialized envelope when the bucket content differs from the last
    /// transmitted snapshot, `None` otherwise.
    pub fn encode_if_changed(&mut self, bucket: StateBucket, data: &Value) -> Option<String> {
        let bytes = match serde_json::to_vec(data) {
            Ok(bytes) => bytes,
            Err(error) => {
                warn!("Unserializable {} snapshot skipped: {}", bucket, error);
                return None;
            }
        };

        let mut hasher = FnvHasher::default();
        hasher.write(&bytes);
        let fingerprint = hasher.finish();

        if self.fingerprints.get(&bucket) == Some(&fingerprint) {
            return None;
        }
        self.fingerprints.insert(bucket, fingerprint);
        Some(bucket_envelope(bucket, data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smol_str::SmolStr;

    #[test]
    fn test_bucket_names_round_trip() {
        let buckets = [
            StateBucket::Orders,
            StateBucket::Positions,
            StateBucket::Notes,
            StateBucket::Tasks,
            StateBucket::Watchlist,
        ];
        for bucket in buckets {
            assert_eq!(StateBucket::from_name(bucket.name()), Some(bucket));
        }
        assert_eq!(StateBucket::from_name("settings"), None);
    }

    mod de {
        use super::*;

        #[test]
        fn test_sync_message_classification() {
            struct TestCase {
                input: &'static str,
                expected: SyncMessage,
            }

            let tests = vec![
                // TC0: notification with an explicit level
                TestCase {
                    input: r#"
                        {
                            "event": "notification",
                            "data": { "level": "warning", "message": "order rejected" }
                        }
                    "#,
                    expected: SyncMessage::Notification(Notification {
                        level: NotificationLevel::Warning,
                        message: "order rejected".to_string(),
                    }),
                },
                // TC1: notification level defaults to info
                TestCase {
                    input: r#"{ "event": "notification", "data": { "message": "hello" } }"#,
                    expected: SyncMessage::Notification(Notification {
                        level: NotificationLevel::Info,
                        message: "hello".to_string(),
                    }),
                },
                // TC2: tick update
                TestCase {
                    input: r#"{ "event": "tick", "data": { "symbol": "BTCUSDT", "price": 64250.5 } }"#,
                    expected: SyncMessage::Tick(WireTick {
                        symbol: SmolStr::new_static("BTCUSDT"),
                        price: 64250.5,
                    }),
                },
                // TC3: named bucket carries its raw payload
                TestCase {
                    input: r#"{ "event": "watchlist", "data": ["BTCUSDT", "ETHUSDT"] }"#,
                    expected: SyncMessage::Bucket {
                        bucket: StateBucket::Watchlist,
                        data: serde_json::json!(["BTCUSDT", "ETHUSDT"]),
                    },
                },
                // TC4: unknown event is ignored
                TestCase {
                    input: r#"{ "event": "settings", "data": {} }"#,
                    expected: SyncMessage::Ignore,
                },
                // TC5: missing event is ignored
                TestCase {
                    input: r#"{ "data": {} }"#,
                    expected: SyncMessage::Ignore,
                },
            ];

            for (index, test) in tests.into_iter().enumerate() {
                let actual = serde_json::from_str::<SyncMessage>(test.input).unwrap();
                assert_eq!(actual, test.expected, "TC{index} failed");
            }
        }
    }

    #[test]
    fn test_change_detector_sends_only_changes() {
        let mut detector = ChangeDetector::new();
        let orders = serde_json::json!({ "ord-1": { "price": 100.0 } });

        // first snapshot always transmits
        let envelope = detector
            .encode_if_changed(StateBucket::Orders, &orders)
            .expect("first snapshot should encode");
        let parsed: Value = serde_json::from_str(&envelope).unwrap();
        assert_eq!(parsed["event"], "orders");
        assert_eq!(parsed["data"]["ord-1"]["price"], 100.0);

        // identical snapshot is suppressed
        assert!(
            detector
                .encode_if_changed(StateBucket::Orders, &orders)
                .is_none()
        );

        // changed content transmits again
        let changed = serde_json::json!({ "ord-1": { "price": 101.0 } });
        assert!(
            detector
                .encode_if_changed(StateBucket::Orders, &changed)
                .is_some()
        );

        // buckets are tracked independently
        let notes = serde_json::json!({ "n1": "hello" });
        assert!(
            detector
                .encode_if_changed(StateBucket::Notes, &notes)
                .is_some()
        );

        // reset forgets the history, everything transmits again
        detector.reset();
        assert!(
            detector
                .encode_if_changed(StateBucket::Orders, &changed)
                .is_some()
        );
    }
}
