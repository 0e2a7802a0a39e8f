//! Inbound reducer for bucket payloads.
//!
//! A whole-bucket payload replaces the bucket; a payload carrying a `_key`
//! field routes to a sub-key update of the bucket object instead, leaving
//! sibling keys untouched.

use super::StateBucket;
use fnv::FnvHashMap;
use serde_json::{Map, Value};
use smol_str::SmolStr;

/// How one inbound payload was applied.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Applied {
    Replaced,
    Merged(SmolStr),
}

/// Client-side copy of the server's application state, bucket by bucket.
#[derive(Default)]
pub struct SyncState {
    buckets: FnvHashMap<StateBucket, Value>,
}

impl SyncState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bucket(&self, bucket: StateBucket) -> Option<&Value> {
        self.buckets.get(&bucket)
    }

    /// Apply one inbound payload to its bucket.
    pub fn apply(&mut self, bucket: StateBucket, data: Value) -> Applied {
        match data {
            Value::Object(mut fields) => match fields.remove("_key") {
                Some(Value::String(key)) => {
                    let entry = self
                        .buckets
                        .entry(bucket)
                        .or_insert_with(|| Value::Object(Map::new()));
                    if !entry.is_object() {
                        *entry = Value::Object(Map::new());
                    }
                    if let Some(object) = entry.as_object_mut() {
                        object.insert(key.clone(), Value::Object(fields));
                    }
                    Applied::Merged(SmolStr::new(key))
                }
                Some(other) => {
                    // malformed routing key: keep the payload intact and
                    // fall back to a whole replace
                    fields.insert("_key".to_string(), other);
                    self.buckets.insert(bucket, Value::Object(fields));
                    Applied::Replaced
                }
                None => {
                    self.buckets.insert(bucket, Value::Object(fields));
                    Applied::Replaced
                }
            },
            other => {
                self.buckets.insert(bucket, other);
                Applied::Replaced
            }
        }
    }
}
