//! Decoded values and the record they accumulate into.

use std::collections::BTreeMap;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// A single decoded field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Raw(Vec<u8>),
    Text(String),
    Number(f64),
    Bool(bool),
}

/// A field's decoded contents: a singleton for non-repeatable items, or an
/// ordered sequence for items declared `repeatable` (always a sequence for
/// those, even when only one occurrence was present — see `DecodedRecord::insert`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Single(Value),
    Sequence(Vec<Value>),
}

impl FieldValue {
    pub fn as_single(&self) -> Option<&Value> {
        match self {
            FieldValue::Single(v) => Some(v),
            FieldValue::Sequence(_) => None,
        }
    }

    pub fn as_sequence(&self) -> Option<&[Value]> {
        match self {
            FieldValue::Sequence(v) => Some(v),
            FieldValue::Single(_) => None,
        }
    }
}

/// A decoded response, keyed by item key in declaration order of first
/// appearance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DecodedRecord(BTreeMap<String, FieldValue>);

impl DecodedRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a decoded value for `key`. Repeatable items always accumulate
    /// into a `Sequence`, even on their first occurrence; non-repeatable
    /// items are always a `Single` (the unpacker rejects protocols where a
    /// non-repeatable key would appear twice, so this never overwrites).
    pub fn insert(&mut self, key: &str, value: Value, repeatable: bool) {
        if repeatable {
            match self.0.get_mut(key) {
                Some(FieldValue::Sequence(seq)) => seq.push(value),
                _ => {
                    self.0.insert(key.to_string(), FieldValue::Sequence(vec![value]));
                }
            }
        } else {
            self.0.insert(key.to_string(), FieldValue::Single(value));
        }
    }

    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.0.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Split into two records by a fixed set of internal key names: keys in
    /// `internal_keys` go to the second record, everything else to the first.
    pub fn partition_by_keys(self, internal_keys: &[&str]) -> (DecodedRecord, DecodedRecord) {
        let mut public = DecodedRecord::new();
        let mut internal = DecodedRecord::new();
        for (key, value) in self.0 {
            if internal_keys.contains(&key.as_str()) {
                internal.0.insert(key, value);
            } else {
                public.0.insert(key, value);
            }
        }
        (public, internal)
    }

    /// Render as a JSON object, for a consumer that wants a sink-friendly
    /// string (e.g. a log line or a file-based history) rather than the
    /// in-memory value — the "passing decoded records to a sink" boundary
    /// named in §1's Non-goals.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// A decoded record stamped with arrival time and spacing from the
/// previously cached record of the same kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedRecord {
    pub record: DecodedRecord,
    #[serde(skip, default = "SystemTime::now")]
    pub timestamp: SystemTime,
    pub time_since_last: Option<std::time::Duration>,
}
