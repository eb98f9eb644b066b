//! Ledger document types
//!
//! A [`LedgerDocument`] is one immutable record of the remote append-only
//! ledger. The ledger has shipped several wire spellings over time
//! (`collectionId` / `collection_id`, `updateTime` / `updateDate`, RFC 3339
//! strings or epoch milliseconds), so deserialization accepts all of them and
//! serialization always emits the camelCase form.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{CollectionId, DocumentId};

/// A single field value stored in a ledger document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Number(f64),
    Text(String),
    /// Anything the ledger returns that is not a scalar. Kept so that a
    /// nested value does not make the whole document undecodable.
    Other(serde_json::Value),
}

impl FieldValue {
    /// String content, if this is a text value.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric interpretation. Text is parsed after trimming.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Number(n) => Some(*n),
            FieldValue::Text(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
    }

    /// Boolean interpretation. Accepts `"true"` / `"false"` text.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Bool(b) => Some(*b),
            FieldValue::Text(s) => match s.trim() {
                "true" => Some(true),
                "false" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Text(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::Text(s)
    }
}

impl From<f64> for FieldValue {
    fn from(n: f64) -> Self {
        FieldValue::Number(n)
    }
}

impl From<bool> for FieldValue {
    fn from(b: bool) -> Self {
        FieldValue::Bool(b)
    }
}

/// Document fields, ordered by key for deterministic serialization.
pub type Fields = BTreeMap<String, FieldValue>;

/// Immutable ledger record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerDocument {
    pub id: DocumentId,

    #[serde(default, alias = "collection_id", skip_serializing_if = "Option::is_none")]
    pub collection_id: Option<CollectionId>,

    #[serde(default)]
    pub fields: Fields,

    #[serde(
        default,
        alias = "creationDate",
        alias = "creation_time",
        with = "timestamp"
    )]
    pub creation_time: Option<DateTime<Utc>>,

    #[serde(
        default,
        alias = "updateDate",
        alias = "update_time",
        with = "timestamp"
    )]
    pub update_time: Option<DateTime<Utc>>,
}

impl LedgerDocument {
    /// Look up a field by name.
    pub fn field(&self, key: &str) -> Option<&FieldValue> {
        self.fields.get(key)
    }

    /// Look up a text field by name.
    pub fn text_field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(FieldValue::as_text)
    }

    /// The time this record describes: the update time when present, else
    /// the creation time. Records carrying neither are placed at the Unix
    /// epoch so they lose every recency comparison.
    pub fn observed_at(&self) -> DateTime<Utc> {
        self.update_time
            .or(self.creation_time)
            .unwrap_or(DateTime::UNIX_EPOCH)
    }
}

/// Lenient (de)serialization for optional ledger timestamps.
pub mod timestamp {
    use chrono::{DateTime, TimeZone, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Millis(i64),
        Fractional(f64),
        Text(String),
    }

    pub fn serialize<S>(value: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(ts) => serializer.serialize_str(&ts.to_rfc3339()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Option::<Raw>::deserialize(deserializer)?;
        Ok(raw.and_then(|raw| match raw {
            Raw::Millis(ms) => Utc.timestamp_millis_opt(ms).single(),
            Raw::Fractional(ms) => Utc.timestamp_millis_opt(ms as i64).single(),
            Raw::Text(s) => parse_text(&s),
        }))
    }

    /// Parse an RFC 3339 string or a string of epoch milliseconds.
    pub fn parse_text(s: &str) -> Option<DateTime<Utc>> {
        let s = s.trim();
        if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
            return Some(ts.with_timezone(&Utc));
        }
        s.parse::<i64>()
            .ok()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
    }
}
