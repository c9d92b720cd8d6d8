//! Entries: immutable, sequence-numbered rows of a relation.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::value::Value;

/// Per-relation sequence number assigned by the store on append.
///
/// Sequences start at 1; 0 means "before the first entry".
pub type Sequence = u64;

/// Field values of an entry, keyed by field name.
pub type Fields = BTreeMap<String, Value>;

/// Builds a [`Fields`] map from name/value pairs.
///
/// ```
/// use tributary::{fields, Value};
///
/// let f = fields([("text", Value::from("a b c"))]);
/// assert_eq!(f["text"], Value::from("a b c"));
/// ```
pub fn fields<I, K, V>(pairs: I) -> Fields
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<Value>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

/// Unique identifier for an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(Uuid);

impl EntryId {
    /// Creates a new random entry ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Deterministic id for `name`: the same name always yields the same id.
    #[must_use]
    pub fn derived(name: &str) -> Self {
        Self(Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()))
    }

    /// The underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for EntryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Value scoping a stateful trigger's exclusivity and persistent state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionKey(String);

impl PartitionKey {
    /// Key used when a stateful trigger has no partition source.
    pub const GLOBAL: &'static str = "*";

    /// Key from any string.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The single key shared by every entry of an unpartitioned trigger.
    #[must_use]
    pub fn global() -> Self {
        Self(Self::GLOBAL.to_string())
    }

    /// Derives a key from a field value. Strings are used verbatim.
    #[must_use]
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::String(s) => Self(s.clone()),
            other => Self(other.to_string()),
        }
    }

    /// The key as text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PartitionKey {
    fn from(v: &str) -> Self {
        Self::new(v)
    }
}

impl From<String> for PartitionKey {
    fn from(v: String) -> Self {
        Self(v)
    }
}

/// Link from a derived entry back to the entry whose trigger produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    /// The upstream entry that caused this one.
    pub caused_by: EntryId,
    /// The externally written entry at the root of the cascade.
    pub root: EntryId,
}

/// One immutable row of a relation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// Unique id.
    pub id: EntryId,
    /// Relation the entry belongs to.
    pub relation: String,
    /// Position in the relation, starting at 1.
    pub sequence: Sequence,
    /// Field values, checked against the relation's schema.
    pub fields: Fields,
    /// The upstream entry whose trigger produced this one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caused_by: Option<EntryId>,
    /// Root of the cascade; equals `id` for externally written entries.
    pub root: EntryId,
    /// Commit time.
    pub written_at: DateTime<Utc>,
}

impl Entry {
    /// Returns the value of a field, if present.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Whether this entry was written externally rather than by a trigger.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.caused_by.is_none()
    }

    /// Partition key taken from `field`; `None` if the field is absent or null.
    #[must_use]
    pub fn partition_key(&self, field: &str) -> Option<PartitionKey> {
        match self.fields.get(field) {
            None | Some(Value::Null) => None,
            Some(v) => Some(PartitionKey::from_value(v)),
        }
    }
}

/// A request to append one entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppendRequest {
    /// Target relation.
    pub relation: String,
    /// Field values.
    pub fields: Fields,
    /// Upstream link; `None` for an externally written entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provenance: Option<Provenance>,
    /// Replaying an append with the same `(relation, dedup_key)` returns the
    /// original entry instead of creating a new one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedup_key: Option<String>,
    /// Key whose latest pointer this entry advances.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_key: Option<PartitionKey>,
    /// Id to give the entry instead of a random one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<EntryId>,
}

impl AppendRequest {
    /// Plain append of `fields` to `relation`.
    #[must_use]
    pub fn new(relation: impl Into<String>, fields: Fields) -> Self {
        Self {
            relation: relation.into(),
            fields,
            provenance: None,
            dedup_key: None,
            latest_key: None,
            id: None,
        }
    }

    /// Marks the entry as produced from an upstream entry.
    #[must_use]
    pub fn caused_by(mut self, provenance: Provenance) -> Self {
        self.provenance = Some(provenance);
        self
    }

    /// Sets the idempotency key.
    #[must_use]
    pub fn dedup_key(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = Some(key.into());
        self
    }

    /// Sets the key whose latest pointer this entry advances.
    #[must_use]
    pub fn latest_key(mut self, key: Option<PartitionKey>) -> Self {
        self.latest_key = key;
        self
    }

    /// Gives the entry a caller-chosen id. Committing a second entry with the same id fails.
    #[must_use]
    pub fn with_id(mut self, id: EntryId) -> Self {
        self.id = Some(id);
        self
    }
}
