//! Store-facing data shapes shared by every collector.
//!
//! A [`PersistedRecord`] is always addressed by its [`BatchKey`] plus a
//! [`PartitionKey`] that must be unique inside that batch. Reconciled
//! entities are long-lived rows merged from many unrelated record streams.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::store::StoreError;

/// Logical partition one run writes into, e.g. `2024-05-01/assets_ranking`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BatchKey {
    pub date: NaiveDate,
    pub kind: String,
}

impl BatchKey {
    pub fn new(date: NaiveDate, kind: impl Into<String>) -> Self {
        Self {
            date,
            kind: kind.into(),
        }
    }
}

impl fmt::Display for BatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.date, self.kind)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum PartitionKey {
    /// Upstream-reported 1-based rank.
    Rank(u64),
    /// Stable external identifier.
    Id(String),
}

impl PartitionKey {
    /// Text form used by the stores (`r:42`, `id:abc`).
    pub fn to_storage(&self) -> String {
        match self {
            Self::Rank(rank) => format!("r:{rank}"),
            Self::Id(id) => format!("id:{id}"),
        }
    }

    pub fn from_storage(raw: &str) -> Result<Self, StoreError> {
        if let Some(rank) = raw.strip_prefix("r:") {
            return rank
                .parse::<u64>()
                .map(Self::Rank)
                .map_err(|_| StoreError::Decode(format!("bad rank partition {raw:?}")));
        }
        if let Some(id) = raw.strip_prefix("id:") {
            return Ok(Self::Id(id.to_string()));
        }
        Err(StoreError::Decode(format!("unknown partition key {raw:?}")))
    }

    /// Numeric ordering hint: the rank itself, or a numeric external id.
    /// Stores use it to answer "latest record" queries.
    pub fn ordinal(&self) -> Option<u64> {
        match self {
            Self::Rank(rank) => Some(*rank),
            Self::Id(id) => id.parse::<u64>().ok(),
        }
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rank(rank) => write!(f, "rank {rank}"),
            Self::Id(id) => write!(f, "id {id}"),
        }
    }
}

/// Store-shape record produced by a fetcher's transform step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedRecord {
    pub key: BatchKey,
    pub partition: PartitionKey,
    pub payload: Value,
}

impl PersistedRecord {
    pub fn new(key: BatchKey, partition: PartitionKey, payload: Value) -> Self {
        Self {
            key,
            partition,
            payload,
        }
    }

    pub fn from_value<T: Serialize>(
        key: BatchKey,
        partition: PartitionKey,
        value: &T,
    ) -> Result<Self, StoreError> {
        let payload = serde_json::to_value(value)
            .map_err(|e| StoreError::Decode(format!("encode {partition}: {e}")))?;
        Ok(Self::new(key, partition, payload))
    }

    /// Typed view of the payload. Shape mismatches fail closed instead of
    /// producing a partially populated value.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, StoreError> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| StoreError::Decode(format!("record {} in {}: {e}", self.partition, self.key)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityStatus {
    #[default]
    Normal,
    /// Upstream reports the entity as deleted or banned.
    Inaccessible,
}

impl EntityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Inaccessible => "inaccessible",
        }
    }
}

impl FromStr for EntityStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "normal" => Ok(Self::Normal),
            "inaccessible" => Ok(Self::Inaccessible),
            other => Err(StoreError::Decode(format!("unknown entity status {other:?}"))),
        }
    }
}

/// Superseded values kept per attribute; older ones are dropped first.
pub const HISTORY_LIMIT: usize = 20;

/// Long-lived denormalized entity (e.g. a user profile).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub kind: String,
    pub key: String,
    pub external_id: Option<i64>,
    pub status: EntityStatus,
    pub attrs: BTreeMap<String, String>,
    /// Superseded values per attribute, oldest first, at most
    /// [`HISTORY_LIMIT`] each.
    pub history: BTreeMap<String, Vec<String>>,
    pub updated_at: DateTime<Utc>,
}

impl Entity {
    /// Fresh entity built from its first sighting; history starts empty.
    pub fn from_update(update: &EntityUpdate) -> Self {
        let attrs = update
            .attrs
            .iter()
            .filter(|(_, v)| !v.trim().is_empty())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Self {
            kind: update.kind.clone(),
            key: update.key.clone(),
            external_id: update.external_id,
            status: EntityStatus::Normal,
            attrs,
            history: BTreeMap::new(),
            updated_at: update.updated_at,
        }
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(String::as_str)
    }

    pub fn history_of(&self, name: &str) -> &[String] {
        self.history.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Apply a patch computed by the reconciler. Stores call this so the
    /// merge semantics live in one place.
    pub fn apply(&mut self, patch: &EntityPatch) {
        if let Some(id) = patch.external_id {
            self.external_id = Some(id);
        }
        for (name, old) in &patch.push_history {
            let entries = self.history.entry(name.clone()).or_default();
            if !entries.contains(old) {
                entries.push(old.clone());
            }
            if entries.len() > HISTORY_LIMIT {
                let excess = entries.len() - HISTORY_LIMIT;
                entries.drain(..excess);
            }
        }
        for (name, value) in &patch.set_attrs {
            self.attrs.insert(name.clone(), value.clone());
        }
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(ts) = patch.updated_at {
            self.updated_at = ts;
        }
    }
}

/// One sighting of an entity inside a record stream.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityUpdate {
    pub kind: String,
    pub key: String,
    pub external_id: Option<i64>,
    pub attrs: BTreeMap<String, String>,
    pub updated_at: DateTime<Utc>,
}

impl EntityUpdate {
    pub fn new(kind: impl Into<String>, key: impl Into<String>, updated_at: DateTime<Utc>) -> Self {
        Self {
            kind: kind.into(),
            key: key.into(),
            external_id: None,
            attrs: BTreeMap::new(),
            updated_at,
        }
    }

    pub fn with_external_id(mut self, id: Option<i64>) -> Self {
        self.external_id = id;
        self
    }

    /// Empty values mean "unknown" and are dropped.
    pub fn with_attr(mut self, name: &str, value: Option<impl Into<String>>) -> Self {
        if let Some(value) = value {
            let value = value.into();
            if !value.trim().is_empty() {
                self.attrs.insert(name.to_string(), value);
            }
        }
        self
    }
}

/// Field-level changes for an existing entity (`updateByKey`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityPatch {
    pub external_id: Option<i64>,
    pub set_attrs: BTreeMap<String, String>,
    /// `(attribute, superseded value)` pairs, applied before `set_attrs`.
    pub push_history: Vec<(String, String)>,
    pub status: Option<EntityStatus>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl EntityPatch {
    pub fn changed_attrs(&self) -> Vec<String> {
        self.set_attrs.keys().cloned().collect()
    }
}
