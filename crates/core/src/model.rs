//! Data model shared by the store, the sync engine and the delta wire format.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A localized string as held by the Local Store.
///
/// Unique by `(key, language)`. Deleted entries stay as tombstones until
/// compaction so "deleted by server" is distinguishable from "never synced".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub key: String,
    pub language: String,
    pub value: String,
    pub version: i64,
    pub updated_at: DateTime<Utc>,
    pub deleted: bool,
    /// Experiment variant values keyed by variant id.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub variants: BTreeMap<String, String>,
}

impl Entry {
    /// Value to show for a device assigned to `variant_id`, if any.
    ///
    /// Falls back to the base value when the entry has no value for the variant.
    pub fn resolve(&self, variant_id: Option<&str>) -> &str {
        variant_id
            .and_then(|id| self.variants.get(id))
            .map(String::as_str)
            .unwrap_or(&self.value)
    }
}

/// Per-language delta cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor {
    pub last_synced_version: i64,
    pub last_synced_at: DateTime<Utc>,
}

/// Where a device identifier came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentitySource {
    Generated,
    Provided,
}

impl IdentitySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentitySource::Generated => "generated",
            IdentitySource::Provided => "provided",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "generated" => Some(IdentitySource::Generated),
            "provided" => Some(IdentitySource::Provided),
            _ => None,
        }
    }
}

/// Stable anonymous identifier for this client install.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub id: String,
    pub source: IdentitySource,
    pub created_at: DateTime<Utc>,
}

impl DeviceIdentity {
    /// A fresh random identity.
    pub fn generate() -> Self {
        Self { id: uuid::Uuid::new_v4().to_string(), source: IdentitySource::Generated, created_at: Utc::now() }
    }

    /// An identity supplied by the host application.
    pub fn provided(id: impl Into<String>) -> Self {
        Self { id: id.into(), source: IdentitySource::Provided, created_at: Utc::now() }
    }
}

/// A device's variant for one experiment. Never reassigned while stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentAssignment {
    pub experiment_id: String,
    pub string_key: String,
    pub variant_id: String,
    pub variant_name: String,
    pub assigned_at: DateTime<Utc>,
}

/// A language the remote catalog offers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Language {
    pub code: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// Read-only snapshot of cache occupancy and effectiveness.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CacheStats {
    pub memory_entries: usize,
    pub memory_capacity: usize,
    pub store_entries: u64,
    pub tombstone_count: u64,
    pub hit_rate: f64,
    pub miss_rate: f64,
}

/// Request sent to the remote delta endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaRequest {
    #[serde(rename = "lang")]
    pub language: String,
    /// `None` requests the full catalog for the language.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since_version: Option<i64>,
    pub device_id: String,
}

/// An upserted string as carried on the wire; the language is implied by the request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteEntry {
    pub key: String,
    pub value: String,
    pub version: i64,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub variants: BTreeMap<String, String>,
}

impl RemoteEntry {
    pub fn into_entry(self, language: &str, now: DateTime<Utc>) -> Entry {
        Entry {
            key: self.key,
            language: language.to_string(),
            value: self.value,
            version: self.version,
            updated_at: self.updated_at.unwrap_or(now),
            deleted: false,
            variants: self.variants,
        }
    }
}

/// Remote delta: everything that changed for one language since a cursor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaResponse {
    #[serde(default)]
    pub upserts: Vec<RemoteEntry>,
    #[serde(default)]
    pub deletions: Vec<String>,
    pub new_version: i64,
    #[serde(default)]
    pub experiment_assignments: Option<Vec<ExperimentAssignment>>,
    /// Catalog of languages the remote offers, when it chooses to send one.
    #[serde(default)]
    pub languages: Option<Vec<Language>>,
}
