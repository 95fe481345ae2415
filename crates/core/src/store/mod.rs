//! SQLite-backed Local Store for synced strings.
//!
//! This module provides durable, per-language persistence using SQLite with
//! async access via tokio-rusqlite. It supports:
//!
//! - Soft-deleted entries (tombstones) until explicit compaction
//! - Per-language delta cursors
//! - Atomic application of a whole sync batch, cursor included
//! - Experiment assignments, device identity and the language catalog

pub mod assignments;
pub mod commit;
pub mod connection;
pub mod cursors;
pub mod entries;
pub mod identity;
pub mod languages;
pub mod migrations;

pub use crate::Error;

pub use commit::{CommitOutcome, CommitRequest};
pub use connection::StoreDb;
pub use entries::StoreCounts;

use chrono::{DateTime, SecondsFormat, Utc};
use tokio_rusqlite::rusqlite::{self, types::Type};

/// Fixed-width UTC RFC 3339, so text order in SQL is time order.
pub(crate) fn to_timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub(crate) fn parse_timestamp(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}
