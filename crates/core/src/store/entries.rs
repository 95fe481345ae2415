//! Entry reads, batch writes and tombstones.
//!
//! Writes are last-writer-wins keyed on version: a row is only replaced by an
//! incoming row with an equal or higher version.

use std::collections::BTreeMap;

use super::connection::StoreDb;
use super::{parse_timestamp, to_timestamp};
use crate::Error;
use crate::model::Entry;
use tokio_rusqlite::params;
use tokio_rusqlite::rusqlite::{self, OptionalExtension, Row};

const ENTRY_COLUMNS: &str = "key, language, value, version, updated_at, deleted, variants_json";

/// Row counts across all languages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreCounts {
    pub live: u64,
    pub tombstones: u64,
}

pub(crate) fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<Entry> {
    let updated_at: String = row.get(4)?;
    let variants_json: Option<String> = row.get(6)?;
    let variants = match variants_json {
        Some(json) => serde_json::from_str::<BTreeMap<String, String>>(&json)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e)))?,
        None => BTreeMap::new(),
    };

    Ok(Entry {
        key: row.get(0)?,
        language: row.get(1)?,
        value: row.get(2)?,
        version: row.get(3)?,
        updated_at: parse_timestamp(4, &updated_at)?,
        deleted: row.get::<_, i32>(5)? == 1,
        variants,
    })
}

/// Insert or replace one entry unless the stored row has a newer version.
///
/// Returns the number of rows changed (0 when the stored row won).
pub(crate) fn upsert_entry(conn: &rusqlite::Connection, entry: &Entry) -> rusqlite::Result<usize> {
    let variants_json = if entry.variants.is_empty() {
        None
    } else {
        Some(
            serde_json::to_string(&entry.variants)
                .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?,
        )
    };

    conn.execute(
        "INSERT INTO entries (key, language, value, version, updated_at, deleted, variants_json)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(key, language) DO UPDATE SET
            value = excluded.value,
            version = excluded.version,
            updated_at = excluded.updated_at,
            deleted = excluded.deleted,
            variants_json = excluded.variants_json
         WHERE excluded.version >= entries.version",
        params![
            &entry.key,
            &entry.language,
            &entry.value,
            entry.version,
            to_timestamp(&entry.updated_at),
            entry.deleted as i32,
            variants_json,
        ],
    )
}

/// Tombstone one key at `version`, creating the tombstone if the key was never seen.
pub(crate) fn tombstone_entry(
    conn: &rusqlite::Connection, key: &str, language: &str, version: i64, at: &str,
) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT INTO entries (key, language, value, version, updated_at, deleted, variants_json)
         VALUES (?1, ?2, '', ?3, ?4, 1, NULL)
         ON CONFLICT(key, language) DO UPDATE SET
            deleted = 1,
            version = excluded.version,
            updated_at = excluded.updated_at
         WHERE entries.deleted = 0 AND excluded.version >= entries.version",
        params![key, language, version, at],
    )
}

impl StoreDb {
    /// Read one entry, tombstones included.
    ///
    /// Returns None if the key was never stored for this language.
    pub async fn read(&self, key: &str, language: &str) -> Result<Option<Entry>, Error> {
        let key = key.to_string();
        let language = language.to_string();
        self.conn
            .call(move |conn| -> Result<Option<Entry>, Error> {
                let entry = conn
                    .query_row(
                        &format!("SELECT {ENTRY_COLUMNS} FROM entries WHERE key = ?1 AND language = ?2"),
                        params![key, language],
                        entry_from_row,
                    )
                    .optional()?;
                Ok(entry)
            })
            .await
            .map_err(Error::from)
    }

    /// Read one entry, treating tombstones as absent.
    pub async fn read_live(&self, key: &str, language: &str) -> Result<Option<Entry>, Error> {
        Ok(self.read(key, language).await?.filter(|entry| !entry.deleted))
    }

    /// All non-deleted entries of a language, ordered by key.
    pub async fn list_live(&self, language: &str) -> Result<Vec<Entry>, Error> {
        let language = language.to_string();
        self.conn
            .call(move |conn| -> Result<Vec<Entry>, Error> {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {ENTRY_COLUMNS} FROM entries WHERE language = ?1 AND deleted = 0 ORDER BY key"
                ))?;
                let rows = stmt.query_map(params![language], entry_from_row)?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await
            .map_err(Error::from)
    }

    /// Write a batch of entries atomically.
    ///
    /// Either every row is written (subject to version precedence) or, on any
    /// failure, none is. Returns the number of rows actually changed.
    pub async fn write_batch(&self, entries: &[Entry]) -> Result<usize, Error> {
        let entries = entries.to_vec();
        self.conn
            .call(move |conn| -> Result<usize, Error> {
                let tx = conn.transaction().map_err(Error::transaction)?;
                let mut changed = 0;
                for entry in &entries {
                    changed += upsert_entry(&tx, entry).map_err(Error::transaction)?;
                }
                tx.commit().map_err(Error::transaction)?;
                Ok(changed)
            })
            .await
            .map_err(Error::from)
    }

    /// Tombstone `keys` in `language` at `version`, atomically.
    ///
    /// Returns the number of keys that became tombstones.
    pub async fn mark_deleted(&self, keys: &[String], language: &str, version: i64) -> Result<usize, Error> {
        let keys = keys.to_vec();
        let language = language.to_string();
        let at = to_timestamp(&chrono::Utc::now());
        self.conn
            .call(move |conn| -> Result<usize, Error> {
                let tx = conn.transaction().map_err(Error::transaction)?;
                let mut removed = 0;
                for key in &keys {
                    removed += tombstone_entry(&tx, key, &language, version, &at).map_err(Error::transaction)?;
                }
                tx.commit().map_err(Error::transaction)?;
                Ok(removed)
            })
            .await
            .map_err(Error::from)
    }

    /// Physically remove tombstones, for one language or all of them.
    ///
    /// Returns the number of deleted rows.
    pub async fn compact(&self, language: Option<&str>) -> Result<u64, Error> {
        let language = language.map(str::to_string);
        self.conn
            .call(move |conn| -> Result<u64, Error> {
                let count = match language {
                    Some(language) => {
                        conn.execute("DELETE FROM entries WHERE deleted = 1 AND language = ?1", params![language])?
                    }
                    None => conn.execute("DELETE FROM entries WHERE deleted = 1", [])?,
                };
                Ok(count as u64)
            })
            .await
            .map_err(Error::from)
    }

    /// Drop every entry and the cursor of one language.
    ///
    /// Returns the number of deleted entries.
    pub async fn clear_language(&self, language: &str) -> Result<u64, Error> {
        let language = language.to_string();
        self.conn
            .call(move |conn| -> Result<u64, Error> {
                let tx = conn.transaction().map_err(Error::transaction)?;
                let count = tx
                    .execute("DELETE FROM entries WHERE language = ?1", params![language])
                    .map_err(Error::transaction)?;
                tx.execute("DELETE FROM sync_cursors WHERE language = ?1", params![language])
                    .map_err(Error::transaction)?;
                tx.commit().map_err(Error::transaction)?;
                Ok(count as u64)
            })
            .await
            .map_err(Error::from)
    }

    /// Drop every entry and cursor. Assignments, identity and the catalog stay.
    pub async fn clear_all(&self) -> Result<u64, Error> {
        self.conn
            .call(|conn| -> Result<u64, Error> {
                let tx = conn.transaction().map_err(Error::transaction)?;
                let count = tx.execute("DELETE FROM entries", []).map_err(Error::transaction)?;
                tx.execute("DELETE FROM sync_cursors", []).map_err(Error::transaction)?;
                tx.commit().map_err(Error::transaction)?;
                Ok(count as u64)
            })
            .await
            .map_err(Error::from)
    }

    /// Live and tombstone row counts across all languages.
    pub async fn counts(&self) -> Result<StoreCounts, Error> {
        self.conn
            .call(|conn| -> Result<StoreCounts, Error> {
                let (live, tombstones): (i64, i64) = conn.query_row(
                    "SELECT
                        COALESCE(SUM(CASE WHEN deleted = 0 THEN 1 ELSE 0 END), 0),
                        COALESCE(SUM(CASE WHEN deleted = 1 THEN 1 ELSE 0 END), 0)
                     FROM entries",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?;
                Ok(StoreCounts { live: live as u64, tombstones: tombstones as u64 })
            })
            .await
            .map_err(Error::from)
    }
}
