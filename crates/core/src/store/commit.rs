//! Atomic application of a remote delta.
//!
//! A delta is applied in one transaction together with its cursor advance. A
//! failure anywhere rolls back every row, so the cursor never claims a version
//! that was only partially applied.

use chrono::{DateTime, Utc};

use super::assignments::insert_assignment_in;
use super::connection::StoreDb;
use super::cursors::{read_cursor_in, write_cursor_in};
use super::entries::{tombstone_entry, upsert_entry};
use super::languages::replace_languages_in;
use super::to_timestamp;
use crate::Error;
use crate::model::{DeltaResponse, Entry, ExperimentAssignment, SyncCursor};
use tokio_rusqlite::params;

/// A fetched delta ready to be committed.
#[derive(Debug, Clone)]
pub struct CommitRequest {
    pub language: String,
    /// Cursor version the fetch was based on; `None` if the language had no cursor.
    pub base_version: Option<i64>,
    /// Discard the language's entries and cursor inside the same transaction.
    pub force: bool,
    pub delta: DeltaResponse,
}

/// Result of a commit attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum CommitOutcome {
    Committed {
        cursor: SyncCursor,
        /// Upserts that won version precedence and were written.
        applied: Vec<Entry>,
        /// Keys that became tombstones.
        removed: Vec<String>,
        /// Assignments newly stored by this commit.
        assignments: Vec<ExperimentAssignment>,
    },
    /// Another commit moved the cursor since the fetch started; nothing was written.
    Superseded { current: Option<SyncCursor> },
}

impl StoreDb {
    /// Apply a delta and advance the cursor in a single transaction.
    ///
    /// A non-force commit is a compare-and-swap on the cursor version: if the
    /// stored cursor no longer equals `base_version`, the delta is discarded
    /// and `CommitOutcome::Superseded` is returned.
    ///
    /// # Errors
    ///
    /// Returns `Error::TransactionFailure` if any statement fails; nothing is
    /// persisted in that case.
    pub async fn commit_sync(&self, request: CommitRequest) -> Result<CommitOutcome, Error> {
        let now = Utc::now();
        self.conn
            .call(move |conn| -> Result<CommitOutcome, Error> {
                let tx = conn.transaction().map_err(Error::transaction)?;
                let language = request.language.as_str();

                let current = read_cursor_in(&tx, language).map_err(Error::transaction)?;
                if !request.force && current.map(|c| c.last_synced_version) != request.base_version {
                    return Ok(CommitOutcome::Superseded { current });
                }

                if request.force {
                    tx.execute("DELETE FROM entries WHERE language = ?1", params![language])
                        .map_err(Error::transaction)?;
                    tx.execute("DELETE FROM sync_cursors WHERE language = ?1", params![language])
                        .map_err(Error::transaction)?;
                }

                let at = to_timestamp(&now);
                let delta = request.delta;

                let mut removed = Vec::new();
                for key in &delta.deletions {
                    if tombstone_entry(&tx, key, language, delta.new_version, &at).map_err(Error::transaction)? > 0 {
                        removed.push(key.clone());
                    }
                }

                let mut applied = Vec::new();
                for upsert in delta.upserts {
                    let entry = upsert.into_entry(language, now);
                    if upsert_entry(&tx, &entry).map_err(Error::transaction)? > 0 {
                        applied.push(entry);
                    }
                }

                let mut assignments = Vec::new();
                for assignment in delta.experiment_assignments.unwrap_or_default() {
                    if insert_assignment_in(&tx, &assignment).map_err(Error::transaction)? {
                        assignments.push(assignment);
                    }
                }

                if let Some(languages) = &delta.languages {
                    replace_languages_in(&tx, languages, &at).map_err(Error::transaction)?;
                }

                let cursor = SyncCursor { last_synced_version: delta.new_version, last_synced_at: now };
                write_cursor_in(&tx, language, &cursor).map_err(Error::transaction)?;

                tx.commit().map_err(Error::transaction)?;

                Ok(CommitOutcome::Committed { cursor, applied, removed, assignments })
            })
            .await
            .map_err(Error::from)
    }

    /// Whether the cursor of `language` is missing or older than `max_age`.
    pub async fn is_stale(&self, language: &str, max_age: chrono::Duration) -> Result<bool, Error> {
        let cursor = self.read_cursor(language).await?;
        Ok(cursor_is_stale(cursor.as_ref(), Utc::now(), max_age))
    }
}

pub(crate) fn cursor_is_stale(cursor: Option<&SyncCursor>, now: DateTime<Utc>, max_age: chrono::Duration) -> bool {
    match cursor {
        Some(cursor) => now - cursor.last_synced_at > max_age,
        None => true,
    }
}
