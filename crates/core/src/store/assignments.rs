//! Persisted experiment assignments.
//!
//! Assignments are insert-if-absent: once a device holds a variant for an
//! experiment, later writes for the same experiment are ignored until the
//! assignment is retired.

use super::connection::StoreDb;
use super::{parse_timestamp, to_timestamp};
use crate::Error;
use crate::model::ExperimentAssignment;
use tokio_rusqlite::params;
use tokio_rusqlite::rusqlite::{self, OptionalExtension, Row};

const ASSIGNMENT_COLUMNS: &str = "experiment_id, string_key, variant_id, variant_name, assigned_at";

fn assignment_from_row(row: &Row<'_>) -> rusqlite::Result<ExperimentAssignment> {
    let assigned_at: String = row.get(4)?;
    Ok(ExperimentAssignment {
        experiment_id: row.get(0)?,
        string_key: row.get(1)?,
        variant_id: row.get(2)?,
        variant_name: row.get(3)?,
        assigned_at: parse_timestamp(4, &assigned_at)?,
    })
}

/// Insert an assignment unless one exists for the experiment.
///
/// Returns true if the row was inserted.
pub(crate) fn insert_assignment_in(
    conn: &rusqlite::Connection, assignment: &ExperimentAssignment,
) -> rusqlite::Result<bool> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO experiment_assignments
            (experiment_id, string_key, variant_id, variant_name, assigned_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            &assignment.experiment_id,
            &assignment.string_key,
            &assignment.variant_id,
            &assignment.variant_name,
            to_timestamp(&assignment.assigned_at),
        ],
    )?;
    Ok(inserted == 1)
}

fn get_assignment_in(conn: &rusqlite::Connection, experiment_id: &str) -> rusqlite::Result<Option<ExperimentAssignment>> {
    conn.query_row(
        &format!("SELECT {ASSIGNMENT_COLUMNS} FROM experiment_assignments WHERE experiment_id = ?1"),
        params![experiment_id],
        assignment_from_row,
    )
    .optional()
}

impl StoreDb {
    /// Get the stored assignment for an experiment.
    pub async fn get_assignment(&self, experiment_id: &str) -> Result<Option<ExperimentAssignment>, Error> {
        let experiment_id = experiment_id.to_string();
        self.conn
            .call(move |conn| -> Result<Option<ExperimentAssignment>, Error> {
                Ok(get_assignment_in(conn, &experiment_id)?)
            })
            .await
            .map_err(Error::from)
    }

    /// Get the most recent assignment targeting a string key.
    pub async fn assignment_for_key(&self, string_key: &str) -> Result<Option<ExperimentAssignment>, Error> {
        let string_key = string_key.to_string();
        self.conn
            .call(move |conn| -> Result<Option<ExperimentAssignment>, Error> {
                let assignment = conn
                    .query_row(
                        &format!(
                            "SELECT {ASSIGNMENT_COLUMNS} FROM experiment_assignments
                             WHERE string_key = ?1 ORDER BY assigned_at DESC, experiment_id DESC LIMIT 1"
                        ),
                        params![string_key],
                        assignment_from_row,
                    )
                    .optional()?;
                Ok(assignment)
            })
            .await
            .map_err(Error::from)
    }

    /// All stored assignments, ordered by experiment id.
    pub async fn list_assignments(&self) -> Result<Vec<ExperimentAssignment>, Error> {
        self.conn
            .call(|conn| -> Result<Vec<ExperimentAssignment>, Error> {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {ASSIGNMENT_COLUMNS} FROM experiment_assignments ORDER BY experiment_id"
                ))?;
                let rows = stmt.query_map([], assignment_from_row)?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await
            .map_err(Error::from)
    }

    /// Store an assignment unless the experiment already has one.
    ///
    /// Returns the assignment that is in effect afterwards and whether it is
    /// the one just written.
    pub async fn insert_assignment(&self, assignment: &ExperimentAssignment) -> Result<(ExperimentAssignment, bool), Error> {
        let assignment = assignment.clone();
        self.conn
            .call(move |conn| -> Result<(ExperimentAssignment, bool), Error> {
                let tx = conn.transaction().map_err(Error::transaction)?;
                let inserted = insert_assignment_in(&tx, &assignment).map_err(Error::transaction)?;
                let effective = get_assignment_in(&tx, &assignment.experiment_id)
                    .map_err(Error::transaction)?
                    .unwrap_or(assignment);
                tx.commit().map_err(Error::transaction)?;
                Ok((effective, inserted))
            })
            .await
            .map_err(Error::from)
    }

    /// Drop the assignment of an experiment that is no longer active.
    ///
    /// Returns the removed assignment, if there was one.
    pub async fn delete_assignment(&self, experiment_id: &str) -> Result<Option<ExperimentAssignment>, Error> {
        let experiment_id = experiment_id.to_string();
        self.conn
            .call(move |conn| -> Result<Option<ExperimentAssignment>, Error> {
                let tx = conn.transaction().map_err(Error::transaction)?;
                let existing = get_assignment_in(&tx, &experiment_id).map_err(Error::transaction)?;
                tx.execute("DELETE FROM experiment_assignments WHERE experiment_id = ?1", params![experiment_id])
                    .map_err(Error::transaction)?;
                tx.commit().map_err(Error::transaction)?;
                Ok(existing)
            })
            .await
            .map_err(Error::from)
    }
}
