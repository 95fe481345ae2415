//! Language catalog advertised by the remote.

use super::connection::StoreDb;
use crate::Error;
use crate::model::Language;
use tokio_rusqlite::params;
use tokio_rusqlite::rusqlite;

/// Replace the whole catalog.
pub(crate) fn replace_languages_in(conn: &rusqlite::Connection, languages: &[Language], at: &str) -> rusqlite::Result<()> {
    conn.execute("DELETE FROM languages", [])?;
    for language in languages {
        conn.execute(
            "INSERT OR REPLACE INTO languages (code, name, updated_at) VALUES (?1, ?2, ?3)",
            params![&language.code, &language.name, at],
        )?;
    }
    Ok(())
}

impl StoreDb {
    /// Languages the remote last advertised, ordered by code.
    pub async fn available_languages(&self) -> Result<Vec<Language>, Error> {
        self.conn
            .call(|conn| -> Result<Vec<Language>, Error> {
                let mut stmt = conn.prepare("SELECT code, name FROM languages ORDER BY code")?;
                let rows = stmt.query_map([], |row| Ok(Language { code: row.get(0)?, name: row.get(1)? }))?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await
            .map_err(Error::from)
    }
}
