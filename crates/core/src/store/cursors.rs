//! Per-language sync cursors.

use super::connection::StoreDb;
use super::{parse_timestamp, to_timestamp};
use crate::Error;
use crate::model::SyncCursor;
use tokio_rusqlite::params;
use tokio_rusqlite::rusqlite::{self, OptionalExtension};

pub(crate) fn read_cursor_in(conn: &rusqlite::Connection, language: &str) -> rusqlite::Result<Option<SyncCursor>> {
    conn.query_row(
        "SELECT last_synced_version, last_synced_at FROM sync_cursors WHERE language = ?1",
        params![language],
        |row| {
            let at: String = row.get(1)?;
            Ok(SyncCursor { last_synced_version: row.get(0)?, last_synced_at: parse_timestamp(1, &at)? })
        },
    )
    .optional()
}

pub(crate) fn write_cursor_in(conn: &rusqlite::Connection, language: &str, cursor: &SyncCursor) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO sync_cursors (language, last_synced_version, last_synced_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(language) DO UPDATE SET
            last_synced_version = excluded.last_synced_version,
            last_synced_at = excluded.last_synced_at",
        params![language, cursor.last_synced_version, to_timestamp(&cursor.last_synced_at)],
    )?;
    Ok(())
}

impl StoreDb {
    /// Read the cursor of a language.
    ///
    /// Returns None if the language was never synced (or was cleared).
    pub async fn read_cursor(&self, language: &str) -> Result<Option<SyncCursor>, Error> {
        let language = language.to_string();
        self.conn
            .call(move |conn| -> Result<Option<SyncCursor>, Error> { Ok(read_cursor_in(conn, &language)?) })
            .await
            .map_err(Error::from)
    }

    /// Overwrite the cursor of a language.
    pub async fn write_cursor(&self, language: &str, cursor: SyncCursor) -> Result<(), Error> {
        let language = language.to_string();
        self.conn
            .call(move |conn| -> Result<(), Error> { Ok(write_cursor_in(conn, &language, &cursor)?) })
            .await
            .map_err(Error::from)
    }

    /// Every synced language with its cursor, ordered by language code.
    pub async fn list_cursors(&self) -> Result<Vec<(String, SyncCursor)>, Error> {
        self.conn
            .call(|conn| -> Result<Vec<(String, SyncCursor)>, Error> {
                let mut stmt = conn.prepare(
                    "SELECT language, last_synced_version, last_synced_at FROM sync_cursors ORDER BY language",
                )?;
                let rows = stmt.query_map([], |row| {
                    let at: String = row.get(2)?;
                    Ok((
                        row.get::<_, String>(0)?,
                        SyncCursor { last_synced_version: row.get(1)?, last_synced_at: parse_timestamp(2, &at)? },
                    ))
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await
            .map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[tokio::test]
    async fn test_cursor_absent_until_written() {
        let db = StoreDb::open_in_memory().await.unwrap();
        assert!(db.read_cursor("en").await.unwrap().is_none());

        let cursor = SyncCursor { last_synced_version: 6, last_synced_at: Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap() };
        db.write_cursor("en", cursor).await.unwrap();

        assert_eq!(db.read_cursor("en").await.unwrap(), Some(cursor));
        assert!(db.read_cursor("fr").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_cursors_sorted() {
        let db = StoreDb::open_in_memory().await.unwrap();
        let now = Utc::now();
        db.write_cursor("fr", SyncCursor { last_synced_version: 2, last_synced_at: now }).await.unwrap();
        db.write_cursor("de", SyncCursor { last_synced_version: 9, last_synced_at: now }).await.unwrap();

        let languages: Vec<String> = db.list_cursors().await.unwrap().into_iter().map(|(l, _)| l).collect();
        assert_eq!(languages, vec!["de".to_string(), "fr".to_string()]);
    }
}
