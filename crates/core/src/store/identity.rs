//! Device identity slot and first-use detection.

use async_trait::async_trait;

use super::connection::StoreDb;
use super::{parse_timestamp, to_timestamp};
use crate::Error;
use crate::identity::IdentityStore;
use crate::model::{DeviceIdentity, IdentitySource};
use tokio_rusqlite::params;
use tokio_rusqlite::rusqlite::{self, OptionalExtension};

#[async_trait]
impl IdentityStore for StoreDb {
    async fn load(&self) -> Result<Option<DeviceIdentity>, Error> {
        self.conn
            .call(|conn| -> Result<Option<DeviceIdentity>, Error> {
                let identity = conn
                    .query_row("SELECT id, source, created_at FROM device_identity WHERE slot = 1", [], |row| {
                        let source: String = row.get(1)?;
                        let created_at: String = row.get(2)?;
                        let source = IdentitySource::parse(&source).ok_or_else(|| {
                            rusqlite::Error::FromSqlConversionFailure(
                                1,
                                rusqlite::types::Type::Text,
                                format!("unknown identity source: {source}").into(),
                            )
                        })?;
                        Ok(DeviceIdentity { id: row.get(0)?, source, created_at: parse_timestamp(2, &created_at)? })
                    })
                    .optional()?;
                Ok(identity)
            })
            .await
            .map_err(Error::from)
    }

    async fn save(&self, identity: &DeviceIdentity) -> Result<(), Error> {
        let identity = identity.clone();
        self.conn
            .call(move |conn| -> Result<(), Error> {
                conn.execute(
                    "INSERT INTO device_identity (slot, id, source, created_at) VALUES (1, ?1, ?2, ?3)
                     ON CONFLICT(slot) DO UPDATE SET
                        id = excluded.id,
                        source = excluded.source,
                        created_at = excluded.created_at",
                    params![identity.id, identity.source.as_str(), to_timestamp(&identity.created_at)],
                )?;
                Ok(())
            })
            .await
            .map_err(Error::from)
    }
}

impl StoreDb {
    /// Whether the device identity has been used: any language synced or any
    /// experiment assignment stored.
    pub async fn identity_in_use(&self) -> Result<bool, Error> {
        self.conn
            .call(|conn| -> Result<bool, Error> {
                let used: bool = conn.query_row(
                    "SELECT EXISTS(SELECT 1 FROM sync_cursors) OR EXISTS(SELECT 1 FROM experiment_assignments)",
                    [],
                    |row| row.get(0),
                )?;
                Ok(used)
            })
            .await
            .map_err(Error::from)
    }
}
