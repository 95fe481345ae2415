//! Durable slot for the device identity.
//!
//! The identity is written once per install. Hosts with their own platform
//! storage can implement [`IdentityStore`]; the SQLite store implements it with
//! a single-row table.

use std::sync::Mutex;

use async_trait::async_trait;

use crate::Error;
use crate::model::DeviceIdentity;

/// A durable key-value slot holding the device identity.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Read the persisted identity, if any.
    async fn load(&self) -> Result<Option<DeviceIdentity>, Error>;

    /// Persist the identity, replacing any previous value.
    async fn save(&self, identity: &DeviceIdentity) -> Result<(), Error>;
}

/// Identity slot kept in process memory, for hosts without durable storage.
#[derive(Debug, Default)]
pub struct MemoryIdentityStore {
    slot: Mutex<Option<DeviceIdentity>>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdentityStore for MemoryIdentityStore {
    async fn load(&self) -> Result<Option<DeviceIdentity>, Error> {
        Ok(self.slot.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    async fn save(&self, identity: &DeviceIdentity) -> Result<(), Error> {
        *self.slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(identity.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_slot() {
        let slot = MemoryIdentityStore::new();
        assert!(slot.load().await.unwrap().is_none());

        let identity = DeviceIdentity::provided("abc123");
        slot.save(&identity).await.unwrap();
        assert_eq!(slot.load().await.unwrap(), Some(identity));
    }
}
