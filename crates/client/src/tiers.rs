//! Memory → Local Store read path and watcher refresh.
//!
//! A key's resolved value is the variant value for the device's stored
//! assignment on that key when there is one, else the entry's base value.
//! With several assignments on one key the most recently assigned wins,
//! ties broken by the greater experiment id.
//!
//! Store reads are written back to memory only if no removal of that language
//! happened in between, so a delete or clear racing a lookup can't be undone.

use std::collections::HashMap;
use std::sync::Arc;

use stringboot_core::{ChangeReason, Error, MemoryCache, StoreDb, WatchEvent, WatchHub};

/// The cache tiers shared by the sync engine, the resolver and the facade.
#[derive(Debug, Clone)]
pub struct Tiers {
    pub store: StoreDb,
    pub memory: Arc<MemoryCache>,
    pub hub: Arc<WatchHub>,
}

impl Tiers {
    pub fn new(store: StoreDb, memory: Arc<MemoryCache>, hub: Arc<WatchHub>) -> Self {
        Self { store, memory, hub }
    }

    /// Resolve `(key, language)` from memory, falling back to the store.
    ///
    /// A store hit is written back to memory. Returns None when neither tier
    /// has a live value; never touches the network.
    pub async fn lookup(&self, key: &str, language: &str) -> Result<Option<String>, Error> {
        if let Some(value) = self.memory.get(key, language) {
            return Ok(Some(value));
        }

        let seen = self.memory.generation(language);
        match self.load(key, language).await? {
            Some((value, version)) => {
                self.memory.put_if_current(key, language, value.clone(), version, seen);
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Resolve `(key, language)` from the store only.
    pub async fn load(&self, key: &str, language: &str) -> Result<Option<(String, i64)>, Error> {
        let Some(entry) = self.store.read_live(key, language).await? else {
            return Ok(None);
        };

        let variant = if entry.variants.is_empty() {
            None
        } else {
            self.store.assignment_for_key(key).await?.map(|a| a.variant_id)
        };

        Ok(Some((entry.resolve(variant.as_deref()).to_string(), entry.version)))
    }

    /// Assigned variant id per string key, resolved the same way as [`Tiers::load`].
    pub async fn variant_ids(&self) -> Result<HashMap<String, String>, Error> {
        let mut assignments = self.store.list_assignments().await?;
        assignments.sort_by(|a, b| (a.assigned_at, &a.experiment_id).cmp(&(b.assigned_at, &b.experiment_id)));
        Ok(assignments.into_iter().map(|a| (a.string_key, a.variant_id)).collect())
    }

    /// Preload memory with live entries of `language`, up to the memory capacity.
    pub async fn warm(&self, language: &str) -> Result<usize, Error> {
        let seen = self.memory.generation(language);
        let entries = self.store.list_live(language).await?;
        if entries.is_empty() {
            return Ok(0);
        }

        let variants = if entries.iter().any(|e| !e.variants.is_empty()) { self.variant_ids().await? } else { HashMap::new() };

        let mut loaded = 0;
        for entry in entries.iter().take(self.memory.capacity()) {
            let value = entry.resolve(variants.get(&entry.key).map(String::as_str));
            if !self.memory.put_if_current(&entry.key, language, value, entry.version, seen) {
                tracing::debug!(language, "memory warm-up interrupted by a removal");
                break;
            }
            loaded += 1;
        }
        tracing::debug!(language, loaded, "memory tier warmed");
        Ok(loaded)
    }

    /// Drop the cached value, re-read it from the store and notify watchers.
    pub async fn refresh(&self, key: &str, language: &str, reason: ChangeReason) -> Result<(), Error> {
        self.memory.remove(key, language);
        let seen = self.memory.generation(language);
        let value = match self.load(key, language).await? {
            Some((value, version)) => {
                self.memory.put_if_current(key, language, value.clone(), version, seen);
                Some(value)
            }
            None => None,
        };

        self.hub.notify(&WatchEvent { key: key.to_string(), language: language.to_string(), value, reason });
        Ok(())
    }

    /// Refresh every watched key of `language`.
    pub async fn refresh_language(&self, language: &str, reason: ChangeReason) -> Result<usize, Error> {
        let keys = self.hub.watched_keys(language);
        for key in &keys {
            self.refresh(key, language, reason).await?;
        }
        Ok(keys.len())
    }

    /// Refresh `key` in every language it is watched in, dropping it from memory everywhere.
    pub async fn refresh_key(&self, key: &str, reason: ChangeReason) -> Result<(), Error> {
        self.memory.remove_key(key);
        for language in self.hub.watched_languages(key) {
            self.refresh(key, &language, reason).await?;
        }
        Ok(())
    }
}
