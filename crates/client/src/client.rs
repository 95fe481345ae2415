//! Client facade tying the cache tiers, sync engine, resolver and broadcaster
//! together, plus the context-scoped state (current language, device identity).
//!
//! Every operation other than construction and [`StringClient::initialize`]
//! fails with `Error::NotInitialized` until initialization has completed.

use std::sync::{Arc, Mutex, RwLock, Weak};

use stringboot_core::{
    Broadcaster, CacheStats, ChangeReason, ClientConfig, ContextEvent, ContextEventKind, DeviceIdentity, Error,
    ExperimentAssignment, ExperimentConfig, IdentityStore, Language, MemoryCache, StoreDb, Subscription, WatchEvent,
    WatchHub,
};
use stringboot_core::language::normalize;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;

use crate::remote::DeltaSource;
use crate::resolver::AssignmentResolver;
use crate::sync::{SyncAnnouncer, SyncEngine, SyncOptions, SyncResult};
use crate::tiers::Tiers;

/// State that exists once the client is initialized.
struct Ready {
    tiers: Tiers,
    engine: SyncEngine,
    resolver: AssignmentResolver,
    identity_store: Arc<dyn IdentityStore>,
    identity: RwLock<DeviceIdentity>,
    language: RwLock<String>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Ready {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.get_mut().unwrap_or_else(|e| e.into_inner()).take() {
            listener.abort();
        }
    }
}

impl Ready {
    fn language(&self) -> String {
        self.language.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_language(&self, language: &str) -> bool {
        let mut current = self.language.write().unwrap_or_else(|e| e.into_inner());
        if *current == language {
            return false;
        }
        *current = language.to_string();
        true
    }

    fn identity(&self) -> DeviceIdentity {
        self.identity.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Apply an event published by a sibling context. Reads only the Local Store.
    async fn on_context_event(&self, own_origin: &str, event: ContextEvent) {
        if event.origin == own_origin {
            return;
        }
        tracing::debug!(origin = %event.origin, event = ?event.kind, "context event received");

        let result = match &event.kind {
            ContextEventKind::LanguageChanged { language } => {
                if self.set_language(language) {
                    self.tiers.refresh_language(language, ChangeReason::LanguageChanged).await.map(|_| ())
                } else {
                    Ok(())
                }
            }
            ContextEventKind::SyncCompleted { language, .. } => {
                self.tiers.memory.clear(Some(language));
                self.tiers.refresh_language(language, ChangeReason::Invalidated).await.map(|_| ())
            }
            ContextEventKind::CacheCleared { language } => self.invalidate(language.as_deref()).await,
            // Lost events may have covered any language.
            ContextEventKind::Lagged { .. } => self.invalidate(None).await,
        };

        if let Err(e) = result {
            tracing::warn!(origin = %event.origin, error = %e, "failed to apply context event");
        }
    }

    /// Drop memory for `language` (or everything) and re-notify watchers from the store.
    async fn invalidate(&self, language: Option<&str>) -> Result<(), Error> {
        self.tiers.memory.clear(language);
        let languages = match language {
            Some(language) => vec![language.to_string()],
            None => self.tiers.hub.languages(),
        };
        for language in languages {
            self.tiers.refresh_language(&language, ChangeReason::Invalidated).await?;
        }
        Ok(())
    }
}

/// A Stringboot client context.
///
/// Sibling contexts (several views of the same app) share one Local Store and
/// one [`Broadcaster`]; each has its own memory tier, watchers and current
/// language.
pub struct StringClient {
    config: ClientConfig,
    source: Arc<dyn DeltaSource>,
    broadcaster: Option<Broadcaster>,
    store: Option<StoreDb>,
    identity_store: Option<Arc<dyn IdentityStore>>,
    context_id: String,
    ready: OnceCell<Arc<Ready>>,
}

impl std::fmt::Debug for StringClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StringClient")
            .field("context_id", &self.context_id)
            .field("initialized", &self.ready.initialized())
            .finish_non_exhaustive()
    }
}

impl StringClient {
    /// Create an uninitialized client.
    ///
    /// Pass the shared broadcaster when the client is one of several sibling
    /// contexts.
    pub fn new(config: ClientConfig, source: Arc<dyn DeltaSource>, broadcaster: Option<Broadcaster>) -> Self {
        Self {
            config,
            source,
            broadcaster,
            store: None,
            identity_store: None,
            context_id: uuid::Uuid::new_v4().to_string(),
            ready: OnceCell::new(),
        }
    }

    /// Use an already opened store instead of opening `config.db_path`.
    pub fn with_store(mut self, store: StoreDb) -> Self {
        self.store = Some(store);
        self
    }

    /// Keep the device identity in host-provided storage instead of the Local Store.
    pub fn with_identity_store(mut self, identity_store: Arc<dyn IdentityStore>) -> Self {
        self.identity_store = Some(identity_store);
        self
    }

    /// Id stamped on events this context publishes.
    pub fn context_id(&self) -> &str {
        &self.context_id
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn is_initialized(&self) -> bool {
        self.ready.initialized()
    }

    /// Open the store, establish the device identity and start listening to
    /// sibling contexts. Calling it again is a no-op.
    ///
    /// # Errors
    ///
    /// - `Error::Config` if the configuration does not validate
    /// - store errors if the database cannot be opened or migrated
    pub async fn initialize(&self) -> Result<(), Error> {
        self.ready.get_or_try_init(|| self.bootstrap()).await?;
        Ok(())
    }

    async fn bootstrap(&self) -> Result<Arc<Ready>, Error> {
        self.config.validate()?;
        let default_language = normalize(&self.config.default_language)?;

        let store = match &self.store {
            Some(store) => store.clone(),
            None => StoreDb::open(&self.config.db_path).await?,
        };
        let identity_store: Arc<dyn IdentityStore> = match &self.identity_store {
            Some(identity_store) => Arc::clone(identity_store),
            None => Arc::new(store.clone()),
        };
        let identity = self.establish_identity(identity_store.as_ref()).await?;

        let tiers =
            Tiers::new(store, Arc::new(MemoryCache::new(self.config.memory_capacity)), Arc::new(WatchHub::new()));
        let announcer = self
            .broadcaster
            .as_ref()
            .map(|b| SyncAnnouncer { broadcaster: b.clone(), origin: self.context_id.clone() });
        let engine = SyncEngine::new(tiers.clone(), Arc::clone(&self.source), identity.id.clone(), announcer);
        let resolver = AssignmentResolver::new(tiers.clone());

        if let Err(e) = tiers.warm(&default_language).await {
            tracing::warn!(language = %default_language, error = %e, "memory warm-up failed");
        }

        let ready = Arc::new(Ready {
            tiers,
            engine,
            resolver,
            identity_store,
            identity: RwLock::new(identity),
            language: RwLock::new(default_language),
            listener: Mutex::new(None),
        });

        if let Some(broadcaster) = &self.broadcaster {
            let weak: Weak<Ready> = Arc::downgrade(&ready);
            let origin = self.context_id.clone();
            let listener = broadcaster.on_receive(move |event| {
                let weak = weak.clone();
                let origin = origin.clone();
                async move {
                    if let Some(ready) = weak.upgrade() {
                        ready.on_context_event(&origin, event).await;
                    }
                }
            });
            *ready.listener.lock().unwrap_or_else(|e| e.into_inner()) = Some(listener);
        }

        tracing::info!(
            context = %self.context_id,
            language = %ready.language(),
            device_source = ready.identity().source.as_str(),
            "client initialized"
        );

        Ok(ready)
    }

    /// Persisted identity wins, then the configured id, then a generated one.
    async fn establish_identity(&self, slot: &dyn IdentityStore) -> Result<DeviceIdentity, Error> {
        if let Some(identity) = slot.load().await? {
            return Ok(identity);
        }

        let identity = match &self.config.device_id {
            Some(id) => DeviceIdentity::provided(id.trim()),
            None => DeviceIdentity::generate(),
        };
        slot.save(&identity).await?;
        tracing::debug!(source = identity.source.as_str(), "device identity created");
        Ok(identity)
    }

    fn ready(&self) -> Result<&Arc<Ready>, Error> {
        self.ready
            .get()
            .ok_or_else(|| Error::NotInitialized("call initialize() before using the client".into()))
    }

    /// Stop listening to sibling contexts. The client stays usable.
    pub fn shutdown(&self) {
        let Some(ready) = self.ready.get() else {
            return;
        };
        let listener = ready.listener.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(listener) = listener {
            listener.abort();
            tracing::debug!(context = %self.context_id, "context listener stopped");
        }
    }

    fn publish(&self, kind: ContextEventKind) {
        if let Some(broadcaster) = &self.broadcaster {
            broadcaster.publish(ContextEvent { origin: self.context_id.clone(), kind });
        }
    }

    /// Resolve `key` in the current language.
    pub async fn get(&self, key: &str) -> Result<Option<String>, Error> {
        let language = self.ready()?.language();
        self.get_in(key, &language).await
    }

    /// Resolve `key` in `language`.
    ///
    /// Memory first, then the Local Store. On a miss, a language that was
    /// never synced or is stale is synced once (when `sync_on_miss`), then
    /// the default language is tried (when `fallback_to_default`). A key that
    /// is absent everywhere resolves to `Ok(None)`.
    ///
    /// # Errors
    ///
    /// A failed sync-on-miss is returned only when no tier produced a value.
    pub async fn get_in(&self, key: &str, language: &str) -> Result<Option<String>, Error> {
        let ready = self.ready()?;
        if key.is_empty() {
            return Err(Error::InvalidInput("key must not be empty".into()));
        }
        let language = normalize(language)?;

        let mut sync_error = None;
        match self.resolve(ready, key, &language).await {
            Ok(Some(value)) => return Ok(Some(value)),
            Ok(None) => {}
            Err(e) if e.is_retryable() => sync_error = Some(e),
            Err(e) => return Err(e),
        }

        let default_language = normalize(&self.config.default_language)?;
        if self.config.fallback_to_default && language != default_language {
            match self.resolve(ready, key, &default_language).await {
                Ok(Some(value)) => {
                    tracing::debug!(key, language = %language, fallback = %default_language, "resolved via fallback");
                    return Ok(Some(value));
                }
                Ok(None) => {}
                Err(e) if e.is_retryable() => {
                    sync_error.get_or_insert(e);
                }
                Err(e) => return Err(e),
            }
        }

        match sync_error {
            Some(e) => Err(e),
            None => Ok(None),
        }
    }

    async fn resolve(&self, ready: &Ready, key: &str, language: &str) -> Result<Option<String>, Error> {
        if let Some(value) = ready.tiers.lookup(key, language).await? {
            return Ok(Some(value));
        }

        if !self.config.sync_on_miss || !ready.tiers.store.is_stale(language, self.config.stale_after()).await? {
            return Ok(None);
        }

        tracing::debug!(key, language, "miss on stale language, syncing");
        ready.engine.sync(language, SyncOptions::default()).await?;
        ready.tiers.lookup(key, language).await
    }

    pub fn current_language(&self) -> Result<String, Error> {
        Ok(self.ready()?.language())
    }

    /// Switch the active language.
    ///
    /// Watchers of the new language are re-notified before this returns, and
    /// sibling contexts are told to switch too. No sync is started; the next
    /// `get` syncs on demand.
    pub async fn change_language(&self, language: &str) -> Result<(), Error> {
        let ready = self.ready()?;
        let language = normalize(language)?;
        if !ready.set_language(&language) {
            return Ok(());
        }

        tracing::info!(context = %self.context_id, language = %language, "language changed");
        ready.tiers.refresh_language(&language, ChangeReason::LanguageChanged).await?;
        self.publish(ContextEventKind::LanguageChanged { language });
        Ok(())
    }

    /// The catalog the remote last advertised.
    pub async fn available_languages(&self) -> Result<Vec<Language>, Error> {
        self.ready()?.tiers.store.available_languages().await
    }

    /// Languages synced into the Local Store, ordered by code.
    pub async fn active_languages(&self) -> Result<Vec<String>, Error> {
        let cursors = self.ready()?.tiers.store.list_cursors().await?;
        Ok(cursors.into_iter().map(|(language, _)| language).collect())
    }

    pub async fn sync(&self, language: &str, options: SyncOptions) -> Result<SyncResult, Error> {
        let ready = self.ready()?;
        let language = normalize(language)?;
        ready.engine.sync(&language, options).await
    }

    /// Register a watcher for `(key, language)`.
    pub fn watch<F>(&self, key: &str, language: &str, callback: F) -> Result<Subscription, Error>
    where
        F: Fn(&WatchEvent) + Send + Sync + 'static,
    {
        let ready = self.ready()?;
        let language = normalize(language)?;
        Ok(ready.tiers.hub.subscribe(key, &language, callback))
    }

    pub async fn stats(&self) -> Result<CacheStats, Error> {
        let tiers = &self.ready()?.tiers;
        let counts = tiers.store.counts().await?;
        Ok(CacheStats {
            memory_entries: tiers.memory.len(),
            memory_capacity: tiers.memory.capacity(),
            store_entries: counts.live,
            tombstone_count: counts.tombstones,
            hit_rate: tiers.memory.hit_rate(),
            miss_rate: tiers.memory.miss_rate(),
        })
    }

    /// Drop cached entries and cursors for one language, or for all of them.
    ///
    /// The next sync of a cleared language fetches the full catalog.
    pub async fn clear_cache(&self, language: Option<&str>) -> Result<u64, Error> {
        let ready = self.ready()?;
        let language = language.map(normalize).transpose()?;

        let removed = match &language {
            Some(language) => ready.tiers.store.clear_language(language).await?,
            None => ready.tiers.store.clear_all().await?,
        };
        tracing::info!(language = ?language, removed, "cache cleared");

        ready.invalidate(language.as_deref()).await?;
        self.publish(ContextEventKind::CacheCleared { language });
        Ok(removed)
    }

    /// Physically remove tombstones.
    pub async fn compact(&self, language: Option<&str>) -> Result<u64, Error> {
        let ready = self.ready()?;
        let language = language.map(normalize).transpose()?;
        ready.tiers.store.compact(language.as_deref()).await
    }

    pub fn device_identity(&self) -> Result<DeviceIdentity, Error> {
        Ok(self.ready()?.identity())
    }

    /// Replace the device id, allowed only before it has been used.
    ///
    /// # Errors
    ///
    /// `Error::InvalidInput` if the id is blank, or if a language has already
    /// been synced or an experiment assigned under the current id.
    pub async fn override_device_id(&self, device_id: &str) -> Result<DeviceIdentity, Error> {
        let ready = self.ready()?;
        let device_id = device_id.trim();
        if device_id.is_empty() {
            return Err(Error::InvalidInput("device id must not be blank".into()));
        }
        if ready.tiers.store.identity_in_use().await? {
            return Err(Error::InvalidInput("device id is already in use and can no longer be overridden".into()));
        }

        let identity = DeviceIdentity::provided(device_id);
        ready.identity_store.save(&identity).await?;
        ready.engine.set_device_id(identity.id.clone());
        *ready.identity.write().unwrap_or_else(|e| e.into_inner()) = identity.clone();
        tracing::info!("device identity overridden");
        Ok(identity)
    }

    /// Sticky variant for this device in `config`.
    pub async fn assign(&self, config: &ExperimentConfig) -> Result<ExperimentAssignment, Error> {
        let ready = self.ready()?;
        ready.resolver.assign(&ready.identity().id, config).await
    }

    pub async fn assignments(&self) -> Result<Vec<ExperimentAssignment>, Error> {
        self.ready()?.resolver.assignments().await
    }

    pub async fn retire_experiment(&self, experiment_id: &str) -> Result<Option<ExperimentAssignment>, Error> {
        self.ready()?.resolver.retire(experiment_id).await
    }
}
