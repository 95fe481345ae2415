//! Delta sync engine.
//!
//! A sync reads the language's cursor, asks the remote for everything since
//! that version and commits the answer to the Local Store in one transaction.
//! Memory and watchers are only updated after the commit.
//!
//! ### Concurrency
//!
//! - At most one sync per language is in flight. A second request for the
//!   same language awaits the running one instead of fetching again.
//! - A `force` request only joins a running `force` sync. Otherwise it starts
//!   its own; the running normal sync then finds the cursor moved at commit
//!   time and its result is discarded (`superseded`).
//! - Languages never share state, so syncs of different languages run
//!   independently.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use stringboot_core::{
    Broadcaster, ChangeReason, CommitOutcome, CommitRequest, ContextEvent, ContextEventKind, DeltaRequest, Entry, Error,
    ExperimentAssignment, SyncCursor, WatchEvent,
};

use crate::remote::DeltaSource;
use crate::tiers::Tiers;

/// Options for a single sync call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncOptions {
    /// Discard the language's cursor and entries and fetch everything.
    pub force: bool,
}

impl SyncOptions {
    pub fn force() -> Self {
        Self { force: true }
    }
}

/// Outcome of a sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncResult {
    pub language: String,
    /// Upserts written to the store.
    pub applied: usize,
    /// Keys tombstoned.
    pub removed: usize,
    /// Cursor after the sync.
    pub cursor: Option<SyncCursor>,
    /// The fetched delta was discarded because a newer commit won.
    pub superseded: bool,
}

type SharedSync = Shared<BoxFuture<'static, Result<SyncResult, Error>>>;

struct InFlight {
    id: u64,
    force: bool,
    future: SharedSync,
}

/// Where to announce committed syncs.
#[derive(Debug, Clone)]
pub struct SyncAnnouncer {
    pub broadcaster: Broadcaster,
    pub origin: String,
}

struct EngineInner {
    tiers: Tiers,
    source: Arc<dyn DeltaSource>,
    device_id: RwLock<String>,
    announcer: Option<SyncAnnouncer>,
    in_flight: Mutex<HashMap<String, InFlight>>,
    next_id: AtomicU64,
}

/// Per-language delta sync with single-flight deduplication.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine").field("tiers", &self.inner.tiers).finish_non_exhaustive()
    }
}

impl SyncEngine {
    pub fn new(
        tiers: Tiers, source: Arc<dyn DeltaSource>, device_id: impl Into<String>, announcer: Option<SyncAnnouncer>,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                tiers,
                source,
                device_id: RwLock::new(device_id.into()),
                announcer,
                in_flight: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    pub fn device_id(&self) -> String {
        self.inner.device_id.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub(crate) fn set_device_id(&self, device_id: impl Into<String>) {
        *self.inner.device_id.write().unwrap_or_else(|e| e.into_inner()) = device_id.into();
    }

    /// Whether a sync for `language` is currently running.
    pub fn is_syncing(&self, language: &str) -> bool {
        self.in_flight().contains_key(language)
    }

    fn in_flight(&self) -> std::sync::MutexGuard<'_, HashMap<String, InFlight>> {
        self.inner.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Sync one language.
    ///
    /// # Errors
    ///
    /// - `Error::NetworkFailure` / `Error::InvalidResponse` if the fetch fails
    /// - `Error::TransactionFailure` if the commit is rolled back
    ///
    /// In every error case the cursor and entries are unchanged.
    pub async fn sync(&self, language: &str, options: SyncOptions) -> Result<SyncResult, Error> {
        let future = {
            let mut in_flight = self.in_flight();
            match in_flight.get(language) {
                Some(running) if !options.force || running.force => {
                    tracing::debug!(language, force = options.force, "joining in-flight sync");
                    running.future.clone()
                }
                _ => {
                    let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                    let future = self.clone().run(language.to_string(), options, id).boxed().shared();
                    in_flight.insert(language.to_string(), InFlight { id, force: options.force, future: future.clone() });
                    future
                }
            }
        };

        future.await
    }

    async fn run(self, language: String, options: SyncOptions, id: u64) -> Result<SyncResult, Error> {
        let result = self.sync_once(&language, options).await;

        let mut in_flight = self.in_flight();
        if in_flight.get(&language).is_some_and(|running| running.id == id) {
            in_flight.remove(&language);
        }

        result
    }

    async fn sync_once(&self, language: &str, options: SyncOptions) -> Result<SyncResult, Error> {
        let store = &self.inner.tiers.store;

        let base_version = if options.force {
            None
        } else {
            store.read_cursor(language).await?.map(|c| c.last_synced_version)
        };

        let request =
            DeltaRequest { language: language.to_string(), since_version: base_version, device_id: self.device_id() };

        tracing::debug!(language, since = ?base_version, force = options.force, "sync started");

        let delta = self.inner.source.fetch_delta(&request).await.inspect_err(|e| {
            tracing::warn!(language, error = %e, "delta fetch failed");
        })?;

        if let Some(since) = base_version.filter(|since| delta.new_version < *since) {
            return Err(Error::InvalidResponse(format!(
                "remote cursor went backwards for {language}: {} < {since}",
                delta.new_version
            )));
        }

        let outcome = store
            .commit_sync(CommitRequest { language: language.to_string(), base_version, force: options.force, delta })
            .await
            .inspect_err(|e| tracing::warn!(language, error = %e, "sync commit failed"))?;

        match outcome {
            CommitOutcome::Superseded { current } => {
                tracing::warn!(
                    language,
                    since = ?base_version,
                    current = ?current.map(|c| c.last_synced_version),
                    "sync result discarded, cursor moved by a newer commit"
                );
                Ok(SyncResult { language: language.to_string(), applied: 0, removed: 0, cursor: current, superseded: true })
            }
            CommitOutcome::Committed { cursor, applied, removed, assignments } => {
                tracing::info!(
                    language,
                    new_version = cursor.last_synced_version,
                    applied = applied.len(),
                    removed = removed.len(),
                    force = options.force,
                    "sync committed"
                );

                if let Err(e) = self.propagate(language, options.force, &applied, &removed, &assignments).await {
                    // The commit is durable; dropping the language from memory keeps reads correct.
                    tracing::warn!(language, error = %e, "post-commit refresh failed, clearing memory tier");
                    self.inner.tiers.memory.clear(Some(language));
                }

                if let Some(announcer) = &self.inner.announcer {
                    announcer.broadcaster.publish(ContextEvent {
                        origin: announcer.origin.clone(),
                        kind: ContextEventKind::SyncCompleted {
                            language: language.to_string(),
                            version: cursor.last_synced_version,
                        },
                    });
                }

                Ok(SyncResult {
                    language: language.to_string(),
                    applied: applied.len(),
                    removed: removed.len(),
                    cursor: Some(cursor),
                    superseded: false,
                })
            }
        }
    }

    /// Push committed changes into memory and out to watchers.
    async fn propagate(
        &self, language: &str, force: bool, applied: &[Entry], removed: &[String], assignments: &[ExperimentAssignment],
    ) -> Result<(), Error> {
        let tiers = &self.inner.tiers;

        if force {
            tiers.memory.clear(Some(language));
        }

        let needs_variants = applied.iter().any(|e| !e.variants.is_empty());
        let variants = if needs_variants { tiers.variant_ids().await? } else { HashMap::new() };

        let mut touched = HashSet::new();
        for entry in applied {
            let value = entry.resolve(variants.get(&entry.key).map(String::as_str)).to_string();
            tiers.memory.remove(&entry.key, language);
            tiers.memory.put(&entry.key, language, value.clone(), entry.version);
            tiers.hub.notify(&WatchEvent {
                key: entry.key.clone(),
                language: language.to_string(),
                value: Some(value),
                reason: ChangeReason::Synced,
            });
            touched.insert(entry.key.as_str());
        }

        for key in removed {
            tiers.memory.remove(key, language);
            tiers.hub.notify(&WatchEvent {
                key: key.clone(),
                language: language.to_string(),
                value: None,
                reason: ChangeReason::Deleted,
            });
            touched.insert(key.as_str());
        }

        for assignment in assignments {
            tiers.refresh_key(&assignment.string_key, ChangeReason::AssignmentChanged).await?;
        }

        if force {
            // Keys that vanished in the full resync still need their watchers told.
            for key in tiers.hub.watched_keys(language) {
                if !touched.contains(key.as_str()) {
                    tiers.refresh(&key, language, ChangeReason::Invalidated).await?;
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedSource;
    use std::collections::BTreeMap;
    use stringboot_core::{DeltaResponse, MemoryCache, RemoteEntry, StoreDb, WatchHub};

    async fn engine_with(source: Arc<ScriptedSource>) -> SyncEngine {
        let store = StoreDb::open_in_memory().await.unwrap();
        let tiers = Tiers::new(store, Arc::new(MemoryCache::new(32)), Arc::new(WatchHub::new()));
        SyncEngine::new(tiers, source, "abc123", None)
    }

    fn upsert(key: &str, value: &str, version: i64) -> RemoteEntry {
        RemoteEntry { key: key.into(), value: value.into(), version, updated_at: None, variants: BTreeMap::new() }
    }

    fn delta(upserts: Vec<RemoteEntry>, deletions: &[&str], new_version: i64) -> DeltaResponse {
        DeltaResponse {
            upserts,
            deletions: deletions.iter().map(|d| d.to_string()).collect(),
            new_version,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_delta_from_version_five() {
        let source = Arc::new(ScriptedSource::new());
        source.respond(delta(vec![upsert("seed", "s", 5)], &[], 5));
        source.respond(delta(vec![upsert("k1", "v1", 6)], &[], 6));
        let engine = engine_with(Arc::clone(&source)).await;

        engine.sync("en", SyncOptions::default()).await.unwrap();
        let result = engine.sync("en", SyncOptions::default()).await.unwrap();

        assert_eq!(result.applied, 1);
        assert_eq!(result.cursor.map(|c| c.last_synced_version), Some(6));
        assert_eq!(source.requests()[1].since_version, Some(5));
        assert_eq!(source.requests()[1].device_id, "abc123");

        let tiers = &engine.inner.tiers;
        assert_eq!(tiers.lookup("k1", "en").await.unwrap().as_deref(), Some("v1"));
        assert_eq!(tiers.store.read_cursor("en").await.unwrap().unwrap().last_synced_version, 6);
    }

    #[tokio::test]
    async fn test_network_failure_leaves_state_untouched() {
        let source = Arc::new(ScriptedSource::new());
        source.respond(delta(vec![upsert("k1", "v1", 1)], &[], 1));
        source.fail(Error::NetworkFailure("offline".into()));
        let engine = engine_with(Arc::clone(&source)).await;

        engine.sync("en", SyncOptions::default()).await.unwrap();
        let err = engine.sync("en", SyncOptions::default()).await.unwrap_err();

        assert!(matches!(err, Error::NetworkFailure(_)));
        assert!(err.is_retryable());
        let store = &engine.inner.tiers.store;
        assert_eq!(store.read_cursor("en").await.unwrap().unwrap().last_synced_version, 1);
        assert_eq!(store.read("k1", "en").await.unwrap().unwrap().value, "v1");
    }

    #[tokio::test]
    async fn test_transaction_failure_leaves_state_untouched() {
        let source = Arc::new(ScriptedSource::new());
        source.respond(delta(vec![upsert("k1", "v1", 1)], &[], 1));
        source.respond(delta(vec![upsert("k1", "v2", 2), upsert("", "broken", 2)], &[], 2));
        let engine = engine_with(Arc::clone(&source)).await;

        engine.sync("en", SyncOptions::default()).await.unwrap();
        let store = &engine.inner.tiers.store;
        let cursor_before = store.read_cursor("en").await.unwrap();
        let entry_before = store.read("k1", "en").await.unwrap();

        let err = engine.sync("en", SyncOptions::default()).await.unwrap_err();

        assert!(matches!(err, Error::TransactionFailure(_)));
        assert_eq!(store.read_cursor("en").await.unwrap(), cursor_before);
        assert_eq!(store.read("k1", "en").await.unwrap(), entry_before);
    }

    #[tokio::test]
    async fn test_backwards_cursor_is_rejected() {
        let source = Arc::new(ScriptedSource::new());
        source.respond(delta(vec![], &[], 8));
        source.respond(delta(vec![upsert("k1", "old", 3)], &[], 3));
        let engine = engine_with(Arc::clone(&source)).await;

        engine.sync("en", SyncOptions::default()).await.unwrap();
        let err = engine.sync("en", SyncOptions::default()).await.unwrap_err();
        assert!(matches!(err, Error::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn test_concurrent_syncs_share_one_fetch() {
        let source = Arc::new(ScriptedSource::new());
        let gate = source.hold();
        source.respond(delta(vec![upsert("k1", "v1", 1)], &[], 1));
        let engine = engine_with(Arc::clone(&source)).await;

        let (a, b, ()) = tokio::join!(
            engine.sync("en", SyncOptions::default()),
            engine.sync("en", SyncOptions::default()),
            async {
                source.wait_for_requests(1).await;
                assert!(engine.is_syncing("en"));
                gate.release();
            }
        );

        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(source.requests().len(), 1);
        assert!(!engine.is_syncing("en"));
    }

    #[tokio::test]
    async fn test_force_sync_supersedes_running_sync() {
        let source = Arc::new(ScriptedSource::new());
        source.respond(delta(vec![upsert("k1", "v1", 5)], &[], 5));
        let engine = engine_with(Arc::clone(&source)).await;
        engine.sync("en", SyncOptions::default()).await.unwrap();

        // The normal sync fetches first but is held until the force sync committed.
        let gate = source.hold();
        source.respond(delta(vec![upsert("k1", "late", 7)], &[], 7));
        let normal = tokio::spawn({
            let engine = engine.clone();
            async move { engine.sync("en", SyncOptions::default()).await }
        });
        source.wait_for_requests(2).await;

        source.respond(delta(vec![upsert("k1", "full", 9)], &[], 9));
        let forced = engine.sync("en", SyncOptions::force()).await.unwrap();
        assert!(!forced.superseded);
        gate.release();

        let normal = normal.await.unwrap().unwrap();
        assert!(normal.superseded);
        assert_eq!(normal.applied, 0);

        let store = &engine.inner.tiers.store;
        assert_eq!(store.read_cursor("en").await.unwrap().unwrap().last_synced_version, 9);
        assert_eq!(store.read("k1", "en").await.unwrap().unwrap().value, "full");
        assert_eq!(source.requests()[2].since_version, None);
    }

    #[tokio::test]
    async fn test_languages_are_isolated() {
        let source = Arc::new(ScriptedSource::new());
        source.respond(delta(vec![upsert("k1", "hello", 1)], &[], 1));
        source.fail(Error::NetworkFailure("offline".into()));
        let engine = engine_with(Arc::clone(&source)).await;

        engine.sync("en", SyncOptions::default()).await.unwrap();
        assert!(engine.sync("fr", SyncOptions::default()).await.is_err());

        let store = &engine.inner.tiers.store;
        assert_eq!(store.read("k1", "en").await.unwrap().unwrap().value, "hello");
        assert!(store.read_cursor("fr").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sync_notifies_watchers() {
        let source = Arc::new(ScriptedSource::new());
        source.respond(delta(vec![upsert("title", "Hello", 1), upsert("gone", "x", 1)], &[], 1));
        source.respond(delta(vec![upsert("title", "Hello again", 2)], &["gone"], 2));
        let engine = engine_with(Arc::clone(&source)).await;

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let _title = engine.inner.tiers.hub.subscribe("title", "en", move |e| sink.lock().unwrap().push(e.clone()));
        let sink = Arc::clone(&events);
        let _gone = engine.inner.tiers.hub.subscribe("gone", "en", move |e| sink.lock().unwrap().push(e.clone()));

        engine.sync("en", SyncOptions::default()).await.unwrap();
        engine.sync("en", SyncOptions::default()).await.unwrap();

        let events = events.lock().unwrap();
        let reasons: Vec<(String, ChangeReason)> = events.iter().map(|e| (e.key.clone(), e.reason)).collect();
        assert_eq!(
            reasons,
            vec![
                ("title".to_string(), ChangeReason::Synced),
                ("gone".to_string(), ChangeReason::Synced),
                ("title".to_string(), ChangeReason::Synced),
                ("gone".to_string(), ChangeReason::Deleted),
            ]
        );
        assert_eq!(engine.inner.tiers.memory.peek("gone", "en"), None);
    }

    #[tokio::test]
    async fn test_remote_assignment_resolves_variant() {
        let mut cta = upsert("cta", "Purchase", 1);
        cta.variants.insert("variantA".into(), "Buy now".into());
        let mut response = delta(vec![cta], &[], 1);
        response.experiment_assignments = Some(vec![ExperimentAssignment {
            experiment_id: "exp-cta".into(),
            string_key: "cta".into(),
            variant_id: "variantA".into(),
            variant_name: "Variant A".into(),
            assigned_at: chrono::Utc::now(),
        }]);
        let source = Arc::new(ScriptedSource::new());
        source.respond(response);
        let engine = engine_with(source).await;

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let _cta = engine.inner.tiers.hub.subscribe("cta", "en", move |e| sink.lock().unwrap().push(e.clone()));

        engine.sync("en", SyncOptions::default()).await.unwrap();

        let events = events.lock().unwrap();
        let seen: Vec<(ChangeReason, Option<&str>)> = events.iter().map(|e| (e.reason, e.value.as_deref())).collect();
        assert_eq!(
            seen,
            vec![(ChangeReason::Synced, Some("Buy now")), (ChangeReason::AssignmentChanged, Some("Buy now"))]
        );
        assert_eq!(engine.inner.tiers.memory.peek("cta", "en").map(|c| c.value).as_deref(), Some("Buy now"));
    }

    #[tokio::test]
    async fn test_force_sync_invalidates_vanished_keys() {
        let source = Arc::new(ScriptedSource::new());
        source.respond(delta(vec![upsert("title", "Hello", 1), upsert("gone", "x", 1)], &[], 1));
        source.respond(delta(vec![upsert("title", "Hello", 4)], &[], 4));
        let engine = engine_with(Arc::clone(&source)).await;

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let _gone = engine.inner.tiers.hub.subscribe("gone", "en", move |e| sink.lock().unwrap().push(e.clone()));

        engine.sync("en", SyncOptions::default()).await.unwrap();
        assert!(engine.inner.tiers.memory.peek("gone", "en").is_some());

        engine.sync("en", SyncOptions::force()).await.unwrap();

        let events = events.lock().unwrap();
        let last = events.last().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!((last.key.as_str(), last.reason, last.value.as_deref()), ("gone", ChangeReason::Invalidated, None));
        assert_eq!(engine.inner.tiers.memory.peek("gone", "en"), None);
        assert_eq!(engine.inner.tiers.lookup("gone", "en").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_sync_announces_commit() {
        let source = Arc::new(ScriptedSource::new());
        source.respond(delta(vec![upsert("k1", "v1", 3)], &[], 3));
        let store = StoreDb::open_in_memory().await.unwrap();
        let tiers = Tiers::new(store, Arc::new(MemoryCache::new(8)), Arc::new(WatchHub::new()));
        let broadcaster = Broadcaster::new(8);
        let mut receiver = broadcaster.subscribe();
        let engine = SyncEngine::new(
            tiers,
            source,
            "abc123",
            Some(SyncAnnouncer { broadcaster, origin: "context-a".into() }),
        );

        engine.sync("en", SyncOptions::default()).await.unwrap();

        let event = receiver.recv().await.unwrap();
        assert_eq!(event.origin, "context-a");
        assert_eq!(event.kind, ContextEventKind::SyncCompleted { language: "en".into(), version: 3 });
    }
}
