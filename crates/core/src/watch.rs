//! Observer registry keyed by `(key, language)`.
//!
//! Callbacks run synchronously on the notifying thread, in registration
//! order, after the registry lock has been released. A callback may
//! subscribe or unsubscribe (itself included) while being notified; a
//! subscription that is cancelled mid-notification is not called again.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// Why a watched value changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeReason {
    /// A sync committed a new value.
    Synced,
    /// A sync tombstoned the key.
    Deleted,
    /// The active language switched to this subscription's language.
    LanguageChanged,
    /// An experiment assignment for the key was stored or retired.
    AssignmentChanged,
    /// Cached state was dropped (cache clear or a sibling context's sync).
    Invalidated,
}

/// Notification delivered to watchers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub key: String,
    pub language: String,
    /// Resolved value after the change; `None` when the key is absent.
    pub value: Option<String>,
    pub reason: ChangeReason,
}

type Callback = Arc<dyn Fn(&WatchEvent) + Send + Sync>;
type WatchKey = (String, String);

struct Watcher {
    id: u64,
    active: Arc<AtomicBool>,
    callback: Callback,
}

#[derive(Default)]
struct Registry {
    watchers: BTreeMap<WatchKey, Vec<Watcher>>,
}

/// Registry of watchers shared by the cache tiers and the client facade.
#[derive(Default)]
pub struct WatchHub {
    registry: Arc<Mutex<Registry>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for WatchHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchHub").field("subscriptions", &self.len()).finish()
    }
}

/// Handle returned by [`WatchHub::subscribe`].
///
/// Dropping the handle keeps the subscription alive; call
/// [`Subscription::unsubscribe`] to stop notifications.
#[must_use = "keep the handle to be able to unsubscribe"]
pub struct Subscription {
    id: u64,
    key: WatchKey,
    active: Arc<AtomicBool>,
    registry: Weak<Mutex<Registry>>,
}

impl Subscription {
    /// Stop notifications. Safe to call from inside a callback and more than once.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let mut registry = registry.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(watchers) = registry.watchers.get_mut(&self.key) {
            watchers.retain(|w| w.id != self.id);
            if watchers.is_empty() {
                registry.watchers.remove(&self.key);
            }
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

impl WatchHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register `callback` for changes to `(key, language)`.
    pub fn subscribe<F>(&self, key: &str, language: &str, callback: F) -> Subscription
    where
        F: Fn(&WatchEvent) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let active = Arc::new(AtomicBool::new(true));
        let watch_key = (key.to_string(), language.to_string());

        self.lock().watchers.entry(watch_key.clone()).or_default().push(Watcher {
            id,
            active: Arc::clone(&active),
            callback: Arc::new(callback),
        });

        Subscription { id, key: watch_key, active, registry: Arc::downgrade(&self.registry) }
    }

    /// Notify every live watcher of `(event.key, event.language)`.
    ///
    /// Returns how many callbacks ran.
    pub fn notify(&self, event: &WatchEvent) -> usize {
        let snapshot: Vec<(Arc<AtomicBool>, Callback)> = {
            let registry = self.lock();
            match registry.watchers.get(&(event.key.clone(), event.language.clone())) {
                Some(watchers) => watchers.iter().map(|w| (Arc::clone(&w.active), Arc::clone(&w.callback))).collect(),
                None => return 0,
            }
        };

        let mut delivered = 0;
        for (active, callback) in snapshot {
            if active.load(Ordering::Acquire) {
                callback(event);
                delivered += 1;
            }
        }
        delivered
    }

    /// Keys with at least one watcher in `language`, ordered by key.
    pub fn watched_keys(&self, language: &str) -> Vec<String> {
        self.lock()
            .watchers
            .keys()
            .filter(|(_, l)| l == language)
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Languages with at least one watcher on `key`.
    pub fn watched_languages(&self, key: &str) -> Vec<String> {
        self.lock()
            .watchers
            .keys()
            .filter(|(k, _)| k == key)
            .map(|(_, l)| l.clone())
            .collect()
    }

    /// Languages with at least one watcher, deduplicated and ordered.
    pub fn languages(&self) -> Vec<String> {
        let mut languages: Vec<String> = self.lock().watchers.keys().map(|(_, l)| l.clone()).collect();
        languages.sort();
        languages.dedup();
        languages
    }

    /// Number of live subscriptions.
    pub fn len(&self) -> usize {
        self.lock().watchers.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn event(key: &str, language: &str, value: &str) -> WatchEvent {
        WatchEvent {
            key: key.into(),
            language: language.into(),
            value: Some(value.into()),
            reason: ChangeReason::Synced,
        }
    }

    #[test]
    fn test_notifies_exact_key_in_registration_order() {
        let hub = WatchHub::new();
        let log = Arc::new(StdMutex::new(Vec::new()));

        let first = Arc::clone(&log);
        let _a = hub.subscribe("title", "en", move |e| first.lock().unwrap().push(format!("a:{:?}", e.value)));
        let second = Arc::clone(&log);
        let _b = hub.subscribe("title", "en", move |e| second.lock().unwrap().push(format!("b:{:?}", e.value)));
        let other = Arc::clone(&log);
        let _c = hub.subscribe("title", "fr", move |_| other.lock().unwrap().push("fr".into()));

        assert_eq!(hub.notify(&event("title", "en", "Hi")), 2);
        assert_eq!(*log.lock().unwrap(), vec!["a:Some(\"Hi\")".to_string(), "b:Some(\"Hi\")".to_string()]);
    }

    #[test]
    fn test_unsubscribe_stops_notifications() {
        let hub = WatchHub::new();
        let count = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&count);
        let sub = hub.subscribe("title", "en", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        hub.notify(&event("title", "en", "1"));
        sub.unsubscribe();
        sub.unsubscribe();
        hub.notify(&event("title", "en", "2"));

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!sub.is_active());
        assert!(hub.is_empty());
    }

    #[test]
    fn test_unsubscribe_during_notification() {
        let hub = Arc::new(WatchHub::new());
        let calls = Arc::new(StdMutex::new(Vec::new()));
        let later: Arc<StdMutex<Option<Subscription>>> = Arc::new(StdMutex::new(None));

        // The first watcher cancels the second one while the notification is running.
        let cancel = Arc::clone(&later);
        let first_calls = Arc::clone(&calls);
        let _first = hub.subscribe("title", "en", move |_| {
            first_calls.lock().unwrap().push("first");
            if let Some(sub) = cancel.lock().unwrap().as_ref() {
                sub.unsubscribe();
            }
        });

        let second_calls = Arc::clone(&calls);
        let second = hub.subscribe("title", "en", move |_| second_calls.lock().unwrap().push("second"));
        *later.lock().unwrap() = Some(second);

        assert_eq!(hub.notify(&event("title", "en", "x")), 1);
        assert_eq!(*calls.lock().unwrap(), vec!["first"]);
    }

    #[test]
    fn test_self_unsubscribe_inside_callback() {
        let hub = WatchHub::new();
        let slot: Arc<StdMutex<Option<Subscription>>> = Arc::new(StdMutex::new(None));
        let count = Arc::new(AtomicU64::new(0));

        let own = Arc::clone(&slot);
        let counter = Arc::clone(&count);
        let sub = hub.subscribe("title", "en", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            if let Some(sub) = own.lock().unwrap().as_ref() {
                sub.unsubscribe();
            }
        });
        *slot.lock().unwrap() = Some(sub);

        hub.notify(&event("title", "en", "x"));
        hub.notify(&event("title", "en", "y"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_watched_keys_and_languages() {
        let hub = WatchHub::new();
        let _a = hub.subscribe("b", "en", |_| {});
        let _b = hub.subscribe("a", "en", |_| {});
        let _c = hub.subscribe("a", "de", |_| {});

        assert_eq!(hub.watched_keys("en"), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(hub.watched_languages("a"), vec!["de".to_string(), "en".to_string()]);
        assert_eq!(hub.languages(), vec!["de".to_string(), "en".to_string()]);
        assert_eq!(hub.len(), 3);
    }
}
