//! Process-wide property store.
//!
//! String keys, string values, change callbacks. Stands in for the system
//! property service: operators tune retry delays and feature flags at
//! runtime and every subscriber sees the new value on the next `set`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

type Callback = Arc<dyn Fn(&str, &str) + Send + Sync>;

struct Subscription {
    id: u64,
    prefix: String,
    callback: Callback,
}

#[derive(Default)]
struct Inner {
    values: HashMap<String, String>,
    subscriptions: Vec<Subscription>,
    next_id: u64,
}

/// Cloneable handle; all clones share the same table.
#[derive(Clone, Default)]
pub struct PropertyStore {
    inner: Arc<Mutex<Inner>>,
}

impl PropertyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.lock().values.get(key).cloned()
    }

    pub fn get_or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    /// Stores `value` and notifies subscribers whose prefix matches `key`.
    /// Setting the current value again is silent.
    pub fn set(&self, key: &str, value: &str) {
        let callbacks: Vec<Callback> = {
            let mut inner = self.lock();
            if inner.values.get(key).map(String::as_str) == Some(value) {
                return;
            }
            inner.values.insert(key.to_string(), value.to_string());
            inner
                .subscriptions
                .iter()
                .filter(|s| key.starts_with(&s.prefix))
                .map(|s| s.callback.clone())
                .collect()
        };
        tracing::debug!(key, value, subscribers = callbacks.len(), "property changed");
        // Run outside the lock so callbacks may read the store.
        for cb in callbacks {
            cb(key, value);
        }
    }

    /// Registers `callback` for every key starting with `prefix`.
    pub fn subscribe<F>(&self, prefix: &str, callback: F) -> u64
    where
        F: Fn(&str, &str) + Send + Sync + 'static,
    {
        let mut inner = self.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.subscriptions.push(Subscription {
            id,
            prefix: prefix.to_string(),
            callback: Arc::new(callback),
        });
        id
    }

    pub fn unsubscribe(&self, id: u64) -> bool {
        let mut inner = self.lock();
        let before = inner.subscriptions.len();
        inner.subscriptions.retain(|s| s.id != id);
        inner.subscriptions.len() != before
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for PropertyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("PropertyStore")
            .field("values", &inner.values)
            .field("subscriptions", &inner.subscriptions.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn get_set() {
        let store = PropertyStore::new();
        assert_eq!(store.get("a"), None);
        store.set("a", "1");
        assert_eq!(store.get("a").as_deref(), Some("1"));
        assert_eq!(store.get_or("b", "x"), "x");
    }

    #[test]
    fn subscribers_see_changes_by_prefix() {
        let store = PropertyStore::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        store.subscribe("persist.telephony.", move |_, _| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        store.set("persist.telephony.setupfail.delay", "5000");
        store.set("persist.other", "1");
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // Same value again does not notify.
        store.set("persist.telephony.setupfail.delay", "5000");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn callback_may_read_store() {
        let store = PropertyStore::new();
        let seen = Arc::new(Mutex::new(None));
        let (s, reader) = (seen.clone(), store.clone());
        store.subscribe("k", move |key, _| {
            *s.lock().unwrap() = reader.get(key);
        });
        store.set("k", "v");
        assert_eq!(seen.lock().unwrap().as_deref(), Some("v"));
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let store = PropertyStore::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let id = store.subscribe("", move |_, _| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert!(store.unsubscribe(id));
        assert!(!store.unsubscribe(id));
        store.set("x", "y");
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
