//! In-memory keyed registry shared by the server and agent.

use std::collections::HashMap;
use std::sync::RwLock;

use uuid::Uuid;

/// Thread-safe string-keyed map. Values are inserted under caller-provided
/// keys or under generated opaque ids.
///
/// Iteration holds the read lock; callers that need to mutate while iterating
/// collect keys first and mutate afterwards.
pub struct Store<T> {
    items: RwLock<HashMap<String, T>>,
}

impl<T> Store<T> {
    pub fn new() -> Self {
        Self {
            items: RwLock::new(HashMap::new()),
        }
    }

    /// Insert under a generated unique id and return that id.
    pub fn add(&self, item: T) -> String {
        let key = Uuid::new_v4().to_string();
        self.items.write().unwrap().insert(key.clone(), item);
        key
    }

    /// Insert under `key`, overwriting any previous entry.
    pub fn set(&self, key: &str, item: T) {
        self.items.write().unwrap().insert(key.to_string(), item);
    }

    /// Remove the listed keys. Missing keys are ignored.
    pub fn del(&self, keys: &[&str]) {
        let mut items = self.items.write().unwrap();
        for key in keys {
            items.remove(*key);
        }
    }

    /// Remove the entry under `key` and return it.
    pub fn take(&self, key: &str) -> Option<T> {
        self.items.write().unwrap().remove(key)
    }

    /// Visit every entry under the read lock.
    pub fn for_each(&self, mut visit: impl FnMut(&str, &T)) {
        let items = self.items.read().unwrap();
        for (key, item) in items.iter() {
            visit(key, item);
        }
    }

    pub fn keys(&self) -> Vec<String> {
        self.items.read().unwrap().keys().cloned().collect()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.items.read().unwrap().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.items.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.read().unwrap().is_empty()
    }
}

impl<T: Clone> Store<T> {
    /// Copy out the entry under `key`.
    pub fn get(&self, key: &str) -> Option<T> {
        self.items.read().unwrap().get(key).cloned()
    }

    pub fn values(&self) -> Vec<T> {
        self.items.read().unwrap().values().cloned().collect()
    }
}

impl<T> Default for Store<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_generates_unique_keys() {
        let store = Store::new();
        let k1 = store.add("a");
        let k2 = store.add("b");

        assert_ne!(k1, k2);
        assert_eq!(store.get(&k1), Some("a"));
        assert_eq!(store.get(&k2), Some("b"));
    }

    #[test]
    fn set_overwrites() {
        let store = Store::new();
        store.set("svc", 1);
        store.set("svc", 2);

        assert_eq!(store.get("svc"), Some(2));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn del_removes_many() {
        let store = Store::new();
        store.set("a", 1);
        store.set("b", 2);
        store.set("c", 3);

        store.del(&["a", "c", "missing"]);

        assert_eq!(store.keys(), vec!["b".to_string()]);
    }

    #[test]
    fn take_moves_value_out() {
        let store: Store<String> = Store::new();
        store.set("k", "v".to_string());

        assert_eq!(store.take("k"), Some("v".to_string()));
        assert_eq!(store.take("k"), None);
        assert!(store.is_empty());
    }

    #[test]
    fn for_each_sees_all_entries() {
        let store = Store::new();
        store.set("a", 1);
        store.set("b", 2);

        let mut total = 0;
        store.for_each(|_, v| total += v);

        assert_eq!(total, 3);
    }

    #[test]
    fn get_missing_is_none() {
        let store: Store<i32> = Store::new();
        assert_eq!(store.get("nope"), None);
    }
}
