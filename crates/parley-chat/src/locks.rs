use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

/// Keyed mutual exclusion: one async mutex per key, created on first
/// use and kept for the life of the registry. Holders of different
/// keys proceed concurrently; holders of the same key queue up in
/// arrival order (tokio mutexes are FIFO-fair).
///
/// Used with a chat id to serialize read-modify-write of one chat's
/// message sequence, and with a sorted user pair to serialize private
/// chat find-or-create.
pub struct KeyedLocks<K> {
    inner: Mutex<HashMap<K, Arc<tokio::sync::Mutex<()>>>>,
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &K) -> Arc<tokio::sync::Mutex<()>> {
        self.inner
            .lock()
            .expect("lock registry poisoned")
            .entry(key.clone())
            .or_default()
            .clone()
    }
}

impl<K: Eq + Hash + Clone> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self::new()
    }
}
