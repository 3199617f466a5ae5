//! Concurrency-safe keyed registry shared by broker subsystems.
//!
//! # Purpose
//! Provides the one in-process shared mutable index the broker uses for
//! hot-path bookkeeping (live connections, outstanding handshake nonces).
//! Subsystems depend on [`Registry`] instead of wrapping their own maps in
//! locks.
//!
//! # Key invariants
//! - Keys are unique. A second [`Registry::add`] for a present key returns
//!   `false` and leaves the stored value untouched.
//! - Presence implies liveness: entries exist from a successful `add` until
//!   the matching `delete`/`take`. Nothing is evicted implicitly.
//! - No operation returns an error; every outcome is a `bool` or `Option`.
//!
//! # Concurrency model
//! Backed by a sharded [`DashMap`]. Operations on a single key are atomic
//! with respect to each other. There is no cross-key ordering and no global
//! snapshot isolation: [`Registry::snapshot`] is linearizable per key only.
//! Callers must never hold an external lock around the registry.
//!
//! # Examples
//! ```rust
//! use warden_registry::Registry;
//!
//! let registry = Registry::new();
//! assert!(registry.add("conn-1", 7u64));
//! assert!(!registry.add("conn-1", 9u64));
//! assert_eq!(registry.load("conn-1"), Some(7));
//! assert!(registry.delete("conn-1"));
//! assert!(!registry.delete("conn-1"));
//! ```
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::fmt;

/// Keyed store usable from any number of concurrent callers.
pub struct Registry<V> {
    entries: DashMap<String, V>,
}

impl<V> Registry<V> {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Insert `value` under `key` iff the key is absent.
    ///
    /// The check and the insert happen under the key's shard lock, so two
    /// racing adds for the same key always produce exactly one winner.
    pub fn add(&self, key: impl Into<String>, value: V) -> bool {
        match self.entries.entry(key.into()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(value);
                true
            }
        }
    }

    /// Remove the entry for `key`. Returns `true` only for the caller that
    /// actually removed it.
    pub fn delete(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Remove and return the value for `key` in one atomic step.
    pub fn take(&self, key: &str) -> Option<V> {
        self.entries.remove(key).map(|(_, value)| value)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<V: Clone> Registry<V> {
    /// Clone out the value stored under `key`, if any.
    pub fn load(&self, key: &str) -> Option<V> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    /// Copy out every entry as parallel key/value vectors.
    ///
    /// Each shard is read-locked while it is visited, so every returned pair
    /// was a real entry at some instant during the call. Entries added or
    /// removed concurrently in shards that were already visited may or may
    /// not appear.
    pub fn snapshot(&self) -> (Vec<String>, Vec<V>) {
        let mut keys = Vec::with_capacity(self.entries.len());
        let mut values = Vec::with_capacity(self.entries.len());
        for entry in self.entries.iter() {
            keys.push(entry.key().clone());
            values.push(entry.value().clone());
        }
        (keys, values)
    }
}

impl<V> Default for Registry<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> fmt::Debug for Registry<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("len", &self.entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn add_rejects_duplicate_without_mutating() {
        let registry = Registry::new();
        assert!(registry.add("k", "first".to_string()));
        assert!(!registry.add("k", "second".to_string()));
        assert_eq!(registry.load("k").as_deref(), Some("first"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn load_missing_key_returns_none() {
        let registry: Registry<u32> = Registry::new();
        assert_eq!(registry.load("absent"), None);
        assert!(!registry.contains("absent"));
        assert!(registry.is_empty());
    }

    #[test]
    fn delete_succeeds_once_per_add() {
        let registry = Registry::new();
        assert!(registry.add("k", 1));
        assert!(registry.delete("k"));
        assert!(!registry.delete("k"));
        assert!(registry.add("k", 2));
        assert!(registry.delete("k"));
        assert!(!registry.delete("k"));
    }

    #[test]
    fn take_returns_value_once() {
        let registry = Registry::new();
        registry.add("nonce", 42u64);
        assert_eq!(registry.take("nonce"), Some(42));
        assert_eq!(registry.take("nonce"), None);
    }

    #[test]
    fn snapshot_pairs_keys_with_values() {
        let registry = Registry::new();
        for i in 0..32u32 {
            registry.add(format!("k{i}"), i);
        }
        let (keys, values) = registry.snapshot();
        assert_eq!(keys.len(), 32);
        for (key, value) in keys.iter().zip(values.iter()) {
            assert_eq!(key, &format!("k{value}"));
        }
    }

    #[test]
    fn concurrent_adds_for_same_key_have_one_winner() {
        for round in 0..50 {
            let registry = Arc::new(Registry::new());
            let winners = Arc::new(AtomicUsize::new(0));
            let handles: Vec<_> = (0..8)
                .map(|worker| {
                    let registry = Arc::clone(&registry);
                    let winners = Arc::clone(&winners);
                    thread::spawn(move || {
                        if registry.add(format!("key-{round}"), worker) {
                            winners.fetch_add(1, Ordering::SeqCst);
                            Some(worker)
                        } else {
                            None
                        }
                    })
                })
                .collect();
            let won: Vec<usize> = handles
                .into_iter()
                .filter_map(|handle| handle.join().expect("join"))
                .collect();
            assert_eq!(winners.load(Ordering::SeqCst), 1);
            assert_eq!(won.len(), 1);
            assert_eq!(registry.load(&format!("key-{round}")), Some(won[0]));
        }
    }

    #[test]
    fn concurrent_deletes_succeed_exactly_once() {
        let registry = Arc::new(Registry::new());
        registry.add("shared", ());
        let successes = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let successes = Arc::clone(&successes);
                thread::spawn(move || {
                    if registry.delete("shared") {
                        successes.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("join");
        }
        assert_eq!(successes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn snapshot_during_mutation_only_sees_real_entries() {
        let registry = Arc::new(Registry::new());
        let writer = {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                for i in 0..2_000u32 {
                    registry.add(format!("k{i}"), i);
                    if i % 3 == 0 {
                        registry.delete(&format!("k{i}"));
                    }
                }
            })
        };
        for _ in 0..50 {
            let (keys, values) = registry.snapshot();
            assert_eq!(keys.len(), values.len());
            for (key, value) in keys.iter().zip(values.iter()) {
                assert_eq!(key, &format!("k{value}"));
            }
        }
        writer.join().expect("join");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn shared_across_tokio_tasks() {
        let registry = Arc::new(Registry::new());
        let mut tasks = Vec::new();
        for i in 0..64u32 {
            let registry = Arc::clone(&registry);
            tasks.push(tokio::spawn(async move { registry.add(format!("c{}", i % 16), i) }));
        }
        let mut added = 0;
        for task in tasks {
            if task.await.expect("task") {
                added += 1;
            }
        }
        assert_eq!(added, 16);
        assert_eq!(registry.len(), 16);
    }
}
