//! # Keyed locks
//!
//! A sharded mutex map: one `parking_lot::Mutex<()>` per key, created
//! lazily. Used for the per-project mutex (`MasterTree::reconcile`,
//! `PushEngine::run_push`, `VersionRepository::complete` serialize per
//! project) and the per-hash CAS write guard. Callers hold the returned
//! `Arc` for the lifetime of their critical section:
//!
//! ```ignore
//! let lock = locks.get(&project_id);
//! let _guard = lock.lock();
//! // ... critical section ...
//! ```

use dashmap::DashMap;
use parking_lot::Mutex;
use std::hash::Hash;
use std::sync::Arc;

pub struct KeyedLocks<K> {
    map: DashMap<K, Arc<Mutex<()>>>,
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        Self { map: DashMap::new() }
    }

    pub fn get(&self, key: &K) -> Arc<Mutex<()>> {
        self.map
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

impl<K: Eq + Hash + Clone> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::thread;

    #[test]
    fn same_key_serializes_critical_sections() {
        let locks: Arc<KeyedLocks<String>> = Arc::new(KeyedLocks::new());
        let counter = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = Arc::clone(&locks);
            let counter = Arc::clone(&counter);
            let peak = Arc::clone(&peak);
            handles.push(thread::spawn(move || {
                let lock = locks.get(&"project-a".to_string());
                let _guard = lock.lock();
                let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(std::time::Duration::from_millis(5));
                counter.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }
}
