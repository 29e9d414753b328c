use crate::clock::Clock;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::Mutex;

struct Entry<V> {
    value: V,
    stored_at_ms: u64,
}

/// Process-scoped TTL cache. Entries expire lazily on read; writes are
/// last-writer-wins since every cached value is re-derivable from the
/// durable store or directory sync.
pub struct TtlCache<K, V> {
    entries: Mutex<HashMap<K, Entry<V>>>,
    ttl_ms: u64,
    clock: Arc<dyn Clock>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ttl_secs: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl_ms: ttl_secs.saturating_mul(1000),
            clock,
        }
    }

    pub async fn get(&self, key: &K) -> Option<V> {
        let now = self.clock.now_ms();
        let mut guard = self.entries.lock().await;
        match guard.get(key) {
            Some(entry) if now.saturating_sub(entry.stored_at_ms) <= self.ttl_ms => {
                Some(entry.value.clone())
            }
            Some(_) => {
                guard.remove(key);
                None
            }
            None => None,
        }
    }

    pub async fn get_many(&self, keys: &[K]) -> HashMap<K, V> {
        let now = self.clock.now_ms();
        let mut guard = self.entries.lock().await;
        let mut out = HashMap::new();
        for key in keys {
            match guard.get(key) {
                Some(entry) if now.saturating_sub(entry.stored_at_ms) <= self.ttl_ms => {
                    out.insert(key.clone(), entry.value.clone());
                }
                Some(_) => {
                    guard.remove(key);
                }
                None => {}
            }
        }
        out
    }

    pub async fn set(&self, key: K, value: V) {
        let now = self.clock.now_ms();
        let mut guard = self.entries.lock().await;
        guard.insert(
            key,
            Entry {
                value,
                stored_at_ms: now,
            },
        );
    }

    pub async fn set_many(&self, values: impl IntoIterator<Item = (K, V)>) {
        let now = self.clock.now_ms();
        let mut guard = self.entries.lock().await;
        for (key, value) in values {
            guard.insert(
                key,
                Entry {
                    value,
                    stored_at_ms: now,
                },
            );
        }
    }

    pub async fn invalidate(&self, key: &K) {
        let mut guard = self.entries.lock().await;
        guard.remove(key);
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}
