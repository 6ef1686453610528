use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

/// Порог размера, после которого вставка заодно выметает просроченные ключи
const SWEEP_THRESHOLD: usize = 64;

/// Конкурентное множество, ключи которого живут `ttl`
#[derive(Debug)]
pub struct ExpiringSet<K: Eq + Hash> {
    items: DashMap<K, Instant>,
    ttl: Duration,
}

impl<K: Eq + Hash + Clone> ExpiringSet<K> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            items: DashMap::new(),
            ttl,
        }
    }

    /// Пометить ключ; `true`, если его не было (или метка истекла)
    pub fn insert(&self, key: K) -> bool {
        let now = Instant::now();
        if self.items.len() > SWEEP_THRESHOLD {
            self.sweep(now);
        }
        match self.items.entry(key) {
            Entry::Occupied(mut entry) => {
                let expired = now.saturating_duration_since(*entry.get()) >= self.ttl;
                if expired {
                    entry.insert(now);
                }
                expired
            }
            Entry::Vacant(entry) => {
                entry.insert(now);
                true
            }
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        let now = Instant::now();
        let live = self
            .items
            .get(key)
            .map(|marked| now.saturating_duration_since(*marked) < self.ttl);
        match live {
            Some(true) => true,
            Some(false) => {
                self.items.remove(key);
                false
            }
            None => false,
        }
    }

    pub fn remove(&self, key: &K) -> bool {
        self.items.remove(key).is_some()
    }

    pub fn clear(&self) {
        self.items.clear();
    }

    fn sweep(&self, now: Instant) {
        self.items
            .retain(|_, marked| now.saturating_duration_since(*marked) < self.ttl);
    }
}
