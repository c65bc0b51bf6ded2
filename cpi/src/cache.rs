use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Memoizing key/value store with explicit invalidation.
///
/// The lock is never held across `compute`, so a compute that ends up
/// clearing the cache (e.g. through a session renewal) cannot deadlock.
/// Every `clear` bumps a generation counter; a value computed across a
/// `clear` is returned to its caller but not stored.
/// Two concurrent misses on the same key may both compute; the first
/// stored value wins and is returned to both.
#[derive(Debug)]
pub struct Cache<V> {
    entries: Mutex<Entries<V>>,
}

#[derive(Debug)]
struct Entries<V> {
    generation: u64,
    values: HashMap<String, V>,
}

impl<V> Default for Cache<V> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(Entries {
                generation: 0,
                values: HashMap::new(),
            }),
        }
    }
}

impl<V: Clone> Cache<V> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Entries<V>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn peek(&self, key: &str) -> Option<V> {
        self.lock().values.get(key).cloned()
    }

    /// Returns the memoized value for `key`, computing it on first miss.
    /// Failed computations are not stored.
    pub async fn get<F, Fut, E>(&self, key: &str, compute: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let generation = {
            let entries = self.lock();
            if let Some(value) = entries.values.get(key) {
                tracing::trace!("cache hit: {}", key);
                return Ok(value.clone());
            }
            entries.generation
        };

        tracing::debug!("cache miss: {}", key);
        let value = compute().await?;

        let mut entries = self.lock();
        if entries.generation != generation {
            tracing::debug!("cache cleared while computing {}, not storing", key);
            return Ok(value);
        }
        Ok(entries
            .values
            .entry(key.to_string())
            .or_insert(value)
            .clone())
    }

    pub fn clear(&self) {
        let mut entries = self.lock();
        if !entries.values.is_empty() {
            tracing::debug!("Clearing {} cached entries", entries.values.len());
        }
        entries.values.clear();
        entries.generation += 1;
    }

    pub fn len(&self) -> usize {
        self.lock().values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().values.is_empty()
    }
}
