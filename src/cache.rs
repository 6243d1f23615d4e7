//! Time-bounded lookup cache.
//!
//! Entries expire purely by elapsed time and are checked lazily on access;
//! nothing sweeps in the background. There is no write-through: a value
//! computed by one caller stays visible until its TTL runs out, even if the
//! underlying storage changed in the meantime.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use log::debug;
use parking_lot::Mutex;

use crate::clock::Clock;

pub trait Cache<K, V>: Send + Sync {
    fn has(&self, key: &K) -> bool;
    fn get(&self, key: &K) -> Option<V>;
    fn set(&self, key: K, value: V);
    fn clear(&self);
}

struct Entry<V> {
    value: V,
    expires_at: i64,
}

pub struct TtlCache<K, V> {
    ttl_millis: i64,
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<K, Entry<V>>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash,
{
    /// A zero TTL disables caching: every entry is expired on arrival.
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            ttl_millis: i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX),
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_millis.max(0) as u64)
    }
}

impl<K, V> Cache<K, V> for TtlCache<K, V>
where
    K: Eq + Hash + Send,
    V: Clone + Send,
{
    fn has(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    fn get(&self, key: &K) -> Option<V> {
        let now = self.clock.now_millis();
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.expires_at > now => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    fn set(&self, key: K, value: V) {
        let expires_at = self.clock.now_millis().saturating_add(self.ttl_millis);
        self.entries.lock().insert(key, Entry { value, expires_at });
    }

    fn clear(&self) {
        self.entries.lock().clear();
    }
}

/// Returns the cached value for `key`, or runs `compute` and caches its
/// result. Errors are returned as-is and never cached.
pub async fn cached_or_compute<C, K, V, F, Fut>(
    cache: &C,
    key: K,
    compute: F,
) -> Result<V>
where
    C: Cache<K, V> + ?Sized,
    K: std::fmt::Debug,
    V: Clone,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<V>>,
{
    if let Some(hit) = cache.get(&key) {
        debug!("Cache hit for {key:?}");
        return Ok(hit);
    }
    debug!("Cache miss for {key:?}");
    let value = compute().await?;
    cache.set(key, value.clone());
    Ok(value)
}
