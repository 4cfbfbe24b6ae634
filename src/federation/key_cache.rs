//! Public Key Caching
//!
//! Caches fetched public keys to reduce remote requests. Concurrent lookups
//! for the same uncached key share one in-flight fetch; lookups for
//! different keys never wait on each other.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio::sync::{Mutex, RwLock};

use super::directory::ActorDirectory;
use crate::error::AppError;
use crate::metrics::{KEY_CACHE_LOOKUPS_TOTAL, KEY_FETCHES_TOTAL};

/// Resolves a signature `keyId` to a PEM public key
#[async_trait::async_trait]
pub trait KeyResolver: Send + Sync {
    async fn resolve(&self, key_id: &str) -> Result<String, AppError>;
}

/// Cached public key entry
#[derive(Debug, Clone)]
struct CachedKey {
    /// PEM-encoded public key
    pem: String,
    /// When this entry was cached
    cached_at: Instant,
}

impl CachedKey {
    fn is_valid(&self, ttl: Duration) -> bool {
        self.cached_at.elapsed() < ttl
    }
}

/// Fetch shared by every caller waiting on the same key id.
/// Errors are stringified because `Shared` needs a `Clone` output.
type InFlightFetch = Shared<BoxFuture<'static, Result<String, String>>>;

struct Inner {
    /// Cache storage: key_id -> cached key
    cache: RwLock<HashMap<String, CachedKey>>,
    in_flight: Mutex<HashMap<String, InFlightFetch>>,
    directory: Arc<dyn ActorDirectory>,
    ttl: Duration,
    max_entries: usize,
}

impl Inner {
    async fn insert(&self, key_id: &str, pem: String) {
        let mut cache = self.cache.write().await;

        if !cache.contains_key(key_id) && cache.len() >= self.max_entries {
            let ttl = self.ttl;
            cache.retain(|_, v| v.is_valid(ttl));
            if cache.len() >= self.max_entries {
                evict_oldest(&mut cache);
            }
        }

        cache.insert(
            key_id.to_string(),
            CachedKey {
                pem,
                cached_at: Instant::now(),
            },
        );
    }
}

fn evict_oldest(cache: &mut HashMap<String, CachedKey>) {
    let Some(oldest_key) = cache
        .iter()
        .min_by_key(|(_, value)| value.cached_at)
        .map(|(key, _)| key.clone())
    else {
        return;
    };
    cache.remove(&oldest_key);
}

/// Public key cache
///
/// Thread-safe, TTL-bounded cache for remote actor public keys. Cloning is
/// cheap and clones share the same entries.
#[derive(Clone)]
pub struct PublicKeyCache {
    inner: Arc<Inner>,
}

impl PublicKeyCache {
    /// Create new public key cache
    ///
    /// # Arguments
    /// * `directory` - Where keys are fetched from on a miss
    /// * `ttl` - How long a fetched key is trusted
    /// * `max_entries` - Upper bound on cached keys
    pub fn new(directory: Arc<dyn ActorDirectory>, ttl: Duration, max_entries: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                cache: RwLock::new(HashMap::new()),
                in_flight: Mutex::new(HashMap::new()),
                directory,
                ttl,
                max_entries: max_entries.max(1),
            }),
        }
    }

    /// Get public key for a key ID
    ///
    /// Checks cache first, fetches from the directory if not cached or
    /// expired. Failed fetches are not cached.
    pub async fn get(&self, key_id: &str) -> Result<String, AppError> {
        // 1. Check cache (read lock)
        if let Some(pem) = self.cached(key_id).await {
            KEY_CACHE_LOOKUPS_TOTAL.with_label_values(&["hit"]).inc();
            tracing::debug!(key_id = %key_id, "Public key cache hit");
            return Ok(pem);
        }

        // 2. Join or start the fetch for this key
        let fetch = {
            let mut in_flight = self.inner.in_flight.lock().await;

            // A fetch may have settled and cleared its slot since step 1
            if let Some(pem) = self.cached(key_id).await {
                KEY_CACHE_LOOKUPS_TOTAL.with_label_values(&["hit"]).inc();
                return Ok(pem);
            }

            match in_flight.get(key_id) {
                Some(fetch) => {
                    KEY_CACHE_LOOKUPS_TOTAL
                        .with_label_values(&["coalesced"])
                        .inc();
                    tracing::debug!(key_id = %key_id, "Joining in-flight public key fetch");
                    fetch.clone()
                }
                None => {
                    KEY_CACHE_LOOKUPS_TOTAL.with_label_values(&["miss"]).inc();
                    tracing::debug!(key_id = %key_id, "Public key cache miss, fetching");
                    let fetch = self.start_fetch(key_id);
                    in_flight.insert(key_id.to_string(), fetch.clone());
                    fetch
                }
            }
        };

        fetch.await.map_err(AppError::KeyResolution)
    }

    /// Unexpired cached key, if any
    async fn cached(&self, key_id: &str) -> Option<String> {
        let cache = self.inner.cache.read().await;
        match cache.get(key_id) {
            Some(cached) if cached.is_valid(self.inner.ttl) => Some(cached.pem.clone()),
            Some(_) => {
                tracing::debug!(key_id = %key_id, "Public key cache expired");
                None
            }
            None => None,
        }
    }

    /// The fetch settles the cache and clears its own in-flight slot, so a
    /// caller dropping out early does not strand the others.
    fn start_fetch(&self, key_id: &str) -> InFlightFetch {
        let inner = Arc::clone(&self.inner);
        let key_id = key_id.to_string();

        async move {
            KEY_FETCHES_TOTAL.inc();
            let result = inner.directory.fetch_public_key(&key_id).await;

            match &result {
                Ok(pem) => inner.insert(&key_id, pem.clone()).await,
                Err(e) => {
                    tracing::warn!(key_id = %key_id, error = %e, "Public key fetch failed")
                }
            }
            inner.in_flight.lock().await.remove(&key_id);

            result.map_err(|e| e.to_string())
        }
        .boxed()
        .shared()
    }

    /// Invalidate a cached key
    ///
    /// Useful when a key is known to be invalid or changed.
    pub async fn invalidate(&self, key_id: &str) {
        let mut cache = self.inner.cache.write().await;
        cache.remove(key_id);
        tracing::debug!(key_id = %key_id, "Invalidated public key cache entry");
    }

    /// Clear all cached keys
    pub async fn clear(&self) {
        let mut cache = self.inner.cache.write().await;
        cache.clear();
        tracing::debug!("Cleared all public key cache entries");
    }

    /// Get cache statistics
    pub async fn stats(&self) -> CacheStats {
        let cache = self.inner.cache.read().await;
        let total = cache.len();
        let valid = cache
            .values()
            .filter(|v| v.is_valid(self.inner.ttl))
            .count();

        CacheStats {
            total_entries: total,
            valid_entries: valid,
            expired_entries: total - valid,
        }
    }

    /// Prune expired entries
    ///
    /// Should be called periodically to clean up expired entries.
    pub async fn prune_expired(&self) -> usize {
        let mut cache = self.inner.cache.write().await;
        let before = cache.len();
        let ttl = self.inner.ttl;
        cache.retain(|_, v| v.is_valid(ttl));
        let removed = before - cache.len();

        if removed > 0 {
            tracing::info!("Pruned {} expired public key cache entries", removed);
        }
        removed
    }
}

#[async_trait::async_trait]
impl KeyResolver for PublicKeyCache {
    async fn resolve(&self, key_id: &str) -> Result<String, AppError> {
        self.get(key_id).await
    }
}

/// Cache statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    /// Total number of entries
    pub total_entries: usize,
    /// Number of valid (non-expired) entries
    pub valid_entries: usize,
    /// Number of expired entries
    pub expired_entries: usize,
}
