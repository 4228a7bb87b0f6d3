//! Per-name two-level cache
//!
//! A [`LayeredCache`] couples one in-process Moka cache (L1) with the shared store (L2)
//! for a single cache name:
//! - Reads go L1 → L2 → loader, populating the faster tiers on the way back
//! - Writes go L2 → invalidation broadcast → L1
//! - Concurrent misses for the same key run the loader once per process
//!
//! Read-path failures of the shared store degrade to a miss. Write-path failures are
//! returned to the caller, since a swallowed write would leave L1 and L2 disagreeing.

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Serialize, de::DeserializeOwned};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, error, trace, warn};

use crate::error::BoxError;
use crate::{CacheConfig, CacheError, InvalidationMessage, SharedStore};

/// Trait for types that can be cached
pub trait Cacheable: Serialize + DeserializeOwned + Send + Sync + 'static {}
impl<T> Cacheable for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}

/// L1 storage. `None` is the null marker: "checked, confirmed absent".
pub(crate) type LocalCache<V> = moka::future::Cache<String, Option<Arc<V>>>;

type LockTable = Mutex<HashMap<String, Arc<AsyncMutex<()>>>>;

/// Holds the per-key loader lock; drops the table entry once nobody else uses it.
struct KeyLockGuard<'a> {
    table: &'a LockTable,
    key: String,
    lock: Arc<AsyncMutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyLockGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());

        // Waiters clone the Arc under the table lock, so a count of two (table + us)
        // means nobody holds or awaits this lock.
        let mut table = self.table.lock();
        if Arc::strong_count(&self.lock) == 2 {
            table.remove(&self.key);
        }
    }
}

/// Two-level cache for one name.
pub struct LayeredCache<V: Cacheable> {
    name: String,
    local: LocalCache<V>,
    store: Arc<dyn SharedStore>,
    key_prefix: Option<String>,
    expiration: Option<Duration>,
    channel: String,
    cache_null_values: bool,
    key_locks: LockTable,
}

impl<V: Cacheable> LayeredCache<V> {
    pub(crate) fn new(
        name: &str,
        local: LocalCache<V>,
        store: Arc<dyn SharedStore>,
        config: &CacheConfig,
    ) -> Self {
        Self {
            name: name.to_owned(),
            local,
            store,
            key_prefix: config.key_prefix().map(str::to_owned),
            expiration: config.expiration_for(name),
            channel: config.invalidation_channel.clone(),
            cache_null_values: config.cache_null_values,
            key_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// L2 time-to-live applied to entries of this cache
    pub fn expiration(&self) -> Option<Duration> {
        self.expiration
    }

    /// Build the shared-store key: `{name}:{prefix}:{key}`, or `{name}:{key}` without a prefix
    pub fn full_key<K: Display + ?Sized>(&self, key: &K) -> String {
        match &self.key_prefix {
            Some(prefix) => format!("{}:{}:{}", self.name, prefix, key),
            None => format!("{}:{}", self.name, key),
        }
    }

    /// Look up a key in L1 then L2 without loading.
    ///
    /// A cached null marker and a miss both return `None`.
    pub async fn get<K: Display + ?Sized>(&self, key: &K) -> Option<Arc<V>> {
        self.lookup(&key.to_string()).await.flatten()
    }

    /// Return the cached value for `key`, running `loader` on a miss.
    ///
    /// At most one loader runs per key in this process; concurrent callers wait for it
    /// and then read its result from L1. A loader error is returned as
    /// [`CacheError::Loader`] and nothing is cached.
    pub async fn get_or_compute<K, F, Fut>(
        &self,
        key: &K,
        loader: F,
    ) -> Result<Option<Arc<V>>, CacheError>
    where
        K: Display + ?Sized,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<V>, BoxError>>,
    {
        let local_key = key.to_string();
        if let Some(value) = self.lookup(&local_key).await {
            return Ok(value);
        }

        let _guard = self.lock_key(&local_key).await;

        // Another task may have populated a tier while we waited
        if let Some(value) = self.lookup(&local_key).await {
            return Ok(value);
        }

        let loaded = match loader().await {
            Ok(value) => value,
            Err(e) => {
                error!(cache = %self.name, key = %local_key, error = %e, "loader failed");
                return Err(CacheError::Loader(e));
            }
        };

        match loaded {
            None if !self.cache_null_values => {
                debug!(cache = %self.name, key = %local_key, "loader returned no value, evicting");
                self.evict(&local_key).await?;
                Ok(None)
            }
            loaded => {
                let value = loaded.map(Arc::new);
                self.write_through(&local_key, value.clone()).await?;
                Ok(value)
            }
        }
    }

    /// Store a value in both tiers and tell peers to drop their copy.
    ///
    /// `None` stores the null marker, or evicts the key when null values are disabled.
    pub async fn put<K: Display + ?Sized>(
        &self,
        key: &K,
        value: impl Into<Option<V>>,
    ) -> Result<(), CacheError> {
        let local_key = key.to_string();
        match value.into() {
            None if !self.cache_null_values => self.evict(&local_key).await,
            value => self.write_through(&local_key, value.map(Arc::new)).await,
        }
    }

    /// Store a value only if L2 holds nothing for `key`.
    ///
    /// Returns `None` when the value was written. Otherwise nothing is written and the
    /// existing entry is returned, with `Some(None)` meaning a stored null marker. When
    /// null values are disabled, a null marker left in L2 counts as absent.
    ///
    /// Shares the per-key lock with [`get_or_compute`](Self::get_or_compute), so it must
    /// not be called from inside a loader for the same key.
    pub async fn put_if_absent<K: Display + ?Sized>(
        &self,
        key: &K,
        value: impl Into<Option<V>>,
    ) -> Result<Option<Option<Arc<V>>>, CacheError> {
        let local_key = key.to_string();
        let value = value.into();
        if value.is_none() && !self.cache_null_values {
            return Err(CacheError::NullValueNotAllowed {
                cache_name: self.name.clone(),
            });
        }

        let _guard = self.lock_key(&local_key).await;

        let existing = match self.store.get(&self.full_key(&local_key)).await? {
            Some(raw) => match serde_json::from_str::<Option<V>>(&raw)? {
                None if !self.cache_null_values => None,
                previous => Some(previous.map(Arc::new)),
            },
            None => None,
        };

        if existing.is_some() {
            debug!(cache = %self.name, key = %local_key, "put_if_absent found existing entry");
            return Ok(existing);
        }
        self.write_through(&local_key, value.map(Arc::new)).await?;
        Ok(None)
    }

    /// Remove a key from L2, broadcast the eviction, then drop it from L1.
    ///
    /// L2 goes first so a peer reacting to the broadcast cannot reload the stale value.
    pub async fn evict<K: Display + ?Sized>(&self, key: &K) -> Result<(), CacheError> {
        let local_key = key.to_string();
        debug!(cache = %self.name, key = %local_key, "evicting");

        self.store.delete(&[self.full_key(&local_key)]).await?;
        self.publish(InvalidationMessage::EvictOne {
            cache_name: self.name.clone(),
            key: local_key.clone(),
        })
        .await?;
        self.local.invalidate(&local_key).await;
        Ok(())
    }

    /// Remove every entry of this cache from L2, broadcast, then empty L1.
    pub async fn clear(&self) -> Result<(), CacheError> {
        let keys = self.store.keys(&format!("{}:*", self.name)).await?;
        debug!(cache = %self.name, count = keys.len(), "clearing");

        if !keys.is_empty() {
            self.store.delete(&keys).await?;
        }
        self.publish(InvalidationMessage::EvictAll {
            cache_name: self.name.clone(),
        })
        .await?;
        self.local.invalidate_all();
        Ok(())
    }

    /// Drop one key, or everything when `key` is `None`, from L1 only.
    ///
    /// Used when a peer announces a mutation; L2 is never touched.
    pub async fn clear_local(&self, key: Option<&str>) {
        debug!(cache = %self.name, key = ?key, "clearing local cache");
        match key {
            Some(key) => self.local.invalidate(key).await,
            None => self.local.invalidate_all(),
        }
    }

    async fn lookup(&self, local_key: &str) -> Option<Option<Arc<V>>> {
        if let Some(value) = self.local.get(local_key).await {
            debug!(cache = %self.name, key = %local_key, "cache hit L1");
            return Some(value);
        }

        let value = self.lookup_shared(local_key).await?;
        debug!(cache = %self.name, key = %local_key, "cache hit L2, populating L1");
        self.local.insert(local_key.to_owned(), value.clone()).await;
        Some(value)
    }

    async fn lookup_shared(&self, local_key: &str) -> Option<Option<Arc<V>>> {
        let full_key = self.full_key(local_key);

        let raw = match self.store.get(&full_key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                trace!(cache = %self.name, key = %local_key, "cache miss L2");
                return None;
            }
            Err(e) => {
                warn!(
                    cache = %self.name,
                    key = %local_key,
                    error = %e,
                    "L2 GET failed, treating as miss"
                );
                return None;
            }
        };

        match serde_json::from_str::<Option<V>>(&raw) {
            Ok(None) if !self.cache_null_values => None,
            Ok(value) => Some(value.map(Arc::new)),
            Err(e) => {
                warn!(
                    cache = %self.name,
                    key = %local_key,
                    error = %e,
                    "failed to deserialize L2 value, deleting corrupt entry"
                );
                if let Err(del_err) = self.store.delete(&[full_key]).await {
                    warn!(cache = %self.name, key = %local_key, error = %del_err, "L2 DEL failed");
                }
                None
            }
        }
    }

    async fn write_through(
        &self,
        local_key: &str,
        value: Option<Arc<V>>,
    ) -> Result<(), CacheError> {
        let json = serde_json::to_string(&value.as_deref())?;
        self.store
            .set(&self.full_key(local_key), json, self.expiration)
            .await?;

        self.publish(InvalidationMessage::EvictOne {
            cache_name: self.name.clone(),
            key: local_key.to_owned(),
        })
        .await?;

        self.local.insert(local_key.to_owned(), value).await;
        Ok(())
    }

    async fn publish(&self, message: InvalidationMessage) -> Result<(), CacheError> {
        let payload = message.encode()?;
        self.store.publish(&self.channel, payload).await?;
        debug!(
            channel = %self.channel,
            cache = %self.name,
            key = ?message.key(),
            "invalidation published"
        );
        Ok(())
    }

    async fn lock_key(&self, local_key: &str) -> KeyLockGuard<'_> {
        let lock = {
            let mut table = self.key_locks.lock();
            Arc::clone(table.entry(local_key.to_owned()).or_insert_with(|| {
                trace!(cache = %self.name, key = %local_key, "create lock for key");
                Arc::new(AsyncMutex::new(()))
            }))
        };
        let guard = Arc::clone(&lock).lock_owned().await;

        KeyLockGuard {
            table: &self.key_locks,
            key: local_key.to_owned(),
            lock,
            guard: Some(guard),
        }
    }

    #[cfg(test)]
    fn lock_table_len(&self) -> usize {
        self.key_locks.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStore;
    use crate::store::PayloadStream;
    use futures::StreamExt;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn local() -> LocalCache<String> {
        moka::future::Cache::builder().max_capacity(100).build()
    }

    fn cache_with(store: Arc<dyn SharedStore>, config: &CacheConfig) -> LayeredCache<String> {
        LayeredCache::new("users", local(), store, config)
    }

    /// MemoryStore wrapper whose reads or writes can be switched to fail.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        fail_reads: AtomicBool,
        fail_writes: AtomicBool,
    }

    impl FlakyStore {
        fn check(&self, flag: &AtomicBool) -> Result<(), CacheError> {
            if flag.load(Ordering::SeqCst) {
                Err(CacheError::Store("connection refused".to_owned()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait::async_trait]
    impl SharedStore for FlakyStore {
        async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
            self.check(&self.fail_reads)?;
            self.inner.get(key).await
        }

        async fn set(
            &self,
            key: &str,
            value: String,
            ttl: Option<Duration>,
        ) -> Result<(), CacheError> {
            self.check(&self.fail_writes)?;
            self.inner.set(key, value, ttl).await
        }

        async fn delete(&self, keys: &[String]) -> Result<(), CacheError> {
            self.check(&self.fail_writes)?;
            self.inner.delete(keys).await
        }

        async fn keys(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
            self.inner.keys(pattern).await
        }

        async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), CacheError> {
            self.check(&self.fail_writes)?;
            self.inner.publish(channel, payload).await
        }

        async fn subscribe(&self, channel: &str) -> Result<PayloadStream, CacheError> {
            self.inner.subscribe(channel).await
        }
    }

    #[test]
    fn test_full_key_derivation() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let cache = cache_with(Arc::clone(&store), &CacheConfig::default());
        assert_eq!(cache.full_key("42"), "users:42");

        let config = CacheConfig {
            key_prefix: Some("v2".to_owned()),
            ..CacheConfig::default()
        };
        let cache = cache_with(store, &config);
        assert_eq!(cache.full_key(&7), "users:v2:7");
    }

    #[tokio::test]
    async fn test_write_order_publishes_after_l2() {
        let store = Arc::new(MemoryStore::new());
        let mut messages = store
            .subscribe(&CacheConfig::default().invalidation_channel)
            .await
            .expect("subscribe");
        let cache = cache_with(store.clone(), &CacheConfig::default());

        cache.put("1", "alice".to_owned()).await.expect("put");

        let raw = messages.next().await.expect("message");
        assert_eq!(
            InvalidationMessage::decode(&raw).expect("decode"),
            InvalidationMessage::EvictOne {
                cache_name: "users".to_owned(),
                key: "1".to_owned(),
            }
        );
        assert_eq!(
            store.get("users:1").await.expect("get"),
            Some("\"alice\"".to_owned())
        );
    }

    #[tokio::test]
    async fn test_null_marker_is_cached_when_enabled() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let cache = cache_with(Arc::clone(&store), &CacheConfig::default());
        let calls = AtomicUsize::new(0);

        for _ in 0..2 {
            let value = cache
                .get_or_compute("ghost", || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(None)
                })
                .await
                .expect("get_or_compute");
            assert!(value.is_none());
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            store.get("users:ghost").await.expect("get"),
            Some("null".to_owned())
        );
    }

    #[tokio::test]
    async fn test_loader_error_caches_nothing() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let cache = cache_with(Arc::clone(&store), &CacheConfig::default());

        let result = cache
            .get_or_compute("1", || async { Err::<Option<String>, _>("db down".into()) })
            .await;
        assert!(matches!(result, Err(CacheError::Loader(_))));
        assert_eq!(store.get("users:1").await.expect("get"), None);

        let value = cache
            .get_or_compute("1", || async { Ok(Some("bob".to_owned())) })
            .await
            .expect("get_or_compute");
        assert_eq!(value.as_deref().map(String::as_str), Some("bob"));
    }

    #[tokio::test]
    async fn test_l2_read_error_falls_back_to_loader() {
        let store = Arc::new(FlakyStore::default());
        store.fail_reads.store(true, Ordering::SeqCst);
        let cache = cache_with(store.clone(), &CacheConfig::default());

        let value = cache
            .get_or_compute("1", || async { Ok(Some("carol".to_owned())) })
            .await
            .expect("read errors degrade to a miss");
        assert_eq!(value.as_deref().map(String::as_str), Some("carol"));
        assert_eq!(
            store.inner.get("users:1").await.expect("get"),
            Some("\"carol\"".to_owned())
        );
    }

    #[tokio::test]
    async fn test_l2_write_error_propagates() {
        let store = Arc::new(FlakyStore::default());
        store.fail_writes.store(true, Ordering::SeqCst);
        let cache = cache_with(store.clone(), &CacheConfig::default());

        assert!(matches!(
            cache.put("1", "dave".to_owned()).await,
            Err(CacheError::Store(_))
        ));
        assert!(
            cache
                .get_or_compute("1", || async { Ok(Some("dave".to_owned())) })
                .await
                .is_err()
        );
        assert!(cache.evict("1").await.is_err());

        // Nothing reached L1 either
        store.fail_writes.store(false, Ordering::SeqCst);
        assert!(cache.get("1").await.is_none());
    }

    #[tokio::test]
    async fn test_corrupt_l2_entry_is_deleted() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        store
            .set("users:1", "{not json".to_owned(), None)
            .await
            .expect("set");
        let cache = cache_with(Arc::clone(&store), &CacheConfig::default());

        assert!(cache.get("1").await.is_none());
        assert_eq!(store.get("users:1").await.expect("get"), None);
    }

    #[tokio::test]
    async fn test_put_if_absent_keeps_existing_value() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let cache = cache_with(Arc::clone(&store), &CacheConfig::default());

        let previous = cache
            .put_if_absent("1", "first".to_owned())
            .await
            .expect("put_if_absent");
        assert!(previous.is_none());

        let previous = cache
            .put_if_absent("1", "second".to_owned())
            .await
            .expect("put_if_absent");
        assert_eq!(
            previous.flatten().as_deref().map(String::as_str),
            Some("first")
        );
        assert_eq!(
            cache.get("1").await.as_deref().map(String::as_str),
            Some("first")
        );
    }

    #[tokio::test]
    async fn test_put_if_absent_reports_existing_null_marker() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let cache = cache_with(Arc::clone(&store), &CacheConfig::default());

        cache.put("1", None::<String>).await.expect("put");
        let previous = cache
            .put_if_absent("1", "real".to_owned())
            .await
            .expect("put_if_absent");

        // Present but null, so nothing was written
        assert!(matches!(previous, Some(None)));
        assert_eq!(
            store.get("users:1").await.expect("get"),
            Some("null".to_owned())
        );
    }

    #[tokio::test]
    async fn test_put_if_absent_overwrites_null_marker_when_disabled() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        store
            .set("users:1", "null".to_owned(), None)
            .await
            .expect("set");
        let config = CacheConfig {
            cache_null_values: false,
            ..CacheConfig::default()
        };
        let cache = cache_with(Arc::clone(&store), &config);

        let previous = cache
            .put_if_absent("1", "real".to_owned())
            .await
            .expect("put_if_absent");

        assert!(previous.is_none());
        assert_eq!(
            store.get("users:1").await.expect("get"),
            Some("\"real\"".to_owned())
        );
        assert_eq!(
            cache.get("1").await.as_deref().map(String::as_str),
            Some("real")
        );
    }

    #[tokio::test]
    async fn test_put_if_absent_rejects_null_when_disabled() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let config = CacheConfig {
            cache_null_values: false,
            ..CacheConfig::default()
        };
        let cache = cache_with(store, &config);

        assert!(matches!(
            cache.put_if_absent("1", None::<String>).await,
            Err(CacheError::NullValueNotAllowed { .. })
        ));
    }

    #[tokio::test]
    async fn test_put_null_evicts_when_disabled() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let config = CacheConfig {
            cache_null_values: false,
            ..CacheConfig::default()
        };
        let cache = cache_with(Arc::clone(&store), &config);

        cache.put("1", "erin".to_owned()).await.expect("put");
        cache.put("1", None::<String>).await.expect("put");

        assert!(cache.get("1").await.is_none());
        assert_eq!(store.get("users:1").await.expect("get"), None);
    }

    #[tokio::test]
    async fn test_ttl_is_applied_to_l2() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let mut config = CacheConfig::default();
        config
            .expires
            .insert("users".to_owned(), Duration::from_millis(30));
        let cache = cache_with(Arc::clone(&store), &config);
        assert_eq!(cache.expiration(), Some(Duration::from_millis(30)));

        cache.put("1", "frank".to_owned()).await.expect("put");
        assert!(store.get("users:1").await.expect("get").is_some());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(store.get("users:1").await.expect("get"), None);
    }

    #[tokio::test]
    async fn test_clear_local_never_touches_l2() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let cache = cache_with(Arc::clone(&store), &CacheConfig::default());
        cache.put("1", "gina".to_owned()).await.expect("put");

        cache.clear_local(Some("1")).await;
        cache.clear_local(Some("1")).await;
        cache.clear_local(None).await;

        assert!(store.get("users:1").await.expect("get").is_some());
        // Re-read from L2 after the local copy was dropped
        assert_eq!(
            cache.get("1").await.as_deref().map(String::as_str),
            Some("gina")
        );
    }

    #[tokio::test]
    async fn test_lock_table_is_pruned_after_load() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let cache = cache_with(store, &CacheConfig::default());

        for i in 0..10 {
            cache
                .get_or_compute(&i, || async move { Ok(Some(i.to_string())) })
                .await
                .expect("get_or_compute");
        }
        assert_eq!(cache.lock_table_len(), 0);
    }
}
