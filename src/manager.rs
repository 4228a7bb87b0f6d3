//! Registry of named caches
//!
//! One [`CacheManager`] per process owns every [`LayeredCache`] it hands out. Caches
//! are created on first request from the shared [`CacheConfig`] and live as long as
//! the manager.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::layered_cache::LocalCache;
use crate::{CacheConfig, Cacheable, LayeredCache, SharedStore};

const KEY_SEPARATOR: char = ':';

pub struct CacheManager<V: Cacheable> {
    config: CacheConfig,
    store: Arc<dyn SharedStore>,
    caches: RwLock<HashMap<String, Arc<LayeredCache<V>>>>,
}

impl<V: Cacheable> CacheManager<V> {
    pub fn new(config: CacheConfig, store: Arc<dyn SharedStore>) -> Self {
        Self {
            config,
            store,
            caches: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn SharedStore> {
        &self.store
    }

    /// Return the cache called `name`, creating it on first use.
    ///
    /// Returns `None` when the manager is not dynamic and `name` is not one of the
    /// configured cache names, or when `name` contains `:`. Full keys are
    /// `{name}:...`, so such a name would overlap another cache's key space.
    pub fn get_cache(&self, name: &str) -> Option<Arc<LayeredCache<V>>> {
        if let Some(cache) = self.caches.read().get(name) {
            return Some(Arc::clone(cache));
        }

        if name.contains(KEY_SEPARATOR) {
            warn!(cache = %name, "cache name must not contain ':'");
            return None;
        }

        if !self.config.dynamic && !self.config.cache_names.contains(name) {
            debug!(cache = %name, "cache name not configured");
            return None;
        }

        let mut caches = self.caches.write();
        let cache = caches.entry(name.to_owned()).or_insert_with(|| {
            debug!(cache = %name, "create cache instance");
            Arc::new(LayeredCache::new(
                name,
                self.local_cache(),
                Arc::clone(&self.store),
                &self.config,
            ))
        });
        Some(Arc::clone(cache))
    }

    /// Names of the caches this manager serves.
    ///
    /// Includes configured names that have not been requested yet.
    pub fn cache_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.caches.read().keys().cloned().collect();
        for name in &self.config.cache_names {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
        names.sort();
        names
    }

    /// Drop local entries of one cache; unknown names are ignored.
    pub async fn clear_local(&self, name: &str, key: Option<&str>) {
        let cache = self.caches.read().get(name).cloned();
        match cache {
            Some(cache) => cache.clear_local(key).await,
            None => debug!(cache = %name, "no local cache to clear"),
        }
    }

    /// Drop the local entries of every cache, e.g. after invalidations may have been missed.
    pub async fn clear_all_local(&self) {
        let caches: Vec<_> = self.caches.read().values().cloned().collect();
        for cache in caches {
            cache.clear_local(None).await;
        }
    }

    fn local_cache(&self) -> LocalCache<V> {
        let local = &self.config.local;
        let mut builder = moka::future::Cache::builder();
        if local.max_capacity > 0 {
            builder = builder.max_capacity(local.max_capacity);
        }
        if local.initial_capacity > 0 {
            builder = builder.initial_capacity(local.initial_capacity);
        }
        if let Some(ttl) = local.time_to_live {
            builder = builder.time_to_live(ttl);
        }
        if let Some(tti) = local.time_to_idle {
            builder = builder.time_to_idle(tti);
        }
        builder.build()
    }
}
