//! Cache configuration

use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// Default pub/sub channel carrying invalidation messages.
pub const DEFAULT_INVALIDATION_CHANNEL: &str = "cache:invalidation";

/// Configuration shared by every cache a [`CacheManager`](crate::CacheManager) creates.
///
/// Durations are written in humantime form (`"10s"`, `"5m"`) when deserialized.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Allow absent loader results to be cached as a null marker
    pub cache_null_values: bool,
    /// Create caches on first request; when false only `cache_names` are served
    pub dynamic: bool,
    /// Names served when `dynamic` is false
    pub cache_names: HashSet<String>,
    /// Optional segment inserted between the cache name and the key in L2
    pub key_prefix: Option<String>,
    /// Fallback L2 time-to-live; `None` stores entries without expiry
    #[serde(with = "humantime_serde")]
    pub default_expiration: Option<Duration>,
    /// Per-name L2 time-to-live overrides
    #[serde(with = "expires_serde")]
    pub expires: HashMap<String, Duration>,
    /// Redis pub/sub channel for cross-instance invalidation
    pub invalidation_channel: String,
    /// L1 bounding policy
    pub local: LocalCacheConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_null_values: true,
            dynamic: true,
            cache_names: HashSet::new(),
            key_prefix: None,
            default_expiration: None,
            expires: HashMap::new(),
            invalidation_channel: DEFAULT_INVALIDATION_CHANNEL.to_owned(),
            local: LocalCacheConfig::default(),
        }
    }
}

impl CacheConfig {
    /// Resolve the L2 time-to-live for a cache name.
    pub fn expiration_for(&self, name: &str) -> Option<Duration> {
        self.expires.get(name).copied().or(self.default_expiration)
    }

    /// The key prefix, treating an empty string as absent.
    pub fn key_prefix(&self) -> Option<&str> {
        self.key_prefix.as_deref().filter(|p| !p.is_empty())
    }
}

/// Bounding policy for the in-process (L1) cache of each name.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LocalCacheConfig {
    /// Maximum number of entries per cache name; 0 means unbounded
    pub max_capacity: u64,
    /// Pre-allocated capacity; 0 leaves Moka's default
    pub initial_capacity: usize,
    /// Expire entries this long after they were written
    #[serde(with = "humantime_serde")]
    pub time_to_live: Option<Duration>,
    /// Expire entries this long after they were last read
    #[serde(with = "humantime_serde")]
    pub time_to_idle: Option<Duration>,
}

impl Default for LocalCacheConfig {
    fn default() -> Self {
        Self {
            max_capacity: 10_000,
            initial_capacity: 0,
            time_to_live: None,
            time_to_idle: None,
        }
    }
}

mod expires_serde {
    use serde::{Deserialize, Deserializer};
    use std::collections::HashMap;
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<HashMap<String, Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Wrapped(#[serde(with = "humantime_serde")] Duration);

        let raw = HashMap::<String, Wrapped>::deserialize(deserializer)?;
        Ok(raw.into_iter().map(|(name, Wrapped(d))| (name, d)).collect())
    }
}
