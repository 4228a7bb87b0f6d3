//! In-process shared store
//!
//! [`MemoryStore`] implements [`SharedStore`] without a network: values live in a
//! mutex-guarded map with lazy expiry, and pub/sub is a tokio broadcast channel.
//! Several [`CacheManager`](crate::CacheManager)s built on one `Arc<MemoryStore>`
//! behave like several processes sharing one Redis.
//!
//! A subscriber that falls more than the channel capacity behind has lost messages,
//! so its stream ends, the same way a Redis subscription ends when its connection drops.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::warn;

use crate::CacheError;
use crate::store::{PayloadStream, SharedStore};

const CHANNEL_CAPACITY: usize = 1024;

struct StoredValue {
    value: String,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Clone)]
struct Published {
    channel: String,
    payload: Vec<u8>,
}

/// Shared store kept entirely in memory.
pub struct MemoryStore {
    entries: Mutex<HashMap<String, StoredValue>>,
    bus: broadcast::Sender<Published>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (bus, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            entries: Mutex::new(HashMap::new()),
            bus,
        }
    }

    /// Number of live (unexpired) entries
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .values()
            .filter(|v| !v.is_expired(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Match a Redis-style pattern. Only a trailing `*` is treated as a wildcard.
fn matches_pattern(pattern: &str, key: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => key.starts_with(prefix),
        None => key == pattern,
    }
}

#[async_trait::async_trait]
impl SharedStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        match entries.get(key) {
            Some(stored) if stored.is_expired(now) => {
                entries.remove(key);
                Ok(None)
            }
            Some(stored) => Ok(Some(stored.value.clone())),
            None => Ok(None),
        }
    }

    async fn set(
        &self,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.entries
            .lock()
            .insert(key.to_owned(), StoredValue { value, expires_at });
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<(), CacheError> {
        let mut entries = self.entries.lock();
        for key in keys {
            entries.remove(key);
        }
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
        let now = Instant::now();
        Ok(self
            .entries
            .lock()
            .iter()
            .filter(|(key, stored)| !stored.is_expired(now) && matches_pattern(pattern, key))
            .map(|(key, _)| key.clone())
            .collect())
    }

    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), CacheError> {
        // No subscribers is not an error, same as Redis PUBLISH.
        let _ = self.bus.send(Published {
            channel: channel.to_owned(),
            payload,
        });
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<PayloadStream, CacheError> {
        let rx = self.bus.subscribe();
        let channel = channel.to_owned();

        let stream = futures::stream::unfold((rx, channel), |(mut rx, channel)| async move {
            loop {
                match rx.recv().await {
                    Ok(published) if published.channel == channel => {
                        return Some((published.payload, (rx, channel)));
                    }
                    Ok(_) => continue,
                    // Dropped messages cannot be replayed; end the stream so the
                    // subscriber resubscribes and resynchronises.
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(channel = %channel, skipped, "subscriber lagged, ending subscription");
                        return None;
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });

        Ok(stream.boxed())
    }
}
