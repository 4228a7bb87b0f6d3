//! Shared (L2) store abstraction
//!
//! The layered cache only needs a handful of operations from the store shared by all
//! instances: plain get/set/delete on string values, key enumeration for namespace
//! clears, and pub/sub for invalidation. [`RedisStore`] is the production backend;
//! [`MemoryStore`](crate::MemoryStore) provides the same contract in-process.

use std::time::Duration;

use futures::StreamExt;
use futures::stream::BoxStream;
use redis::AsyncCommands;
use tracing::debug;

use crate::CacheError;

/// Stream of raw payloads received on a subscribed channel.
///
/// The stream ends when the underlying subscription is lost.
pub type PayloadStream = BoxStream<'static, Vec<u8>>;

/// Store shared by all cache instances of a deployment.
#[async_trait::async_trait]
pub trait SharedStore: Send + Sync + 'static {
    /// Fetch the value stored under `key`
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Store `value` under `key`, expiring after `ttl` when given
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>)
    -> Result<(), CacheError>;

    /// Delete the given keys; missing keys are ignored
    async fn delete(&self, keys: &[String]) -> Result<(), CacheError>;

    /// List keys matching a glob pattern such as `users:*`
    async fn keys(&self, pattern: &str) -> Result<Vec<String>, CacheError>;

    /// Publish a payload to every subscriber of `channel`
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), CacheError>;

    /// Subscribe to `channel`.
    ///
    /// The subscription is active once this returns.
    async fn subscribe(&self, channel: &str) -> Result<PayloadStream, CacheError>;
}

/// Redis-backed shared store.
///
/// Commands share one auto-reconnecting [`ConnectionManager`](redis::aio::ConnectionManager);
/// every subscription opens its own pub/sub connection.
#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
    conn: redis::aio::ConnectionManager,
}

impl RedisStore {
    /// Connect to Redis using an existing client
    pub async fn new(client: redis::Client) -> Result<Self, redis::RedisError> {
        let conn = redis::aio::ConnectionManager::new(client.clone()).await?;
        Ok(Self { client, conn })
    }

    /// Connect to Redis at `url` (e.g. `redis://127.0.0.1/`)
    pub async fn open(url: &str) -> Result<Self, redis::RedisError> {
        Self::new(redis::Client::open(url)?).await
    }
}

#[async_trait::async_trait]
impl SharedStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.conn.clone();
        Ok(conn.get::<_, Option<String>>(key).await?)
    }

    async fn set(
        &self,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        match ttl {
            Some(ttl) => {
                // Redis rejects a zero expiry.
                let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
                conn.pset_ex::<_, _, ()>(key, value, millis).await?;
            }
            None => conn.set::<_, _, ()>(key, value).await?,
        }
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<(), CacheError> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(keys.to_vec()).await?;
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
        let mut conn = self.conn.clone();
        Ok(conn.keys::<_, Vec<String>>(pattern).await?)
    }

    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        conn.publish::<_, _, ()>(channel, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<PayloadStream, CacheError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        debug!(channel = %channel, "subscribed to Redis channel");

        Ok(pubsub
            .into_on_message()
            .map(|msg| msg.get_payload_bytes().to_vec())
            .boxed())
    }
}
