//! Cross-instance invalidation listener
//!
//! Subscribes to the invalidation channel and drops the announced keys from this
//! process's local caches. Messages are handled one at a time and independently;
//! eviction is idempotent, so at-least-once delivery (including our own publishes)
//! is harmless.
//!
//! If the subscription is lost the listener resubscribes with exponential backoff and
//! then clears every local cache, since invalidations may have been missed meanwhile.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::store::PayloadStream;
use crate::{CacheError, CacheManager, Cacheable, InvalidationMessage};

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_millis(2000);

pub struct InvalidationListener<V: Cacheable> {
    manager: Arc<CacheManager<V>>,
}

impl<V: Cacheable> Clone for InvalidationListener<V> {
    fn clone(&self) -> Self {
        Self {
            manager: Arc::clone(&self.manager),
        }
    }
}

impl<V: Cacheable> InvalidationListener<V> {
    pub fn new(manager: Arc<CacheManager<V>>) -> Self {
        Self { manager }
    }

    /// Apply one raw invalidation payload to the local caches.
    ///
    /// Undecodable payloads are logged and dropped.
    pub async fn on_message(&self, payload: &[u8]) {
        let message = match InvalidationMessage::decode(payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(
                    error = %e,
                    payload = %String::from_utf8_lossy(payload),
                    "dropping undecodable invalidation message"
                );
                return;
            }
        };

        debug!(
            cache = %message.cache_name(),
            key = ?message.key(),
            "received invalidation message"
        );

        match &message {
            InvalidationMessage::EvictOne { cache_name, key } => {
                self.manager.clear_local(cache_name, Some(key)).await;
            }
            InvalidationMessage::EvictAll { cache_name } => {
                self.manager.clear_local(cache_name, None).await;
            }
        }
    }

    /// Subscribe to the invalidation channel and process messages in a background task.
    ///
    /// The subscription is active when this returns. Must be called within a tokio runtime.
    pub async fn start(self) -> Result<ListenerHandle, CacheError> {
        let channel = self.manager.config().invalidation_channel.clone();
        let stream = self.manager.store().subscribe(&channel).await?;
        info!(channel = %channel, "invalidation listener subscribed");

        let shutdown = Arc::new(Notify::new());
        let task = tokio::spawn(self.run(channel, stream, Arc::clone(&shutdown)));

        Ok(ListenerHandle { shutdown, task })
    }

    async fn run(self, channel: String, mut stream: PayloadStream, shutdown: Arc<Notify>) {
        loop {
            loop {
                // A `notify_one` sent while no `notified()` is pending leaves a permit,
                // which the next freshly created `notified()` consumes at once.
                tokio::select! {
                    _ = shutdown.notified() => {
                        debug!(channel = %channel, "invalidation listener stopped");
                        return;
                    }
                    payload = stream.next() => match payload {
                        Some(payload) => self.on_message(&payload).await,
                        None => break,
                    },
                }
            }

            warn!(channel = %channel, "invalidation subscription lost, resubscribing");
            stream = match self.resubscribe(&channel, &shutdown).await {
                Some(stream) => stream,
                None => return,
            };
            self.manager.clear_all_local().await;
        }
    }

    async fn resubscribe(&self, channel: &str, shutdown: &Notify) -> Option<PayloadStream> {
        let mut delay = INITIAL_BACKOFF;
        let mut attempt = 0u32;
        loop {
            // Same stored-permit reliance as in `run`
            tokio::select! {
                _ = shutdown.notified() => return None,
                _ = tokio::time::sleep(delay) => {}
            }

            attempt += 1;
            match self.manager.store().subscribe(channel).await {
                Ok(stream) => {
                    info!(channel = %channel, attempt, "invalidation listener resubscribed");
                    return Some(stream);
                }
                Err(e) => {
                    warn!(channel = %channel, attempt, error = %e, "resubscribe failed");
                    delay = delay.saturating_mul(2).min(MAX_BACKOFF);
                }
            }
        }
    }
}

/// Handle to a running [`InvalidationListener`]. Dropping it leaves the listener running.
pub struct ListenerHandle {
    shutdown: Arc<Notify>,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    /// Stop the listener and wait for its task to finish
    pub async fn shutdown(self) {
        self.shutdown.notify_one();
        if let Err(e) = self.task.await {
            warn!(error = %e, "invalidation listener task failed");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
