//! layercache - Two-level caching library
//!
//! This library provides a named, two-tier cache for services running as several
//! instances:
//! - L1: In-memory Moka cache per process (fastest)
//! - L2: Shared store, normally Redis (shared across instances)
//! - Loader: caller-supplied async function run on a full miss
//!
//! Every mutation is broadcast on a pub/sub channel so that sibling instances drop
//! their stale L1 copies. Consistency across instances is eventual: the last writer
//! wins in L2 and invalidations may arrive in any order.
//!
//! ```no_run
//! use std::sync::Arc;
//! use layercache::{CacheConfig, CacheManager, InvalidationListener, RedisStore};
//!
//! # async fn run() -> Result<(), layercache::CacheError> {
//! let store = Arc::new(RedisStore::open("redis://127.0.0.1/").await?);
//! let manager = Arc::new(CacheManager::<String>::new(CacheConfig::default(), store));
//! let listener = InvalidationListener::new(Arc::clone(&manager)).start().await?;
//!
//! if let Some(users) = manager.get_cache("users") {
//!     let name = users
//!         .get_or_compute("42", || async { Ok(Some("Ada".to_owned())) })
//!         .await?;
//!     assert_eq!(name.as_deref().map(String::as_str), Some("Ada"));
//! }
//!
//! listener.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod config;
mod error;
mod layered_cache;
mod listener;
mod manager;
mod memory_store;
mod message;
mod store;

pub use config::{CacheConfig, DEFAULT_INVALIDATION_CHANNEL, LocalCacheConfig};
pub use error::{BoxError, CacheError};
pub use layered_cache::{Cacheable, LayeredCache};
pub use listener::{InvalidationListener, ListenerHandle};
pub use manager::CacheManager;
pub use memory_store::MemoryStore;
pub use message::InvalidationMessage;
pub use store::{PayloadStream, RedisStore, SharedStore};

// Re-export async_trait for convenience
pub use async_trait::async_trait;
