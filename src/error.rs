//! Cache error types

use redis::RedisError;

/// Boxed error returned by value loaders.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Cache-related errors
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Redis error: {0}")]
    Redis(#[from] RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Loader error: {0}")]
    Loader(BoxError),

    #[error("Shared store error: {0}")]
    Store(String),

    #[error("Cache '{cache_name}' is configured to not allow null values")]
    NullValueNotAllowed { cache_name: String },
}
