//! Invalidation messages broadcast on the pub/sub channel
//!
//! Wire format is JSON: `{"cacheName": "users", "key": "42"}`. A `null` (or missing)
//! key means the whole namespace is dropped from every local cache.

use serde::{Deserialize, Serialize};

use crate::CacheError;

/// Instruction for peer instances to drop local (L1) entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "WireMessage", into = "WireMessage")]
pub enum InvalidationMessage {
    /// Drop one key from the named cache
    EvictOne { cache_name: String, key: String },
    /// Drop every entry of the named cache
    EvictAll { cache_name: String },
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMessage {
    cache_name: String,
    #[serde(default)]
    key: Option<String>,
}

impl From<WireMessage> for InvalidationMessage {
    fn from(wire: WireMessage) -> Self {
        match wire.key {
            Some(key) => Self::EvictOne {
                cache_name: wire.cache_name,
                key,
            },
            None => Self::EvictAll {
                cache_name: wire.cache_name,
            },
        }
    }
}

impl From<InvalidationMessage> for WireMessage {
    fn from(msg: InvalidationMessage) -> Self {
        match msg {
            InvalidationMessage::EvictOne { cache_name, key } => Self {
                cache_name,
                key: Some(key),
            },
            InvalidationMessage::EvictAll { cache_name } => Self {
                cache_name,
                key: None,
            },
        }
    }
}

impl InvalidationMessage {
    /// Name of the cache this message targets
    pub fn cache_name(&self) -> &str {
        match self {
            Self::EvictOne { cache_name, .. } | Self::EvictAll { cache_name } => cache_name,
        }
    }

    /// The key to drop, or `None` for the whole namespace
    pub fn key(&self) -> Option<&str> {
        match self {
            Self::EvictOne { key, .. } => Some(key),
            Self::EvictAll { .. } => None,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, CacheError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(payload: &[u8]) -> Result<Self, CacheError> {
        Ok(serde_json::from_slice(payload)?)
    }
}
