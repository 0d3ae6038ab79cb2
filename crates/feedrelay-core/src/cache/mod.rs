//! Response cache backends.
//!
//! The engine stores the latest provider value per fingerprint. Two
//! backends exist: an in-process LRU with TTL and a Redis-backed store
//! namespaced by adapter name. A miss is never an error; backend failures
//! surface [`EngineError::CacheUnavailable`].

mod local;
mod redis;
mod response;

pub use local::LocalCache;
pub use redis::RedisCache;
pub use response::ResponseCache;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::request::{AdapterResponse, ResponseTimestamps};
use crate::EngineError;

/// One cached provider value.
///
/// Expiry is `written_at + max_age`; `written_at` drives eviction while
/// `provider_indicated_time` only feeds total-staleness metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub result: Value,
    pub data: Value,
    pub status_code: u16,
    pub written_at: u64,
    pub max_age_ms: u64,
    pub provider_data_received: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_data_stream_established: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_indicated_time: Option<u64>,
}

impl CacheEntry {
    pub const fn expires_at(&self) -> u64 {
        self.written_at.saturating_add(self.max_age_ms)
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at()
    }

    /// Render the entry as a client response, flagged as served from
    /// cache.
    pub fn into_response(self) -> AdapterResponse {
        AdapterResponse {
            result: self.result,
            data: self.data,
            status_code: self.status_code,
            timestamps: ResponseTimestamps {
                provider_data_received: self.provider_data_received,
                provider_data_stream_established: self.provider_data_stream_established,
                provider_indicated_time: self.provider_indicated_time,
            },
            cached: true,
        }
    }
}

/// Backend contract shared by the local and Redis caches.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, EngineError>;
    async fn set(&self, key: &str, entry: CacheEntry, ttl: Duration) -> Result<(), EngineError>;
    async fn delete(&self, key: &str) -> Result<(), EngineError>;
}
