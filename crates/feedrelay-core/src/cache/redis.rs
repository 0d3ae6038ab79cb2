//! Redis-backed cache: keys namespaced by adapter name, TTL honored by
//! the store natively.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tracing::warn;

use super::{CacheBackend, CacheEntry};
use crate::EngineError;

pub struct RedisCache {
    connection: ConnectionManager,
    namespace: String,
}

impl RedisCache {
    /// Connect to the store at `url`. Keys are written under
    /// `"{adapter}:cache:"`.
    pub async fn connect(url: &str, adapter_name: &str) -> Result<Self, EngineError> {
        let client = redis::Client::open(url).map_err(unavailable)?;
        let connection = client
            .get_connection_manager()
            .await
            .map_err(unavailable)?;
        Ok(Self::from_manager(connection, adapter_name))
    }

    /// Reuse an established connection manager, as the adapter does when
    /// cache and subscription sets share one store.
    pub fn from_manager(connection: ConnectionManager, adapter_name: &str) -> Self {
        Self {
            connection,
            namespace: format!("{adapter_name}:cache:"),
        }
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}{key}", self.namespace)
    }
}

#[async_trait]
impl CacheBackend for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, EngineError> {
        let mut connection = self.connection.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(self.namespaced(key))
            .query_async(&mut connection)
            .await
            .map_err(unavailable)?;

        match raw {
            Some(payload) => match serde_json::from_str(&payload) {
                Ok(entry) => Ok(Some(entry)),
                Err(error) => {
                    // A corrupt entry is treated as a miss rather than an
                    // outage; the next write repairs it.
                    warn!(key, %error, "discarding undecodable cache entry");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, entry: CacheEntry, ttl: Duration) -> Result<(), EngineError> {
        let payload = serde_json::to_string(&entry)
            .map_err(|error| EngineError::internal(error.to_string()))?;
        let ttl_ms = ttl.as_millis().max(1).min(u128::from(u64::MAX)) as u64;

        let mut connection = self.connection.clone();
        let _: () = redis::cmd("SET")
            .arg(self.namespaced(key))
            .arg(payload)
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut connection)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), EngineError> {
        let mut connection = self.connection.clone();
        let _: () = redis::cmd("DEL")
            .arg(self.namespaced(key))
            .query_async(&mut connection)
            .await
            .map_err(unavailable)?;
        Ok(())
    }
}

fn unavailable(error: redis::RedisError) -> EngineError {
    EngineError::CacheUnavailable(error.to_string())
}
