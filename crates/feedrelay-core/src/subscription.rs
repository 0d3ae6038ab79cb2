//! Expiring subscription sets.
//!
//! Each transport keeps the parameter tuples the background loop should
//! keep fresh. Entries carry an absolute expiry; expired entries are
//! invisible to readers. The local backend bounds its size with FIFO
//! eviction; the Redis backend stores members in a sorted set scored by
//! expiry.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use serde_json::Value;
use tracing::warn;

use crate::clock::epoch_ms;
use crate::EngineError;

/// Delimiter between the subscription key and its JSON payload in the
/// Redis sorted-set member encoding. Fixed and unescaped: keys must not
/// contain it, enforced on `add`.
pub const MEMBER_DELIMITER: char = '>';

/// One registered parameter tuple.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionEntry {
    pub key: String,
    pub params: Value,
    pub expires_at: u64,
}

/// Set of parameter tuples one transport should keep fresh.
#[async_trait]
pub trait SubscriptionSet: Send + Sync {
    /// Register `params` under `key` for `ttl`. Re-adding an existing key
    /// refreshes its expiry in place.
    async fn add(&self, key: &str, params: Value, ttl: Duration) -> Result<(), EngineError>;

    /// Live entry for `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<Value>, EngineError>;

    /// All live entries, oldest first on the local backend.
    async fn get_all(&self) -> Result<Vec<SubscriptionEntry>, EngineError>;
}

fn reject_delimiter(key: &str) -> Result<(), EngineError> {
    if key.contains(MEMBER_DELIMITER) {
        return Err(EngineError::invalid_input(format!(
            "subscription key must not contain '{MEMBER_DELIMITER}': '{key}'"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Local backend
// ---------------------------------------------------------------------------

struct StoredSubscription {
    params: Value,
    expires_at: u64,
}

struct LocalInner {
    order: VecDeque<String>,
    entries: HashMap<String, StoredSubscription>,
}

impl LocalInner {
    fn prune_expired(&mut self, now: u64) {
        if self.entries.is_empty() {
            return;
        }
        self.entries.retain(|_, stored| stored.expires_at >= now);
        self.order.retain(|key| self.entries.contains_key(key));
    }
}

/// In-process subscription set bounded by `CACHE_MAX_SUBSCRIPTIONS`.
///
/// On overflow the oldest entry by insertion order is evicted.
pub struct LocalSubscriptionSet {
    inner: tokio::sync::Mutex<LocalInner>,
    capacity: usize,
}

impl LocalSubscriptionSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: tokio::sync::Mutex::new(LocalInner {
                order: VecDeque::new(),
                entries: HashMap::new(),
            }),
            capacity: capacity.max(1),
        }
    }
}

#[async_trait]
impl SubscriptionSet for LocalSubscriptionSet {
    async fn add(&self, key: &str, params: Value, ttl: Duration) -> Result<(), EngineError> {
        reject_delimiter(key)?;

        let mut inner = self.inner.lock().await;
        let now = epoch_ms();
        inner.prune_expired(now);

        let expires_at = now.saturating_add(ttl.as_millis().min(u128::from(u64::MAX)) as u64);

        if let Some(stored) = inner.entries.get_mut(key) {
            // Duplicate key: refresh TTL, keep insertion position.
            stored.expires_at = expires_at;
            stored.params = params;
            return Ok(());
        }

        while inner.entries.len() >= self.capacity {
            match inner.order.pop_front() {
                Some(oldest) => {
                    inner.entries.remove(&oldest);
                }
                None => break,
            }
        }

        inner.order.push_back(key.to_owned());
        inner
            .entries
            .insert(key.to_owned(), StoredSubscription { params, expires_at });
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Value>, EngineError> {
        let inner = self.inner.lock().await;
        let now = epoch_ms();

        Ok(inner
            .entries
            .get(key)
            .filter(|stored| stored.expires_at >= now)
            .map(|stored| stored.params.clone()))
    }

    async fn get_all(&self) -> Result<Vec<SubscriptionEntry>, EngineError> {
        let mut inner = self.inner.lock().await;
        let now = epoch_ms();
        inner.prune_expired(now);

        let mut live = Vec::with_capacity(inner.entries.len());
        for key in &inner.order {
            if let Some(stored) = inner.entries.get(key) {
                live.push(SubscriptionEntry {
                    key: key.clone(),
                    params: stored.params.clone(),
                    expires_at: stored.expires_at,
                });
            }
        }
        Ok(live)
    }
}

// ---------------------------------------------------------------------------
// Redis backend
// ---------------------------------------------------------------------------

/// Encode one sorted-set member: `key '>' JSON(params)`.
pub fn encode_member(key: &str, params: &Value) -> Result<String, EngineError> {
    reject_delimiter(key)?;
    let payload =
        serde_json::to_string(params).map_err(|error| EngineError::internal(error.to_string()))?;
    Ok(format!("{key}{MEMBER_DELIMITER}{payload}"))
}

/// Decode a sorted-set member back into `(key, params)`.
pub fn decode_member(member: &str) -> Option<(String, Value)> {
    let (key, payload) = member.split_once(MEMBER_DELIMITER)?;
    let params = serde_json::from_str(payload).ok()?;
    Some((key.to_owned(), params))
}

/// Subscription set in a Redis sorted set, score = expiry epoch ms.
pub struct RedisSubscriptionSet {
    connection: ConnectionManager,
    set_key: String,
}

impl RedisSubscriptionSet {
    pub fn new(
        connection: ConnectionManager,
        adapter_name: &str,
        endpoint_name: &str,
        transport_name: &str,
    ) -> Self {
        Self {
            connection,
            set_key: format!("{adapter_name}:subscriptions:{endpoint_name}:{transport_name}"),
        }
    }

    async fn live_members(&self) -> Result<Vec<String>, EngineError> {
        let now = epoch_ms();
        let mut connection = self.connection.clone();

        // Prune first so reads stay O(live entries).
        let _: u64 = redis::cmd("ZREMRANGEBYSCORE")
            .arg(&self.set_key)
            .arg("-inf")
            .arg(format!("({now}"))
            .query_async(&mut connection)
            .await
            .map_err(unavailable)?;

        redis::cmd("ZRANGEBYSCORE")
            .arg(&self.set_key)
            .arg(now)
            .arg("+inf")
            .query_async(&mut connection)
            .await
            .map_err(unavailable)
    }
}

#[async_trait]
impl SubscriptionSet for RedisSubscriptionSet {
    async fn add(&self, key: &str, params: Value, ttl: Duration) -> Result<(), EngineError> {
        let member = encode_member(key, &params)?;
        let expires_at =
            epoch_ms().saturating_add(ttl.as_millis().min(u128::from(u64::MAX)) as u64);

        let mut connection = self.connection.clone();
        let _: u64 = redis::cmd("ZADD")
            .arg(&self.set_key)
            .arg(expires_at)
            .arg(member)
            .query_async(&mut connection)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Value>, EngineError> {
        let needle = format!("{key}{MEMBER_DELIMITER}");
        let members = self.live_members().await?;

        Ok(members
            .iter()
            .find(|member| member.starts_with(&needle))
            .and_then(|member| decode_member(member))
            .map(|(_, params)| params))
    }

    async fn get_all(&self) -> Result<Vec<SubscriptionEntry>, EngineError> {
        let members = self.live_members().await?;

        let mut live = Vec::with_capacity(members.len());
        for member in members {
            match decode_member(&member) {
                Some((key, params)) => live.push(SubscriptionEntry {
                    key,
                    params,
                    // The store already dropped expired members; readers
                    // only need a lower bound here.
                    expires_at: epoch_ms(),
                }),
                None => warn!(%member, "skipping undecodable subscription member"),
            }
        }
        Ok(live)
    }
}

fn unavailable(error: redis::RedisError) -> EngineError {
    EngineError::CacheUnavailable(error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn overflow_evicts_oldest_by_insertion_order() {
        let set = LocalSubscriptionSet::new(3);
        for index in 1..=4 {
            set.add(&index.to_string(), json!(index), Duration::from_secs(600))
                .await
                .expect("add must succeed");
        }

        assert_eq!(set.get("1").await.expect("get"), None);
        assert_eq!(set.get("2").await.expect("get"), Some(json!(2)));
        assert_eq!(set.get("3").await.expect("get"), Some(json!(3)));
        assert_eq!(set.get("4").await.expect("get"), Some(json!(4)));

        let all: Vec<Value> = set
            .get_all()
            .await
            .expect("get_all")
            .into_iter()
            .map(|entry| entry.params)
            .collect();
        assert_eq!(all, vec![json!(2), json!(3), json!(4)]);
    }

    #[tokio::test]
    async fn duplicate_add_refreshes_ttl_without_moving_position() {
        let set = LocalSubscriptionSet::new(8);
        set.add("a", json!("a"), Duration::from_secs(600))
            .await
            .expect("add");
        set.add("b", json!("b"), Duration::from_secs(600))
            .await
            .expect("add");
        set.add("a", json!("a"), Duration::from_secs(600))
            .await
            .expect("re-add");

        let keys: Vec<String> = set
            .get_all()
            .await
            .expect("get_all")
            .into_iter()
            .map(|entry| entry.key)
            .collect();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn expired_entries_are_invisible() {
        let set = LocalSubscriptionSet::new(8);
        set.add("fast", json!(1), Duration::from_millis(20))
            .await
            .expect("add");
        set.add("slow", json!(2), Duration::from_secs(600))
            .await
            .expect("add");

        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(set.get("fast").await.expect("get"), None);
        let all = set.get_all().await.expect("get_all");
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].key, "slow");
    }

    #[tokio::test]
    async fn keys_containing_the_delimiter_are_rejected() {
        let set = LocalSubscriptionSet::new(8);
        let error = set
            .add("bad>key", json!(1), Duration::from_secs(600))
            .await
            .expect_err("must reject");
        assert!(matches!(error, EngineError::InvalidInput(_)));
    }

    #[test]
    fn member_encoding_round_trips() {
        let params = json!({ "base": "ETH", "quote": "USD" });
        let member = encode_member("eth-usd", &params).expect("encode must succeed");

        let (key, decoded) = decode_member(&member).expect("decode must succeed");
        assert_eq!(key, "eth-usd");
        assert_eq!(decoded, params);
        assert_eq!(
            encode_member(&key, &decoded).expect("re-encode must succeed"),
            member
        );
    }

    #[test]
    fn encode_rejects_delimiter_in_key() {
        let error = encode_member("a>b", &json!(1)).expect_err("must reject");
        assert!(matches!(error, EngineError::InvalidInput(_)));
    }
}
