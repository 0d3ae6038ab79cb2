//! Streaming transport core.
//!
//! Each background tick reads the desired subscription set, diffs it
//! against the last known provider-side state and hands the deltas to a
//! stream handler. The WebSocket transport is the main specialization.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use super::{SharedDeps, Transport, TransportDeps};
use crate::request::{AdapterRequest, AdapterResponse};
use crate::subscription::SubscriptionEntry;
use crate::EngineError;

/// Subscription changes for one tick, keyed by subscription key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubscriptionDeltas {
    /// Desired but not yet active provider-side.
    pub new: Vec<SubscriptionEntry>,
    /// Active provider-side but no longer desired.
    pub stale: Vec<SubscriptionEntry>,
    /// The full desired set this tick.
    pub desired: Vec<SubscriptionEntry>,
}

/// What a tick left active provider-side.
#[derive(Debug, Clone, PartialEq)]
pub struct TickReport {
    pub active: Vec<SubscriptionEntry>,
}

impl TickReport {
    pub fn all_desired(deltas: &SubscriptionDeltas) -> Self {
        Self {
            active: deltas.desired.clone(),
        }
    }

    pub fn none() -> Self {
        Self { active: Vec::new() }
    }
}

/// Provider driver invoked with each tick's deltas.
#[async_trait]
pub trait StreamHandler: Send + Sync + 'static {
    async fn on_tick(
        &self,
        deps: &TransportDeps,
        deltas: SubscriptionDeltas,
    ) -> Result<TickReport, EngineError>;

    /// Tear down provider-side state when the adapter stops.
    async fn on_shutdown(&self, _deps: &TransportDeps) {}
}

/// Transport that keeps a provider stream aligned with the subscription
/// set.
pub struct StreamingTransport<H: StreamHandler> {
    handler: H,
    shared: SharedDeps,
    last_known: Mutex<BTreeMap<String, SubscriptionEntry>>,
}

impl<H: StreamHandler> StreamingTransport<H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            shared: SharedDeps::unset(),
            last_known: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }
}

/// Cache read that degrades to a miss when the backend is unavailable,
/// so one store outage does not fail the request outright.
pub(crate) async fn read_degraded(
    deps: &TransportDeps,
    fingerprint: &crate::fingerprint::Fingerprint,
) -> Result<Option<crate::cache::CacheEntry>, EngineError> {
    match deps.response_cache.read(&deps.scope, fingerprint).await {
        Ok(found) => Ok(found),
        Err(EngineError::CacheUnavailable(reason)) => {
            tracing::warn!(
                endpoint = %deps.scope.endpoint,
                %reason,
                "cache unavailable, degrading request to no-cache"
            );
            Ok(None)
        }
        Err(other) => Err(other),
    }
}

/// Diff the desired set against the last known provider-side state.
///
/// Invariant: `(new ∪ last_known) \ stale = desired`, comparing by
/// subscription key.
pub(crate) fn compute_deltas(
    last_known: &BTreeMap<String, SubscriptionEntry>,
    desired: Vec<SubscriptionEntry>,
) -> SubscriptionDeltas {
    let new = desired
        .iter()
        .filter(|entry| !last_known.contains_key(&entry.key))
        .cloned()
        .collect();

    let stale = last_known
        .values()
        .filter(|entry| !desired.iter().any(|wanted| wanted.key == entry.key))
        .cloned()
        .collect();

    SubscriptionDeltas {
        new,
        stale,
        desired,
    }
}

#[async_trait]
impl<H: StreamHandler> Transport for StreamingTransport<H> {
    fn kind(&self) -> super::TransportKind {
        super::TransportKind::Streaming
    }

    async fn initialize(&self, deps: TransportDeps) -> Result<(), EngineError> {
        self.shared.install(deps);
        Ok(())
    }

    async fn foreground_execute(
        &self,
        request: &AdapterRequest,
    ) -> Result<Option<AdapterResponse>, EngineError> {
        let deps = self.shared.get()?;
        let params = Value::Object(request.data.params.clone());
        let fingerprint = deps.scope.fingerprint(&params);

        if let Some(entry) = read_degraded(deps, &fingerprint).await? {
            return Ok(Some(entry.into_response()));
        }

        // First sight of these parameters: register interest so the
        // background loop starts feeding the cache, then wait for the
        // first value until the request deadline.
        let key = deps.scope.subscription_key(&params);
        deps.subscriptions
            .add(&key, params.clone(), deps.config.ws_subscription_ttl)
            .await?;

        let deadline = tokio::time::Instant::now() + deps.config.api_timeout;
        let poll_interval = Duration::from_millis(200);

        loop {
            tokio::time::sleep(poll_interval.min(deps.config.api_timeout)).await;

            if let Some(entry) = read_degraded(deps, &fingerprint).await? {
                return Ok(Some(entry.into_response()));
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
        }
    }

    async fn background_execute(&self) -> Result<(), EngineError> {
        let deps = self.shared.get()?;

        let tick_result = async {
            let desired = deps.subscriptions.get_all().await?;
            let deltas = {
                let last_known = self.last_known.lock().await;
                compute_deltas(&last_known, desired)
            };

            debug!(
                endpoint = %deps.scope.endpoint,
                new = deltas.new.len(),
                stale = deltas.stale.len(),
                desired = deltas.desired.len(),
                "streaming tick"
            );

            self.handler.on_tick(deps, deltas).await
        }
        .await;

        {
            let mut last_known = self.last_known.lock().await;
            match &tick_result {
                Ok(report) => {
                    *last_known = report
                        .active
                        .iter()
                        .map(|entry| (entry.key.clone(), entry.clone()))
                        .collect();
                }
                // On a failed tick assume nothing survived provider-side;
                // the next tick then re-issues every subscription.
                Err(_) => last_known.clear(),
            }
        }

        // Cadence sleep doubles as the retry floor after failures.
        tokio::time::sleep(deps.tick_interval).await;

        tick_result.map(|_| ())
    }

    async fn shutdown(&self) {
        if let Ok(deps) = self.shared.get() {
            self.handler.on_shutdown(deps).await;
        }
        self.last_known.lock().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn entry(key: &str) -> SubscriptionEntry {
        SubscriptionEntry {
            key: key.to_owned(),
            params: json!({ "pair": key }),
            expires_at: u64::MAX,
        }
    }

    fn known(keys: &[&str]) -> BTreeMap<String, SubscriptionEntry> {
        keys.iter()
            .map(|key| ((*key).to_owned(), entry(key)))
            .collect()
    }

    fn keys(entries: &[SubscriptionEntry]) -> Vec<&str> {
        entries.iter().map(|entry| entry.key.as_str()).collect()
    }

    #[test]
    fn deltas_split_new_and_stale() {
        let deltas = compute_deltas(&known(&["a", "b"]), vec![entry("b"), entry("c")]);

        assert_eq!(keys(&deltas.new), vec!["c"]);
        assert_eq!(keys(&deltas.stale), vec!["a"]);
        assert_eq!(keys(&deltas.desired), vec!["b", "c"]);
    }

    #[test]
    fn empty_last_known_makes_everything_new() {
        let deltas = compute_deltas(&BTreeMap::new(), vec![entry("x"), entry("y")]);
        assert_eq!(keys(&deltas.new), vec!["x", "y"]);
        assert!(deltas.stale.is_empty());
    }

    #[test]
    fn empty_desired_makes_everything_stale() {
        let deltas = compute_deltas(&known(&["x", "y"]), Vec::new());
        assert!(deltas.new.is_empty());
        assert_eq!(keys(&deltas.stale), vec!["x", "y"]);
    }

    #[test]
    fn union_minus_stale_equals_desired() {
        // (new ∪ last_known) \ stale = desired, for a few shapes.
        let cases: Vec<(Vec<&str>, Vec<&str>)> = vec![
            (vec!["a", "b"], vec!["b", "c"]),
            (vec![], vec!["a"]),
            (vec!["a"], vec![]),
            (vec!["a", "b", "c"], vec!["a", "b", "c"]),
        ];

        for (last, wanted) in cases {
            let last_known = known(&last);
            let desired: Vec<_> = wanted.iter().map(|key| entry(key)).collect();
            let deltas = compute_deltas(&last_known, desired);

            let mut reconstructed: Vec<String> = deltas
                .new
                .iter()
                .map(|entry| entry.key.clone())
                .chain(last_known.keys().cloned())
                .filter(|key| !deltas.stale.iter().any(|stale| &stale.key == key))
                .collect();
            reconstructed.sort();
            reconstructed.dedup();

            let mut expected: Vec<String> =
                wanted.iter().map(|key| (*key).to_owned()).collect();
            expected.sort();

            assert_eq!(reconstructed, expected, "case {last:?} -> {wanted:?}");
        }
    }
}
