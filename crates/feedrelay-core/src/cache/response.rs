//! Typed façade over the cache backend.
//!
//! Transports never touch the backend directly: the façade computes
//! fingerprints, stamps timestamps, applies the endpoint TTL policy and
//! keeps the cache metric series current. Writes may arrive concurrently
//! from several transports; the last writer wins per fingerprint.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::{CacheBackend, CacheEntry};
use crate::clock::epoch_ms;
use crate::fingerprint::{Fingerprint, FingerprintScope};
use crate::metrics::Metrics;
use crate::request::ProviderResult;
use crate::EngineError;

pub struct ResponseCache {
    backend: Arc<dyn CacheBackend>,
    metrics: Arc<Metrics>,
    max_age: Duration,
}

impl ResponseCache {
    pub fn new(backend: Arc<dyn CacheBackend>, metrics: Arc<Metrics>, max_age: Duration) -> Self {
        Self {
            backend,
            metrics,
            max_age,
        }
    }

    pub const fn max_age(&self) -> Duration {
        self.max_age
    }

    /// Store one entry per provider result, keyed by the result's
    /// parameter fingerprint.
    pub async fn write(
        &self,
        scope: &FingerprintScope,
        results: &[ProviderResult],
        stream_established: Option<u64>,
    ) -> Result<(), EngineError> {
        for result in results {
            let fingerprint = scope.fingerprint(&result.params);
            let now = epoch_ms();
            let entry = CacheEntry {
                result: result.result.clone(),
                data: result.data.clone(),
                status_code: result.status_code,
                written_at: now,
                max_age_ms: self.max_age.as_millis().min(u128::from(u64::MAX)) as u64,
                provider_data_received: now,
                provider_data_stream_established: stream_established,
                provider_indicated_time: result.provider_indicated_time,
            };

            self.backend
                .set(fingerprint.as_str(), entry, self.max_age)
                .await?;

            self.metrics
                .cache_data_set_count
                .with_label_values(&[&scope.endpoint, &scope.transport])
                .inc();
        }

        debug!(
            endpoint = %scope.endpoint,
            transport = %scope.transport,
            count = results.len(),
            "wrote provider results to response cache"
        );
        Ok(())
    }

    /// Latest entry for a fingerprint; expired entries report as misses.
    pub async fn read(
        &self,
        scope: &FingerprintScope,
        fingerprint: &Fingerprint,
    ) -> Result<Option<CacheEntry>, EngineError> {
        let found = self.backend.get(fingerprint.as_str()).await?;
        let now = epoch_ms();

        let live = match found {
            Some(entry) if entry.is_expired(now) => None,
            other => other,
        };

        let outcome = if live.is_some() { "hit" } else { "miss" };
        self.metrics
            .cache_data_get_count
            .with_label_values(&[&scope.endpoint, &scope.transport, outcome])
            .inc();

        if let Some(entry) = &live {
            let cache_staleness = now.saturating_sub(entry.written_at) as f64 / 1_000.0;
            self.metrics
                .cache_data_staleness_seconds
                .with_label_values(&[&scope.endpoint, &scope.transport])
                .set(cache_staleness);

            if let Some(indicated) = entry.provider_indicated_time {
                let total_staleness = now.saturating_sub(indicated) as f64 / 1_000.0;
                self.metrics
                    .total_data_staleness_seconds
                    .with_label_values(&[&scope.endpoint, &scope.transport])
                    .set(total_staleness);
            }
        }

        Ok(live)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::LocalCache;
    use serde_json::json;

    fn response_cache(max_age: Duration) -> ResponseCache {
        ResponseCache::new(
            Arc::new(LocalCache::new(16)),
            Arc::new(Metrics::new("test").expect("metrics must build")),
            max_age,
        )
    }

    fn scope() -> FingerprintScope {
        FingerprintScope::new("test", "price", "rest")
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let cache = response_cache(Duration::from_secs(60));
        let params = json!({ "base": "ETH" });
        let results = vec![ProviderResult::new(params.clone(), json!(1234.5))];

        cache
            .write(&scope(), &results, None)
            .await
            .expect("write must succeed");

        let fingerprint = scope().fingerprint(&params);
        let entry = cache
            .read(&scope(), &fingerprint)
            .await
            .expect("read must succeed")
            .expect("must hit");

        assert_eq!(entry.result, json!(1234.5));
        assert_eq!(entry.status_code, 200);
        assert!(entry.provider_data_received > 0);
    }

    #[tokio::test]
    async fn expired_entries_read_as_misses() {
        let cache = response_cache(Duration::from_millis(25));
        let params = json!({ "base": "ETH" });
        cache
            .write(
                &scope(),
                &[ProviderResult::new(params.clone(), json!(1.0))],
                None,
            )
            .await
            .expect("write must succeed");

        tokio::time::sleep(Duration::from_millis(60)).await;

        let fingerprint = scope().fingerprint(&params);
        let miss = cache
            .read(&scope(), &fingerprint)
            .await
            .expect("read must succeed");
        assert!(miss.is_none());
    }

    #[tokio::test]
    async fn last_writer_wins_per_fingerprint() {
        let cache = response_cache(Duration::from_secs(60));
        let params = json!({ "base": "ETH" });

        for value in [1.0, 2.0, 3.0] {
            cache
                .write(
                    &scope(),
                    &[ProviderResult::new(params.clone(), json!(value))],
                    None,
                )
                .await
                .expect("write must succeed");
        }

        let fingerprint = scope().fingerprint(&params);
        let entry = cache
            .read(&scope(), &fingerprint)
            .await
            .expect("read must succeed")
            .expect("must hit");
        assert_eq!(entry.result, json!(3.0));
    }

    #[tokio::test]
    async fn stream_established_timestamp_is_preserved() {
        let cache = response_cache(Duration::from_secs(60));
        let params = json!({ "base": "ETH" });
        cache
            .write(
                &scope(),
                &[ProviderResult::new(params.clone(), json!(9.0))
                    .with_provider_indicated_time(1_700_000_000_000)],
                Some(1_700_000_000_500),
            )
            .await
            .expect("write must succeed");

        let fingerprint = scope().fingerprint(&params);
        let entry = cache
            .read(&scope(), &fingerprint)
            .await
            .expect("read must succeed")
            .expect("must hit");

        assert_eq!(
            entry.provider_data_stream_established,
            Some(1_700_000_000_500)
        );
        assert_eq!(entry.provider_indicated_time, Some(1_700_000_000_000));
    }
}
