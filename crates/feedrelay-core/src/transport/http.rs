//! Batched HTTP polling transport.
//!
//! Each background tick reads the desired subscription set, groups it
//! into provider-sized batches and issues the batch requests through a
//! bounded worker pool. Foreground misses perform one inline fetch so the
//! first request for a parameter tuple is answered synchronously.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use serde_json::Value;
use tracing::{debug, warn};

use super::{SharedDeps, Transport, TransportDeps};
use crate::http_client::{HttpClient, ProviderHttpRequest, ProviderHttpResponse};
use crate::request::{AdapterRequest, AdapterResponse, ProviderResult, ResponseTimestamps};
use crate::EngineError;

/// Endpoint-specific polling behavior.
pub trait HttpPollingHandler: Send + Sync + 'static {
    /// How many parameter tuples one provider request may carry.
    fn max_batch_size(&self) -> usize {
        1
    }

    /// Build the provider request for one batch of parameter tuples.
    fn build_request(&self, group: &[Value]) -> Result<ProviderHttpRequest, EngineError>;

    /// Map a provider response back onto the batch's parameter tuples.
    fn parse_response(
        &self,
        group: &[Value],
        response: &ProviderHttpResponse,
    ) -> Result<Vec<ProviderResult>, EngineError>;
}

pub struct HttpTransport<H: HttpPollingHandler> {
    handler: Arc<H>,
    client: Arc<dyn HttpClient>,
    shared: SharedDeps,
}

impl<H: HttpPollingHandler> HttpTransport<H> {
    pub fn new(handler: H, client: Arc<dyn HttpClient>) -> Self {
        Self {
            handler: Arc::new(handler),
            client,
            shared: SharedDeps::unset(),
        }
    }

    async fn fetch_group(
        &self,
        group: &[Value],
        timeout_cap: std::time::Duration,
    ) -> Result<Vec<ProviderResult>, EngineError> {
        let mut request = self.handler.build_request(group)?;
        request.timeout = request.timeout.min(timeout_cap);
        let response = self.client.execute(request).await?;

        if !response.is_success() {
            return Err(EngineError::upstream(
                format!("provider answered with status {}", response.status),
                Some(response.status),
            ));
        }

        self.handler.parse_response(group, &response)
    }
}

#[async_trait]
impl<H: HttpPollingHandler> Transport for HttpTransport<H> {
    fn kind(&self) -> super::TransportKind {
        super::TransportKind::Polling
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

        if let Some(entry) = super::streaming::read_degraded(deps, &fingerprint).await? {
            return Ok(Some(entry.into_response()));
        }

        // Register interest so the background loop keeps this tuple warm
        // from now on. A degraded subscription store is logged and
        // skipped: the inline fetch below still answers the caller.
        let key = deps.scope.subscription_key(&params);
        if let Err(err) = deps
            .subscriptions
            .add(&key, params.clone(), deps.config.ws_subscription_ttl)
            .await
        {
            warn!(endpoint = %deps.scope.endpoint, %err, "could not register subscription");
        }

        // First sight: fetch inline rather than making the caller wait
        // for a background tick.
        let group = vec![params.clone()];
        let results = self.fetch_group(&group, deps.config.api_timeout).await?;

        if let Err(err) = deps.response_cache.write(&deps.scope, &results, None).await {
            // Degrade to no-cache for this request.
            warn!(endpoint = %deps.scope.endpoint, %err, "inline fetch could not be cached");
        }

        let answer = results
            .into_iter()
            .find(|result| deps.scope.fingerprint(&result.params) == fingerprint);

        match answer {
            Some(result) => Ok(Some(AdapterResponse {
                result: result.result,
                data: result.data,
                status_code: result.status_code,
                timestamps: ResponseTimestamps {
                    provider_data_received: crate::clock::epoch_ms(),
                    provider_data_stream_established: None,
                    provider_indicated_time: result.provider_indicated_time,
                },
                cached: false,
            })),
            None => {
                warn!(
                    endpoint = %deps.scope.endpoint,
                    "inline fetch returned no value for the requested parameters"
                );
                Ok(None)
            }
        }
    }

    async fn background_execute(&self) -> Result<(), EngineError> {
        let deps = self.shared.get()?;
        let started = Instant::now();

        let desired = deps.subscriptions.get_all().await?;
        if !desired.is_empty() {
            let batch_size = self.handler.max_batch_size().max(1);
            let groups: Vec<Vec<Value>> = desired
                .chunks(batch_size)
                .map(|chunk| chunk.iter().map(|entry| entry.params.clone()).collect())
                .collect();

            debug!(
                endpoint = %deps.scope.endpoint,
                subscriptions = desired.len(),
                batches = groups.len(),
                "polling tick"
            );

            let outcomes: Vec<(usize, Result<Vec<ProviderResult>, EngineError>)> =
                stream::iter(groups.into_iter().map(|group| async move {
                    let outcome = self.fetch_group(&group, deps.config.api_timeout).await;
                    (group.len(), outcome)
                }))
                .buffer_unordered(deps.config.requester_queue_size)
                .collect()
                .await;

            for (group_len, outcome) in outcomes {
                match outcome {
                    Ok(results) => {
                        if let Err(err) =
                            deps.response_cache.write(&deps.scope, &results, None).await
                        {
                            warn!(endpoint = %deps.scope.endpoint, %err, "poll results could not be cached");
                        }
                    }
                    Err(err) => {
                        // A failed batch marks its members errored but
                        // never evicts what is already cached.
                        warn!(endpoint = %deps.scope.endpoint, %err, "poll batch failed");
                        deps.metrics
                            .transport_polling_failure_count
                            .with_label_values(&[&deps.scope.endpoint])
                            .inc_by(group_len as u64);
                    }
                }
            }
        }

        deps.metrics
            .transport_polling_duration_seconds
            .with_label_values(&[&deps.scope.endpoint])
            .observe(started.elapsed().as_secs_f64());

        tokio::time::sleep(deps.tick_interval).await;
        Ok(())
    }
}
