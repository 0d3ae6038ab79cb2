//! The adapter: endpoint registry, shared dependencies and the
//! background executor.
//!
//! `start` wires every transport of every endpoint with the shared cache
//! and its own subscription set, then spawns one long-lived loop per
//! transport. Ticks within one transport are serialized; across
//! transports no ordering is guaranteed. Shutdown signals a watch
//! channel, waits out a grace window and aborts stragglers.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::cache::{CacheBackend, LocalCache, RedisCache, ResponseCache};
use crate::config::{CacheKind, EngineConfig};
use crate::endpoint::AdapterEndpoint;
use crate::fingerprint::FingerprintScope;
use crate::metrics::Metrics;
use crate::rate_limit::CreditLimiter;
use crate::request::{AdapterRequest, AdapterResponse};
use crate::subscription::{LocalSubscriptionSet, RedisSubscriptionSet, SubscriptionSet};
use crate::transport::{TransportDeps, TransportKind};
use crate::{EngineError, SchemaError, StartupError};

/// Bound on the local response cache; the subscription-set bound is
/// configured separately via `CACHE_MAX_SUBSCRIPTIONS`.
const LOCAL_CACHE_CAPACITY: usize = 10_000;

pub struct AdapterBuilder {
    name: String,
    config: Option<EngineConfig>,
    endpoints: Vec<AdapterEndpoint>,
}

impl AdapterBuilder {
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_endpoint(mut self, endpoint: AdapterEndpoint) -> Self {
        self.endpoints.push(endpoint);
        self
    }

    /// Validate the registry and assemble the adapter. The registry is
    /// immutable from here on.
    pub fn build(self) -> Result<Adapter, StartupError> {
        let config = match self.config {
            Some(config) => config,
            None => EngineConfig::from_env()?,
        };

        let mut seen = HashSet::new();
        for endpoint in &self.endpoints {
            endpoint.ensure_routable()?;
            for name in std::iter::once(endpoint.name())
                .chain(endpoint.aliases().iter().map(String::as_str))
            {
                if !seen.insert(name.to_owned()) {
                    return Err(SchemaError::DuplicateEndpointAlias {
                        alias: name.to_owned(),
                    }
                    .into());
                }
            }
        }

        let metrics = Arc::new(Metrics::new(&self.name)?);

        let rate_limiter = config
            .rate_limit_capacity_minute
            .map(CreditLimiter::per_minute);

        let (shutdown_tx, _) = watch::channel(false);

        Ok(Adapter {
            name: self.name,
            config: Arc::new(config),
            metrics,
            endpoints: self.endpoints,
            rate_limiter,
            shutdown: shutdown_tx,
            tasks: tokio::sync::Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        })
    }
}

pub struct Adapter {
    name: String,
    config: Arc<EngineConfig>,
    metrics: Arc<Metrics>,
    endpoints: Vec<AdapterEndpoint>,
    rate_limiter: Option<CreditLimiter>,
    shutdown: watch::Sender<bool>,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl Adapter {
    pub fn builder(name: impl Into<String>) -> AdapterBuilder {
        AdapterBuilder {
            name: name.into(),
            config: None,
            endpoints: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Wire dependencies, initialize every transport and launch the
    /// background executor.
    pub async fn start(&self) -> Result<(), StartupError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let (backend, redis_connection): (
            Arc<dyn CacheBackend>,
            Option<redis::aio::ConnectionManager>,
        ) = match self.config.cache_type {
            CacheKind::Local => (Arc::new(LocalCache::new(LOCAL_CACHE_CAPACITY)), None),
            CacheKind::Redis => {
                let client = redis::Client::open(self.config.cache_redis_url.as_str())
                    .map_err(|err| EngineError::CacheUnavailable(err.to_string()))?;
                let connection = client
                    .get_connection_manager()
                    .await
                    .map_err(|err| EngineError::CacheUnavailable(err.to_string()))?;
                (
                    Arc::new(RedisCache::from_manager(connection.clone(), &self.name)),
                    Some(connection),
                )
            }
        };

        let response_cache = Arc::new(ResponseCache::new(
            backend,
            Arc::clone(&self.metrics),
            self.config.cache_max_age,
        ));

        let mut tasks = self.tasks.lock().await;
        for endpoint in &self.endpoints {
            for (transport_name, transport) in endpoint.transports() {
                let subscriptions: Arc<dyn SubscriptionSet> = match &redis_connection {
                    Some(connection) => Arc::new(RedisSubscriptionSet::new(
                        connection.clone(),
                        &self.name,
                        endpoint.name(),
                        transport_name,
                    )),
                    None => Arc::new(LocalSubscriptionSet::new(
                        self.config.cache_max_subscriptions,
                    )),
                };

                let mut scope = FingerprintScope::new(
                    self.name.as_str(),
                    endpoint.name(),
                    transport_name.as_str(),
                );
                if let Some(generator) = endpoint.cache_key_generator() {
                    scope = scope.with_generator(generator);
                }

                let tick_interval = match transport.kind() {
                    TransportKind::Streaming => self.config.background_execute_ms_ws,
                    TransportKind::Polling => self.config.background_execute_ms_http,
                };

                let deps = TransportDeps {
                    scope,
                    config: Arc::clone(&self.config),
                    metrics: Arc::clone(&self.metrics),
                    response_cache: Arc::clone(&response_cache),
                    subscriptions,
                    tick_interval,
                };

                transport.initialize(deps).await?;

                tasks.push(spawn_background_loop(
                    Arc::clone(transport),
                    Arc::clone(&self.metrics),
                    endpoint.name().to_owned(),
                    transport_name.clone(),
                    self.shutdown.subscribe(),
                ));
            }
        }

        info!(
            adapter = %self.name,
            endpoints = self.endpoints.len(),
            transports = tasks.len(),
            "adapter started"
        );
        Ok(())
    }

    /// Signal cancellation and wait for in-flight ticks, up to the
    /// configured grace window.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);

        let mut tasks = self.tasks.lock().await;
        let deadline = tokio::time::Instant::now() + self.config.shutdown_grace;

        for task in tasks.iter_mut() {
            if tokio::time::timeout_at(deadline, &mut *task).await.is_err() {
                warn!(adapter = %self.name, "grace window elapsed, aborting background task");
                task.abort();
            }
        }
        tasks.clear();

        for endpoint in &self.endpoints {
            for (_, transport) in endpoint.transports() {
                transport.shutdown().await;
            }
        }

        info!(adapter = %self.name, "adapter stopped");
    }

    /// Entry point for the public HTTP server: size check, parse, serve.
    pub async fn handle_raw(&self, body: &[u8]) -> Result<AdapterResponse, EngineError> {
        if body.len() > self.config.max_payload_size_limit {
            return Err(EngineError::PayloadTooLarge {
                limit_bytes: self.config.max_payload_size_limit,
            });
        }
        if body.is_empty() {
            return Err(EngineError::invalid_input("request body is empty"));
        }

        let request: AdapterRequest = serde_json::from_slice(body)
            .map_err(|err| EngineError::invalid_input(format!("malformed request: {err}")))?;
        self.handle(request).await
    }

    /// Serve one parsed request.
    pub async fn handle(&self, request: AdapterRequest) -> Result<AdapterResponse, EngineError> {
        let endpoint = self.resolve_endpoint(&request)?;
        let endpoint_name = endpoint.name().to_owned();

        if let Some(limiter) = &self.rate_limiter {
            match limiter.try_spend() {
                Ok(()) => {
                    self.metrics
                        .rate_limit_credits_spent_total
                        .with_label_values(&[&endpoint_name])
                        .inc();
                }
                Err(wait) => {
                    let error = EngineError::RateLimited {
                        retry_after_ms: wait.as_millis().min(u128::from(u64::MAX)) as u64,
                    };
                    self.observe_request(&endpoint_name, error.status_code(), None);
                    return Err(error);
                }
            }
        }

        let started = Instant::now();
        let outcome = endpoint.handle(request, &self.config).await;

        match &outcome {
            Ok(response) => {
                self.observe_request(&endpoint_name, response.status_code, Some(started.elapsed()));
            }
            Err(err) => {
                if err.status_code() >= 500 {
                    error!(adapter = %self.name, endpoint = %endpoint_name, %err, "request failed");
                }
                self.observe_request(&endpoint_name, err.status_code(), Some(started.elapsed()));
            }
        }

        outcome
    }

    fn resolve_endpoint(&self, request: &AdapterRequest) -> Result<&AdapterEndpoint, EngineError> {
        match request.data.endpoint.as_deref() {
            Some(name) => self
                .endpoints
                .iter()
                .find(|endpoint| endpoint.answers_to(name))
                .ok_or_else(|| EngineError::UnknownEndpoint(name.to_owned())),
            // An unnamed endpoint is unambiguous only for single-endpoint
            // adapters.
            None if self.endpoints.len() == 1 => Ok(&self.endpoints[0]),
            None => Err(EngineError::UnknownEndpoint(String::from("(unspecified)"))),
        }
    }

    fn observe_request(&self, endpoint: &str, status: u16, elapsed: Option<Duration>) {
        self.metrics
            .http_requests_total
            .with_label_values(&[endpoint, &status.to_string()])
            .inc();
        if let Some(elapsed) = elapsed {
            self.metrics
                .http_request_duration_seconds
                .with_label_values(&[endpoint])
                .observe(elapsed.as_secs_f64());
        }
    }
}

fn spawn_background_loop(
    transport: Arc<dyn crate::transport::Transport>,
    metrics: Arc<Metrics>,
    endpoint_name: String,
    transport_name: String,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if *shutdown.borrow() {
                break;
            }

            let started = Instant::now();
            tokio::select! {
                // Cancellation aborts the tick mid-sleep or mid-I/O.
                _ = shutdown.changed() => break,
                result = transport.background_execute() => {
                    metrics
                        .bg_execute_total
                        .with_label_values(&[&endpoint_name, &transport_name])
                        .inc();
                    metrics
                        .bg_execute_duration_seconds
                        .with_label_values(&[&endpoint_name, &transport_name])
                        .observe(started.elapsed().as_secs_f64());

                    if let Err(err) = result {
                        metrics
                            .bg_execute_errors
                            .with_label_values(&[&endpoint_name, &transport_name])
                            .inc();
                        warn!(endpoint = %endpoint_name, transport = %transport_name, %err, "background tick failed");
                    }
                }
            }
        }
    })
}
