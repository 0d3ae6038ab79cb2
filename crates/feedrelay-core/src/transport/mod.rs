//! Provider-facing transports.
//!
//! A transport serves the foreground path (answer one request, usually
//! from cache) and the background path (one tick of keeping the cache
//! warm for every registered subscription).

mod http;
mod streaming;
mod websocket;

pub use http::{HttpPollingHandler, HttpTransport};
pub use streaming::{StreamHandler, StreamingTransport, SubscriptionDeltas, TickReport};
pub use websocket::{WebSocketEndpoint, WebSocketTransport, WsDriver};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::cache::ResponseCache;
use crate::config::EngineConfig;
use crate::fingerprint::FingerprintScope;
use crate::metrics::Metrics;
use crate::request::{AdapterRequest, AdapterResponse};
use crate::subscription::SubscriptionSet;
use crate::EngineError;

/// Dependencies wired into a transport when its adapter starts.
#[derive(Clone)]
pub struct TransportDeps {
    pub scope: FingerprintScope,
    pub config: Arc<EngineConfig>,
    pub metrics: Arc<Metrics>,
    pub response_cache: Arc<ResponseCache>,
    pub subscriptions: Arc<dyn SubscriptionSet>,
    /// Cadence of this transport's background loop.
    pub tick_interval: Duration,
}

/// Transport family, used to pick the background cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Streaming,
    Polling,
}

/// Driver contract for one endpoint transport.
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Wire shared dependencies. Idempotent: repeated calls keep the
    /// first wiring.
    async fn initialize(&self, deps: TransportDeps) -> Result<(), EngineError>;

    /// Serve one client request. `None` means the value is not available
    /// yet and the caller's deadline ran out.
    async fn foreground_execute(
        &self,
        request: &AdapterRequest,
    ) -> Result<Option<AdapterResponse>, EngineError>;

    /// One background tick. Implementations sleep their configured
    /// cadence before returning, which doubles as the retry floor.
    async fn background_execute(&self) -> Result<(), EngineError>;

    /// Release provider-side resources (open sockets, pending sends) on
    /// adapter shutdown.
    async fn shutdown(&self) {}
}

pub(crate) struct SharedDeps {
    deps: std::sync::OnceLock<TransportDeps>,
}

impl SharedDeps {
    pub(crate) fn unset() -> Self {
        Self {
            deps: std::sync::OnceLock::new(),
        }
    }

    pub(crate) fn install(&self, deps: TransportDeps) {
        // First wiring wins; initialize is documented as idempotent.
        let _ = self.deps.set(deps);
    }

    pub(crate) fn get(&self) -> Result<&TransportDeps, EngineError> {
        self.deps
            .get()
            .ok_or_else(|| EngineError::internal("transport used before initialize"))
    }
}
