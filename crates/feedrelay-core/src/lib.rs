//! Core engine for feedrelay external adapters.
//!
//! This crate contains:
//! - The response cache (local LRU and Redis backends) and its typed façade
//! - Expiring subscription sets that drive background refresh
//! - WebSocket and HTTP polling transports with a shared delta engine
//! - Endpoint routing, input validation and request transforms
//! - The adapter registry, background executor and shutdown path

pub mod adapter;
pub mod cache;
pub mod clock;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod fingerprint;
pub mod http_client;
pub mod input;
pub mod metrics;
pub mod rate_limit;
pub mod request;
pub mod subscription;
pub mod transport;

pub use adapter::{Adapter, AdapterBuilder};
pub use cache::{CacheBackend, CacheEntry, LocalCache, RedisCache, ResponseCache};
pub use config::{CacheKind, EngineConfig};
pub use endpoint::{AdapterEndpoint, CustomRouter, RequestTransform, SymbolOverrider, TransformContext};
pub use error::{ConfigError, EngineError, ErrorBody, SchemaError, StartupError};
pub use fingerprint::{canonical_json, CacheKeyGenerator, Fingerprint, FingerprintScope};
pub use http_client::{
    HttpClient, HttpMethod, NoopHttpClient, ProviderHttpRequest, ProviderHttpResponse,
    ReqwestHttpClient,
};
pub use input::{InputParameter, InputParameters, ParamType};
pub use metrics::Metrics;
pub use rate_limit::CreditLimiter;
pub use request::{
    AdapterRequest, AdapterResponse, ProviderResult, RequestData, ResponseTimestamps,
};
pub use subscription::{
    LocalSubscriptionSet, RedisSubscriptionSet, SubscriptionEntry, SubscriptionSet,
};
pub use transport::{
    HttpPollingHandler, HttpTransport, StreamHandler, StreamingTransport, SubscriptionDeltas,
    TickReport, Transport, TransportDeps, TransportKind, WebSocketEndpoint, WebSocketTransport,
    WsDriver,
};
