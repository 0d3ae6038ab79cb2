//! Adapter endpoints.
//!
//! An endpoint names one operation, owns its input schema and routes each
//! request to one of its registered transports.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde_json::Value;

use crate::config::EngineConfig;
use crate::fingerprint::CacheKeyGenerator;
use crate::input::InputParameters;
use crate::request::{AdapterRequest, AdapterResponse};
use crate::transport::Transport;
use crate::{EngineError, SchemaError};

/// Chooses a transport name for a request, ahead of the static fallbacks.
pub type CustomRouter = dyn Fn(&AdapterRequest, &EngineConfig) -> Option<String> + Send + Sync;

/// Context handed to request transforms.
pub struct TransformContext<'a> {
    pub endpoint_overrides: &'a HashMap<String, String>,
    pub config: &'a EngineConfig,
}

/// In-place request rewrite, run before validation in registration order.
pub trait RequestTransform: Send + Sync {
    fn apply(
        &self,
        request: &mut AdapterRequest,
        context: &TransformContext<'_>,
    ) -> Result<(), EngineError>;
}

/// Replaces `base` with its override: per-request overrides first, then
/// the endpoint's static override map. Always the first transform.
pub struct SymbolOverrider;

impl RequestTransform for SymbolOverrider {
    fn apply(
        &self,
        request: &mut AdapterRequest,
        context: &TransformContext<'_>,
    ) -> Result<(), EngineError> {
        let Some(Value::String(base)) = request.data.params.get("base") else {
            return Ok(());
        };

        let replacement = request
            .data
            .overrides
            .as_ref()
            .and_then(|overrides| overrides.get(base))
            .or_else(|| context.endpoint_overrides.get(base));

        if let Some(replacement) = replacement {
            let replacement = replacement.clone();
            request
                .data
                .params
                .insert(String::from("base"), Value::String(replacement));
        }
        Ok(())
    }
}

/// One named operation within an adapter.
pub struct AdapterEndpoint {
    name: String,
    aliases: Vec<String>,
    transports: BTreeMap<String, Arc<dyn Transport>>,
    input_parameters: InputParameters,
    overrides: HashMap<String, String>,
    custom_router: Option<Box<CustomRouter>>,
    default_transport: Option<String>,
    request_transforms: Vec<Box<dyn RequestTransform>>,
    cache_key_generator: Option<Arc<CacheKeyGenerator>>,
}

impl std::fmt::Debug for AdapterEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterEndpoint")
            .field("name", &self.name)
            .field("aliases", &self.aliases)
            .field("transports", &self.transports.keys().collect::<Vec<_>>())
            .field("input_parameters", &self.input_parameters)
            .field("overrides", &self.overrides)
            .field("default_transport", &self.default_transport)
            .finish()
    }
}

impl AdapterEndpoint {
    pub fn new(name: impl Into<String>, input_parameters: InputParameters) -> Self {
        Self {
            name: name.into(),
            aliases: Vec::new(),
            transports: BTreeMap::new(),
            input_parameters,
            overrides: HashMap::new(),
            custom_router: None,
            default_transport: None,
            request_transforms: vec![Box::new(SymbolOverrider)],
            cache_key_generator: None,
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.aliases.push(alias.into());
        self
    }

    /// Register a transport. Names must be non-empty lowercase ASCII.
    pub fn with_transport(
        mut self,
        name: impl Into<String>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, SchemaError> {
        let name = name.into();
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit());
        if !valid {
            return Err(SchemaError::InvalidTransportName { name });
        }

        self.transports.insert(name, transport);
        Ok(self)
    }

    pub fn with_override(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.overrides.insert(from.into(), to.into());
        self
    }

    pub fn with_default_transport(mut self, name: impl Into<String>) -> Self {
        self.default_transport = Some(name.into());
        self
    }

    pub fn with_custom_router(mut self, router: Box<CustomRouter>) -> Self {
        self.custom_router = Some(router);
        self
    }

    /// Append a transform after the built-in symbol overrider.
    pub fn with_request_transform(mut self, transform: Box<dyn RequestTransform>) -> Self {
        self.request_transforms.push(transform);
        self
    }

    pub fn with_cache_key_generator(mut self, generator: Arc<CacheKeyGenerator>) -> Self {
        self.cache_key_generator = Some(generator);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn aliases(&self) -> &[String] {
        &self.aliases
    }

    pub fn cache_key_generator(&self) -> Option<Arc<CacheKeyGenerator>> {
        self.cache_key_generator.clone()
    }

    pub fn transports(&self) -> impl Iterator<Item = (&String, &Arc<dyn Transport>)> {
        self.transports.iter()
    }

    pub fn answers_to(&self, name: &str) -> bool {
        self.name == name || self.aliases.iter().any(|alias| alias == name)
    }

    pub(crate) fn ensure_routable(&self) -> Result<(), SchemaError> {
        if self.transports.is_empty() {
            return Err(SchemaError::NoTransports {
                endpoint: self.name.clone(),
            });
        }
        Ok(())
    }

    /// Serve one request: transform, validate, route, delegate.
    pub async fn handle(
        &self,
        mut request: AdapterRequest,
        config: &EngineConfig,
    ) -> Result<AdapterResponse, EngineError> {
        let context = TransformContext {
            endpoint_overrides: &self.overrides,
            config,
        };
        for transform in &self.request_transforms {
            transform.apply(&mut request, &context)?;
        }

        request.data.params = self.input_parameters.validate(&request.data.params)?;

        let transport = self.resolve_transport(&request, config)?;
        match transport.foreground_execute(&request).await? {
            Some(response) => Ok(response),
            // The value is being fetched in the background; the caller's
            // deadline ran out first.
            None => Err(EngineError::Timeout),
        }
    }

    fn resolve_transport(
        &self,
        request: &AdapterRequest,
        config: &EngineConfig,
    ) -> Result<Arc<dyn Transport>, EngineError> {
        if self.transports.len() == 1 {
            let transport = self
                .transports
                .values()
                .next()
                .cloned()
                .ok_or_else(|| EngineError::internal("transport map emptied"))?;
            return Ok(transport);
        }

        let chosen = self
            .custom_router
            .as_ref()
            .and_then(|router| router(request, config))
            .or_else(|| request.data.transport.clone())
            .or_else(|| self.default_transport.clone());

        match chosen {
            Some(name) => self.transports.get(&name).cloned().ok_or_else(|| {
                EngineError::invalid_input(format!(
                    "unknown transport '{name}' for endpoint '{}'",
                    self.name
                ))
            }),
            None => Err(EngineError::invalid_input(format!(
                "no transport resolved for endpoint '{}'",
                self.name
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::{InputParameter, InputParameters};
    use crate::request::RequestData;
    use crate::transport::TransportDeps;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    /// Transport double that records requests and answers with a fixed
    /// value.
    struct RecordingTransport {
        label: &'static str,
        served: Mutex<Vec<AdapterRequest>>,
    }

    impl RecordingTransport {
        fn new(label: &'static str) -> Arc<Self> {
            Arc::new(Self {
                label,
                served: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        fn kind(&self) -> crate::transport::TransportKind {
            crate::transport::TransportKind::Polling
        }

        async fn initialize(&self, _deps: TransportDeps) -> Result<(), EngineError> {
            Ok(())
        }

        async fn foreground_execute(
            &self,
            request: &AdapterRequest,
        ) -> Result<Option<AdapterResponse>, EngineError> {
            self.served
                .lock()
                .expect("served lock should not be poisoned")
                .push(request.clone());
            Ok(Some(AdapterResponse::success(
                json!(self.label),
                json!({}),
                Default::default(),
            )))
        }

        async fn background_execute(&self) -> Result<(), EngineError> {
            Ok(())
        }
    }

    fn base_schema() -> InputParameters {
        InputParameters::new(vec![(
            String::from("base"),
            InputParameter::string().required(),
        )])
        .expect("schema must build")
    }

    fn request_with_base(base: &str) -> AdapterRequest {
        AdapterRequest::new(RequestData::default().with_param("base", json!(base)))
    }

    #[tokio::test]
    async fn single_transport_serves_without_routing_hints() {
        let transport = RecordingTransport::new("ws");
        let endpoint = AdapterEndpoint::new("price", base_schema())
            .with_transport("ws", transport.clone())
            .expect("transport name must be valid");

        let response = endpoint
            .handle(request_with_base("ETH"), &EngineConfig::default())
            .await
            .expect("must serve");
        assert_eq!(response.result, json!("ws"));
    }

    #[tokio::test]
    async fn request_transport_field_picks_among_many() {
        let ws = RecordingTransport::new("ws");
        let rest = RecordingTransport::new("rest");
        let endpoint = AdapterEndpoint::new("price", base_schema())
            .with_transport("ws", ws)
            .expect("valid name")
            .with_transport("rest", rest)
            .expect("valid name");

        let request = AdapterRequest::new(
            RequestData::default()
                .with_param("base", json!("ETH"))
                .with_transport("rest"),
        );
        let response = endpoint
            .handle(request, &EngineConfig::default())
            .await
            .expect("must serve");
        assert_eq!(response.result, json!("rest"));
    }

    #[tokio::test]
    async fn custom_router_outranks_the_request_field() {
        let ws = RecordingTransport::new("ws");
        let rest = RecordingTransport::new("rest");
        let endpoint = AdapterEndpoint::new("price", base_schema())
            .with_transport("ws", ws)
            .expect("valid name")
            .with_transport("rest", rest)
            .expect("valid name")
            .with_custom_router(Box::new(|_, _| Some(String::from("ws"))));

        let request = AdapterRequest::new(
            RequestData::default()
                .with_param("base", json!("ETH"))
                .with_transport("rest"),
        );
        let response = endpoint
            .handle(request, &EngineConfig::default())
            .await
            .expect("must serve");
        assert_eq!(response.result, json!("ws"));
    }

    #[tokio::test]
    async fn default_transport_is_the_last_fallback() {
        let ws = RecordingTransport::new("ws");
        let rest = RecordingTransport::new("rest");
        let endpoint = AdapterEndpoint::new("price", base_schema())
            .with_transport("ws", ws)
            .expect("valid name")
            .with_transport("rest", rest)
            .expect("valid name")
            .with_default_transport("ws");

        let response = endpoint
            .handle(request_with_base("ETH"), &EngineConfig::default())
            .await
            .expect("must serve");
        assert_eq!(response.result, json!("ws"));
    }

    #[tokio::test]
    async fn unknown_transport_name_is_a_400() {
        let ws = RecordingTransport::new("ws");
        let rest = RecordingTransport::new("rest");
        let endpoint = AdapterEndpoint::new("price", base_schema())
            .with_transport("ws", ws)
            .expect("valid name")
            .with_transport("rest", rest)
            .expect("valid name");

        let request = AdapterRequest::new(
            RequestData::default()
                .with_param("base", json!("ETH"))
                .with_transport("carrier-pigeon"),
        );
        let error = endpoint
            .handle(request, &EngineConfig::default())
            .await
            .expect_err("must reject");
        assert_eq!(error.status_code(), 400);
    }

    #[tokio::test]
    async fn unroutable_request_is_a_400() {
        let ws = RecordingTransport::new("ws");
        let rest = RecordingTransport::new("rest");
        let endpoint = AdapterEndpoint::new("price", base_schema())
            .with_transport("ws", ws)
            .expect("valid name")
            .with_transport("rest", rest)
            .expect("valid name");

        let error = endpoint
            .handle(request_with_base("ETH"), &EngineConfig::default())
            .await
            .expect_err("must reject");
        assert_eq!(error.status_code(), 400);
    }

    #[test]
    fn transport_names_must_be_lowercase_ascii() {
        let transport = RecordingTransport::new("ws");
        let error = AdapterEndpoint::new("price", base_schema())
            .with_transport("WS", transport)
            .expect_err("must reject");
        assert!(matches!(error, SchemaError::InvalidTransportName { .. }));
    }

    #[tokio::test]
    async fn static_override_rewrites_base_before_validation() {
        let transport = RecordingTransport::new("ws");
        let endpoint = AdapterEndpoint::new("price", base_schema())
            .with_transport("ws", transport.clone())
            .expect("valid name")
            .with_override("WETH", "ETH");

        endpoint
            .handle(request_with_base("WETH"), &EngineConfig::default())
            .await
            .expect("must serve");

        let served = transport.served.lock().expect("lock");
        assert_eq!(served[0].data.params["base"], json!("ETH"));
    }

    #[tokio::test]
    async fn request_overrides_outrank_the_static_map() {
        let transport = RecordingTransport::new("ws");
        let endpoint = AdapterEndpoint::new("price", base_schema())
            .with_transport("ws", transport.clone())
            .expect("valid name")
            .with_override("WETH", "ETH");

        let request = AdapterRequest::new(
            RequestData::default()
                .with_param("base", json!("WETH"))
                .with_override("WETH", "WRAPPED"),
        );
        endpoint
            .handle(request, &EngineConfig::default())
            .await
            .expect("must serve");

        let served = transport.served.lock().expect("lock");
        assert_eq!(served[0].data.params["base"], json!("WRAPPED"));
    }
}
