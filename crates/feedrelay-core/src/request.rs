//! Request and response envelopes for the uniform adapter API.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Inbound JSON request: `{ "id": ..., "data": { ... } }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub data: RequestData,
}

impl AdapterRequest {
    pub fn new(data: RequestData) -> Self {
        Self { id: None, data }
    }

    /// Client-supplied id, or a generated one for log correlation.
    pub fn request_id(&self) -> String {
        match &self.id {
            Some(Value::String(id)) if !id.is_empty() => id.clone(),
            Some(other) if !other.is_null() => other.to_string(),
            _ => Uuid::new_v4().to_string(),
        }
    }
}

/// The `data` object: engine-reserved fields plus endpoint parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overrides: Option<HashMap<String, String>>,
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

impl RequestData {
    pub fn for_endpoint(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: Some(endpoint.into()),
            ..Self::default()
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: Value) -> Self {
        self.params.insert(name.into(), value);
        self
    }

    pub fn with_transport(mut self, transport: impl Into<String>) -> Self {
        self.transport = Some(transport.into());
        self
    }

    pub fn with_override(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.overrides
            .get_or_insert_with(HashMap::new)
            .insert(from.into(), to.into());
        self
    }
}

/// Timestamps attached to every successful response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseTimestamps {
    /// When this adapter received the value from the provider.
    pub provider_data_received: u64,
    /// When the stream carrying the value was opened, for streaming
    /// transports.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_data_stream_established: Option<u64>,
    /// Timestamp the provider itself attached to the value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_indicated_time: Option<u64>,
}

/// Outbound response body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterResponse {
    pub result: Value,
    pub data: Value,
    #[serde(rename = "statusCode")]
    pub status_code: u16,
    pub timestamps: ResponseTimestamps,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub cached: bool,
}

impl AdapterResponse {
    pub fn success(result: Value, data: Value, timestamps: ResponseTimestamps) -> Self {
        Self {
            result,
            data,
            status_code: 200,
            timestamps,
            cached: false,
        }
    }
}

/// One provider-sourced value for one parameter tuple, produced by
/// transport handlers and written through the response cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderResult {
    /// The validated parameter tuple this value answers.
    pub params: Value,
    pub result: Value,
    #[serde(default = "Value::default")]
    pub data: Value,
    #[serde(default = "default_status")]
    pub status_code: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_indicated_time: Option<u64>,
}

fn default_status() -> u16 {
    200
}

impl ProviderResult {
    pub fn new(params: Value, result: Value) -> Self {
        Self {
            params,
            result,
            data: Value::Null,
            status_code: 200,
            provider_indicated_time: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    pub fn with_provider_indicated_time(mut self, epoch_ms: u64) -> Self {
        self.provider_indicated_time = Some(epoch_ms);
        self
    }
}
