//! Provider-facing HTTP plumbing.
//!
//! Polling transports describe requests with [`ProviderHttpRequest`] and
//! execute them through the [`HttpClient`] trait, so tests can swap the
//! network out for a canned client.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

/// One outgoing provider request.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderHttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Value>,
    pub timeout: Duration,
}

impl ProviderHttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Get,
            url: url.into(),
            headers: BTreeMap::new(),
            body: None,
            timeout: Duration::from_secs(10),
        }
    }

    pub fn post(url: impl Into<String>, body: Value) -> Self {
        Self {
            method: HttpMethod::Post,
            url: url.into(),
            headers: BTreeMap::new(),
            body: Some(body),
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.into().to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Raw provider response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderHttpResponse {
    pub status: u16,
    pub body: String,
}

impl ProviderHttpResponse {
    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }

    pub fn json(&self) -> Result<Value, EngineError> {
        serde_json::from_str(&self.body).map_err(|error| {
            EngineError::upstream(
                format!("provider returned undecodable JSON: {error}"),
                Some(self.status),
            )
        })
    }
}

/// Transport contract for provider HTTP calls.
pub trait HttpClient: Send + Sync {
    fn execute<'a>(
        &'a self,
        request: ProviderHttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<ProviderHttpResponse, EngineError>> + Send + 'a>>;
}

/// Production client backed by a shared reqwest connection pool.
#[derive(Clone)]
pub struct ReqwestHttpClient {
    client: Arc<reqwest::Client>,
}

impl ReqwestHttpClient {
    pub fn new() -> Self {
        Self {
            client: Arc::new(
                reqwest::Client::builder()
                    .user_agent("feedrelay/0.1.0")
                    .build()
                    .unwrap_or_else(|_| reqwest::Client::new()),
            ),
        }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client: Arc::new(client),
        }
    }
}

impl Default for ReqwestHttpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpClient for ReqwestHttpClient {
    fn execute<'a>(
        &'a self,
        request: ProviderHttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<ProviderHttpResponse, EngineError>> + Send + 'a>> {
        Box::pin(async move {
            let mut builder = match request.method {
                HttpMethod::Get => self.client.get(&request.url),
                HttpMethod::Post => self.client.post(&request.url),
            };

            for (name, value) in &request.headers {
                builder = builder.header(name, value);
            }
            builder = builder.timeout(request.timeout);
            if let Some(body) = &request.body {
                builder = builder.json(body);
            }

            let response = builder.send().await.map_err(|error| {
                if error.is_timeout() {
                    EngineError::Timeout
                } else {
                    EngineError::upstream(format!("provider request failed: {error}"), None)
                }
            })?;

            let status = response.status().as_u16();
            let body = response.text().await.map_err(|error| {
                EngineError::upstream(
                    format!("failed to read provider response body: {error}"),
                    Some(status),
                )
            })?;

            Ok(ProviderHttpResponse { status, body })
        })
    }
}

/// Offline client that answers every request with an empty JSON object.
#[derive(Debug, Default)]
pub struct NoopHttpClient;

impl HttpClient for NoopHttpClient {
    fn execute<'a>(
        &'a self,
        request: ProviderHttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<ProviderHttpResponse, EngineError>> + Send + 'a>> {
        let _ = request;
        Box::pin(async move {
            Ok(ProviderHttpResponse {
                status: 200,
                body: String::from("{}"),
            })
        })
    }
}
