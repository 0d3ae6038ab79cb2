//! Canonical cache keys.
//!
//! A fingerprint identifies one `(adapter, endpoint, transport, params)`
//! tuple. Two semantically equal requests must produce byte-identical
//! fingerprints, so parameter maps are canonicalized: object keys sorted
//! recursively, integral floats collapsed to integers.

use std::fmt::{Display, Formatter};
use std::sync::Arc;

use serde_json::Value;

/// Endpoint-supplied replacement for the default canonical key.
pub type CacheKeyGenerator = dyn Fn(&Value) -> String + Send + Sync;

/// Deterministic cache key for one request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl Display for Fingerprint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Names a transport instance for fingerprinting and cache namespacing.
#[derive(Clone)]
pub struct FingerprintScope {
    pub adapter: String,
    pub endpoint: String,
    pub transport: String,
    pub generator: Option<Arc<CacheKeyGenerator>>,
}

impl FingerprintScope {
    pub fn new(
        adapter: impl Into<String>,
        endpoint: impl Into<String>,
        transport: impl Into<String>,
    ) -> Self {
        Self {
            adapter: adapter.into(),
            endpoint: endpoint.into(),
            transport: transport.into(),
            generator: None,
        }
    }

    pub fn with_generator(mut self, generator: Arc<CacheKeyGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn fingerprint(&self, params: &Value) -> Fingerprint {
        let param_key = match &self.generator {
            Some(generator) => generator(params),
            None => canonical_json(params),
        };

        Fingerprint(format!(
            "{}-{}-{}-{param_key}",
            self.adapter, self.endpoint, self.transport
        ))
    }

    /// Default per-endpoint subscription key for a parameter tuple.
    pub fn subscription_key(&self, params: &Value) -> String {
        match &self.generator {
            Some(generator) => generator(params),
            None => canonical_json(params),
        }
    }
}

impl std::fmt::Debug for FingerprintScope {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FingerprintScope")
            .field("adapter", &self.adapter)
            .field("endpoint", &self.endpoint)
            .field("transport", &self.transport)
            .field("generator", &self.generator.is_some())
            .finish()
    }
}

/// Canonical JSON rendering: recursively sorted object keys, normalized
/// number encodings (`1.0` and `1` render identically).
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(flag) => out.push_str(if *flag { "true" } else { "false" }),
        Value::Number(number) => write_number(number, out),
        Value::String(text) => {
            // serde_json escapes exactly as the wire format requires.
            out.push_str(&Value::String(text.clone()).to_string());
        }
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();

            out.push('{');
            for (index, key) in keys.into_iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
    }
}

fn write_number(number: &serde_json::Number, out: &mut String) {
    if let Some(value) = number.as_i64() {
        out.push_str(&value.to_string());
        return;
    }
    if let Some(value) = number.as_u64() {
        out.push_str(&value.to_string());
        return;
    }
    if let Some(value) = number.as_f64() {
        // Collapse integral floats so 1.0 fingerprints like 1.
        if value.is_finite() && value.fract() == 0.0 && value.abs() < 9.0e15 {
            out.push_str(&(value as i64).to_string());
            return;
        }
        out.push_str(&value.to_string());
        return;
    }
    out.push_str(&number.to_string());
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope() -> FingerprintScope {
        FingerprintScope::new("coinprice", "price", "ws")
    }

    #[test]
    fn key_order_does_not_change_the_fingerprint() {
        let left = json!({ "base": "ETH", "quote": "USD" });
        let right = json!({ "quote": "USD", "base": "ETH" });

        assert_eq!(scope().fingerprint(&left), scope().fingerprint(&right));
    }

    #[test]
    fn nested_maps_are_sorted_recursively() {
        let left = json!({ "filter": { "b": 1, "a": 2 }, "base": "ETH" });
        let right = json!({ "base": "ETH", "filter": { "a": 2, "b": 1 } });

        assert_eq!(scope().fingerprint(&left), scope().fingerprint(&right));
    }

    #[test]
    fn integral_float_matches_integer() {
        let as_float = json!({ "amount": 10.0 });
        let as_int = json!({ "amount": 10 });

        assert_eq!(scope().fingerprint(&as_float), scope().fingerprint(&as_int));
    }

    #[test]
    fn different_params_differ() {
        let eth = json!({ "base": "ETH" });
        let btc = json!({ "base": "BTC" });

        assert_ne!(scope().fingerprint(&eth), scope().fingerprint(&btc));
    }

    #[test]
    fn scope_components_are_part_of_the_key() {
        let params = json!({ "base": "ETH" });
        let ws = FingerprintScope::new("coinprice", "price", "ws").fingerprint(&params);
        let rest = FingerprintScope::new("coinprice", "price", "rest").fingerprint(&params);

        assert_ne!(ws, rest);
    }

    #[test]
    fn custom_generator_overrides_canonical_key() {
        let generator: Arc<CacheKeyGenerator> =
            Arc::new(|params| params["base"].as_str().unwrap_or("?").to_owned());
        let scope = scope().with_generator(generator);

        let fingerprint = scope.fingerprint(&json!({ "base": "ETH", "noise": 42 }));
        assert_eq!(fingerprint.as_str(), "coinprice-price-ws-ETH");
    }
}
