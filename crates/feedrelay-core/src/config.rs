use std::fmt::{Display, Formatter};
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

use url::Url;

use crate::ConfigError;

/// Cache backend selector, driven by `CACHE_TYPE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKind {
    Local,
    Redis,
}

impl CacheKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Redis => "redis",
        }
    }
}

impl Display for CacheKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CacheKind {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "redis" => Ok(Self::Redis),
            other => Err(ConfigError::InvalidChoice {
                name: "CACHE_TYPE",
                value: other.to_owned(),
                expected: "local, redis",
            }),
        }
    }
}

/// Engine configuration resolved from the environment at startup.
///
/// Every knob carries a default; validators reject malformed values before
/// the adapter starts (startup configuration failures are fatal).
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub cache_type: CacheKind,
    pub cache_redis_url: String,
    pub cache_max_subscriptions: usize,
    pub cache_max_age: Duration,
    pub ws_subscription_ttl: Duration,
    pub ws_subscription_unresponsive_ttl: Duration,
    pub background_execute_ms_ws: Duration,
    pub background_execute_ms_http: Duration,
    pub max_payload_size_limit: usize,
    pub api_timeout: Duration,
    pub metrics_port: u16,
    pub ea_host: String,
    pub base_url: String,
    pub shutdown_grace: Duration,
    pub requester_queue_size: usize,
    pub rate_limit_capacity_minute: Option<u32>,
    /// When set, any inbound WebSocket frame counts as liveness, not only
    /// frames that produce cache writes.
    pub ws_any_message_counts_as_activity: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_type: CacheKind::Local,
            cache_redis_url: String::from("redis://127.0.0.1:6379"),
            cache_max_subscriptions: 10_000,
            cache_max_age: Duration::from_millis(90_000),
            ws_subscription_ttl: Duration::from_millis(120_000),
            ws_subscription_unresponsive_ttl: Duration::from_millis(120_000),
            background_execute_ms_ws: Duration::from_millis(1_000),
            background_execute_ms_http: Duration::from_millis(1_000),
            max_payload_size_limit: 1_048_576,
            api_timeout: Duration::from_millis(30_000),
            metrics_port: 9080,
            ea_host: String::from("0.0.0.0"),
            base_url: String::from("http://localhost:8080"),
            shutdown_grace: Duration::from_millis(5_000),
            requester_queue_size: 200,
            rate_limit_capacity_minute: None,
            ws_any_message_counts_as_activity: false,
        }
    }
}

impl EngineConfig {
    /// Resolve configuration from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Resolve configuration from an arbitrary lookup, used by tests to
    /// avoid mutating process state.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let cache_type = match lookup("CACHE_TYPE") {
            Some(raw) => raw.parse()?,
            None => defaults.cache_type,
        };

        let cache_redis_url = match lookup("CACHE_REDIS_URL") {
            Some(raw) => {
                validate_url("CACHE_REDIS_URL", &raw)?;
                raw
            }
            None => defaults.cache_redis_url,
        };

        let base_url = match lookup("BASE_URL") {
            Some(raw) => {
                validate_url("BASE_URL", &raw)?;
                raw
            }
            None => defaults.base_url,
        };

        let ea_host = match lookup("EA_HOST") {
            Some(raw) => {
                validate_host("EA_HOST", &raw)?;
                raw
            }
            None => defaults.ea_host,
        };

        let metrics_port = match lookup("METRICS_PORT") {
            Some(raw) => parse_port("METRICS_PORT", &raw)?,
            None => defaults.metrics_port,
        };

        let rate_limit_capacity_minute = match lookup("RATE_LIMIT_CAPACITY_MINUTE") {
            Some(raw) => {
                Some(parse_bounded("RATE_LIMIT_CAPACITY_MINUTE", &raw, 1, 1_000_000)? as u32)
            }
            None => defaults.rate_limit_capacity_minute,
        };

        let ws_any_message_counts_as_activity =
            match lookup("WS_ANY_MESSAGE_COUNTS_AS_ACTIVITY") {
                Some(raw) => matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true"),
                None => defaults.ws_any_message_counts_as_activity,
            };

        Ok(Self {
            cache_type,
            cache_redis_url,
            cache_max_subscriptions: parse_opt(
                &lookup,
                "CACHE_MAX_SUBSCRIPTIONS",
                defaults.cache_max_subscriptions as u64,
                1,
                10_000_000,
            )? as usize,
            cache_max_age: duration_opt(
                &lookup,
                "CACHE_MAX_AGE",
                defaults.cache_max_age,
                1_000,
                86_400_000,
            )?,
            ws_subscription_ttl: duration_opt(
                &lookup,
                "WS_SUBSCRIPTION_TTL",
                defaults.ws_subscription_ttl,
                1_000,
                86_400_000,
            )?,
            ws_subscription_unresponsive_ttl: duration_opt(
                &lookup,
                "WS_SUBSCRIPTION_UNRESPONSIVE_TTL",
                defaults.ws_subscription_unresponsive_ttl,
                1_000,
                86_400_000,
            )?,
            background_execute_ms_ws: duration_opt(
                &lookup,
                "BACKGROUND_EXECUTE_MS_WS",
                defaults.background_execute_ms_ws,
                1,
                3_600_000,
            )?,
            background_execute_ms_http: duration_opt(
                &lookup,
                "BACKGROUND_EXECUTE_MS_HTTP",
                defaults.background_execute_ms_http,
                1,
                3_600_000,
            )?,
            max_payload_size_limit: parse_opt(
                &lookup,
                "MAX_PAYLOAD_SIZE_LIMIT",
                defaults.max_payload_size_limit as u64,
                1_024,
                104_857_600,
            )? as usize,
            api_timeout: duration_opt(
                &lookup,
                "API_TIMEOUT",
                defaults.api_timeout,
                100,
                600_000,
            )?,
            metrics_port,
            ea_host,
            base_url,
            shutdown_grace: duration_opt(
                &lookup,
                "SHUTDOWN_GRACE_MS",
                defaults.shutdown_grace,
                0,
                600_000,
            )?,
            requester_queue_size: parse_opt(
                &lookup,
                "REQUESTER_QUEUE_SIZE",
                defaults.requester_queue_size as u64,
                1,
                10_000,
            )? as usize,
            rate_limit_capacity_minute,
            ws_any_message_counts_as_activity,
        })
    }
}

fn parse_opt<F>(
    lookup: &F,
    name: &'static str,
    default: u64,
    min: u64,
    max: u64,
) -> Result<u64, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        Some(raw) => parse_bounded(name, &raw, min, max),
        None => Ok(default),
    }
}

fn duration_opt<F>(
    lookup: &F,
    name: &'static str,
    default: Duration,
    min_ms: u64,
    max_ms: u64,
) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    parse_opt(lookup, name, default.as_millis() as u64, min_ms, max_ms).map(Duration::from_millis)
}

fn parse_bounded(name: &'static str, raw: &str, min: u64, max: u64) -> Result<u64, ConfigError> {
    let out_of_bounds = || ConfigError::IntOutOfBounds {
        name,
        value: raw.to_owned(),
        min,
        max,
    };

    let value: u64 = raw.trim().parse().map_err(|_| out_of_bounds())?;
    if value < min || value > max {
        return Err(out_of_bounds());
    }
    Ok(value)
}

fn parse_port(name: &'static str, raw: &str) -> Result<u16, ConfigError> {
    let invalid = || ConfigError::InvalidPort {
        name,
        value: raw.to_owned(),
    };

    let port: u32 = raw.trim().parse().map_err(|_| invalid())?;
    if port == 0 || port > 65_535 {
        return Err(invalid());
    }
    Ok(port as u16)
}

fn validate_url(name: &'static str, raw: &str) -> Result<(), ConfigError> {
    Url::parse(raw).map(|_| ()).map_err(|_| ConfigError::InvalidUrl {
        name,
        value: raw.to_owned(),
    })
}

fn validate_host(name: &'static str, raw: &str) -> Result<(), ConfigError> {
    if raw.parse::<IpAddr>().is_ok() || is_dns_name(raw) {
        return Ok(());
    }
    Err(ConfigError::InvalidHost {
        name,
        value: raw.to_owned(),
    })
}

fn is_dns_name(raw: &str) -> bool {
    if raw.is_empty() || raw.len() > 253 {
        return false;
    }

    raw.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '-')
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup_from<'a>(pairs: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        move |name| {
            pairs
                .iter()
                .find(|(key, _)| *key == name)
                .map(|(_, value)| (*value).to_owned())
        }
    }

    #[test]
    fn defaults_apply_when_environment_is_empty() {
        let config = EngineConfig::from_lookup(|_| None).expect("defaults must resolve");

        assert_eq!(config.cache_type, CacheKind::Local);
        assert_eq!(config.cache_max_age, Duration::from_millis(90_000));
        assert_eq!(config.metrics_port, 9080);
        assert!(!config.ws_any_message_counts_as_activity);
    }

    #[test]
    fn recognized_variables_override_defaults() {
        let pairs = [
            ("CACHE_TYPE", "redis"),
            ("CACHE_MAX_SUBSCRIPTIONS", "3"),
            ("BACKGROUND_EXECUTE_MS_WS", "250"),
            ("WS_ANY_MESSAGE_COUNTS_AS_ACTIVITY", "true"),
        ];
        let config =
            EngineConfig::from_lookup(lookup_from(&pairs)).expect("overrides must resolve");

        assert_eq!(config.cache_type, CacheKind::Redis);
        assert_eq!(config.cache_max_subscriptions, 3);
        assert_eq!(config.background_execute_ms_ws, Duration::from_millis(250));
        assert!(config.ws_any_message_counts_as_activity);
    }

    #[test]
    fn port_validator_rejects_out_of_range() {
        let pairs = [("METRICS_PORT", "70000")];
        let error = EngineConfig::from_lookup(lookup_from(&pairs)).expect_err("must fail");
        assert!(matches!(error, ConfigError::InvalidPort { .. }));
    }

    #[test]
    fn url_validator_rejects_garbage() {
        let pairs = [("BASE_URL", "not a url")];
        let error = EngineConfig::from_lookup(lookup_from(&pairs)).expect_err("must fail");
        assert!(matches!(error, ConfigError::InvalidUrl { .. }));
    }

    #[test]
    fn host_validator_accepts_ip_and_dns() {
        assert!(validate_host("EA_HOST", "10.0.0.1").is_ok());
        assert!(validate_host("EA_HOST", "adapter.internal.example").is_ok());
        assert!(validate_host("EA_HOST", "-bad-.example").is_err());
        assert!(validate_host("EA_HOST", "").is_err());
    }

    #[test]
    fn bounded_int_validator_enforces_limits() {
        let pairs = [("CACHE_MAX_SUBSCRIPTIONS", "0")];
        let error = EngineConfig::from_lookup(lookup_from(&pairs)).expect_err("must fail");
        assert!(matches!(error, ConfigError::IntOutOfBounds { .. }));
    }
}
