/* src/models.rs */

use serde::{Deserialize, Deserializer};
use std::collections::HashMap;

/// Top-level structure of a route file that wraps its list in a `routes` key.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct RouteFile {
    #[serde(default)]
    pub routes: Vec<RouteSpec>,
}

/// A single declarative route. Order inside the route file is significant:
/// the first route whose match keys all hold wins.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct RouteSpec {
    pub name: String,

    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default)]
    pub path_prefix: String,
    #[serde(default)]
    pub regex: Option<String>,

    #[serde(default)]
    pub methods_allow: Vec<String>,
    #[serde(default)]
    pub methods_deny: Vec<String>,

    #[serde(default)]
    pub upstream: Option<String>,
    #[serde(default)]
    pub upstreams: Vec<String>,

    #[serde(default)]
    pub canary_upstream: Option<String>,
    #[serde(default)]
    pub canary_percent: Option<CanaryPercent>,
    #[serde(default)]
    pub canary_bucketing: CanaryBucketing,

    #[serde(default)]
    pub header_routes: Vec<HeaderRoute>,

    #[serde(default)]
    pub headers_set: HashMap<String, String>,
    #[serde(default)]
    pub headers_remove: Vec<String>,
    #[serde(default)]
    pub query_inject: HashMap<String, String>,

    #[serde(default)]
    pub rewrite_prefix: Option<String>,

    #[serde(default)]
    pub websocket_passthrough: bool,
    #[serde(default)]
    pub grpc_proxy: bool,

    #[serde(default)]
    pub rate_limit: Option<RateLimitSpec>,
    #[serde(default)]
    pub quota: Option<QuotaSpec>,
    #[serde(default)]
    pub circuit_breaker: Option<CircuitBreakerSpec>,
    #[serde(default)]
    pub outlier_detection: Option<OutlierSpec>,

    /// Kept as a string so an unknown policy is reported by the route
    /// compiler rather than as a generic parse failure.
    #[serde(default)]
    pub load_balancing: Option<String>,
}

/// Routes a request to a dedicated upstream when `header` equals `value`.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct HeaderRoute {
    pub header: String,
    pub value: String,
    pub upstream: String,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct RateLimitSpec {
    #[serde(default)]
    pub enabled: bool,
    /// Token refill rate, requests per second.
    #[serde(default)]
    pub rps: f64,
    #[serde(default)]
    pub burst: u32,
    #[serde(default)]
    pub key_header: Option<String>,
    /// Use the fixed-window counter in the shared store instead of a local bucket.
    #[serde(default)]
    pub use_shared: bool,
    #[serde(default = "default_window_sec")]
    pub window_sec: u64,
    #[serde(default)]
    pub limit: u64,
}

fn default_window_sec() -> u64 {
    1
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct QuotaSpec {
    #[serde(default)]
    pub enabled: bool,
    /// Requests per UTC day; 0 disables the daily counter.
    #[serde(default)]
    pub daily: u64,
    /// Requests per UTC hour; 0 disables the hourly counter.
    #[serde(default)]
    pub hourly: u64,
    #[serde(default)]
    pub key_header: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CircuitBreakerSpec {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_failure_ratio")]
    pub failure_ratio: f64,
    #[serde(default = "default_min_requests")]
    pub min_requests: u32,
    #[serde(default = "default_interval_sec")]
    pub interval_sec: u64,
    #[serde(default = "default_timeout_sec")]
    pub timeout_sec: u64,
}

impl Default for CircuitBreakerSpec {
    fn default() -> Self {
        Self {
            enabled: false,
            failure_ratio: default_failure_ratio(),
            min_requests: default_min_requests(),
            interval_sec: default_interval_sec(),
            timeout_sec: default_timeout_sec(),
        }
    }
}

fn default_failure_ratio() -> f64 {
    0.5
}

fn default_min_requests() -> u32 {
    10
}

fn default_interval_sec() -> u64 {
    60
}

fn default_timeout_sec() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct OutlierSpec {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_eject_duration_sec")]
    pub eject_duration_sec: u64,
}

impl Default for OutlierSpec {
    fn default() -> Self {
        Self {
            enabled: false,
            failure_threshold: default_failure_threshold(),
            eject_duration_sec: default_eject_duration_sec(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_eject_duration_sec() -> u64 {
    30
}

/// Load-balancing policy across `upstreams`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadBalancing {
    #[default]
    RoundRobin,
    LeastConnections,
}

impl LoadBalancing {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "" | "round_robin" | "roundrobin" => Some(Self::RoundRobin),
            "least_connections" | "leastconn" | "least_conn" => Some(Self::LeastConnections),
            _ => None,
        }
    }
}

/// How the canary bucket in `[0, 100)` is derived from the correlation id.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CanaryBucketing {
    /// Last byte of the id modulo 100. Only uniform when ids end in a
    /// byte drawn evenly from a 100-aligned alphabet, which generated hex
    /// ids are not.
    LastByte,
    /// Hash of the whole id modulo 100.
    #[default]
    Hash,
}

/// Canary share, written either as a number (`10`, `12.5`) or as a string (`"10%"`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CanaryPercent(pub f64);

impl<'de> Deserialize<'de> for CanaryPercent {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(f64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Ok(Self(n)),
            Raw::Text(s) => s
                .trim()
                .trim_end_matches('%')
                .trim()
                .parse::<f64>()
                .map(Self)
                .map_err(|_| serde::de::Error::custom(format!("invalid canary percent '{s}'"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canary_percent_accepts_numbers_and_strings() {
        let specs: Vec<RouteSpec> = serde_yaml::from_str(
            r#"
- name: a
  canary_percent: "10%"
- name: b
  canary_percent: 25
- name: c
  canary_percent: "12.5"
"#,
        )
        .unwrap();
        assert_eq!(specs[0].canary_percent, Some(CanaryPercent(10.0)));
        assert_eq!(specs[1].canary_percent, Some(CanaryPercent(25.0)));
        assert_eq!(specs[2].canary_percent, Some(CanaryPercent(12.5)));
    }

    #[test]
    fn canary_percent_rejects_garbage() {
        let res: Result<Vec<RouteSpec>, _> =
            serde_yaml::from_str("- name: a\n  canary_percent: \"ten\"\n");
        assert!(res.is_err());
    }

    #[test]
    fn sub_specs_fill_defaults() {
        let specs: Vec<RouteSpec> = serde_yaml::from_str(
            r#"
- name: a
  circuit_breaker: { enabled: true }
  outlier_detection: { enabled: true, failure_threshold: 3 }
"#,
        )
        .unwrap();
        let cb = specs[0].circuit_breaker.as_ref().unwrap();
        assert!(cb.enabled);
        assert_eq!(cb.min_requests, 10);
        let od = specs[0].outlier_detection.as_ref().unwrap();
        assert_eq!(od.failure_threshold, 3);
        assert_eq!(od.eject_duration_sec, 30);
        assert_eq!(specs[0].canary_bucketing, CanaryBucketing::Hash);
    }

    #[test]
    fn last_byte_bucketing_is_opt_in() {
        let specs: Vec<RouteSpec> =
            serde_yaml::from_str("- name: a\n  canary_bucketing: last_byte\n").unwrap();
        assert_eq!(specs[0].canary_bucketing, CanaryBucketing::LastByte);
    }

    #[test]
    fn load_balancing_names() {
        assert_eq!(LoadBalancing::parse("round_robin"), Some(LoadBalancing::RoundRobin));
        assert_eq!(
            LoadBalancing::parse("least-connections"),
            Some(LoadBalancing::LeastConnections)
        );
        assert_eq!(LoadBalancing::parse("random"), None);
    }
}
