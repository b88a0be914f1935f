/* src/error.rs */

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use fancy_log::{LogLevel, log};
use serde_json::json;
use std::path::PathBuf;
use thiserror::Error;

/// Fatal problems found while loading or compiling the route file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read route file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse route file {path:?}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("route '{route}': invalid regex '{pattern}': {source}")]
    InvalidRegex {
        route: String,
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("route '{route}': unknown load balancing policy '{policy}'")]
    UnknownLoadBalancing { route: String, policy: String },

    #[error("route '{route}': invalid method '{method}'")]
    InvalidMethod { route: String, method: String },

    #[error("route '{route}': invalid upstream url '{url}'")]
    InvalidUpstream { route: String, url: String },

    #[error("route '{route}': invalid header '{header}'")]
    InvalidHeader { route: String, header: String },

    #[error("route '{route}': canary percent {value} is outside 0..=100")]
    InvalidCanaryPercent { route: String, value: f64 },

    #[error("duplicate route name '{0}'")]
    DuplicateRouteName(String),

    #[error("route at position {0} has an empty name")]
    EmptyRouteName(usize),
}

/// Per-request failures, each mapped to the status the client sees.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("no route matches {0}")]
    NoRoute(String),

    #[error("method {method} not allowed on route '{route}'")]
    MethodNotAllowed { route: String, method: String },

    #[error("rate limit exceeded for '{key}' on route '{route}'")]
    RateLimited { route: String, key: String },

    #[error("hourly quota exceeded for '{key}' on route '{route}'")]
    HourlyQuotaExceeded { route: String, key: String },

    #[error("daily quota exceeded for '{key}' on route '{route}'")]
    DailyQuotaExceeded { route: String, key: String },

    #[error("circuit open for route '{0}'")]
    CircuitOpen(String),

    #[error("request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },

    #[error("counter store failure on route '{route}': {message}")]
    CounterStore { route: String, message: String },

    #[error("route '{0}' has no upstream")]
    NoUpstream(String),

    #[error("upstream {upstream} failed: {source}")]
    BadGateway {
        upstream: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("upstream {0} timed out")]
    GatewayTimeout(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NoRoute(_) => StatusCode::NOT_FOUND,
            Self::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
            Self::RateLimited { .. }
            | Self::HourlyQuotaExceeded { .. }
            | Self::DailyQuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::CircuitOpen(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::CounterStore { .. } | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::NoUpstream(_) | Self::BadGateway { .. } => StatusCode::BAD_GATEWAY,
            Self::GatewayTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::NoRoute(_) => "NO_ROUTE",
            Self::MethodNotAllowed { .. } => "METHOD_NOT_ALLOWED",
            Self::RateLimited { .. } => "RATE_LIMIT_EXCEEDED",
            Self::HourlyQuotaExceeded { .. } => "HOURLY_QUOTA_EXCEEDED",
            Self::DailyQuotaExceeded { .. } => "DAILY_QUOTA_EXCEEDED",
            Self::CircuitOpen(_) => "CIRCUIT_OPEN",
            Self::PayloadTooLarge { .. } => "PAYLOAD_TOO_LARGE",
            Self::CounterStore { .. } => "COUNTER_STORE_ERROR",
            Self::NoUpstream(_) => "NO_UPSTREAM",
            Self::BadGateway { .. } => "BAD_GATEWAY",
            Self::GatewayTimeout(_) => "GATEWAY_TIMEOUT",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Label used for `gateway_rejections_total`; `None` for dispatch failures.
    pub fn rejection_reason(&self) -> Option<&'static str> {
        match self {
            Self::NoRoute(_) => Some("no_route"),
            Self::MethodNotAllowed { .. } => Some("method"),
            Self::RateLimited { .. } => Some("rate_limit"),
            Self::HourlyQuotaExceeded { .. } => Some("quota_hourly"),
            Self::DailyQuotaExceeded { .. } => Some("quota_daily"),
            Self::CircuitOpen(_) => Some("circuit_open"),
            Self::PayloadTooLarge { .. } => Some("body_too_large"),
            _ => None,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        match &self {
            Self::BadGateway { .. } | Self::GatewayTimeout(_) => {
                log(LogLevel::Error, &format!("Upstream error: {self:#}"));
            }
            Self::CounterStore { .. } | Self::Internal(_) => {
                log(LogLevel::Error, &format!("Gateway error: {self}"));
            }
            _ => {}
        }

        let body = Json(json!({
            "error": {
                "code": self.code(),
                "message": self.to_string(),
            }
        }));

        (status, body).into_response()
    }
}
