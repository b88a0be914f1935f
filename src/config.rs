/* src/config.rs */

use crate::error::ConfigError;
use crate::models::{RouteFile, RouteSpec};
use anyhow::{Context, Result};
use fancy_log::{LogLevel, log};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Process-wide settings read from the environment at startup.
#[derive(Debug, Clone)]
pub struct GatewayEnv {
    pub port: u16,
    pub config_path: PathBuf,
    pub redis_addr: Option<String>,
    pub redis_password: Option<String>,
    pub redis_db: i64,
    pub cors_allow_origin: String,
    pub cors_allow_methods: String,
    pub cors_allow_headers: String,
    /// `prefix=url` pairs used when the route file is absent.
    pub default_routes: Vec<(String, String)>,
    pub default_upstream: Option<String>,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_body_bytes: usize,
    pub limiter_max_keys: usize,
    pub limiter_idle: Duration,
}

impl Default for GatewayEnv {
    fn default() -> Self {
        Self {
            port: 8080,
            config_path: PathBuf::from("./gateway.yaml"),
            redis_addr: None,
            redis_password: None,
            redis_db: 0,
            cors_allow_origin: "*".to_owned(),
            cors_allow_methods: "GET, POST, PUT, PATCH, DELETE, OPTIONS".to_owned(),
            cors_allow_headers: "Content-Type, Authorization, X-Request-ID".to_owned(),
            default_routes: Vec::new(),
            default_upstream: None,
            read_timeout: Duration::from_secs(15),
            write_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(60),
            max_body_bytes: 10 * 1024 * 1024,
            limiter_max_keys: 10_000,
            limiter_idle: Duration::from_secs(600),
        }
    }
}

impl GatewayEnv {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds settings from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_owned()).filter(|v| !v.is_empty());
        let defaults = Self::default();

        let config_path = get("GATEWAY_CONFIG")
            .map(|p| PathBuf::from(shellexpand::tilde(&p).into_owned()))
            .unwrap_or(defaults.config_path);

        Ok(Self {
            port: parse_or(get("GATEWAY_PORT"), "GATEWAY_PORT", defaults.port)?,
            config_path,
            redis_addr: get("REDIS_ADDR"),
            redis_password: get("REDIS_PASSWORD"),
            redis_db: parse_or(get("REDIS_DB"), "REDIS_DB", defaults.redis_db)?,
            cors_allow_origin: get("CORS_ALLOW_ORIGIN").unwrap_or(defaults.cors_allow_origin),
            cors_allow_methods: get("CORS_ALLOW_METHODS").unwrap_or(defaults.cors_allow_methods),
            cors_allow_headers: get("CORS_ALLOW_HEADERS").unwrap_or(defaults.cors_allow_headers),
            default_routes: get("DEFAULT_ROUTES")
                .map(|raw| parse_default_routes(&raw))
                .transpose()?
                .unwrap_or_default(),
            default_upstream: get("DEFAULT_UPSTREAM"),
            read_timeout: secs_or(get("READ_TIMEOUT_SEC"), "READ_TIMEOUT_SEC", defaults.read_timeout)?,
            write_timeout: secs_or(get("WRITE_TIMEOUT_SEC"), "WRITE_TIMEOUT_SEC", defaults.write_timeout)?,
            idle_timeout: secs_or(get("IDLE_TIMEOUT_SEC"), "IDLE_TIMEOUT_SEC", defaults.idle_timeout)?,
            max_body_bytes: parse_or(get("MAX_BODY_BYTES"), "MAX_BODY_BYTES", defaults.max_body_bytes)?,
            limiter_max_keys: parse_or(
                get("LIMITER_MAX_KEYS"),
                "LIMITER_MAX_KEYS",
                defaults.limiter_max_keys,
            )?,
            limiter_idle: secs_or(get("LIMITER_IDLE_SEC"), "LIMITER_IDLE_SEC", defaults.limiter_idle)?,
        })
    }
}

fn parse_or<T>(raw: Option<String>, name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match raw {
        Some(v) => v.parse::<T>().with_context(|| format!("Invalid {name} '{v}'")),
        None => Ok(default),
    }
}

fn secs_or(raw: Option<String>, name: &str, default: Duration) -> Result<Duration> {
    parse_or(raw, name, default.as_secs()).map(Duration::from_secs)
}

fn parse_default_routes(raw: &str) -> Result<Vec<(String, String)>> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            entry
                .split_once('=')
                .map(|(prefix, url)| (prefix.trim().to_owned(), url.trim().to_owned()))
                .with_context(|| format!("Invalid DEFAULT_ROUTES entry '{entry}', expected prefix=url"))
        })
        .collect()
}

/// Loads the route list. `Ok(None)` when the file does not exist; a file
/// that exists but cannot be read or parsed is an error.
pub fn load_route_file(path: &Path) -> Result<Option<Vec<RouteSpec>>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }

    log(LogLevel::Info, &format!("Loading routes from {path:?}"));
    let content = fs::read_to_string(path)
        .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
    parse_routes(path, &content).map(Some)
}

/// Parses route file content; the format follows the file extension
/// (`.toml`, `.json`, anything else is YAML).
pub fn parse_routes(path: &Path, content: &str) -> Result<Vec<RouteSpec>, ConfigError> {
    let parse_err = |message: String| ConfigError::Parse { path: path.to_path_buf(), message };

    if content.trim().is_empty() {
        return Ok(Vec::new());
    }

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    match ext.as_str() {
        "toml" => toml::from_str::<RouteFile>(content)
            .map(|f| f.routes)
            .map_err(|e| parse_err(e.to_string())),
        "json" => {
            let value: serde_json::Value =
                serde_json::from_str(content).map_err(|e| parse_err(e.to_string()))?;
            if value.is_array() {
                serde_json::from_value(value).map_err(|e| parse_err(e.to_string()))
            } else {
                serde_json::from_value::<RouteFile>(value)
                    .map(|f| f.routes)
                    .map_err(|e| parse_err(e.to_string()))
            }
        }
        _ => {
            let value: serde_yaml::Value =
                serde_yaml::from_str(content).map_err(|e| parse_err(e.to_string()))?;
            if value.is_sequence() {
                serde_yaml::from_value(value).map_err(|e| parse_err(e.to_string()))
            } else {
                serde_yaml::from_value::<RouteFile>(value)
                    .map(|f| f.routes)
                    .map_err(|e| parse_err(e.to_string()))
            }
        }
    }
}

/// Routes synthesised from `DEFAULT_ROUTES` and `DEFAULT_UPSTREAM`, in that order.
pub fn default_routes(env: &GatewayEnv) -> Vec<RouteSpec> {
    let mut routes: Vec<RouteSpec> = env
        .default_routes
        .iter()
        .enumerate()
        .map(|(i, (prefix, url))| RouteSpec {
            name: default_route_name(i, prefix),
            path_prefix: prefix.clone(),
            upstream: Some(url.clone()),
            ..Default::default()
        })
        .collect();

    if let Some(url) = &env.default_upstream {
        routes.push(RouteSpec {
            name: "default".to_owned(),
            upstream: Some(url.clone()),
            ..Default::default()
        });
    }
    routes
}

fn default_route_name(index: usize, prefix: &str) -> String {
    let slug: String = prefix
        .trim_matches('/')
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    if slug.is_empty() { format!("default-{index}") } else { slug }
}

/// Route file content when present, otherwise the environment defaults.
pub fn load_routes(env: &GatewayEnv) -> Result<Vec<RouteSpec>, ConfigError> {
    if let Some(routes) = load_route_file(&env.config_path)? {
        return Ok(routes);
    }

    let routes = default_routes(env);
    log(
        LogLevel::Warn,
        &format!(
            "Route file {:?} not found, using {} default route(s) from the environment",
            env.config_path,
            routes.len()
        ),
    );
    Ok(routes)
}
