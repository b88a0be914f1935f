/* src/routing.rs */

use crate::error::{ConfigError, GatewayError};
use crate::models::{
    CanaryBucketing, CircuitBreakerSpec, HeaderRoute, LoadBalancing, OutlierSpec, QuotaSpec,
    RateLimitSpec, RouteSpec,
};
use axum::http::{HeaderName, HeaderValue, Method, Uri};
use regex::Regex;
use std::collections::HashSet;

/// Header override compiled from a [`HeaderRoute`].
#[derive(Debug, Clone)]
pub struct CompiledHeaderRoute {
    pub header: HeaderName,
    pub value: String,
    pub upstream: String,
}

/// A route with every per-request derivation done up front. Immutable once built.
#[derive(Debug, Clone)]
pub struct CompiledRoute {
    pub index: usize,
    pub name: String,

    pub hosts: Vec<String>,
    pub path_prefix: String,
    pub regex: Option<Regex>,
    pub methods_allow: HashSet<Method>,
    pub methods_deny: HashSet<Method>,

    pub upstream: Option<String>,
    pub upstreams: Vec<String>,
    pub canary_upstream: Option<String>,
    pub canary_percent: Option<f64>,
    pub canary_bucketing: CanaryBucketing,
    pub header_routes: Vec<CompiledHeaderRoute>,

    pub headers_set: Vec<(HeaderName, HeaderValue)>,
    pub headers_remove: Vec<HeaderName>,
    /// Sorted by key so injection order is stable.
    pub query_inject: Vec<(String, String)>,
    pub rewrite_prefix: Option<String>,

    pub websocket_passthrough: bool,
    pub grpc_proxy: bool,

    pub rate_limit: Option<RateLimitSpec>,
    pub quota: Option<QuotaSpec>,
    pub circuit_breaker: Option<CircuitBreakerSpec>,
    pub outlier_detection: Option<OutlierSpec>,
    pub load_balancing: LoadBalancing,
}

impl CompiledRoute {
    pub fn compile(index: usize, spec: &RouteSpec) -> Result<Self, ConfigError> {
        let name = spec.name.trim().to_owned();
        if name.is_empty() {
            return Err(ConfigError::EmptyRouteName(index));
        }

        let regex = spec
            .regex
            .as_deref()
            .filter(|p| !p.is_empty())
            .map(|pattern| {
                Regex::new(pattern).map_err(|source| ConfigError::InvalidRegex {
                    route: name.clone(),
                    pattern: pattern.to_owned(),
                    source,
                })
            })
            .transpose()?;

        let methods_allow = method_set(&name, &spec.methods_allow)?;
        let methods_deny = method_set(&name, &spec.methods_deny)?;

        let upstream = spec.upstream.as_deref().filter(|u| !u.is_empty()).map(str::to_owned);
        let upstreams: Vec<String> = spec
            .upstreams
            .iter()
            .filter(|u| !u.is_empty())
            .cloned()
            .collect();
        let canary_upstream = spec
            .canary_upstream
            .as_deref()
            .filter(|u| !u.is_empty())
            .map(str::to_owned);

        let header_routes = spec
            .header_routes
            .iter()
            .map(|hr| compile_header_route(&name, hr))
            .collect::<Result<Vec<_>, _>>()?;

        for url in upstream
            .iter()
            .chain(upstreams.iter())
            .chain(canary_upstream.iter())
            .chain(header_routes.iter().map(|hr| &hr.upstream))
        {
            validate_upstream(&name, url)?;
        }

        let canary_percent = match spec.canary_percent {
            Some(p) if !(0.0..=100.0).contains(&p.0) || p.0.is_nan() => {
                return Err(ConfigError::InvalidCanaryPercent { route: name, value: p.0 });
            }
            Some(p) => Some(p.0),
            None => None,
        };

        let headers_set = spec
            .headers_set
            .iter()
            .map(|(k, v)| {
                let invalid = || ConfigError::InvalidHeader { route: name.clone(), header: k.clone() };
                let key = HeaderName::from_bytes(k.as_bytes()).map_err(|_| invalid())?;
                let value = HeaderValue::from_str(v).map_err(|_| invalid())?;
                Ok((key, value))
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        let headers_remove = spec
            .headers_remove
            .iter()
            .map(|k| {
                HeaderName::from_bytes(k.as_bytes())
                    .map_err(|_| ConfigError::InvalidHeader { route: name.clone(), header: k.clone() })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut query_inject: Vec<(String, String)> = spec
            .query_inject
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        query_inject.sort();

        let load_balancing = match spec.load_balancing.as_deref() {
            None => LoadBalancing::default(),
            Some(raw) => LoadBalancing::parse(raw).ok_or_else(|| ConfigError::UnknownLoadBalancing {
                route: name.clone(),
                policy: raw.to_owned(),
            })?,
        };

        Ok(Self {
            index,
            hosts: spec.hosts.iter().filter(|h| !h.is_empty()).cloned().collect(),
            path_prefix: spec.path_prefix.clone(),
            regex,
            methods_allow,
            methods_deny,
            upstream,
            upstreams,
            canary_upstream,
            canary_percent,
            canary_bucketing: spec.canary_bucketing,
            header_routes,
            headers_set,
            headers_remove,
            query_inject,
            rewrite_prefix: spec.rewrite_prefix.clone().filter(|p| !p.is_empty()),
            websocket_passthrough: spec.websocket_passthrough,
            grpc_proxy: spec.grpc_proxy,
            rate_limit: spec.rate_limit.clone().filter(|r| r.enabled),
            quota: spec.quota.clone().filter(|q| q.enabled),
            circuit_breaker: spec.circuit_breaker.clone().filter(|c| c.enabled),
            outlier_detection: spec.outlier_detection.clone().filter(|o| o.enabled),
            load_balancing,
            name,
        })
    }

    /// Host, path prefix and regex all hold. Empty keys match anything.
    pub fn matches(&self, host: &str, path: &str) -> bool {
        (self.hosts.is_empty() || self.hosts.iter().any(|h| h == host))
            && (self.path_prefix.is_empty() || path.starts_with(&self.path_prefix))
            && self.regex.as_ref().is_none_or(|re| re.is_match(path))
    }

    /// Deny set first, then a non-empty allow set.
    pub fn check_method(&self, method: &Method) -> Result<(), GatewayError> {
        let denied = self.methods_deny.contains(method)
            || (!self.methods_allow.is_empty() && !self.methods_allow.contains(method));
        if denied {
            return Err(GatewayError::MethodNotAllowed {
                route: self.name.clone(),
                method: method.to_string(),
            });
        }
        Ok(())
    }
}

fn method_set(route: &str, methods: &[String]) -> Result<HashSet<Method>, ConfigError> {
    methods
        .iter()
        .map(|m| {
            Method::from_bytes(m.trim().to_ascii_uppercase().as_bytes()).map_err(|_| {
                ConfigError::InvalidMethod { route: route.to_owned(), method: m.clone() }
            })
        })
        .collect()
}

fn compile_header_route(route: &str, hr: &HeaderRoute) -> Result<CompiledHeaderRoute, ConfigError> {
    let header = HeaderName::from_bytes(hr.header.as_bytes()).map_err(|_| ConfigError::InvalidHeader {
        route: route.to_owned(),
        header: hr.header.clone(),
    })?;
    Ok(CompiledHeaderRoute { header, value: hr.value.clone(), upstream: hr.upstream.clone() })
}

fn validate_upstream(route: &str, url: &str) -> Result<(), ConfigError> {
    let invalid = || ConfigError::InvalidUpstream { route: route.to_owned(), url: url.to_owned() };
    let uri: Uri = url.parse().map_err(|_| invalid())?;
    match (uri.scheme_str(), uri.authority()) {
        (Some("http" | "https" | "ws" | "wss"), Some(_)) => Ok(()),
        _ => Err(invalid()),
    }
}

/// Compiled routes in declaration order.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: Vec<CompiledRoute>,
}

impl RouteTable {
    /// Compiles routes without reordering; names must be unique.
    pub fn compile(specs: &[RouteSpec]) -> Result<Self, ConfigError> {
        let mut seen = HashSet::new();
        let mut routes = Vec::with_capacity(specs.len());
        for (index, spec) in specs.iter().enumerate() {
            let route = CompiledRoute::compile(index, spec)?;
            if !seen.insert(route.name.clone()) {
                return Err(ConfigError::DuplicateRouteName(route.name));
            }
            routes.push(route);
        }
        Ok(Self { routes })
    }

    /// First route, in declaration order, whose match keys all hold.
    pub fn find(&self, host: &str, path: &str) -> Option<&CompiledRoute> {
        self.routes.iter().find(|r| r.matches(host, path))
    }

    pub fn routes(&self) -> &[CompiledRoute] {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
