/* src/state.rs */

use crate::breaker::CircuitBreaker;
use crate::clock::Clock;
use crate::config::GatewayEnv;
use crate::counter::SharedCounter;
use crate::metrics::Metrics;
use crate::models::RouteSpec;
use crate::ratelimit::LocalLimiter;
use crate::routing::{CompiledRoute, RouteTable};
use crate::upstream::UpstreamPool;
use anyhow::{Context, Result};
use axum::body::Body;
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use rustls::{ClientConfig, RootCertStore};
use std::sync::Arc;

pub type HttpClient = Client<HttpsConnector<HttpConnector>, Body>;
pub type H2cClient = Client<HttpConnector, Body>;

/// Mutable per-route state that sits next to an immutable [`CompiledRoute`].
pub struct RouteRuntime {
    pub limiter: Option<LocalLimiter>,
    pub breaker: Option<CircuitBreaker>,
    pub pool: Arc<UpstreamPool>,
}

impl RouteRuntime {
    fn new(route: &CompiledRoute, env: &GatewayEnv, clock: &Arc<dyn Clock>) -> Self {
        let limiter = route
            .rate_limit
            .as_ref()
            .filter(|rl| !rl.use_shared)
            .map(|rl| {
                LocalLimiter::new(
                    rl.rps,
                    rl.burst,
                    env.limiter_max_keys,
                    env.limiter_idle,
                    clock.clone(),
                )
            });
        let breaker = route
            .circuit_breaker
            .as_ref()
            .map(|cb| CircuitBreaker::new(&route.name, cb, clock.clone()));

        Self { limiter, breaker, pool: Arc::new(UpstreamPool::new(route, clock.clone())) }
    }
}

pub struct AppState {
    pub env: GatewayEnv,
    pub table: RouteTable,
    /// Indexed by [`CompiledRoute::index`].
    pub runtimes: Vec<RouteRuntime>,
    pub http_client: HttpClient,
    pub h2c_client: H2cClient,
    /// HTTP/1.1-only connector used to dial WebSocket upstreams.
    pub ws_connector: HttpsConnector<HttpConnector>,
    pub counter: Arc<dyn SharedCounter>,
    pub metrics: Metrics,
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    /// Compiles `specs` and wires every per-route runtime and shared client.
    pub fn build(
        env: GatewayEnv,
        specs: &[RouteSpec],
        counter: Arc<dyn SharedCounter>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let table = RouteTable::compile(specs).context("Invalid route configuration")?;
        let runtimes = table
            .routes()
            .iter()
            .map(|route| RouteRuntime::new(route, &env, &clock))
            .collect();
        let metrics = Metrics::new().context("Failed to register metrics")?;

        let http_client = Client::builder(TokioExecutor::new()).build(https_connector(true));
        let h2c_client = Client::builder(TokioExecutor::new())
            .http2_only(true)
            .build_http();

        Ok(Self {
            env,
            table,
            runtimes,
            http_client,
            h2c_client,
            ws_connector: https_connector(false),
            counter,
            metrics,
            clock,
        })
    }

    pub fn runtime(&self, route: &CompiledRoute) -> &RouteRuntime {
        &self.runtimes[route.index]
    }

    /// Periodic housekeeping: idle limiter keys and expired in-process counters.
    pub fn sweep(&self) -> usize {
        self.counter.purge_expired();
        self.runtimes
            .iter()
            .filter_map(|rt| rt.limiter.as_ref())
            .map(LocalLimiter::sweep)
            .sum()
    }
}

/// TLS-capable connector with the webpki root set. Plain `http://` is
/// allowed through the same connector.
fn https_connector(http2: bool) -> HttpsConnector<HttpConnector> {
    let mut root_store = RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    let mut http_connector = HttpConnector::new();
    http_connector.enforce_http(false);

    let builder = HttpsConnectorBuilder::new()
        .with_tls_config(tls_config)
        .https_or_http()
        .enable_http1();
    if http2 {
        builder.enable_http2().wrap_connector(http_connector)
    } else {
        builder.wrap_connector(http_connector)
    }
}
