/* src/proxy.rs */

use crate::{
    breaker::BreakerPermit,
    error::GatewayError,
    middleware::REQUEST_ID,
    quota::{self, QuotaDecision},
    ratelimit::{allow_shared, client_key},
    routing::CompiledRoute,
    state::{AppState, RouteRuntime},
    transform,
    upstream::InFlight,
    websocket,
};
use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{
        HeaderMap, HeaderName, HeaderValue, Request, StatusCode, Uri, Version, header,
        request::Parts,
    },
    response::{IntoResponse, Response},
};
use chrono::Utc;
use fancy_log::{LogLevel, log};
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::body::Incoming;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

const IP_HEADERS_TO_CLEAN: &[&str] = &[
    "x-real-ip",
    "x-forwarded-for",
    "x-forwarded",
    "forwarded-for",
    "forwarded",
];

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// How a request leaves the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Engine {
    Http,
    H2c,
    WebSocket,
}

/// Route label used for requests that matched nothing.
const UNMATCHED: &str = "none";

pub async fn proxy_handler(State(state): State<Arc<AppState>>, req: Request<Body>) -> Response {
    let started = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_owned();
    let request_id = req
        .headers()
        .get(&REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_owned();
    let client_ip = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map_or_else(|| "unknown".to_owned(), |ConnectInfo(addr)| addr.ip().to_string());
    let host = request_host(&req);

    let route = state.table.find(&host, &path);
    let route_name = route.map_or(UNMATCHED, |r| r.name.as_str());
    let mut upstream = None;

    let result = match route {
        Some(route) => forward(&state, route, req, &client_ip, &request_id, &mut upstream).await,
        None => Err(GatewayError::NoRoute(path.clone())),
    };

    let (outcome, response) = match result {
        Ok(response) => {
            let outcome = if response.status().is_server_error() { "upstream_error" } else { "ok" };
            (outcome, response)
        }
        Err(err) => {
            if let Some(reason) = err.rejection_reason() {
                state.metrics.observe_rejection(route_name, reason);
            }
            (outcome_class(&err), err.into_response())
        }
    };

    let elapsed = started.elapsed();
    state.metrics.observe_request(route_name, outcome, elapsed.as_secs_f64());
    log(
        LogLevel::Info,
        &format!(
            "{method} {path} route={route_name} upstream={} status={} outcome={outcome} duration_ms={} request_id={request_id}",
            upstream.as_deref().unwrap_or("-"),
            response.status().as_u16(),
            elapsed.as_millis()
        ),
    );
    response
}

fn outcome_class(err: &GatewayError) -> &'static str {
    match err {
        GatewayError::CircuitOpen(_) => "circuit_open",
        GatewayError::CounterStore { .. } => "rejected",
        e if e.rejection_reason().is_some() => "rejected",
        _ => "upstream_error",
    }
}

/// Request host without the port, from `Host` or the URI authority (HTTP/2).
fn request_host(req: &Request<Body>) -> String {
    let raw = req
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| req.uri().authority().map(|a| a.as_str()))
        .unwrap_or_default();
    strip_port(raw).to_owned()
}

fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return host.split_once(']').map_or(host, |(v6, _)| &host[..=v6.len()]);
    }
    host.rsplit_once(':')
        .filter(|(_, port)| port.chars().all(|c| c.is_ascii_digit()))
        .map_or(host, |(name, _)| name)
}

/// Runs the per-route pipeline for a matched request.
async fn forward(
    state: &AppState,
    route: &CompiledRoute,
    mut req: Request<Body>,
    client_ip: &str,
    request_id: &str,
    selected: &mut Option<String>,
) -> Result<Response, GatewayError> {
    route.check_method(req.method())?;

    let limit = state.env.max_body_bytes;
    if content_length(req.headers()).is_some_and(|len| len > limit) {
        return Err(GatewayError::PayloadTooLarge { limit });
    }

    let runtime = state.runtime(route);
    admit(state, route, runtime, req.headers(), client_ip).await?;

    let engine = if route.websocket_passthrough && websocket::is_upgrade(req.headers()) {
        Engine::WebSocket
    } else if route.grpc_proxy {
        Engine::H2c
    } else {
        Engine::Http
    };
    let client_upgrade = (engine == Engine::WebSocket).then(|| hyper::upgrade::on(&mut req));

    let (mut parts, body) = req.into_parts();
    transform::apply_headers(route, &mut parts.headers);
    let query = transform::inject_query(parts.uri.query(), &route.query_inject);

    let selection = runtime
        .pool
        .select(route, &parts.headers, request_id)
        .ok_or_else(|| GatewayError::NoUpstream(route.name.clone()))?;
    *selected = Some(selection.upstream.clone());

    let path = transform::rewrite_path(parts.uri.path(), route.rewrite_prefix.as_deref());
    let target = target_uri(&selection.upstream, &path, query.as_deref(), engine)?;

    let permit = match &runtime.breaker {
        Some(breaker) => Some(
            breaker
                .acquire()
                .ok_or_else(|| GatewayError::CircuitOpen(route.name.clone()))?,
        ),
        None => None,
    };

    prepare_headers(&mut parts, client_ip, engine);
    parts.uri = target;
    parts.version = match engine {
        Engine::H2c => Version::HTTP_2,
        Engine::Http | Engine::WebSocket => Version::HTTP_11,
    };
    let body = Body::new(Limited::new(body, limit));
    let upstream_req = Request::from_parts(parts, body);

    if engine == Engine::WebSocket {
        log(
            LogLevel::Debug,
            &format!("Passing WebSocket upgrade through to {}", websocket::ws_url(&selection.upstream)),
        );
    }

    let mut guard = runtime.pool.begin(&selection.upstream);
    let sent = tokio::time::timeout(state.env.write_timeout, send(state, engine, upstream_req)).await;

    let mut response = match sent {
        Err(_) => {
            record(state, route, permit, &mut guard, false);
            return Err(GatewayError::GatewayTimeout(selection.upstream));
        }
        Ok(Err(err)) if err.chain().any(|e| e.is::<LengthLimitError>()) => {
            // The client overran the cap; no outcome for the upstream.
            drop(permit);
            return Err(GatewayError::PayloadTooLarge { limit });
        }
        Ok(Err(err)) => {
            record(state, route, permit, &mut guard, false);
            return Err(GatewayError::BadGateway { upstream: selection.upstream, source: err });
        }
        Ok(Ok(response)) => response,
    };

    let success = !response.status().is_server_error();
    record(state, route, permit, &mut guard, success);

    if let Some(client_upgrade) = client_upgrade {
        if response.status() == StatusCode::SWITCHING_PROTOCOLS {
            let upstream_upgrade = hyper::upgrade::on(&mut response);
            websocket::spawn_tunnel(client_upgrade, upstream_upgrade, guard);
            return Ok(response.map(Body::new));
        }
    }

    if engine == Engine::Http {
        strip_hop_by_hop(response.headers_mut());
    }
    Ok(hold_until_done(response, guard))
}

/// Rate limit, then quota. Counter store failures never admit.
async fn admit(
    state: &AppState,
    route: &CompiledRoute,
    runtime: &RouteRuntime,
    headers: &HeaderMap,
    client_ip: &str,
) -> Result<(), GatewayError> {
    if let Some(rl) = &route.rate_limit {
        let key = client_key(headers, rl.key_header.as_deref(), client_ip);
        let allowed = match &runtime.limiter {
            Some(limiter) => limiter.allow(&key),
            None => {
                let now_secs = u64::try_from(Utc::now().timestamp()).unwrap_or_default();
                allow_shared(state.counter.as_ref(), &route.name, &key, rl.window_sec, rl.limit, now_secs)
                    .await
                    .map_err(|e| counter_failure(state, route, &e))?
            }
        };
        if !allowed {
            return Err(GatewayError::RateLimited { route: route.name.clone(), key });
        }
    }

    if let Some(spec) = &route.quota {
        let key = client_key(headers, spec.key_header.as_deref(), client_ip);
        let decision = quota::check(state.counter.as_ref(), spec, &route.name, &key, Utc::now())
            .await
            .map_err(|e| counter_failure(state, route, &e))?;
        match decision {
            QuotaDecision::Allowed => {}
            QuotaDecision::HourlyExceeded => {
                return Err(GatewayError::HourlyQuotaExceeded { route: route.name.clone(), key });
            }
            QuotaDecision::DailyExceeded => {
                return Err(GatewayError::DailyQuotaExceeded { route: route.name.clone(), key });
            }
        }
    }
    Ok(())
}

fn counter_failure(state: &AppState, route: &CompiledRoute, err: &anyhow::Error) -> GatewayError {
    state.metrics.observe_counter_error(&route.name);
    log(
        LogLevel::Error,
        &format!(
            "Counter store ({}) failed on route '{}': {err:#}",
            state.counter.backend(),
            route.name
        ),
    );
    GatewayError::CounterStore { route: route.name.clone(), message: format!("{err:#}") }
}

/// Reports one dispatch outcome to the breaker and the outlier detector.
fn record(
    state: &AppState,
    route: &CompiledRoute,
    permit: Option<BreakerPermit<'_>>,
    guard: &mut InFlight,
    success: bool,
) {
    if let Some(permit) = permit {
        permit.report(success);
    }
    if guard.finish(success) {
        state.metrics.observe_ejection(&route.name, guard.upstream());
    }
}

async fn send(state: &AppState, engine: Engine, req: Request<Body>) -> anyhow::Result<Response<Incoming>> {
    match engine {
        Engine::Http => Ok(state.http_client.request(req).await?),
        Engine::H2c => Ok(state.h2c_client.request(req).await?),
        Engine::WebSocket => websocket::handshake(&state.ws_connector, req).await,
    }
}

/// `base` + rewritten path + query. WebSocket dials keep an HTTP scheme;
/// h2c always dials cleartext.
fn target_uri(base: &str, path: &str, query: Option<&str>, engine: Engine) -> Result<Uri, GatewayError> {
    let base = base.trim_end_matches('/');
    let base = match base.split_once("://") {
        Some(("ws", rest)) => format!("http://{rest}"),
        Some(("wss", rest)) if engine != Engine::H2c => format!("https://{rest}"),
        Some(("https" | "wss", rest)) if engine == Engine::H2c => format!("http://{rest}"),
        _ => base.to_owned(),
    };

    let target = match query {
        Some(q) if !q.is_empty() => format!("{base}{path}?{q}"),
        _ => format!("{base}{path}"),
    };
    target
        .parse()
        .map_err(|e| GatewayError::Internal(format!("invalid upstream url '{target}': {e}")))
}

fn prepare_headers(parts: &mut Parts, client_ip: &str, engine: Engine) {
    for name in IP_HEADERS_TO_CLEAN {
        parts.headers.remove(*name);
    }
    if let Ok(ip) = HeaderValue::from_str(client_ip) {
        parts.headers.insert("x-forwarded-for", ip);
    }
    parts.headers.remove(header::HOST);

    match engine {
        Engine::Http => strip_hop_by_hop(&mut parts.headers),
        Engine::H2c => {
            let trailers = parts
                .headers
                .get(header::TE)
                .is_some_and(|v| v.as_bytes().eq_ignore_ascii_case(b"trailers"));
            strip_hop_by_hop(&mut parts.headers);
            if trailers {
                parts.headers.insert(header::TE, HeaderValue::from_static("trailers"));
            }
        }
        Engine::WebSocket => {}
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
    for name in listed {
        headers.remove(name);
    }
}

fn content_length(headers: &HeaderMap) -> Option<usize> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// Streams the upstream body back while keeping the in-flight slot held
/// until the body is finished or dropped.
fn hold_until_done(response: Response<Incoming>, guard: InFlight) -> Response {
    response.map(|body| {
        Body::new(body.map_frame(move |frame| {
            let _held = &guard;
            frame
        }))
    })
}
