#![allow(dead_code)]

use axum::{
    Json, Router,
    body::Body,
    extract::ConnectInfo,
    http::{Request, Response, StatusCode},
};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use sluice::{
    clock::ManualClock,
    config::GatewayEnv,
    counter::{MemoryCounter, SharedCounter},
    models::RouteSpec,
    server,
    state::AppState,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::net::TcpListener;
use tower::ServiceExt;

pub const CLIENT: ([u8; 4], u16) = ([10, 0, 0, 1], 40000);

/// A gateway router plus handles on its state and clock.
pub struct Gateway {
    pub app: Router,
    pub state: Arc<AppState>,
    pub clock: Arc<ManualClock>,
}

impl Gateway {
    pub fn new(routes: Vec<RouteSpec>) -> Self {
        Self::with(GatewayEnv::default(), routes, Arc::new(MemoryCounter::new()))
    }

    pub fn with(env: GatewayEnv, routes: Vec<RouteSpec>, counter: Arc<dyn SharedCounter>) -> Self {
        let clock = ManualClock::shared();
        let state = Arc::new(AppState::build(env, &routes, counter, clock.clone()).unwrap());
        Self { app: server::router(state.clone()), state, clock }
    }

    pub async fn send(&self, mut req: Request<Body>) -> Response<Body> {
        req.extensions_mut().insert(ConnectInfo(SocketAddr::from(CLIENT)));
        self.app.clone().oneshot(req).await.unwrap()
    }

    pub async fn get(&self, path: &str) -> Response<Body> {
        self.send(Request::get(path).body(Body::empty()).unwrap()).await
    }
}

pub async fn json_body(resp: Response<Body>) -> Value {
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

/// Upstream that echoes what it received. Requests carrying `x-fail: 1`
/// get a 500. `hits` counts every request.
pub struct Upstream {
    pub url: String,
    pub hits: Arc<AtomicUsize>,
}

impl Upstream {
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

pub async fn echo_upstream(name: &'static str) -> Upstream {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    let app = Router::new().fallback(move |req: Request<Body>| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            let header = |n: &str| {
                req.headers()
                    .get(n)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_owned)
            };
            let status = if header("x-fail").as_deref() == Some("1") {
                StatusCode::INTERNAL_SERVER_ERROR
            } else {
                StatusCode::OK
            };
            let body = json!({
                "upstream": name,
                "method": req.method().as_str(),
                "path": req.uri().path(),
                "query": req.uri().query(),
                "version": format!("{:?}", req.version()),
                "x_forwarded_for": header("x-forwarded-for"),
                "x_real_ip": header("x-real-ip"),
                "x_request_id": header("x-request-id"),
                "x_env": header("x-env"),
                "cookie": header("cookie"),
            });
            (status, Json(body))
        }
    });
    Upstream { url: serve(app).await, hits }
}

/// Upstream that never answers within any reasonable deadline.
pub async fn stalled_upstream() -> String {
    let app = Router::new().fallback(|| async {
        tokio::time::sleep(std::time::Duration::from_secs(30)).await;
        "late"
    });
    serve(app).await
}

/// An address nothing listens on.
pub async fn dead_upstream() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}")
}

pub async fn serve(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

pub fn route(name: &str, prefix: &str, upstream: &str) -> RouteSpec {
    RouteSpec {
        name: name.to_owned(),
        path_prefix: prefix.to_owned(),
        upstream: Some(upstream.to_owned()),
        ..Default::default()
    }
}

/// Upstream that answers every request with a 500.
pub async fn failing_upstream() -> Upstream {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    let app = Router::new().fallback(move || {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            (StatusCode::INTERNAL_SERVER_ERROR, "boom")
        }
    });
    Upstream { url: serve(app).await, hits }
}
