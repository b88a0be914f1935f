mod common;

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, StatusCode, header},
};
use common::{Gateway, echo_upstream, json_body, route};
use sluice::{
    config::GatewayEnv,
    counter::{MemoryCounter, SharedCounter},
    models::{QuotaSpec, RateLimitSpec, RouteSpec},
};
use std::sync::Arc;
use std::time::Duration;

fn keyed(path: &str, key: &str) -> Request<Body> {
    Request::get(path).header("x-key", key).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn local_token_bucket_burst_then_429() {
    let u = echo_upstream("u").await;
    let gw = Gateway::new(vec![RouteSpec {
        rate_limit: Some(RateLimitSpec {
            enabled: true,
            rps: 1.0,
            burst: 2,
            key_header: Some("X-Key".into()),
            ..Default::default()
        }),
        ..route("limited", "", &u.url)
    }]);

    let statuses = [
        gw.send(keyed("/", "K")).await.status(),
        gw.send(keyed("/", "K")).await.status(),
        gw.send(keyed("/", "K")).await.status(),
    ];
    assert_eq!(statuses, [StatusCode::OK, StatusCode::OK, StatusCode::TOO_MANY_REQUESTS]);

    // Other keys have their own bucket.
    assert_eq!(gw.send(keyed("/", "other")).await.status(), StatusCode::OK);

    gw.clock.advance(Duration::from_secs(1));
    assert_eq!(gw.send(keyed("/", "K")).await.status(), StatusCode::OK);
    assert_eq!(u.hits(), 4);
    assert_eq!(gw.state.metrics.rejections("limited", "rate_limit"), 1);
}

#[tokio::test]
async fn limiter_state_is_per_route() {
    let u = echo_upstream("u").await;
    let limit = RateLimitSpec {
        enabled: true,
        rps: 0.0,
        burst: 1,
        key_header: Some("X-Key".into()),
        ..Default::default()
    };
    let gw = Gateway::new(vec![
        RouteSpec { rate_limit: Some(limit.clone()), ..route("a", "/a", &u.url) },
        RouteSpec { rate_limit: Some(limit), ..route("b", "/b", &u.url) },
    ]);

    assert_eq!(gw.send(keyed("/a", "K")).await.status(), StatusCode::OK);
    assert_eq!(gw.send(keyed("/a", "K")).await.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(gw.send(keyed("/b", "K")).await.status(), StatusCode::OK);
}

#[tokio::test]
async fn shared_window_admits_up_to_limit() {
    let u = echo_upstream("u").await;
    let gw = Gateway::new(vec![RouteSpec {
        rate_limit: Some(RateLimitSpec {
            enabled: true,
            use_shared: true,
            // Wide enough that no window boundary falls inside the test.
            window_sec: 1_000_000_000,
            limit: 3,
            key_header: Some("X-Key".into()),
            ..Default::default()
        }),
        ..route("shared", "", &u.url)
    }]);

    let mut statuses = Vec::new();
    for _ in 0..5 {
        statuses.push(gw.send(keyed("/", "K")).await.status());
    }
    assert_eq!(
        statuses,
        [
            StatusCode::OK,
            StatusCode::OK,
            StatusCode::OK,
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::TOO_MANY_REQUESTS,
        ]
    );
    assert_eq!(u.hits(), 3);

    let resp = gw.send(keyed("/", "L")).await;
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn hourly_quota_rejects_with_its_own_code() {
    let u = echo_upstream("u").await;
    let gw = Gateway::new(vec![RouteSpec {
        quota: Some(QuotaSpec {
            enabled: true,
            hourly: 2,
            daily: 100,
            key_header: Some("X-Key".into()),
        }),
        ..route("metered", "", &u.url)
    }]);

    assert_eq!(gw.send(keyed("/", "K")).await.status(), StatusCode::OK);
    assert_eq!(gw.send(keyed("/", "K")).await.status(), StatusCode::OK);
    let resp = gw.send(keyed("/", "K")).await;
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(json_body(resp).await["error"]["code"], "HOURLY_QUOTA_EXCEEDED");
}

#[tokio::test]
async fn daily_quota_falls_back_to_client_ip() {
    let u = echo_upstream("u").await;
    let gw = Gateway::new(vec![RouteSpec {
        quota: Some(QuotaSpec { enabled: true, daily: 1, ..Default::default() }),
        ..route("daily", "", &u.url)
    }]);

    assert_eq!(gw.get("/").await.status(), StatusCode::OK);
    let resp = gw.get("/").await;
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(json_body(resp).await["error"]["code"], "DAILY_QUOTA_EXCEEDED");
}

struct BrokenCounter;

#[async_trait]
impl SharedCounter for BrokenCounter {
    async fn incr(&self, _key: &str) -> anyhow::Result<i64> {
        anyhow::bail!("connection refused")
    }

    async fn expire(&self, _key: &str, _ttl: Duration) -> anyhow::Result<()> {
        anyhow::bail!("connection refused")
    }

    fn backend(&self) -> &'static str {
        "broken"
    }
}

#[tokio::test]
async fn counter_failure_is_500_and_never_admits() {
    let u = echo_upstream("u").await;
    let gw = Gateway::with(
        GatewayEnv::default(),
        vec![RouteSpec {
            quota: Some(QuotaSpec { enabled: true, hourly: 10, ..Default::default() }),
            ..route("q", "", &u.url)
        }],
        Arc::new(BrokenCounter),
    );

    let resp = gw.get("/").await;
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(json_body(resp).await["error"]["code"], "COUNTER_STORE_ERROR");
    assert_eq!(u.hits(), 0);
    assert_eq!(gw.state.metrics.counter_errors("q"), 1);
}

#[tokio::test]
async fn oversized_body_is_413() {
    let u = echo_upstream("u").await;
    let env = GatewayEnv { max_body_bytes: 16, ..Default::default() };
    let gw = Gateway::with(env, vec![route("a", "", &u.url)], Arc::new(MemoryCounter::new()));

    let req = Request::post("/upload")
        .header(header::CONTENT_LENGTH, "64")
        .body(Body::from(vec![b'x'; 64]))
        .unwrap();
    let resp = gw.send(req).await;
    assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(u.hits(), 0);

    let req = Request::post("/upload").body(Body::from("small")).unwrap();
    assert_eq!(gw.send(req).await.status(), StatusCode::OK);
}
