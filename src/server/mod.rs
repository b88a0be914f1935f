/* src/server/mod.rs */

mod http_server;

use crate::{
    clock::MonotonicClock,
    config::{self, GatewayEnv},
    counter::{MemoryCounter, RedisCounter, SharedCounter},
    middleware, proxy,
    state::AppState,
};
use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::State,
    http::header,
    middleware as axum_middleware,
    response::IntoResponse,
    routing::get,
};
use fancy_log::{LogLevel, log};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Loads configuration, builds shared state and serves until a shutdown
/// signal arrives.
pub async fn run() -> Result<()> {
    let env = GatewayEnv::from_env().context("Invalid environment configuration")?;
    log(LogLevel::Info, &format!("Route file: {:?}", env.config_path));

    let specs = config::load_routes(&env).context("Failed to load routes")?;
    let counter = connect_counter(&env).await?;
    let state = Arc::new(AppState::build(
        env,
        &specs,
        counter,
        Arc::new(MonotonicClock::default()),
    )?);
    log(
        LogLevel::Info,
        &format!("Compiled {} route(s)", state.table.len()),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], state.env.port));
    let tcp = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    log(LogLevel::Info, &format!("Sluice gateway listening on {addr}"));

    let sweeper = spawn_sweeper(state.clone());
    let app = router(state.clone());
    http_server::serve(tcp, app, &state.env, shutdown_signal()).await;
    sweeper.abort();

    log(LogLevel::Info, "Gateway stopped.");
    Ok(())
}

/// The full gateway router: `/health` and `/metrics`, everything else
/// through the proxy pipeline. Request-id and CORS wrap all of it.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .fallback(proxy::proxy_handler)
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::cors,
        ))
        .layer(axum_middleware::from_fn(middleware::request_id))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

async fn connect_counter(env: &GatewayEnv) -> Result<Arc<dyn SharedCounter>> {
    match &env.redis_addr {
        Some(addr) => {
            let counter =
                RedisCounter::connect(addr, env.redis_password.as_deref(), env.redis_db).await?;
            log(LogLevel::Info, &format!("Shared counters stored in Redis at {addr}"));
            Ok(Arc::new(counter))
        }
        None => {
            log(
                LogLevel::Warn,
                "REDIS_ADDR not set, shared counters are local to this process.",
            );
            Ok(Arc::new(MemoryCounter::new()))
        }
    }
}

fn spawn_sweeper(state: Arc<AppState>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let evicted = state.sweep();
            if evicted > 0 {
                log(LogLevel::Debug, &format!("Swept {evicted} idle limiter key(s)"));
            }
        }
    })
}

/// Listens for OS signals for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            log(LogLevel::Error, &format!("Failed to listen for Ctrl-C: {e}"));
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                log(LogLevel::Error, &format!("Failed to install SIGTERM handler: {e}"));
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    log(LogLevel::Info, "Signal received, shutting down gracefully.");
}
