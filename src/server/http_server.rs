/* src/server/http_server.rs */

use crate::config::GatewayEnv;
use axum::{Router, extract::ConnectInfo};
use fancy_log::{LogLevel, log};
use hyper::{Request, body::Incoming};
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto::Builder;
use hyper_util::server::graceful::GracefulShutdown;
use std::future::Future;
use tokio::net::TcpListener;
use tower::ServiceExt;

/// Accepts connections until `shutdown` resolves, then drains in-flight
/// connections for at most the write timeout.
///
/// HTTP/1.1 (with upgrades) and prior-knowledge HTTP/2 are served on the
/// same socket.
pub async fn serve<F>(listener: TcpListener, app: Router, env: &GatewayEnv, shutdown: F)
where
    F: Future<Output = ()>,
{
    let mut builder = Builder::new(TokioExecutor::new());
    builder
        .http1()
        .timer(TokioTimer::new())
        .keep_alive(true)
        .header_read_timeout(env.read_timeout);
    builder
        .http2()
        .timer(TokioTimer::new())
        .keep_alive_interval(env.idle_timeout)
        .keep_alive_timeout(env.idle_timeout);

    let graceful = GracefulShutdown::new();
    tokio::pin!(shutdown);

    loop {
        let (stream, remote) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    log(LogLevel::Warn, &format!("Failed to accept connection: {e}"));
                    continue;
                }
            },
            () = &mut shutdown => break,
        };

        let app = app.clone();
        let service = hyper::service::service_fn(move |mut req: Request<Incoming>| {
            req.extensions_mut().insert(ConnectInfo(remote));
            app.clone().oneshot(req)
        });

        let conn = builder.serve_connection_with_upgrades(TokioIo::new(stream), service);
        let conn = graceful.watch(conn.into_owned());
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                log(LogLevel::Debug, &format!("Connection from {remote} closed: {e}"));
            }
        });
    }

    drop(listener);
    tokio::select! {
        () = graceful.shutdown() => {}
        () = tokio::time::sleep(env.write_timeout) => {
            log(LogLevel::Warn, "Timed out draining connections.");
        }
    }
}
