/* src/websocket.rs */

//! WebSocket passthrough: the upgrade request is replayed against the
//! upstream over a dedicated HTTP/1.1 connection and, once both sides have
//! switched protocols, bytes are copied in both directions until either
//! side closes.

use crate::upstream::InFlight;
use anyhow::{Context, Result};
use axum::{
    body::Body,
    http::{HeaderMap, HeaderValue, Request, Response, Uri, header},
};
use fancy_log::{LogLevel, log};
use hyper::body::Incoming;
use hyper::upgrade::OnUpgrade;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioIo;
use tower::ServiceExt;

/// `Upgrade: websocket`, or any `Connection` header that lists `upgrade`.
pub fn is_upgrade(headers: &HeaderMap) -> bool {
    let upgrade_ws = headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
    let connection_upgrade = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    upgrade_ws || connection_upgrade
}

/// Maps an upstream base onto the WebSocket scheme (`http` to `ws`,
/// `https` to `wss`) for logs. The dial itself keeps the HTTP scheme,
/// since the upgrade handshake is an ordinary HTTP/1.1 request.
pub fn ws_url(upstream: &str) -> String {
    if let Some(rest) = upstream.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = upstream.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        upstream.to_owned()
    }
}

/// Sends the upgrade request to the upstream named by `req`'s URI and
/// returns its response. A `101` response still has its upgrade pending.
pub async fn handshake(
    connector: &HttpsConnector<HttpConnector>,
    mut req: Request<Body>,
) -> Result<Response<Incoming>> {
    let uri = req.uri().clone();
    if let Some(authority) = uri.authority() {
        if !req.headers().contains_key(header::HOST) {
            let host = HeaderValue::from_str(authority.as_str())
                .with_context(|| format!("Invalid upstream authority '{authority}'"))?;
            req.headers_mut().insert(header::HOST, host);
        }
    }
    // The dedicated connection expects origin-form.
    let origin: Uri = uri
        .path_and_query()
        .map_or("/", |pq| pq.as_str())
        .parse()
        .context("Invalid upstream path")?;
    *req.uri_mut() = origin;
    let io = connector
        .clone()
        .oneshot(uri.clone())
        .await
        .map_err(anyhow::Error::msg)
        .with_context(|| format!("Failed to dial {uri}"))?;

    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .context("WebSocket handshake with upstream failed")?;

    tokio::spawn(async move {
        if let Err(e) = conn.with_upgrades().await {
            log(LogLevel::Debug, &format!("Upstream WebSocket connection closed: {e}"));
        }
    });

    sender
        .send_request(req)
        .await
        .context("Upstream rejected the WebSocket upgrade request")
}

/// Waits for both sides to switch protocols, then pumps bytes between them.
/// `guard` keeps the upstream counted as active for the tunnel's lifetime.
pub fn spawn_tunnel(client: OnUpgrade, upstream: OnUpgrade, guard: InFlight) {
    tokio::spawn(async move {
        let target = guard.upstream().to_owned();
        let (client, upstream) = match tokio::try_join!(client, upstream) {
            Ok(pair) => pair,
            Err(e) => {
                log(LogLevel::Warn, &format!("WebSocket upgrade to {target} failed: {e}"));
                return;
            }
        };

        let mut client = TokioIo::new(client);
        let mut upstream = TokioIo::new(upstream);
        match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
            Ok((sent, received)) => log(
                LogLevel::Debug,
                &format!("WebSocket tunnel to {target} closed ({sent}B up, {received}B down)"),
            ),
            Err(e) => log(LogLevel::Debug, &format!("WebSocket tunnel to {target} ended: {e}")),
        }
        drop(guard);
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_upgrade_requests() {
        let mut headers = HeaderMap::new();
        assert!(!is_upgrade(&headers));

        headers.insert(header::UPGRADE, HeaderValue::from_static("WebSocket"));
        assert!(is_upgrade(&headers));

        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, Upgrade"));
        assert!(is_upgrade(&headers));
    }

    #[test]
    fn scheme_mapping() {
        assert_eq!(ws_url("http://chat:9000"), "ws://chat:9000");
        assert_eq!(ws_url("https://chat"), "wss://chat");
        assert_eq!(ws_url("ws://already"), "ws://already");
    }
}
