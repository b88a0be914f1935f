/* src/middleware.rs */

use crate::state::AppState;
use axum::{
    body::Body,
    extract::State,
    http::{HeaderName, HeaderValue, Method, Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use uuid::Uuid;

pub const REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// Ensures every request carries an `X-Request-ID` and echoes it on the
/// response. A non-empty UTF-8 id from the client is kept as is; anything
/// else is replaced.
pub async fn request_id(mut req: Request<Body>, next: Next) -> Response {
    let existing = req
        .headers()
        .get(&REQUEST_ID)
        .filter(|v| v.to_str().is_ok_and(|id| !id.is_empty()))
        .cloned();

    let id = match existing {
        Some(id) => Some(id),
        None => {
            let generated = HeaderValue::from_str(&Uuid::now_v7().to_string()).ok();
            if let Some(value) = &generated {
                req.headers_mut().insert(REQUEST_ID, value.clone());
            }
            generated
        }
    };

    let mut response = next.run(req).await;
    if let Some(id) = id {
        response.headers_mut().entry(REQUEST_ID).or_insert(id);
    }
    response
}

/// Applies the configured CORS headers to every response and answers
/// `OPTIONS` with 204 before routing.
pub async fn cors(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let mut response = if req.method() == Method::OPTIONS {
        StatusCode::NO_CONTENT.into_response()
    } else {
        next.run(req).await
    };

    let headers = response.headers_mut();
    for (name, value) in [
        (header::ACCESS_CONTROL_ALLOW_ORIGIN, &state.env.cors_allow_origin),
        (header::ACCESS_CONTROL_ALLOW_METHODS, &state.env.cors_allow_methods),
        (header::ACCESS_CONTROL_ALLOW_HEADERS, &state.env.cors_allow_headers),
    ] {
        if let Ok(value) = HeaderValue::from_str(value) {
            headers.insert(name, value);
        }
    }
    response
}
