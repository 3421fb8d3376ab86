use axum::{
    Json,
    body::Body,
    extract::State,
    http::{Request, Uri},
    middleware::Next,
    response::{IntoResponse, Redirect, Response},
};
use hyper::StatusCode;
use serde_json::json;
use tracing::Span;

use super::AppState;

pub async fn enrich_current_span(req: Request<Body>, next: Next) -> Response {
    let uri: &Uri = req.uri();

    let host = req
        .headers()
        .get("host")
        .and_then(|h| h.to_str().ok())
        .unwrap_or("UNKNOWN");

    let current_span = Span::current();
    current_span.record("http.uri", uri.path());
    current_span.record("http.host", host);
    if let Some(query) = uri.query() {
        current_span.record("http.query", query);
    }

    next.run(req).await
}

pub async fn strip_trailing_slash(req: Request<Body>, next: Next) -> Response {
    let uri = req.uri();
    let stripped = match uri.path().strip_suffix('/') {
        Some(path) if !path.is_empty() => path.to_string(),
        _ => return next.run(req).await,
    };

    let path_and_query = match uri.query() {
        Some(query) => format!("{stripped}?{query}"),
        None => stripped,
    };
    let mut parts = uri.clone().into_parts();
    parts.path_and_query = path_and_query.parse().ok();
    match Uri::from_parts(parts) {
        Ok(new_uri) => Redirect::permanent(&new_uri.to_string()).into_response(),
        Err(_) => next.run(req).await,
    }
}

/// Bearer-key gate for the HTTP shim. The socket has its own `auth` message;
/// both check the same shared key.
pub async fn require_auth(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let authorized = req
        .headers()
        .get(hyper::header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(|token| state.auth.is_authorized(token))
        .unwrap_or(false);

    if !authorized {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": { "kind": "Unauthenticated", "message": "missing or invalid key" } })),
        )
            .into_response();
    }
    next.run(req).await
}
