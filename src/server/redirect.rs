//! Plaintext redirect & ACME challenge responder
//!
//! - `GET /.well-known/acme-challenge/{token}` answers with the stored
//!   authorization when the token matches the live challenge, else 404
//! - anything else under the challenge prefix is 404
//! - everything else is redirected to the configured scheme and port

use crate::error::ServerError;
use crate::server::{bind_listener, socket_addr};
use crate::supervisor::SupervisorContext;
use axum::extract::{Path, State};
use axum::http::header::{CONTENT_TYPE, HOST, LOCATION};
use axum::http::{HeaderMap, HeaderValue, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use std::sync::Arc;
use tracing::{debug, info};

/// Path prefix for HTTP-01 challenges
pub const CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

async fn acme_challenge(
    State(ctx): State<Arc<SupervisorContext>>,
    Path(token): Path<String>,
) -> Response {
    match ctx.challenge_authorization(&token) {
        Some(authorization) => {
            debug!(token = %token, "Answering ACME challenge");
            ([(CONTENT_TYPE, "text/plain")], authorization).into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn redirect(
    State(ctx): State<Arc<SupervisorContext>>,
    headers: HeaderMap,
    uri: Uri,
) -> Response {
    if uri.path().starts_with(CHALLENGE_PREFIX) {
        return StatusCode::NOT_FOUND.into_response();
    }

    let settings = ctx.settings();
    let host = headers
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("localhost");
    let target = redirect_url(host, &uri, settings.server_ssl, settings.server_port);

    match HeaderValue::from_str(&target) {
        Ok(location) => (StatusCode::FOUND, [(LOCATION, location)]).into_response(),
        Err(_) => StatusCode::BAD_REQUEST.into_response(),
    }
}

/// Target of a redirect for a request to `host` + `uri`
///
/// The scheme follows the secured flag, any port on the incoming host is
/// dropped, and `:<port>` is appended unless the port is 443.
pub fn redirect_url(host: &str, uri: &Uri, secure: bool, port: u16) -> String {
    let scheme = if secure { "https" } else { "http" };
    let mut url = format!("{}://{}", scheme, strip_port(host));
    if port != 443 {
        url.push_str(&format!(":{}", port));
    }
    url.push_str(uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/"));
    url
}

fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        // Bracketed IPv6 literal, keep the brackets
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    host.split(':').next().unwrap_or(host)
}

/// Router for the redirect responder
pub fn redirect_router(ctx: Arc<SupervisorContext>) -> Router {
    Router::new()
        .route("/.well-known/acme-challenge/{token}", get(acme_challenge))
        .fallback(redirect)
        .with_state(ctx)
}

/// Serve the redirect responder until shutdown
///
/// Runs independently of the generation restart protocol.
pub async fn serve_redirect(ctx: Arc<SupervisorContext>) -> Result<(), ServerError> {
    let settings = ctx.settings();
    let addr = socket_addr(&settings.bind_addr, settings.redirect_port)?;
    let listener = bind_listener(addr, settings.request_queue_size)?;
    info!(addr = %addr, "Redirect server listening");

    let shutdown = ctx.shutdown_token().clone();
    axum::serve(listener, redirect_router(ctx))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(ServerError::Serve)
}

#[cfg(test)]
#[path = "redirect_test.rs"]
mod tests;
