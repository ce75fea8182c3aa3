// src/middleware.rs

use crate::api::{ApiError, AppState};
use crate::metrics;
use crate::panic_notifier::{format_panic_report, take_panic_stack};
use crate::rate_limiter::Admission;
use axum::extract::{ConnectInfo, Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use futures::FutureExt;
use log::{error, warn};
use std::any::Any;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;

pub const API_KEY_HEADER: &str = "x-api-key";

/// Client identity used for rate limiting, attached by [`client_identity`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientId(pub String);

/// Rejects requests without a known `X-API-Key`.
pub async fn require_api_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let key = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .ok_or(ApiError::Unauthorized("missing X-API-Key"))?;

    match state.keys.is_valid(key).await {
        Ok(true) => Ok(next.run(request).await),
        Ok(false) => Err(ApiError::Unauthorized("invalid api key")),
        Err(e) => {
            error!("API key lookup failed: {}", e);
            Err(ApiError::Unauthorized("invalid api key"))
        }
    }
}

/// Per-client admission ahead of auth and body parsing. Needs [`ClientId`].
pub async fn rate_limit(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let client = match request.extensions().get::<ClientId>() {
        Some(ClientId(client)) => client.clone(),
        None => extract_client_ip(&request),
    };
    match state.service.limiter().check(&client) {
        Admission::Allowed { .. } => Ok(next.run(request).await),
        Admission::Denied { retry_after } => Err(ApiError::RateLimited { retry_after }),
    }
}

/// Resolves the caller's address and stores it as a [`ClientId`] extension.
pub async fn client_identity(mut request: Request, next: Next) -> Response {
    let client = extract_client_ip(&request);
    request.extensions_mut().insert(ClientId(client));
    next.run(request).await
}

/// First `X-Forwarded-For` entry, then `X-Real-IP`, then the socket peer.
pub fn extract_client_ip(request: &Request) -> String {
    let header = |name: &str| {
        request
            .headers()
            .get(name)
            .and_then(|h| h.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    if let Some(first) = header("x-forwarded-for").and_then(|v| v.split(',').next()) {
        let first = first.trim();
        if !first.is_empty() {
            return first.to_string();
        }
    }
    if let Some(real_ip) = header("x-real-ip") {
        return real_ip.to_string();
    }
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Turns a handler panic into a 500 and reports it to the webhook, if any.
pub async fn catch_panic(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let method = request.method().to_string();
    let uri = request.uri().to_string();

    match AssertUnwindSafe(next.run(request)).catch_unwind().await {
        Ok(response) => response,
        Err(panic) => {
            let stack = take_panic_stack();
            let payload = panic_payload(panic.as_ref());
            error!("Handler panicked on {} {}: {}", method, uri, payload);
            metrics::increment_http_panics();

            if let Some(notifier) = &state.notifier {
                let report = format_panic_report(
                    &payload,
                    &method,
                    &uri,
                    chrono::Utc::now(),
                    stack.as_deref(),
                );
                notifier.spawn_notify(report);
            } else {
                warn!("No webhook configured, panic report not sent");
            }
            ApiError::Internal.into_response()
        }
    }
}

fn panic_payload(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
