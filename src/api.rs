// src/api.rs

use crate::api_keys::ApiKeyStore;
use crate::balance_service::{BalanceReport, BalanceService};
use crate::errors::BalanceError;
use crate::middleware::{catch_panic, client_identity, rate_limit, require_api_key, ClientId};
use crate::panic_notifier::PanicNotifier;
use crate::settings::Settings;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{middleware, Extension, Json, Router};
use log::debug;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tower_http::compression::CompressionLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<BalanceService>,
    pub keys: Arc<dyn ApiKeyStore>,
    pub notifier: Option<PanicNotifier>,
}

impl AppState {
    pub fn new(service: Arc<BalanceService>, keys: Arc<dyn ApiKeyStore>) -> Self {
        Self {
            service,
            keys,
            notifier: None,
        }
    }

    pub fn with_notifier(mut self, notifier: PanicNotifier) -> Self {
        self.notifier = Some(notifier);
        self
    }
}

/// HTTP-facing error. Rendered as `{"error": "<message>"}`.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Unauthorized(&'static str),
    #[error("rate limit exceeded")]
    RateLimited { retry_after: Duration },
    #[error("internal server error")]
    Internal,
}

impl From<BalanceError> for ApiError {
    fn from(err: BalanceError) -> Self {
        match err {
            BalanceError::RateLimited { retry_after } => ApiError::RateLimited { retry_after },
            other => ApiError::BadRequest(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let mut response = (status, Json(json!({ "error": self.to_string() }))).into_response();

        if let ApiError::RateLimited { retry_after } = self {
            // Whole seconds, rounded up, never zero.
            let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
            if let Ok(value) = HeaderValue::from_str(&secs.max(1).to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

#[derive(Debug, Deserialize)]
struct BalanceRequest {
    #[serde(default)]
    wallets: Vec<String>,
}

/// `POST /api/get-balance`
async fn get_balance(
    State(state): State<AppState>,
    Extension(ClientId(client)): Extension<ClientId>,
    body: Bytes,
) -> Result<Json<BalanceReport>, ApiError> {
    let request: BalanceRequest = serde_json::from_slice(&body).map_err(|e| {
        debug!("Rejecting body from {}: {}", client, e);
        if e.is_data() {
            ApiError::BadRequest("wallets must be an array of strings".to_string())
        } else {
            ApiError::BadRequest("invalid json".to_string())
        }
    })?;

    // Admission already ran in the `rate_limit` layer.
    tracing::debug!(client = %client, wallets = request.wallets.len(), "balance lookup");
    let report = state.service.get_balances(&request.wallets).await?;
    Ok(Json(report))
}

async fn force_panic() -> &'static str {
    panic!("forced panic for testing")
}

pub fn create_router(state: AppState, settings: &Settings) -> Router {
    let mut router = Router::new().route(
        "/api/get-balance",
        post(get_balance)
            .route_layer(middleware::from_fn_with_state(state.clone(), require_api_key)),
    );
    if settings.server.enable_debug_routes {
        router = router.route("/admin/force-panic", get(force_panic));
    }

    router
        .layer(middleware::from_fn_with_state(state.clone(), rate_limit))
        .layer(middleware::from_fn(client_identity))
        .layer(middleware::from_fn_with_state(state.clone(), catch_panic))
        .layer(DefaultBodyLimit::max(settings.server.max_body_bytes))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api_keys::StaticApiKeyStore;
    use crate::balance_cache::BalanceCache;
    use crate::errors::UpstreamError;
    use crate::rate_limiter::RateLimiter;
    use crate::upstream::BalanceSource;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use std::num::NonZeroU32;
    use tower::ServiceExt; // for `oneshot`

    const WALLET: &str = "So11111111111111111111111111111111111111112";

    struct FixedSource;

    #[async_trait]
    impl BalanceSource for FixedSource {
        async fn get_balance(&self, _address: &str) -> Result<u64, UpstreamError> {
            Ok(42)
        }
    }

    fn test_app(limit: u32, debug_routes: bool) -> Router {
        let service = BalanceService::new(
            Arc::new(BalanceCache::new(Duration::from_secs(10))),
            Arc::new(RateLimiter::new(
                NonZeroU32::new(limit).unwrap(),
                Duration::from_secs(60),
            )),
            Arc::new(FixedSource),
        );
        let state = AppState::new(Arc::new(service), Arc::new(StaticApiKeyStore::new(["k1"])));
        let mut settings = Settings::default();
        settings.server.enable_debug_routes = debug_routes;
        create_router(state, &settings)
    }

    fn balance_request(key: Option<&str>, body: &str) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/api/get-balance")
            .header("content-type", "application/json")
            .header("x-forwarded-for", "203.0.113.1");
        if let Some(key) = key {
            builder = builder.header("x-api-key", key);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_get_balance_ok() {
        let app = test_app(10, false);
        let body = format!(r#"{{"wallets":[" {} ", "{}"]}}"#, WALLET, WALLET);
        let response = app.oneshot(balance_request(Some("k1"), &body)).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-request-id"));
        let json = body_json(response).await;
        assert_eq!(
            json,
            json!({
                "results": [{"wallet": WALLET, "balance_lamports": 42}],
                "cached_any": false
            })
        );
    }

    #[tokio::test]
    async fn test_missing_and_invalid_api_key() {
        let app = test_app(10, false);
        let response = app
            .clone()
            .oneshot(balance_request(None, r#"{"wallets":[]}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(response).await["error"], "missing X-API-Key");

        let response = app
            .oneshot(balance_request(Some("nope"), r#"{"wallets":[]}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(response).await["error"], "invalid api key");
    }

    #[tokio::test]
    async fn test_bad_bodies_are_400() {
        let app = test_app(100, false);
        let cases = [
            ("{not json", "invalid json"),
            (r#"{"wallets": 5}"#, "wallets must be an array of strings"),
            (r#"{"wallets": []}"#, "wallets required"),
            (r#"{"wallets": ["  ", ""]}"#, "no valid wallets"),
            (r#"{"wallets": ["not-a-wallet"]}"#, "invalid wallet: not-a-wallet"),
        ];
        for (body, expected) in cases {
            let response = app
                .clone()
                .oneshot(balance_request(Some("k1"), body))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "body {}", body);
            assert_eq!(body_json(response).await["error"], expected);
        }
    }

    #[tokio::test]
    async fn test_rate_limited_sets_retry_after() {
        let app = test_app(1, false);
        let body = format!(r#"{{"wallets":["{}"]}}"#, WALLET);

        let first = app
            .clone()
            .oneshot(balance_request(Some("k1"), &body))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = app.oneshot(balance_request(Some("k1"), &body)).await.unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        let retry_after: u64 = second.headers()[header::RETRY_AFTER]
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert!((1..=60).contains(&retry_after));
    }

    #[tokio::test]
    async fn test_rate_limit_runs_before_auth_and_parsing() {
        let app = test_app(2, false);

        let statuses = [
            (Some("k1"), "{not json"),
            (Some("k1"), "{not json"),
            (Some("k1"), "{not json"),
            (Some("bogus"), r#"{"wallets":[]}"#),
            (None, r#"{"wallets":[]}"#),
        ];
        let mut seen = Vec::new();
        for (key, body) in statuses {
            let response = app.clone().oneshot(balance_request(key, body)).await.unwrap();
            seen.push(response.status());
        }
        assert_eq!(
            seen,
            vec![
                StatusCode::BAD_REQUEST,
                StatusCode::BAD_REQUEST,
                StatusCode::TOO_MANY_REQUESTS,
                StatusCode::TOO_MANY_REQUESTS,
                StatusCode::TOO_MANY_REQUESTS,
            ]
        );

        // A different client still has its own bucket.
        let request = Request::builder()
            .method("POST")
            .uri("/api/get-balance")
            .header("x-forwarded-for", "198.51.100.9")
            .body(Body::from("{not json"))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_force_panic_returns_500() {
        let request = || Request::builder().uri("/admin/force-panic").body(Body::empty()).unwrap();

        let response = test_app(10, true).oneshot(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_json(response).await["error"], "internal server error");

        let response = test_app(10, false).oneshot(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
