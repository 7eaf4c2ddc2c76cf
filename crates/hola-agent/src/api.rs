//! HTTP surface of the agent.
//!
//! `GET /api/v1/health` is public. Every other route requires
//! `Authorization: Bearer <token>`.

use axum::extract::{Request, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use serde_json::{Value, json};
use sysinfo::System;
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

use crate::metrics::SystemMetrics;
use crate::state::AppState;
use crate::ws::serve_socket;

/// Build the agent's router.
pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/api/v1/agent/info", get(agent_info))
        .route("/api/v1/system/metrics", get(system_metrics))
        .route("/api/v1/ws", get(websocket))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_token));

    Router::new()
        .route("/api/v1/health", get(health))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// JSON error body `{"error": ..., "code": ...}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    status: StatusCode,
    error: &'static str,
    code: &'static str,
}

impl ApiError {
    const fn unauthorized(error: &'static str) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            error,
            code: "UNAUTHORIZED",
        }
    }

    /// HTTP status of the response.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        self.status
    }

    /// Machine-readable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        self.code
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    code: &'static str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.error,
            code: self.code,
        };
        (self.status, Json(body)).into_response()
    }
}

/// The token of a `Bearer` authorization value. The scheme is matched
/// case-insensitively.
#[must_use]
pub fn bearer_token(value: &str) -> Option<&str> {
    let (scheme, token) = value.split_once(' ')?;
    scheme.eq_ignore_ascii_case("bearer").then_some(token)
}

/// Check the request headers against the configured token.
///
/// # Errors
///
/// Returns a `401` [`ApiError`] when the header is missing, malformed or
/// carries the wrong token.
pub fn authorize(headers: &HeaderMap, expected: &str) -> Result<(), ApiError> {
    let Some(value) = headers.get(header::AUTHORIZATION) else {
        return Err(ApiError::unauthorized("missing authorization header"));
    };

    let presented = value.to_str().ok().and_then(bearer_token);
    if presented == Some(expected) {
        Ok(())
    } else {
        Err(ApiError::unauthorized("invalid or missing bearer token"))
    }
}

async fn require_token(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if let Err(err) = authorize(request.headers(), &state.token) {
        warn!(path = %request.uri().path(), "rejected unauthorized request");
        return Err(err);
    }
    Ok(next.run(request).await)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Serialize)]
struct AgentInfo {
    version: &'static str,
    hostname: String,
    os: &'static str,
    arch: &'static str,
    docker_version: String,
}

async fn agent_info(State(state): State<AppState>) -> Json<AgentInfo> {
    let docker_version = match &state.services.docker {
        Some(docker) => docker.version().await.unwrap_or_else(|err| {
            warn!(error = %err, "failed to read Docker version");
            String::new()
        }),
        None => String::new(),
    };

    Json(AgentInfo {
        version: env!("CARGO_PKG_VERSION"),
        hostname: System::host_name().unwrap_or_default(),
        os: std::env::consts::OS,
        arch: std::env::consts::ARCH,
        docker_version,
    })
}

async fn system_metrics(State(state): State<AppState>) -> Result<Json<SystemMetrics>, ApiError> {
    state.services.metrics.collect().await.map(Json).map_err(|err| {
        error!(error = %err, "failed to collect metrics");
        ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            error: "failed to collect system metrics",
            code: "METRICS_ERROR",
        }
    })
}

async fn websocket(State(state): State<AppState>, upgrade: WebSocketUpgrade) -> Response {
    let services = state.services.clone();
    let shutdown = state.shutdown.clone();
    upgrade.on_upgrade(move |socket| serve_socket(socket, services, shutdown))
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    fn headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn bearer_scheme_is_case_insensitive() {
        assert_eq!(bearer_token("Bearer s3cret"), Some("s3cret"));
        assert_eq!(bearer_token("bearer s3cret"), Some("s3cret"));
        assert_eq!(bearer_token("BEARER s3cret"), Some("s3cret"));
        assert_eq!(bearer_token("Basic s3cret"), None);
        assert_eq!(bearer_token("Bearer"), None);
    }

    #[test]
    fn accepts_matching_token() {
        assert!(authorize(&headers("Bearer s3cret"), "s3cret").is_ok());
    }

    #[test]
    fn rejects_missing_header() {
        let err = authorize(&HeaderMap::new(), "s3cret").unwrap_err();
        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(err.code(), "UNAUTHORIZED");
        assert_eq!(err.error, "missing authorization header");
    }

    #[test]
    fn rejects_wrong_token_or_scheme() {
        for value in ["Bearer nope", "Token s3cret", "s3cret", "Bearer  s3cret"] {
            let err = authorize(&headers(value), "s3cret").unwrap_err();
            assert_eq!(err.error, "invalid or missing bearer token", "{value}");
        }
    }
}
