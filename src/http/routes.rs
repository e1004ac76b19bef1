//! HTTP route definitions

use axum::{
    extract::{Path, State},
    http::{header, Method, StatusCode},
    middleware,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::error;
use uuid::Uuid;

use crate::app::AppState;
use crate::game::rewards::RewardLedgerEntry;
use crate::http::middleware::require_engine;
use crate::util::time::uptime_secs;
use crate::ws::handler::ws_handler;

/// Build the application router
pub fn build_router(state: AppState) -> Router {
    // CORS configuration - support multiple origins (comma-separated in CLIENT_ORIGIN)
    let cors = match &state.config.client_origin {
        Some(origins) => {
            let allowed_origins: Vec<header::HeaderValue> = origins
                .split(',')
                .filter_map(|s| s.trim().parse::<header::HeaderValue>().ok())
                .collect();
            CorsLayer::new().allow_origin(allowed_origins)
        }
        None => CorsLayer::new().allow_origin(Any),
    }
    .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
    .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

    // Opening matches and reading ledgers is for the engine only
    let engine_routes = Router::new()
        .route("/matches", post(create_match_handler))
        .route("/matches/:id/rewards", get(rewards_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_engine));

    Router::new()
        .route("/health", get(health_handler))
        .route("/matches/:id/ws", get(ws_handler))
        .merge(engine_routes)
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

// ============================================================================
// Health endpoint
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    active_matches: usize,
    active_participants: usize,
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: uptime_secs(),
        active_matches: state.match_registry.active_matches(),
        active_participants: state.match_registry.total_participants(),
    })
}

// ============================================================================
// Match endpoints
// ============================================================================

#[derive(Deserialize, Default)]
struct CreateMatchRequest {
    /// Ledger exported from an earlier session of the same match
    #[serde(default)]
    ledger: Vec<RewardLedgerEntry>,
}

#[derive(Serialize)]
struct CreateMatchResponse {
    match_id: Uuid,
    ws_path: String,
}

async fn create_match_handler(
    State(state): State<AppState>,
    body: Option<Json<CreateMatchRequest>>,
) -> Result<(StatusCode, Json<CreateMatchResponse>), AppError> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let handle = state.open_match(request.ledger).map_err(|e| {
        error!(error = %e, "Failed to open match");
        AppError::Internal(e.to_string())
    })?;

    Ok((
        StatusCode::CREATED,
        Json(CreateMatchResponse {
            match_id: handle.id,
            ws_path: format!("/matches/{}/ws", handle.id),
        }),
    ))
}

#[derive(Serialize)]
struct RewardsResponse {
    match_id: Uuid,
    entries: Vec<RewardLedgerEntry>,
}

/// Export of the reward ledger, for persistence by an outer service
async fn rewards_handler(
    State(state): State<AppState>,
    Path(match_id): Path<Uuid>,
) -> Result<Json<RewardsResponse>, AppError> {
    let handle = state
        .match_registry
        .get(&match_id)
        .ok_or_else(|| AppError::NotFound(format!("match {}", match_id)))?;

    Ok(Json(RewardsResponse {
        match_id,
        entries: handle.rewards.entries(),
    }))
}

// ============================================================================
// Error handling
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };

        let body = serde_json::json!({
            "error": message
        });

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_support::survival_config;
    use crate::config::Config;
    use crate::http::middleware::test_support::{far_future, sign_token};
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    const SECRET: &str = "routes-secret";

    fn state() -> AppState {
        let config = Config {
            server_addr: "127.0.0.1:0".parse().unwrap(),
            log_level: "info".into(),
            match_config_path: "match.json".into(),
            accounts_url: None,
            accounts_service_key: None,
            session_jwt_secret: SECRET.into(),
            client_origin: None,
        };
        AppState::new(config, survival_config())
    }

    async fn open_match(state: AppState, auth: Option<String>) -> StatusCode {
        let mut request = Request::builder().method(Method::POST).uri("/matches");
        if let Some(token) = auth {
            request = request.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        let response = build_router(state)
            .oneshot(request.body(Body::empty()).unwrap())
            .await
            .unwrap();
        response.status()
    }

    #[tokio::test]
    async fn opening_a_match_needs_an_engine_token() {
        let state = state();
        assert_eq!(open_match(state.clone(), None).await, StatusCode::UNAUTHORIZED);

        let participant = sign_token(SECRET, Uuid::new_v4(), None, far_future());
        assert_eq!(open_match(state.clone(), Some(participant)).await, StatusCode::FORBIDDEN);

        let forged = sign_token("guess", Uuid::new_v4(), Some("engine"), far_future());
        assert_eq!(open_match(state.clone(), Some(forged)).await, StatusCode::UNAUTHORIZED);
        assert_eq!(state.match_registry.active_matches(), 0);

        let engine = sign_token(SECRET, Uuid::new_v4(), Some("engine"), far_future());
        assert_eq!(open_match(state.clone(), Some(engine)).await, StatusCode::CREATED);
        assert_eq!(state.match_registry.active_matches(), 1);
    }

    #[tokio::test]
    async fn health_stays_public() {
        let response = build_router(state())
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
