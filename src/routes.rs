//! Route definitions and router setup
//!
//! Configures all API routes and middleware.

mod proposal;

use crate::auth::auth_middleware;
use crate::config::Settings;
use crate::state::SharedState;
use axum::{
    http::{header, Method},
    middleware,
    routing::{get, post},
    Router,
};
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    request_id::MakeRequestUuid,
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
    ServiceBuilderExt,
};
use tracing::Level;

/// Create the application router with all routes and middleware
pub fn create_router(state: SharedState, settings: &Settings) -> Router {
    // Build CORS layer
    let cors = build_cors_layer(settings);

    // Build tracing/logging layer
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::INFO))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    // Build middleware stack
    let middleware_stack = ServiceBuilder::new()
        .set_x_request_id(MakeRequestUuid)
        .layer(trace_layer)
        .layer(CompressionLayer::new())
        .layer(cors)
        .propagate_x_request_id();

    // Every governance route acts on behalf of an authenticated member
    let governance = Router::new()
        .route(
            "/groups/{group_id}/proposals/requirement",
            get(proposal::check_requirement),
        )
        .route(
            "/groups/{group_id}/proposals",
            get(proposal::list_proposals).post(proposal::create_proposal),
        )
        .route(
            "/groups/{group_id}/proposals/{proposal_id}",
            get(proposal::get_proposal),
        )
        .route(
            "/groups/{group_id}/proposals/{proposal_id}/votes",
            post(proposal::cast_vote),
        )
        .route(
            "/groups/{group_id}/proposals/{proposal_id}/cancel",
            post(proposal::cancel_proposal),
        )
        .route(
            "/groups/{group_id}/proposals/{proposal_id}/reconcile",
            post(proposal::reconcile_proposal),
        )
        .layer(middleware::from_fn(auth_middleware));

    Router::new()
        // Health check
        .route("/health", get(health_check))
        .nest("/api", governance)
        // Apply middleware and state
        .layer(middleware_stack)
        .with_state(state)
}

/// Build CORS layer from settings
fn build_cors_layer(settings: &Settings) -> CorsLayer {
    let origins: Vec<_> = settings
        .cors
        .allowed_origins
        .iter()
        .filter_map(|s| s.parse().ok())
        .collect();

    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION, header::ACCEPT])
        .max_age(Duration::from_secs(3600));

    if origins.is_empty() {
        cors.allow_origin(Any)
    } else {
        cors.allow_origin(origins)
    }
}

/// Health check endpoint
async fn health_check() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "success": true,
        "message": "Server is running fine.",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    }))
}
