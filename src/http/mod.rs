//! Control and query surface
//!
//! JSON REST endpoints consumed by the operator UI plus the `/tracking`
//! WebSocket for live clients. Handlers read live state from the engine's
//! published snapshots and everything durable from the store; ROI and
//! settings mutations signal the affected venue pipeline.

pub mod checkout;
pub mod kpis;
pub mod ledger;
pub mod regions;
pub mod rules;
pub mod settings;
pub mod ws;

use crate::io::store::Store;
use crate::services::engine::Engine;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
    pub store: Arc<Store>,
}

/// Shorthand for the handler error tuple used throughout
pub type ApiError = (StatusCode, String);

pub fn internal_error<E: std::fmt::Display>(e: E) -> ApiError {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        // Regions of interest
        .route("/api/venues/{id}/regions", get(regions::list_regions))
        .route("/api/roi", post(regions::create_roi))
        .route(
            "/api/roi/{id}",
            put(regions::update_roi).delete(regions::delete_roi),
        )
        // Zone settings
        .route(
            "/api/roi/{id}/settings",
            get(settings::get_settings).put(settings::put_settings),
        )
        // Live occupancy and aggregates
        .route("/api/roi/{id}/occupancy/live", get(kpis::occupancy_live))
        .route("/api/roi/{id}/kpis", get(kpis::roi_kpis))
        // Checkout lanes
        .route("/api/venues/{id}/checkout/live-status", get(checkout::live_status))
        .route("/api/venues/{id}/checkout/active-sessions", get(checkout::active_sessions))
        .route("/api/venues/{id}/checkout/set-lane-state", post(checkout::set_lane_state))
        // Alert rules
        .route(
            "/api/roi/{id}/rules",
            get(rules::list_rules).post(rules::create_rule),
        )
        .route("/api/rules/{id}", put(rules::update_rule).delete(rules::delete_rule))
        // Activity ledger
        .route("/api/venues/{id}/ledger", get(ledger::query_ledger))
        .route("/api/venues/{id}/ledger/unacknowledged-count", get(ledger::unacknowledged_count))
        .route("/api/ledger/{id}/acknowledge", put(ledger::acknowledge))
        // Live channel
        .route("/tracking", get(ws::tracking_ws))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let status = if state.engine.is_degraded() { "degraded-persistence" } else { "ok" };
    Json(serde_json::json!({ "status": status }))
}
