//! Live occupancy reads and persisted KPI aggregates

use crate::domain::session::epoch_ms;
use crate::domain::types::RoiId;
use crate::http::{internal_error, ApiError, AppState};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;

pub async fn occupancy_live(
    State(state): State<AppState>,
    Path(roi_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let roi_id = RoiId(roi_id);
    let roi = state
        .store
        .get_roi(roi_id)
        .map_err(internal_error)?
        .ok_or_else(|| (StatusCode::NOT_FOUND, "roi not found".to_string()))?;

    // Live counter from the venue snapshot; a stopped venue reads as empty
    let current = state
        .engine
        .snapshot(roi.venue_id)
        .and_then(|snapshot| snapshot.occupancy.get(&roi_id).copied())
        .unwrap_or(0);
    Ok(Json(serde_json::json!({ "currentOccupancy": current })))
}

#[derive(Debug, Deserialize)]
pub struct KpiQuery {
    #[serde(default = "default_period")]
    pub period: String,
}

fn default_period() -> String {
    "hour".to_string()
}

pub async fn roi_kpis(
    State(state): State<AppState>,
    Path(roi_id): Path<i64>,
    Query(query): Query<KpiQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let window_ms: u64 = match query.period.as_str() {
        "hour" => 3_600_000,
        "day" => 86_400_000,
        "week" => 604_800_000,
        other => {
            return Err((
                StatusCode::BAD_REQUEST,
                format!("invalid period: {other} (expected hour|day|week)"),
            ))
        }
    };
    let since_ts = epoch_ms().saturating_sub(window_ms);
    let kpis = state.store.roi_kpis(RoiId(roi_id), since_ts).map_err(internal_error)?;
    Ok(Json(serde_json::json!({ "period": query.period, "kpis": kpis })))
}
