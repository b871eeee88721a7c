//! Activity-ledger queries and acknowledgement

use crate::domain::session::{epoch_ms, Severity};
use crate::domain::types::{RoiId, VenueId};
use crate::http::{internal_error, ApiError, AppState};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;

const DEFAULT_LIMIT: u32 = 50;
const MAX_LIMIT: u32 = 500;

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct LedgerQuery {
    pub limit: Option<u32>,
    pub offset: Option<u32>,
    pub roi_id: Option<i64>,
    pub severity: Option<String>,
    pub acknowledged: Option<bool>,
}

pub async fn query_ledger(
    State(state): State<AppState>,
    Path(venue_id): Path<i64>,
    Query(query): Query<LedgerQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let severity = match query.severity.as_deref() {
        Some(s) => {
            Some(s.parse::<Severity>().map_err(|e| (StatusCode::BAD_REQUEST, e))?)
        }
        None => None,
    };
    let entries = state
        .store
        .query_ledger(
            VenueId(venue_id),
            query.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT),
            query.offset.unwrap_or(0),
            query.roi_id.map(RoiId),
            severity,
            query.acknowledged,
        )
        .map_err(internal_error)?;
    Ok(Json(serde_json::json!({ "entries": entries })))
}

pub async fn unacknowledged_count(
    State(state): State<AppState>,
    Path(venue_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let count = state.store.unacknowledged_count(VenueId(venue_id)).map_err(internal_error)?;
    Ok(Json(serde_json::json!({ "count": count })))
}

pub async fn acknowledge(
    State(state): State<AppState>,
    Path(entry_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let changed = state
        .store
        .acknowledge_ledger_entry(&entry_id, epoch_ms())
        .map_err(internal_error)?;
    if !changed {
        // Acknowledging twice is fine; a missing entry is not
        let exists = state.store.ledger_entry_exists(&entry_id).map_err(internal_error)?;
        if !exists {
            return Err((StatusCode::NOT_FOUND, "ledger entry not found".to_string()));
        }
    }
    Ok(Json(serde_json::json!({ "id": entry_id, "acknowledged": true })))
}
