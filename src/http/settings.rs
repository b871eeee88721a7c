//! Zone settings; a PUT invalidates the venue's threshold cache

use crate::domain::session::ZoneSettings;
use crate::domain::types::RoiId;
use crate::http::{internal_error, ApiError, AppState};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PutSettingsRequest {
    pub dwell_threshold_sec: Option<u32>,
    pub engagement_threshold_sec: Option<u32>,
    pub max_occupancy: Option<u32>,
    pub visit_end_grace_sec: Option<u32>,
    pub min_visit_duration_sec: Option<u32>,
    pub queue_warning_threshold_sec: Option<u32>,
    pub queue_critical_threshold_sec: Option<u32>,
    pub is_open: Option<bool>,
    pub lane_number: Option<i64>,
}

pub async fn get_settings(
    State(state): State<AppState>,
    Path(roi_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let roi_id = RoiId(roi_id);
    let roi = state
        .store
        .get_roi(roi_id)
        .map_err(internal_error)?
        .ok_or_else(|| (StatusCode::NOT_FOUND, "roi not found".to_string()))?;

    let settings = state
        .store
        .zone_settings(roi_id)
        .map_err(internal_error)?
        .unwrap_or(ZoneSettings {
            roi_id,
            venue_id: roi.venue_id,
            is_open: true,
            ..Default::default()
        });
    Ok(Json(settings))
}

pub async fn put_settings(
    State(state): State<AppState>,
    Path(roi_id): Path<i64>,
    Json(req): Json<PutSettingsRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let roi_id = RoiId(roi_id);
    let roi = state
        .store
        .get_roi(roi_id)
        .map_err(internal_error)?
        .ok_or_else(|| (StatusCode::NOT_FOUND, "roi not found".to_string()))?;

    let previous = state.store.zone_settings(roi_id).map_err(internal_error)?;
    let settings = ZoneSettings {
        roi_id,
        venue_id: roi.venue_id,
        dwell_threshold_sec: req.dwell_threshold_sec,
        engagement_threshold_sec: req.engagement_threshold_sec,
        max_occupancy: req.max_occupancy,
        visit_end_grace_sec: req.visit_end_grace_sec,
        min_visit_duration_sec: req.min_visit_duration_sec,
        queue_warning_threshold_sec: req.queue_warning_threshold_sec,
        queue_critical_threshold_sec: req.queue_critical_threshold_sec,
        is_open: req
            .is_open
            .unwrap_or_else(|| previous.as_ref().map(|p| p.is_open).unwrap_or(true)),
        lane_number: req.lane_number,
    };
    state.store.upsert_zone_settings(&settings).map_err(internal_error)?;
    state.engine.invalidate_thresholds(roi.venue_id, roi_id);
    Ok(Json(settings))
}
