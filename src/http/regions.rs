//! ROI CRUD; every mutation invalidates the venue's index

use crate::domain::geometry::{Point, Polygon};
use crate::domain::types::{RoiId, RoiMetadata, VenueId};
use crate::http::{internal_error, ApiError, AppState};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoiRequest {
    pub venue_id: i64,
    pub name: String,
    pub vertices: Vec<Point>,
    #[serde(default)]
    pub metadata: RoiMetadata,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRoiRequest {
    pub name: String,
    pub vertices: Vec<Point>,
    #[serde(default)]
    pub metadata: RoiMetadata,
}

fn validate_polygon(vertices: &[Point]) -> Result<(), ApiError> {
    Polygon::new(vertices.to_vec())
        .map(|_| ())
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("invalid polygon: {e}")))
}

pub async fn list_regions(
    State(state): State<AppState>,
    Path(venue_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let rois = state.store.rois_for_venue(VenueId(venue_id)).map_err(internal_error)?;
    Ok(Json(serde_json::json!({ "regions": rois })))
}

pub async fn create_roi(
    State(state): State<AppState>,
    Json(req): Json<CreateRoiRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.name.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "name must not be empty".to_string()));
    }
    validate_polygon(&req.vertices)?;

    let venue_id = VenueId(req.venue_id);
    let roi = state
        .store
        .create_roi(venue_id, &req.name, &req.vertices, &req.metadata)
        .map_err(internal_error)?;
    state.engine.invalidate_rois(venue_id);
    Ok((StatusCode::CREATED, Json(roi)))
}

pub async fn update_roi(
    State(state): State<AppState>,
    Path(roi_id): Path<i64>,
    Json(req): Json<UpdateRoiRequest>,
) -> Result<impl IntoResponse, ApiError> {
    validate_polygon(&req.vertices)?;
    let roi_id = RoiId(roi_id);
    let existing = state
        .store
        .get_roi(roi_id)
        .map_err(internal_error)?
        .ok_or_else(|| (StatusCode::NOT_FOUND, "roi not found".to_string()))?;

    state
        .store
        .update_roi(roi_id, &req.name, &req.vertices, &req.metadata)
        .map_err(internal_error)?;
    state.engine.invalidate_rois(existing.venue_id);

    let updated = state
        .store
        .get_roi(roi_id)
        .map_err(internal_error)?
        .ok_or_else(|| internal_error("roi vanished during update"))?;
    Ok(Json(updated))
}

pub async fn delete_roi(
    State(state): State<AppState>,
    Path(roi_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let roi_id = RoiId(roi_id);
    let existing = state
        .store
        .get_roi(roi_id)
        .map_err(internal_error)?
        .ok_or_else(|| (StatusCode::NOT_FOUND, "roi not found".to_string()))?;

    state.store.delete_roi(roi_id).map_err(internal_error)?;
    state.engine.invalidate_rois(existing.venue_id);
    Ok(StatusCode::NO_CONTENT)
}
