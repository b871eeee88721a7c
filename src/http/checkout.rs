//! Checkout lane views: live lane status, open sessions, lane state control

use crate::domain::geometry::Polygon;
use crate::domain::session::epoch_ms;
use crate::domain::types::{Roi, RoiId, VenueId};
use crate::http::{internal_error, ApiError, AppState};
use crate::services::pipeline::VenueControl;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};

/// Lane status falls back to these when no per-lane thresholds are set
const DEFAULT_WARNING_SEC: u32 = 120;
const DEFAULT_CRITICAL_SEC: u32 = 300;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LaneStatus {
    pub queue_zone_id: RoiId,
    pub service_zone_id: Option<RoiId>,
    pub name: String,
    pub queue_count: u32,
    pub is_open: bool,
    pub status: String,
}

/// Pair queue and service ROIs: explicit zone links first, then the
/// `"... - Queue"` / `"... - Service"` naming convention
fn pair_lanes(rois: &[Roi], links: &[(RoiId, RoiId)]) -> Vec<(RoiId, Option<RoiId>)> {
    let mut lanes: Vec<(RoiId, Option<RoiId>)> =
        links.iter().map(|&(q, s)| (q, Some(s))).collect();

    for roi in rois {
        let is_queue = roi.metadata.is_queue() || roi.name.ends_with(" - Queue");
        if !is_queue || lanes.iter().any(|(q, _)| *q == roi.id) {
            continue;
        }
        let service = roi.name.strip_suffix(" - Queue").and_then(|prefix| {
            let service_name = format!("{prefix} - Service");
            rois.iter().find(|r| r.name == service_name).map(|r| r.id)
        });
        lanes.push((roi.id, service));
    }
    lanes
}

pub async fn live_status(
    State(state): State<AppState>,
    Path(venue_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let venue_id = VenueId(venue_id);
    let rois = state.store.rois_for_venue(venue_id).map_err(internal_error)?;
    let links: Vec<(RoiId, RoiId)> = state
        .store
        .zone_links(venue_id)
        .map_err(internal_error)?
        .into_iter()
        .map(|l| (l.queue_roi_id, l.service_roi_id))
        .collect();
    let lane_settings = state.store.zone_settings_for_venue(venue_id).map_err(internal_error)?;
    let sessions = state.store.open_queue_sessions(venue_id).map_err(internal_error)?;
    let snapshot = state.engine.snapshot(venue_id);

    let occupancy_of = |roi_id: RoiId| -> u32 {
        snapshot
            .as_ref()
            .and_then(|s| s.occupancy.get(&roi_id).copied())
            .unwrap_or(0)
    };
    let now = epoch_ms();

    let mut lanes: Vec<LaneStatus> = pair_lanes(&rois, &links)
        .into_iter()
        .filter_map(|(queue_id, service_id)| {
            let roi = rois.iter().find(|r| r.id == queue_id)?;
            let settings = lane_settings.iter().find(|s| s.roi_id == queue_id);
            let is_open = settings.map(|s| s.is_open).unwrap_or(true);
            let warning_ms = settings
                .and_then(|s| s.queue_warning_threshold_sec)
                .unwrap_or(DEFAULT_WARNING_SEC) as u64
                * 1000;
            let critical_ms = settings
                .and_then(|s| s.queue_critical_threshold_sec)
                .unwrap_or(DEFAULT_CRITICAL_SEC) as u64
                * 1000;

            // Longest wait among sessions still in this lane's queue
            let oldest_wait_ms = sessions
                .iter()
                .filter(|s| s.queue_roi_id == queue_id && s.queue_exit_ts.is_none())
                .map(|s| now.saturating_sub(s.queue_entry_ts))
                .max()
                .unwrap_or(0);

            let status = if !is_open {
                "closed"
            } else if oldest_wait_ms >= critical_ms {
                "critical"
            } else if oldest_wait_ms >= warning_ms {
                "warning"
            } else {
                "ok"
            };

            Some(LaneStatus {
                queue_zone_id: queue_id,
                service_zone_id: service_id,
                name: roi.name.clone(),
                queue_count: occupancy_of(queue_id),
                is_open,
                status: status.to_string(),
            })
        })
        .collect();

    // Present lanes left-to-right by queue centroid
    let centroid_x = |roi_id: RoiId| -> f64 {
        rois.iter()
            .find(|r| r.id == roi_id)
            .and_then(|r| Polygon::new(r.vertices.clone()).ok())
            .map(|p| p.centroid().x)
            .unwrap_or(f64::MAX)
    };
    lanes.sort_by(|a, b| {
        centroid_x(a.queue_zone_id)
            .partial_cmp(&centroid_x(b.queue_zone_id))
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    Ok(Json(serde_json::json!({ "lanes": lanes })))
}

pub async fn active_sessions(
    State(state): State<AppState>,
    Path(venue_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let sessions =
        state.store.open_queue_sessions(VenueId(venue_id)).map_err(internal_error)?;
    Ok(Json(serde_json::json!({ "sessions": sessions })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetLaneStateRequest {
    pub queue_zone_id: i64,
    pub is_open: bool,
}

pub async fn set_lane_state(
    State(state): State<AppState>,
    Path(venue_id): Path<i64>,
    Json(req): Json<SetLaneStateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let venue_id = VenueId(venue_id);
    let roi_id = RoiId(req.queue_zone_id);
    let roi = state
        .store
        .get_roi(roi_id)
        .map_err(internal_error)?
        .ok_or_else(|| (StatusCode::NOT_FOUND, "queue zone not found".to_string()))?;
    if roi.venue_id != venue_id {
        return Err((StatusCode::BAD_REQUEST, "queue zone belongs to another venue".to_string()));
    }

    state.store.set_lane_state(venue_id, roi_id, req.is_open).map_err(internal_error)?;
    state.engine.control(venue_id, VenueControl::SetLaneState { roi_id, is_open: req.is_open });
    Ok(Json(serde_json::json!({ "queueZoneId": roi_id, "isOpen": req.is_open })))
}
