//! Zone alert-rule CRUD

use crate::domain::session::{new_uuid_v7, AlertMetric, AlertOperator, AlertRule, Severity};
use crate::domain::types::RoiId;
use crate::http::{internal_error, ApiError, AppState};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRuleRequest {
    pub rule_name: String,
    pub metric: String,
    pub operator: String,
    pub threshold_value: f64,
    pub severity: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub message_template: Option<String>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRuleRequest {
    pub rule_name: Option<String>,
    pub metric: Option<String>,
    pub operator: Option<String>,
    pub threshold_value: Option<f64>,
    pub severity: Option<String>,
    pub enabled: Option<bool>,
    pub message_template: Option<String>,
}

fn parse_metric(s: &str) -> Result<AlertMetric, ApiError> {
    s.parse().map_err(|e: String| (StatusCode::BAD_REQUEST, e))
}

fn parse_operator(s: &str) -> Result<AlertOperator, ApiError> {
    s.parse().map_err(|e: String| (StatusCode::BAD_REQUEST, e))
}

fn parse_severity(s: &str) -> Result<Severity, ApiError> {
    s.parse().map_err(|e: String| (StatusCode::BAD_REQUEST, e))
}

pub async fn list_rules(
    State(state): State<AppState>,
    Path(roi_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let rules = state.store.alert_rules_for_roi(RoiId(roi_id)).map_err(internal_error)?;
    Ok(Json(serde_json::json!({ "rules": rules })))
}

pub async fn create_rule(
    State(state): State<AppState>,
    Path(roi_id): Path<i64>,
    Json(req): Json<CreateRuleRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let roi_id = RoiId(roi_id);
    let roi = state
        .store
        .get_roi(roi_id)
        .map_err(internal_error)?
        .ok_or_else(|| (StatusCode::NOT_FOUND, "roi not found".to_string()))?;
    if req.rule_name.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "ruleName must not be empty".to_string()));
    }

    let rule = AlertRule {
        id: new_uuid_v7(),
        roi_id,
        venue_id: roi.venue_id,
        rule_name: req.rule_name,
        metric: parse_metric(&req.metric)?,
        operator: parse_operator(&req.operator)?,
        threshold_value: req.threshold_value,
        severity: parse_severity(&req.severity)?,
        enabled: req.enabled,
        message_template: req.message_template,
    };
    state.store.upsert_alert_rule(&rule).map_err(internal_error)?;
    state.engine.invalidate_rois(roi.venue_id);
    Ok((StatusCode::CREATED, Json(rule)))
}

pub async fn update_rule(
    State(state): State<AppState>,
    Path(rule_id): Path<String>,
    Json(req): Json<UpdateRuleRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let mut rule = state
        .store
        .get_alert_rule(&rule_id)
        .map_err(internal_error)?
        .ok_or_else(|| (StatusCode::NOT_FOUND, "rule not found".to_string()))?;

    if let Some(name) = req.rule_name {
        rule.rule_name = name;
    }
    if let Some(metric) = req.metric.as_deref() {
        rule.metric = parse_metric(metric)?;
    }
    if let Some(operator) = req.operator.as_deref() {
        rule.operator = parse_operator(operator)?;
    }
    if let Some(threshold) = req.threshold_value {
        rule.threshold_value = threshold;
    }
    if let Some(severity) = req.severity.as_deref() {
        rule.severity = parse_severity(severity)?;
    }
    if let Some(enabled) = req.enabled {
        rule.enabled = enabled;
    }
    if req.message_template.is_some() {
        rule.message_template = req.message_template;
    }

    state.store.upsert_alert_rule(&rule).map_err(internal_error)?;
    state.engine.invalidate_rois(rule.venue_id);
    Ok(Json(rule))
}

pub async fn delete_rule(
    State(state): State<AppState>,
    Path(rule_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let rule = state
        .store
        .get_alert_rule(&rule_id)
        .map_err(internal_error)?
        .ok_or_else(|| (StatusCode::NOT_FOUND, "rule not found".to_string()))?;
    state.store.delete_alert_rule(&rule_id).map_err(internal_error)?;
    state.engine.invalidate_rois(rule.venue_id);
    Ok(StatusCode::NO_CONTENT)
}
