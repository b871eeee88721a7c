//! Lifecycle records derived by the engine: zone visits, queue sessions,
//! occupancy snapshots, alert rules, and activity-ledger entries.

use crate::domain::types::{RoiId, TrackKey, VenueId};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Generate a new UUIDv7 (time-sortable)
pub fn new_uuid_v7() -> String {
    Uuid::now_v7().to_string()
}

/// Get current epoch milliseconds
#[inline]
pub fn epoch_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// A period during which a track was inside an ROI.
///
/// Opened once the track has stayed past the minimum visit duration; closed on
/// verified exit (grace period elapsed) or track eviction. `is_dwell` and
/// `is_engagement` are resolved against the thresholds in force at close time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZoneVisit {
    pub id: String,
    pub venue_id: VenueId,
    pub roi_id: RoiId,
    pub track_key: TrackKey,
    pub start_ts: u64,
    pub end_ts: Option<u64>,
    pub duration_ms: Option<u64>,
    pub is_dwell: bool,
    pub is_engagement: bool,
}

impl ZoneVisit {
    pub fn open(venue_id: VenueId, roi_id: RoiId, track_key: TrackKey, start_ts: u64) -> Self {
        Self {
            id: new_uuid_v7(),
            venue_id,
            roi_id,
            track_key,
            start_ts,
            end_ts: None,
            duration_ms: None,
            is_dwell: false,
            is_engagement: false,
        }
    }

    /// Close the visit and classify it against the supplied thresholds
    pub fn close(&mut self, end_ts: u64, dwell_threshold_ms: u64, engagement_threshold_ms: u64) {
        let end_ts = end_ts.max(self.start_ts);
        let duration = end_ts - self.start_ts;
        self.end_ts = Some(end_ts);
        self.duration_ms = Some(duration);
        self.is_dwell = duration >= dwell_threshold_ms;
        self.is_engagement = duration >= engagement_threshold_ms;
    }

    pub fn is_open(&self) -> bool {
        self.end_ts.is_none()
    }
}

/// A specialized visit on a queue-typed ROI, optionally completed by a
/// linked service-ROI visit; otherwise abandoned.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSession {
    pub id: String,
    pub venue_id: VenueId,
    pub queue_roi_id: RoiId,
    pub service_roi_id: Option<RoiId>,
    pub track_key: TrackKey,
    pub queue_entry_ts: u64,
    pub queue_exit_ts: Option<u64>,
    pub waiting_time_ms: Option<u64>,
    pub service_entry_ts: Option<u64>,
    pub service_exit_ts: Option<u64>,
    pub is_abandoned: bool,
}

impl QueueSession {
    pub fn open(
        venue_id: VenueId,
        queue_roi_id: RoiId,
        service_roi_id: Option<RoiId>,
        track_key: TrackKey,
        queue_entry_ts: u64,
    ) -> Self {
        Self {
            id: new_uuid_v7(),
            venue_id,
            queue_roi_id,
            service_roi_id,
            track_key,
            queue_entry_ts,
            queue_exit_ts: None,
            waiting_time_ms: None,
            service_entry_ts: None,
            service_exit_ts: None,
            is_abandoned: false,
        }
    }

    pub fn record_queue_exit(&mut self, exit_ts: u64) {
        let exit_ts = exit_ts.max(self.queue_entry_ts);
        self.queue_exit_ts = Some(exit_ts);
        self.waiting_time_ms = Some(exit_ts - self.queue_entry_ts);
    }
}

/// Per-ROI occupancy sample taken on a fixed cadence
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OccupancySnapshot {
    pub venue_id: VenueId,
    pub roi_id: RoiId,
    pub ts: u64,
    pub count: u32,
}

/// Per-ROI overrides for visit and queue classification
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZoneSettings {
    pub roi_id: RoiId,
    pub venue_id: VenueId,
    pub dwell_threshold_sec: Option<u32>,
    pub engagement_threshold_sec: Option<u32>,
    pub max_occupancy: Option<u32>,
    pub visit_end_grace_sec: Option<u32>,
    pub min_visit_duration_sec: Option<u32>,
    pub queue_warning_threshold_sec: Option<u32>,
    pub queue_critical_threshold_sec: Option<u32>,
    /// Queue lanes only: whether the lane accepts new sessions
    #[serde(default = "default_lane_open")]
    pub is_open: bool,
    pub lane_number: Option<i64>,
}

fn default_lane_open() -> bool {
    true
}

impl Default for ZoneSettings {
    fn default() -> Self {
        Self {
            roi_id: RoiId(0),
            venue_id: VenueId(0),
            dwell_threshold_sec: None,
            engagement_threshold_sec: None,
            max_occupancy: None,
            visit_end_grace_sec: None,
            min_visit_duration_sec: None,
            queue_warning_threshold_sec: None,
            queue_critical_threshold_sec: None,
            is_open: true,
            lane_number: None,
        }
    }
}

/// Directed link from a queue ROI to the service ROI that completes it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZoneLink {
    pub venue_id: VenueId,
    pub queue_roi_id: RoiId,
    pub service_roi_id: RoiId,
}

/// Venue display geometry and default thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VenueDefaults {
    pub venue_id: VenueId,
    pub name: String,
    pub width: f64,
    pub depth: f64,
    pub dwell_threshold_sec: Option<u32>,
    pub engagement_threshold_sec: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(Severity::Info),
            "warning" => Ok(Severity::Warning),
            "critical" => Ok(Severity::Critical),
            other => Err(format!("unknown severity: {other}")),
        }
    }
}

/// Metric a zone alert rule observes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AlertMetric {
    Occupancy,
    DwellTime,
    Visits,
    AvgTimeSpent,
    Velocity,
}

impl AlertMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertMetric::Occupancy => "occupancy",
            AlertMetric::DwellTime => "dwellTime",
            AlertMetric::Visits => "visits",
            AlertMetric::AvgTimeSpent => "avgTimeSpent",
            AlertMetric::Velocity => "velocity",
        }
    }
}

impl std::str::FromStr for AlertMetric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "occupancy" => Ok(AlertMetric::Occupancy),
            "dwellTime" => Ok(AlertMetric::DwellTime),
            "visits" => Ok(AlertMetric::Visits),
            "avgTimeSpent" => Ok(AlertMetric::AvgTimeSpent),
            "velocity" => Ok(AlertMetric::Velocity),
            other => Err(format!("unknown metric: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertOperator {
    Gt,
    Gte,
    Lt,
    Lte,
    Eq,
}

impl AlertOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertOperator::Gt => "gt",
            AlertOperator::Gte => "gte",
            AlertOperator::Lt => "lt",
            AlertOperator::Lte => "lte",
            AlertOperator::Eq => "eq",
        }
    }

    pub fn compare(&self, value: f64, threshold: f64) -> bool {
        match self {
            AlertOperator::Gt => value > threshold,
            AlertOperator::Gte => value >= threshold,
            AlertOperator::Lt => value < threshold,
            AlertOperator::Lte => value <= threshold,
            AlertOperator::Eq => (value - threshold).abs() < f64::EPSILON,
        }
    }
}

impl std::str::FromStr for AlertOperator {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gt" => Ok(AlertOperator::Gt),
            "gte" => Ok(AlertOperator::Gte),
            "lt" => Ok(AlertOperator::Lt),
            "lte" => Ok(AlertOperator::Lte),
            "eq" => Ok(AlertOperator::Eq),
            other => Err(format!("unknown operator: {other}")),
        }
    }
}

/// A threshold rule evaluated against a single ROI's live KPIs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertRule {
    pub id: String,
    pub roi_id: RoiId,
    pub venue_id: VenueId,
    pub rule_name: String,
    pub metric: AlertMetric,
    pub operator: AlertOperator,
    pub threshold_value: f64,
    pub severity: Severity,
    pub enabled: bool,
    pub message_template: Option<String>,
}

impl AlertRule {
    pub fn triggers(&self, value: f64) -> bool {
        self.enabled && self.operator.compare(value, self.threshold_value)
    }

    /// Render the alert message; `{value}` and `{threshold}` placeholders are
    /// substituted in the template
    pub fn message(&self, value: f64) -> String {
        match &self.message_template {
            Some(template) => template
                .replace("{value}", &format_metric(value))
                .replace("{threshold}", &format_metric(self.threshold_value)),
            None => format!(
                "{} {} {} (observed {})",
                self.metric.as_str(),
                self.operator.as_str(),
                format_metric(self.threshold_value),
                format_metric(value)
            ),
        }
    }
}

fn format_metric(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{}", value as i64)
    } else {
        format!("{value:.2}")
    }
}

/// A durable, user-visible event record surfaced in the activity feed.
/// Never mutated after insert except for acknowledgement.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    pub id: String,
    pub venue_id: VenueId,
    pub roi_id: Option<RoiId>,
    pub rule_id: Option<String>,
    pub event_type: String,
    pub severity: Severity,
    pub title: String,
    pub message: String,
    pub metric_name: Option<String>,
    pub metric_value: Option<f64>,
    pub threshold_value: Option<f64>,
    pub acknowledged: bool,
    pub acknowledged_at: Option<u64>,
    pub ts: u64,
}

impl LedgerEntry {
    /// Entry produced by a rule transitioning into its triggering state
    pub fn from_rule(rule: &AlertRule, value: f64, ts: u64) -> Self {
        Self {
            id: new_uuid_v7(),
            venue_id: rule.venue_id,
            roi_id: Some(rule.roi_id),
            rule_id: Some(rule.id.clone()),
            event_type: "rule".to_string(),
            severity: rule.severity,
            title: rule.rule_name.clone(),
            message: rule.message(value),
            metric_name: Some(rule.metric.as_str().to_string()),
            metric_value: Some(value),
            threshold_value: Some(rule.threshold_value),
            acknowledged: false,
            acknowledged_at: None,
            ts,
        }
    }

    /// Engine-originated entry (invalid ROI polygon, degraded persistence, ...)
    pub fn system(
        venue_id: VenueId,
        roi_id: Option<RoiId>,
        severity: Severity,
        title: &str,
        message: String,
        ts: u64,
    ) -> Self {
        Self {
            id: new_uuid_v7(),
            venue_id,
            roi_id,
            rule_id: None,
            event_type: "system".to_string(),
            severity,
            title: title.to_string(),
            message,
            metric_name: None,
            metric_value: None,
            threshold_value: None,
            acknowledged: false,
            acknowledged_at: None,
            ts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> TrackKey {
        TrackKey::from_source("mock", 1)
    }

    #[test]
    fn test_visit_close_computes_duration_and_flags() {
        let mut visit = ZoneVisit::open(VenueId(1), RoiId(10), key(), 1_000);
        assert!(visit.is_open());

        visit.close(71_500, 60_000, 120_000);

        assert_eq!(visit.end_ts, Some(71_500));
        assert_eq!(visit.duration_ms, Some(70_500));
        assert!(visit.is_dwell);
        assert!(!visit.is_engagement);
        assert!(!visit.is_open());
    }

    #[test]
    fn test_visit_close_clamps_negative_duration() {
        let mut visit = ZoneVisit::open(VenueId(1), RoiId(10), key(), 5_000);
        visit.close(4_000, 1_000, 2_000);
        assert_eq!(visit.end_ts, Some(5_000));
        assert_eq!(visit.duration_ms, Some(0));
    }

    #[test]
    fn test_queue_exit_sets_waiting_time() {
        let mut session = QueueSession::open(VenueId(1), RoiId(20), Some(RoiId(21)), key(), 0);
        session.record_queue_exit(5_000);
        assert_eq!(session.queue_exit_ts, Some(5_000));
        assert_eq!(session.waiting_time_ms, Some(5_000));
        assert!(!session.is_abandoned);
    }

    #[test]
    fn test_operator_compare() {
        assert!(AlertOperator::Gt.compare(5.0, 4.0));
        assert!(!AlertOperator::Gt.compare(4.0, 4.0));
        assert!(AlertOperator::Gte.compare(4.0, 4.0));
        assert!(AlertOperator::Lt.compare(3.0, 4.0));
        assert!(AlertOperator::Lte.compare(4.0, 4.0));
        assert!(AlertOperator::Eq.compare(4.0, 4.0));
        assert!(!AlertOperator::Eq.compare(4.1, 4.0));
    }

    fn rule(template: Option<&str>) -> AlertRule {
        AlertRule {
            id: "r1".to_string(),
            roi_id: RoiId(10),
            venue_id: VenueId(1),
            rule_name: "Crowding".to_string(),
            metric: AlertMetric::Occupancy,
            operator: AlertOperator::Gte,
            threshold_value: 5.0,
            severity: Severity::Warning,
            enabled: true,
            message_template: template.map(str::to_string),
        }
    }

    #[test]
    fn test_rule_triggers_only_when_enabled() {
        let mut r = rule(None);
        assert!(r.triggers(6.0));
        assert!(!r.triggers(4.0));
        r.enabled = false;
        assert!(!r.triggers(6.0));
    }

    #[test]
    fn test_rule_message_template_substitution() {
        let r = rule(Some("Zone busy: {value} people (limit {threshold})"));
        assert_eq!(r.message(7.0), "Zone busy: 7 people (limit 5)");

        let default = rule(None);
        assert_eq!(default.message(7.0), "occupancy gte 5 (observed 7)");
    }

    #[test]
    fn test_ledger_entry_from_rule() {
        let r = rule(None);
        let entry = LedgerEntry::from_rule(&r, 6.0, 123);
        assert_eq!(entry.event_type, "rule");
        assert_eq!(entry.title, "Crowding");
        assert_eq!(entry.metric_name.as_deref(), Some("occupancy"));
        assert_eq!(entry.metric_value, Some(6.0));
        assert_eq!(entry.threshold_value, Some(5.0));
        assert!(!entry.acknowledged);
        assert_eq!(entry.ts, 123);
    }

    #[test]
    fn test_metric_round_trips() {
        for metric in [
            AlertMetric::Occupancy,
            AlertMetric::DwellTime,
            AlertMetric::Visits,
            AlertMetric::AvgTimeSpent,
            AlertMetric::Velocity,
        ] {
            assert_eq!(metric.as_str().parse::<AlertMetric>().unwrap(), metric);
        }
    }
}
