//! Per-ROI occupancy counters, snapshots, and alert-rule evaluation
//!
//! Occupancy mirrors the set of open visits: incremented on `visit_opened`,
//! decremented on `visit_closed`, clamped at zero when the books do not
//! balance (counted as an invariant violation; the caller escalates).
//!
//! Rules are edge-triggered: a ledger entry fires on the transition into the
//! triggering state, and the rule re-arms only after its metric has been
//! non-triggering for a quiescence period.

use crate::domain::session::{AlertMetric, AlertRule, LedgerEntry, OccupancySnapshot};
use crate::domain::types::{RoiId, VenueId};
use rustc_hash::FxHashMap;
use std::collections::VecDeque;

/// Rolling window for the `visits` metric
const VISITS_WINDOW_MS: u64 = 60_000;
/// Closed-visit durations kept per ROI for `avgTimeSpent`
const DURATION_SAMPLES: usize = 20;

struct RuleState {
    rule: AlertRule,
    triggered: bool,
    /// Wall time the metric first went non-triggering while latched
    cleared_since: Option<u64>,
}

/// Occupancy and KPI state for one venue
pub struct OccupancyBoard {
    venue_id: VenueId,
    counts: FxHashMap<RoiId, u32>,
    rules: FxHashMap<RoiId, Vec<RuleState>>,
    /// Wall timestamps of recent visit openings, for the `visits` metric
    open_events: FxHashMap<RoiId, VecDeque<u64>>,
    /// Recent closed-visit durations (ms), for `avgTimeSpent`
    durations: FxHashMap<RoiId, VecDeque<u64>>,
    quiescence_ms: u64,
    invariant_violations: u64,
}

impl OccupancyBoard {
    pub fn new(venue_id: VenueId, quiescence_ms: u64) -> Self {
        Self {
            venue_id,
            counts: FxHashMap::default(),
            rules: FxHashMap::default(),
            open_events: FxHashMap::default(),
            durations: FxHashMap::default(),
            quiescence_ms,
            invariant_violations: 0,
        }
    }

    /// Replace the rule set, preserving latch state for rules that survive
    pub fn set_rules(&mut self, rules: Vec<AlertRule>) {
        let mut latched: FxHashMap<String, (bool, Option<u64>)> = FxHashMap::default();
        for states in self.rules.values() {
            for state in states {
                latched.insert(state.rule.id.clone(), (state.triggered, state.cleared_since));
            }
        }
        self.rules.clear();
        for rule in rules {
            let (triggered, cleared_since) =
                latched.get(&rule.id).copied().unwrap_or((false, None));
            self.rules
                .entry(rule.roi_id)
                .or_default()
                .push(RuleState { rule, triggered, cleared_since });
        }
    }

    pub fn occupancy(&self, roi_id: RoiId) -> u32 {
        self.counts.get(&roi_id).copied().unwrap_or(0)
    }

    pub fn counts(&self) -> &FxHashMap<RoiId, u32> {
        &self.counts
    }

    pub fn invariant_violations(&self) -> u64 {
        self.invariant_violations
    }

    /// A visit opened on the ROI. Returns ledger entries from occupancy rules.
    pub fn on_visit_opened(&mut self, roi_id: RoiId, now_wall: u64) -> Vec<LedgerEntry> {
        *self.counts.entry(roi_id).or_insert(0) += 1;
        let window = self.open_events.entry(roi_id).or_default();
        window.push_back(now_wall);
        while window.front().is_some_and(|&ts| now_wall.saturating_sub(ts) > VISITS_WINDOW_MS) {
            window.pop_front();
        }
        self.eval_occupancy_rules(roi_id, now_wall)
    }

    /// A visit closed on the ROI. Returns ledger entries from occupancy,
    /// dwell-time, and average-time-spent rules.
    pub fn on_visit_closed(
        &mut self,
        roi_id: RoiId,
        duration_ms: u64,
        now_wall: u64,
    ) -> Vec<LedgerEntry> {
        let count = self.counts.entry(roi_id).or_insert(0);
        if *count == 0 {
            // The books do not balance; clamp and count it
            self.invariant_violations += 1;
            tracing::error!(
                venue_id = %self.venue_id,
                roi_id = %roi_id,
                "occupancy_underflow_clamped"
            );
        } else {
            *count -= 1;
        }

        let durations = self.durations.entry(roi_id).or_default();
        if durations.len() == DURATION_SAMPLES {
            durations.pop_front();
        }
        durations.push_back(duration_ms);
        let avg_sec = durations.iter().sum::<u64>() as f64 / durations.len() as f64 / 1000.0;
        let dwell_sec = duration_ms as f64 / 1000.0;

        let mut entries = self.eval_occupancy_rules(roi_id, now_wall);
        entries.extend(self.eval_rules(roi_id, AlertMetric::DwellTime, dwell_sec, now_wall));
        entries.extend(self.eval_rules(roi_id, AlertMetric::AvgTimeSpent, avg_sec, now_wall));
        entries
    }

    /// Record a snapshot for every ROI of the venue, zeros included
    pub fn snapshot(&self, roi_ids: &[RoiId], ts: u64) -> Vec<OccupancySnapshot> {
        roi_ids
            .iter()
            .map(|&roi_id| OccupancySnapshot {
                venue_id: self.venue_id,
                roi_id,
                ts,
                count: self.occupancy(roi_id),
            })
            .collect()
    }

    /// Periodic evaluation of the tick-driven metrics: `velocity` (mean speed
    /// of tracks currently in the ROI) and `visits` (openings in the trailing
    /// window).
    pub fn tick(
        &mut self,
        velocities: &FxHashMap<RoiId, f64>,
        now_wall: u64,
    ) -> Vec<LedgerEntry> {
        let roi_ids: Vec<RoiId> = self.rules.keys().copied().collect();
        let mut entries = Vec::new();
        for roi_id in roi_ids {
            let visits = self
                .open_events
                .get_mut(&roi_id)
                .map(|window| {
                    while window
                        .front()
                        .is_some_and(|&ts| now_wall.saturating_sub(ts) > VISITS_WINDOW_MS)
                    {
                        window.pop_front();
                    }
                    window.len()
                })
                .unwrap_or(0);
            let velocity = velocities.get(&roi_id).copied().unwrap_or(0.0);
            entries.extend(self.eval_rules(roi_id, AlertMetric::Visits, visits as f64, now_wall));
            entries.extend(self.eval_rules(roi_id, AlertMetric::Velocity, velocity, now_wall));
        }
        self.advance_latches(now_wall);
        entries
    }

    /// Re-arm latched rules whose metric has stayed non-triggering through
    /// the quiescence period, even when no event re-evaluated them
    fn advance_latches(&mut self, now_wall: u64) {
        for states in self.rules.values_mut() {
            for state in states.iter_mut() {
                if !state.triggered {
                    continue;
                }
                if let Some(since) = state.cleared_since {
                    if now_wall.saturating_sub(since) >= self.quiescence_ms {
                        state.triggered = false;
                        state.cleared_since = None;
                    }
                }
            }
        }
    }

    fn eval_occupancy_rules(&mut self, roi_id: RoiId, now_wall: u64) -> Vec<LedgerEntry> {
        let value = self.occupancy(roi_id) as f64;
        self.eval_rules(roi_id, AlertMetric::Occupancy, value, now_wall)
    }

    fn eval_rules(
        &mut self,
        roi_id: RoiId,
        metric: AlertMetric,
        value: f64,
        now_wall: u64,
    ) -> Vec<LedgerEntry> {
        let Some(states) = self.rules.get_mut(&roi_id) else {
            return Vec::new();
        };
        let quiescence_ms = self.quiescence_ms;
        let mut entries = Vec::new();
        for state in states.iter_mut().filter(|s| s.rule.metric == metric) {
            if state.rule.triggers(value) {
                state.cleared_since = None;
                if !state.triggered {
                    state.triggered = true;
                    entries.push(LedgerEntry::from_rule(&state.rule, value, now_wall));
                }
            } else if state.triggered {
                match state.cleared_since {
                    None => state.cleared_since = Some(now_wall),
                    Some(since) if now_wall.saturating_sub(since) >= quiescence_ms => {
                        state.triggered = false;
                        state.cleared_since = None;
                    }
                    Some(_) => {}
                }
            }
        }
        entries
    }
}
