//! Zone-visit state machines
//!
//! Per `(track, ROI)` the engine runs: Absent -> Tentative -> Active ->
//! (grace) -> Absent. All transitions are driven by sample timestamps, never
//! arrival time, so replayed or multi-source feeds classify identically.
//!
//! Key behaviors:
//! - A visit is only persisted (Opened) once sample timestamps have
//!   progressed past the minimum visit duration; its start stays at the
//!   first in-ROI sample
//! - Leaving the ROI starts a grace window measured from the last in-ROI
//!   sample; re-entry inside the window keeps the same visit
//! - A visit always closes at the last in-ROI sample timestamp, whether the
//!   grace window expired or the track was evicted
//! - Dwell/engagement flags use the thresholds in force at close time

use crate::domain::session::{VenueDefaults, ZoneSettings, ZoneVisit};
use crate::domain::types::{RoiId, TrackKey, VenueId};
use crate::infra::config::EngineSettings;
use rustc_hash::FxHashMap;

/// Fully resolved per-ROI thresholds, all in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedThresholds {
    pub dwell_ms: u64,
    pub engagement_ms: u64,
    pub grace_ms: u64,
    pub min_visit_ms: u64,
}

/// Resolves thresholds per ROI: ZoneSettings override venue defaults, which
/// override the engine-wide defaults. Resolution is cached until settings or
/// venue defaults change.
pub struct ThresholdCache {
    defaults: EngineSettings,
    venue_dwell_sec: Option<u32>,
    venue_engagement_sec: Option<u32>,
    settings: FxHashMap<RoiId, ZoneSettings>,
    resolved: FxHashMap<RoiId, ResolvedThresholds>,
}

impl ThresholdCache {
    pub fn new(defaults: EngineSettings) -> Self {
        Self {
            defaults,
            venue_dwell_sec: None,
            venue_engagement_sec: None,
            settings: FxHashMap::default(),
            resolved: FxHashMap::default(),
        }
    }

    /// Replace the cached settings wholesale (refresh path)
    pub fn reload(&mut self, settings: Vec<ZoneSettings>, venue: Option<&VenueDefaults>) {
        self.settings = settings.into_iter().map(|s| (s.roi_id, s)).collect();
        self.venue_dwell_sec = venue.and_then(|v| v.dwell_threshold_sec);
        self.venue_engagement_sec = venue.and_then(|v| v.engagement_threshold_sec);
        self.resolved.clear();
    }

    pub fn invalidate(&mut self, roi_id: RoiId) {
        self.resolved.remove(&roi_id);
    }

    pub fn upsert_settings(&mut self, settings: ZoneSettings) {
        let roi_id = settings.roi_id;
        self.settings.insert(roi_id, settings);
        self.resolved.remove(&roi_id);
    }

    pub fn resolve(&mut self, roi_id: RoiId) -> ResolvedThresholds {
        if let Some(resolved) = self.resolved.get(&roi_id) {
            return *resolved;
        }
        let settings = self.settings.get(&roi_id);
        let dwell_sec = settings
            .and_then(|s| s.dwell_threshold_sec)
            .or(self.venue_dwell_sec)
            .unwrap_or(self.defaults.dwell_default_sec);
        let engagement_sec = settings
            .and_then(|s| s.engagement_threshold_sec)
            .or(self.venue_engagement_sec)
            .unwrap_or(self.defaults.engagement_default_sec);
        let grace_sec = settings
            .and_then(|s| s.visit_end_grace_sec)
            .unwrap_or(self.defaults.visit_end_grace_sec);
        let min_visit_sec = settings
            .and_then(|s| s.min_visit_duration_sec)
            .unwrap_or(self.defaults.min_visit_duration_sec);

        let resolved = ResolvedThresholds {
            dwell_ms: dwell_sec as u64 * 1000,
            engagement_ms: engagement_sec as u64 * 1000,
            grace_ms: grace_sec as u64 * 1000,
            min_visit_ms: min_visit_sec as u64 * 1000,
        };
        self.resolved.insert(roi_id, resolved);
        resolved
    }
}

/// Lifecycle events produced by the visit engine
#[derive(Debug, Clone)]
pub enum VisitEvent {
    Opened(ZoneVisit),
    Closed(ZoneVisit),
}

#[derive(Debug)]
struct VisitState {
    visit: ZoneVisit,
    /// Whether the visit crossed the minimum duration and was emitted
    promoted: bool,
    /// False while the track is in the grace window
    in_roi: bool,
    last_in_roi_ts: u64,
}

/// All visit state machines for one venue
pub struct VisitEngine {
    venue_id: VenueId,
    states: FxHashMap<TrackKey, FxHashMap<RoiId, VisitState>>,
}

impl VisitEngine {
    pub fn new(venue_id: VenueId) -> Self {
        Self { venue_id, states: FxHashMap::default() }
    }

    /// Feed one observation: the ROI set containing the track at sample
    /// time `ts`. Appends lifecycle events to `out`.
    pub fn observe(
        &mut self,
        key: &TrackKey,
        ts: u64,
        roi_set: &[RoiId],
        thresholds: &mut ThresholdCache,
        out: &mut Vec<VisitEvent>,
    ) {
        let venue_id = self.venue_id;
        let track_states = self.states.entry(key.clone()).or_default();

        for &roi_id in roi_set {
            let th = thresholds.resolve(roi_id);
            let grace_expired = match track_states.get(&roi_id) {
                None => {
                    track_states.insert(roi_id, new_state(venue_id, roi_id, key, ts, th, out));
                    continue;
                }
                Some(state) if state.in_roi => false,
                // In grace: rescue only while the window holds
                Some(state) => ts.saturating_sub(state.last_in_roi_ts) > th.grace_ms,
            };
            if grace_expired {
                let old = track_states.remove(&roi_id).unwrap();
                finalize(old, th, out);
                track_states.insert(roi_id, new_state(venue_id, roi_id, key, ts, th, out));
            } else {
                let state = track_states.get_mut(&roi_id).unwrap();
                state.in_roi = true;
                state.last_in_roi_ts = ts;
                try_promote(state, ts, th, out);
            }
        }

        // Exit transitions and grace expiry for ROIs this sample is not in
        track_states.retain(|roi_id, state| {
            if roi_set.contains(roi_id) {
                return true;
            }
            if state.in_roi {
                state.in_roi = false;
                return true;
            }
            let th = thresholds.resolve(*roi_id);
            if ts.saturating_sub(state.last_in_roi_ts) > th.grace_ms {
                finalize_ref(state, th, out);
                false
            } else {
                true
            }
        });
    }

    /// Expire grace windows against the venue's latest observed sample
    /// timestamp. Covers tracks that left an ROI and then only produced
    /// samples elsewhere (or none; eviction handles those).
    pub fn sweep(
        &mut self,
        venue_ts: u64,
        thresholds: &mut ThresholdCache,
        out: &mut Vec<VisitEvent>,
    ) {
        for track_states in self.states.values_mut() {
            track_states.retain(|roi_id, state| {
                if state.in_roi {
                    return true;
                }
                let th = thresholds.resolve(*roi_id);
                if venue_ts.saturating_sub(state.last_in_roi_ts) > th.grace_ms {
                    finalize_ref(state, th, out);
                    false
                } else {
                    true
                }
            });
        }
        self.states.retain(|_, track_states| !track_states.is_empty());
    }

    /// Close everything the track had open; called on TTL eviction
    pub fn evict(
        &mut self,
        key: &TrackKey,
        thresholds: &mut ThresholdCache,
        out: &mut Vec<VisitEvent>,
    ) {
        if let Some(track_states) = self.states.remove(key) {
            for (roi_id, state) in track_states {
                let th = thresholds.resolve(roi_id);
                finalize(state, th, out);
            }
        }
    }

    /// Close every open visit (venue stop)
    pub fn close_all(&mut self, thresholds: &mut ThresholdCache, out: &mut Vec<VisitEvent>) {
        let keys: Vec<TrackKey> = self.states.keys().cloned().collect();
        for key in keys {
            self.evict(&key, thresholds, out);
        }
    }

    /// Number of currently open (promoted) visits on an ROI
    pub fn open_visit_count(&self, roi_id: RoiId) -> usize {
        self.states
            .values()
            .filter_map(|m| m.get(&roi_id))
            .filter(|s| s.promoted)
            .count()
    }
}

fn new_state(
    venue_id: VenueId,
    roi_id: RoiId,
    key: &TrackKey,
    ts: u64,
    th: ResolvedThresholds,
    out: &mut Vec<VisitEvent>,
) -> VisitState {
    let mut state = VisitState {
        visit: ZoneVisit::open(venue_id, roi_id, key.clone(), ts),
        promoted: false,
        in_roi: true,
        last_in_roi_ts: ts,
    };
    try_promote(&mut state, ts, th, out);
    state
}

fn try_promote(state: &mut VisitState, ts: u64, th: ResolvedThresholds, out: &mut Vec<VisitEvent>) {
    if !state.promoted && ts.saturating_sub(state.visit.start_ts) >= th.min_visit_ms {
        state.promoted = true;
        out.push(VisitEvent::Opened(state.visit.clone()));
    }
}

fn finalize(mut state: VisitState, th: ResolvedThresholds, out: &mut Vec<VisitEvent>) {
    finalize_ref(&mut state, th, out);
}

/// Close at the last in-ROI sample; visits that never reached the minimum
/// duration are discarded
fn finalize_ref(state: &mut VisitState, th: ResolvedThresholds, out: &mut Vec<VisitEvent>) {
    if state.promoted {
        let mut visit = state.visit.clone();
        visit.close(state.last_in_roi_ts, th.dwell_ms, th.engagement_ms);
        out.push(VisitEvent::Closed(visit));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> TrackKey {
        TrackKey::from_source("mock", 1)
    }

    fn cache() -> ThresholdCache {
        ThresholdCache::new(EngineSettings::default())
    }

    fn engine() -> VisitEngine {
        VisitEngine::new(VenueId(1))
    }

    const R1: RoiId = RoiId(10);

    fn opened(events: &[VisitEvent]) -> Vec<&ZoneVisit> {
        events
            .iter()
            .filter_map(|e| match e {
                VisitEvent::Opened(v) => Some(v),
                _ => None,
            })
            .collect()
    }

    fn closed(events: &[VisitEvent]) -> Vec<&ZoneVisit> {
        events
            .iter()
            .filter_map(|e| match e {
                VisitEvent::Closed(v) => Some(v),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_threshold_resolution_order() {
        let mut cache = cache();
        // Engine defaults
        assert_eq!(cache.resolve(R1).dwell_ms, 60_000);
        assert_eq!(cache.resolve(R1).engagement_ms, 120_000);

        // Venue defaults override engine defaults
        let venue = VenueDefaults {
            venue_id: VenueId(1),
            name: String::new(),
            width: 10.0,
            depth: 10.0,
            dwell_threshold_sec: Some(30),
            engagement_threshold_sec: None,
        };
        cache.reload(Vec::new(), Some(&venue));
        assert_eq!(cache.resolve(R1).dwell_ms, 30_000);
        assert_eq!(cache.resolve(R1).engagement_ms, 120_000);

        // Zone settings override both
        cache.upsert_settings(ZoneSettings {
            roi_id: R1,
            venue_id: VenueId(1),
            dwell_threshold_sec: Some(10),
            visit_end_grace_sec: Some(5),
            ..Default::default()
        });
        let resolved = cache.resolve(R1);
        assert_eq!(resolved.dwell_ms, 10_000);
        assert_eq!(resolved.grace_ms, 5_000);
    }

    #[test]
    fn test_single_dwell_scenario() {
        // Samples at t = 0, 500, 1500, 70000, 70500 inside R1, then eviction
        let mut engine = engine();
        let mut cache = cache();
        let mut events = Vec::new();
        let k = key();

        for ts in [0u64, 500, 1500, 70_000, 70_500] {
            engine.observe(&k, ts, &[R1], &mut cache, &mut events);
        }
        let open = opened(&events);
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].start_ts, 0);
        assert!(closed(&events).is_empty());

        engine.evict(&k, &mut cache, &mut events);
        let close = closed(&events);
        assert_eq!(close.len(), 1);
        assert_eq!(close[0].start_ts, 0);
        assert_eq!(close[0].end_ts, Some(70_500));
        assert_eq!(close[0].duration_ms, Some(70_500));
        assert!(close[0].is_dwell);
        assert!(!close[0].is_engagement);
    }

    #[test]
    fn test_grace_rescue_keeps_one_visit() {
        // In at 0, 1500; out at 2000, 3500; back in at 4000, 7000; grace 3 s
        let mut engine = engine();
        let mut cache = cache();
        let mut events = Vec::new();
        let k = key();

        engine.observe(&k, 0, &[R1], &mut cache, &mut events);
        engine.observe(&k, 1500, &[R1], &mut cache, &mut events);
        engine.observe(&k, 2000, &[], &mut cache, &mut events);
        engine.observe(&k, 3500, &[], &mut cache, &mut events);
        engine.observe(&k, 4000, &[R1], &mut cache, &mut events);
        engine.observe(&k, 7000, &[R1], &mut cache, &mut events);
        engine.evict(&k, &mut cache, &mut events);

        assert_eq!(opened(&events).len(), 1);
        let close = closed(&events);
        assert_eq!(close.len(), 1);
        assert_eq!(close[0].start_ts, 0);
        assert_eq!(close[0].end_ts, Some(7000));
        assert_eq!(close[0].duration_ms, Some(7000));
        assert!(!close[0].is_dwell);
    }

    #[test]
    fn test_grace_expiry_splits_visits() {
        // Outside gap 1500 -> 6000 exceeds the 3 s grace
        let mut engine = engine();
        let mut cache = cache();
        let mut events = Vec::new();
        let k = key();

        engine.observe(&k, 0, &[R1], &mut cache, &mut events);
        engine.observe(&k, 1500, &[R1], &mut cache, &mut events);
        engine.observe(&k, 2000, &[], &mut cache, &mut events);
        engine.observe(&k, 3500, &[], &mut cache, &mut events);
        engine.observe(&k, 6000, &[R1], &mut cache, &mut events);
        engine.observe(&k, 7000, &[R1], &mut cache, &mut events);
        engine.evict(&k, &mut cache, &mut events);

        let close = closed(&events);
        assert_eq!(close.len(), 2);
        // First visit ends at the last in-ROI sample, not grace expiry
        assert_eq!(close[0].start_ts, 0);
        assert_eq!(close[0].end_ts, Some(1500));
        assert_eq!(close[1].start_ts, 6000);
        assert_eq!(close[1].end_ts, Some(7000));
    }

    #[test]
    fn test_grace_expires_via_outside_samples() {
        let mut engine = engine();
        let mut cache = cache();
        let mut events = Vec::new();
        let k = key();

        engine.observe(&k, 0, &[R1], &mut cache, &mut events);
        engine.observe(&k, 1500, &[R1], &mut cache, &mut events);
        engine.observe(&k, 2000, &[], &mut cache, &mut events);
        // 4501 > 1500 + 3000, closes during the outside observation
        engine.observe(&k, 4501, &[], &mut cache, &mut events);

        let close = closed(&events);
        assert_eq!(close.len(), 1);
        assert_eq!(close[0].end_ts, Some(1500));
        assert_eq!(engine.open_visit_count(R1), 0);
    }

    #[test]
    fn test_sweep_expires_grace_without_track_samples() {
        let mut engine = engine();
        let mut cache = cache();
        let mut events = Vec::new();
        let k = key();

        engine.observe(&k, 0, &[R1], &mut cache, &mut events);
        engine.observe(&k, 1500, &[R1], &mut cache, &mut events);
        engine.observe(&k, 2000, &[], &mut cache, &mut events);

        // Venue time advances via other tracks; grace deadline is 4500
        engine.sweep(4500, &mut cache, &mut events);
        assert!(closed(&events).is_empty());
        engine.sweep(4501, &mut cache, &mut events);
        let close = closed(&events);
        assert_eq!(close.len(), 1);
        assert_eq!(close[0].end_ts, Some(1500));
    }

    #[test]
    fn test_tentative_visit_discarded_on_eviction() {
        let mut engine = engine();
        let mut cache = cache();
        let mut events = Vec::new();
        let k = key();

        // One sample only: below the 1 s minimum visit duration
        engine.observe(&k, 0, &[R1], &mut cache, &mut events);
        engine.evict(&k, &mut cache, &mut events);

        assert!(events.is_empty());
    }

    #[test]
    fn test_zero_min_visit_promotes_immediately() {
        let mut engine = engine();
        let mut cache = cache();
        cache.upsert_settings(ZoneSettings {
            roi_id: R1,
            venue_id: VenueId(1),
            min_visit_duration_sec: Some(0),
            ..Default::default()
        });
        let mut events = Vec::new();

        engine.observe(&key(), 0, &[R1], &mut cache, &mut events);
        assert_eq!(opened(&events).len(), 1);
    }

    #[test]
    fn test_independent_machines_per_roi() {
        let r2 = RoiId(11);
        let mut engine = engine();
        let mut cache = cache();
        let mut events = Vec::new();
        let k = key();

        // Track inside both ROIs, then leaves only R1
        engine.observe(&k, 0, &[R1, r2], &mut cache, &mut events);
        engine.observe(&k, 2000, &[R1, r2], &mut cache, &mut events);
        engine.observe(&k, 3000, &[r2], &mut cache, &mut events);
        engine.observe(&k, 7000, &[r2], &mut cache, &mut events);

        assert_eq!(opened(&events).len(), 2);
        let close = closed(&events);
        assert_eq!(close.len(), 1);
        assert_eq!(close[0].roi_id, R1);
        assert_eq!(close[0].end_ts, Some(2000));
        assert_eq!(engine.open_visit_count(r2), 1);
    }

    #[test]
    fn test_close_time_threshold_resolution() {
        // Threshold change between open and close decides the dwell flag
        let mut engine = engine();
        let mut cache = cache();
        let mut events = Vec::new();
        let k = key();

        engine.observe(&k, 0, &[R1], &mut cache, &mut events);
        engine.observe(&k, 5000, &[R1], &mut cache, &mut events);
        assert_eq!(opened(&events).len(), 1);

        // Lower the dwell threshold to 3 s while the visit is open
        cache.upsert_settings(ZoneSettings {
            roi_id: R1,
            venue_id: VenueId(1),
            dwell_threshold_sec: Some(3),
            ..Default::default()
        });

        engine.evict(&k, &mut cache, &mut events);
        let close = closed(&events);
        assert_eq!(close[0].duration_ms, Some(5000));
        assert!(close[0].is_dwell, "close-time threshold (3 s) must apply");
    }

    #[test]
    fn test_visit_conservation() {
        // Every closed visit has duration == end - start >= 0
        let mut engine = engine();
        let mut cache = cache();
        let mut events = Vec::new();
        let k = key();

        let pattern: &[(u64, bool)] = &[
            (0, true),
            (1200, true),
            (2000, false),
            (2500, true),
            (9000, true),
            (9500, false),
            (20_000, true),
            (22_000, false),
        ];
        for &(ts, inside) in pattern {
            let rois: &[RoiId] = if inside { &[R1] } else { &[] };
            engine.observe(&k, ts, rois, &mut cache, &mut events);
        }
        engine.evict(&k, &mut cache, &mut events);

        let close = closed(&events);
        assert!(!close.is_empty());
        for visit in &close {
            let end = visit.end_ts.unwrap();
            assert!(end >= visit.start_ts);
            assert_eq!(visit.duration_ms, Some(end - visit.start_ts));
        }
        let dwell_count = close.iter().filter(|v| v.is_dwell).count();
        assert!(dwell_count <= close.len());
    }
}
