//! End-to-end scenarios through the spatial pipeline's state machines
//!
//! Samples are fed with explicit timestamps, mirroring how the venue
//! pipeline drives the visit, queue, and occupancy engines, so every
//! scenario is deterministic regardless of wall clock.

use floorsight::domain::geometry::Point;
use floorsight::domain::session::ZoneVisit;
use floorsight::domain::types::{Roi, RoiId, RoiMetadata, TrackKey, VenueId};
use floorsight::infra::config::EngineSettings;
use floorsight::services::occupancy::OccupancyBoard;
use floorsight::services::queues::{QueueEngine, QueueEvent};
use floorsight::services::roi_index::RoiIndex;
use floorsight::services::visits::{ThresholdCache, VisitEngine, VisitEvent};

const VENUE: VenueId = VenueId(1);
const R1: RoiId = RoiId(10);
const Q: RoiId = RoiId(20);
const S: RoiId = RoiId(21);

fn pt(x: f64, z: f64) -> Point {
    Point { x, z }
}

fn square(id: RoiId, name: &str, x0: f64, z0: f64, size: f64, zone_type: Option<&str>) -> Roi {
    Roi {
        id,
        venue_id: VENUE,
        name: name.to_string(),
        vertices: vec![
            pt(x0, z0),
            pt(x0 + size, z0),
            pt(x0 + size, z0 + size),
            pt(x0, z0 + size),
        ],
        metadata: RoiMetadata {
            template: None,
            zone_type: zone_type.map(str::to_string),
            color: None,
        },
    }
}

/// Wires the engines together the way the venue pipeline does
struct Harness {
    index: RoiIndex,
    visits: VisitEngine,
    thresholds: ThresholdCache,
    queues: QueueEngine,
    board: OccupancyBoard,
    opened: Vec<ZoneVisit>,
    closed: Vec<ZoneVisit>,
    queue_events: Vec<QueueEvent>,
    venue_latest_ts: u64,
}

impl Harness {
    fn new(rois: Vec<Roi>, links: Vec<(RoiId, RoiId)>) -> Self {
        let (index, rejected) = RoiIndex::build(VENUE, rois);
        assert!(rejected.is_empty(), "scenario ROIs must be valid");
        let settings = EngineSettings::default();
        let mut queues = QueueEngine::new(
            VENUE,
            settings.service_linger_sec as u64 * 1000,
            settings.min_completion_ms,
        );
        queues.set_links(links);
        Self {
            index,
            visits: VisitEngine::new(VENUE),
            thresholds: ThresholdCache::new(settings),
            queues,
            board: OccupancyBoard::new(VENUE, settings.alert_quiescence_sec as u64 * 1000),
            opened: Vec::new(),
            closed: Vec::new(),
            queue_events: Vec::new(),
            venue_latest_ts: 0,
        }
    }

    fn observe(&mut self, key: &TrackKey, ts: u64, x: f64, z: f64) {
        self.venue_latest_ts = self.venue_latest_ts.max(ts);
        let roi_set = self.index.containing(x, z);
        let mut events = Vec::new();
        self.visits.observe(key, ts, &roi_set, &mut self.thresholds, &mut events);
        self.process(events);
        self.sweep();
    }

    fn sweep(&mut self) {
        let mut events = Vec::new();
        let venue_ts = self.venue_latest_ts;
        self.visits.sweep(venue_ts, &mut self.thresholds, &mut events);
        self.process(events);
        for event in self.queues.sweep(venue_ts) {
            self.queue_events.push(event);
        }
    }

    fn evict(&mut self, key: &TrackKey) {
        let mut events = Vec::new();
        self.visits.evict(key, &mut self.thresholds, &mut events);
        self.process(events);
        for event in self.queues.evict(key) {
            self.queue_events.push(event);
        }
    }

    fn process(&mut self, events: Vec<VisitEvent>) {
        for event in events {
            match event {
                VisitEvent::Opened(visit) => {
                    self.board.on_visit_opened(visit.roi_id, visit.start_ts);
                    let is_queue = self
                        .index
                        .get(visit.roi_id)
                        .is_some_and(|r| r.metadata.is_queue());
                    if is_queue {
                        if let Some(e) = self.queues.on_queue_visit_opened(
                            visit.roi_id,
                            &visit.track_key,
                            visit.start_ts,
                        ) {
                            self.queue_events.push(e);
                        }
                    }
                    if self.queues.is_service_roi(visit.roi_id) {
                        if let Some(e) = self.queues.on_service_visit_opened(
                            visit.roi_id,
                            &visit.track_key,
                            visit.start_ts,
                        ) {
                            self.queue_events.push(e);
                        }
                    }
                    self.opened.push(visit);
                }
                VisitEvent::Closed(visit) => {
                    let end_ts = visit.end_ts.unwrap();
                    self.board.on_visit_closed(
                        visit.roi_id,
                        visit.duration_ms.unwrap(),
                        end_ts,
                    );
                    let is_queue = self
                        .index
                        .get(visit.roi_id)
                        .is_some_and(|r| r.metadata.is_queue());
                    if is_queue {
                        if let Some(e) = self.queues.on_queue_visit_closed(
                            visit.roi_id,
                            &visit.track_key,
                            end_ts,
                        ) {
                            self.queue_events.push(e);
                        }
                    }
                    if self.queues.is_service_roi(visit.roi_id) {
                        if let Some(e) = self.queues.on_service_visit_closed(
                            visit.roi_id,
                            &visit.track_key,
                            end_ts,
                        ) {
                            self.queue_events.push(e);
                        }
                    }
                    self.closed.push(visit);
                }
            }
        }
    }

    fn final_sessions(&self) -> Vec<&QueueEvent> {
        self.queue_events
            .iter()
            .filter(|e| matches!(e, QueueEvent::Closed(_)))
            .collect()
    }
}

fn track() -> TrackKey {
    TrackKey::from_source("lidar-1", 7)
}

fn single_roi_harness() -> Harness {
    Harness::new(vec![square(R1, "Endcap", 0.0, 0.0, 4.0, None)], Vec::new())
}

fn queue_harness() -> Harness {
    Harness::new(
        vec![
            square(Q, "Lane 1 - Queue", 0.0, 0.0, 4.0, Some("queue")),
            square(S, "Lane 1 - Service", 6.0, 0.0, 4.0, Some("service")),
        ],
        vec![(Q, S)],
    )
}

#[test]
fn scenario_single_dwell() {
    let mut h = single_roi_harness();
    let k = track();

    for ts in [0u64, 500, 1500, 70_000, 70_500] {
        h.observe(&k, ts, 2.0, 2.0);
    }
    h.evict(&k);

    assert_eq!(h.closed.len(), 1);
    let visit = &h.closed[0];
    assert_eq!(visit.start_ts, 0);
    assert_eq!(visit.end_ts, Some(70_500));
    assert_eq!(visit.duration_ms, Some(70_500));
    assert!(visit.is_dwell);
    assert!(!visit.is_engagement);
}

#[test]
fn scenario_grace_rescue() {
    let mut h = single_roi_harness();
    let k = track();

    h.observe(&k, 0, 2.0, 2.0);
    h.observe(&k, 1500, 2.0, 2.0);
    h.observe(&k, 2000, 10.0, 10.0);
    h.observe(&k, 3500, 10.0, 10.0);
    h.observe(&k, 4000, 2.0, 2.0);
    h.observe(&k, 7000, 2.0, 2.0);
    h.evict(&k);

    assert_eq!(h.closed.len(), 1, "2.5 s outside is within the 3 s grace");
    let visit = &h.closed[0];
    assert_eq!(visit.start_ts, 0);
    assert_eq!(visit.end_ts, Some(7000));
    assert_eq!(visit.duration_ms, Some(7000));
    assert!(!visit.is_dwell);
}

#[test]
fn scenario_grace_expiry() {
    let mut h = single_roi_harness();
    let k = track();

    h.observe(&k, 0, 2.0, 2.0);
    h.observe(&k, 1500, 2.0, 2.0);
    h.observe(&k, 2000, 10.0, 10.0);
    h.observe(&k, 3500, 10.0, 10.0);
    h.observe(&k, 6000, 2.0, 2.0);
    h.observe(&k, 7000, 2.0, 2.0);
    h.evict(&k);

    assert_eq!(h.closed.len(), 2, "4.5 s outside exceeds the 3 s grace");
    assert_eq!(h.closed[0].start_ts, 0);
    assert_eq!(h.closed[0].end_ts, Some(1500));
    assert_eq!(h.closed[1].start_ts, 6000);
}

#[test]
fn scenario_queue_service_completion() {
    let mut h = queue_harness();
    let k = track();

    h.observe(&k, 0, 2.0, 2.0); // inside Q
    h.observe(&k, 5000, 2.0, 2.0);
    h.observe(&k, 6000, 5.0, 5.0); // outside both
    h.observe(&k, 7000, 8.0, 2.0); // inside S
    h.observe(&k, 8000, 8.0, 2.0);
    h.evict(&k);

    let sessions = h.final_sessions();
    assert_eq!(sessions.len(), 1);
    let session = sessions[0].session();
    assert_eq!(session.queue_entry_ts, 0);
    assert_eq!(session.queue_exit_ts, Some(5000));
    assert_eq!(session.waiting_time_ms, Some(5000));
    assert_eq!(session.service_entry_ts, Some(7000));
    assert!(!session.is_abandoned);
}

#[test]
fn scenario_queue_abandonment() {
    let mut h = queue_harness();
    let k = track();

    h.observe(&k, 0, 2.0, 2.0);
    h.observe(&k, 20_000, 2.0, 2.0);
    // Outside everything until venue time passes the linger deadline
    let mut ts = 21_000;
    while ts <= 100_000 {
        h.observe(&k, ts, 5.0, 8.0);
        ts += 1000;
    }
    h.evict(&k);

    let sessions = h.final_sessions();
    assert_eq!(sessions.len(), 1);
    let session = sessions[0].session();
    assert_eq!(session.queue_exit_ts, Some(20_000));
    assert_eq!(session.waiting_time_ms, Some(20_000));
    assert_eq!(session.service_entry_ts, None);
    assert!(session.is_abandoned);
}

#[test]
fn scenario_lane_closed_records_visit_but_no_session() {
    let mut h = queue_harness();
    h.queues.set_lane_state(Q, false);
    let k = track();

    h.observe(&k, 0, 2.0, 2.0);
    h.observe(&k, 5000, 2.0, 2.0);
    h.evict(&k);

    assert_eq!(h.closed.len(), 1, "the zone visit is still recorded");
    assert_eq!(h.closed[0].roi_id, Q);
    assert!(h.queue_events.is_empty(), "no session may open on a closed lane");
}

#[test]
fn scenario_occupancy_matches_open_visits() {
    let mut h = single_roi_harness();
    let keys: Vec<TrackKey> = (1..=3).map(|i| TrackKey::from_source("lidar-1", i)).collect();

    for key in &keys {
        h.observe(key, 0, 2.0, 2.0);
        h.observe(key, 1500, 2.0, 2.0);
    }
    assert_eq!(h.board.occupancy(R1), 3);
    assert_eq!(h.visits.open_visit_count(R1), 3);

    h.evict(&keys[0]);
    assert_eq!(h.board.occupancy(R1), 2);
    assert_eq!(h.visits.open_visit_count(R1), 2);

    h.evict(&keys[1]);
    h.evict(&keys[2]);
    assert_eq!(h.board.occupancy(R1), 0);
    assert_eq!(h.board.invariant_violations(), 0);
}

#[test]
fn scenario_snapshot_cadence() {
    // Three tracks steady in R1, none in R2, sampled every 2 s for 10 s
    let r2 = RoiId(11);
    let mut h = Harness::new(
        vec![
            square(R1, "Zone A", 0.0, 0.0, 4.0, None),
            square(r2, "Zone B", 10.0, 10.0, 4.0, None),
        ],
        Vec::new(),
    );
    for i in 1..=3 {
        let key = TrackKey::from_source("lidar-1", i);
        h.observe(&key, 0, 2.0, 2.0);
        h.observe(&key, 1500, 2.0, 2.0);
    }

    let mut snapshots = Vec::new();
    for tick in 1..=5u64 {
        snapshots.extend(h.board.snapshot(&h.index.roi_ids(), tick * 2000));
    }

    let r1_counts: Vec<u32> =
        snapshots.iter().filter(|s| s.roi_id == R1).map(|s| s.count).collect();
    let r2_counts: Vec<u32> =
        snapshots.iter().filter(|s| s.roi_id == r2).map(|s| s.count).collect();
    assert_eq!(r1_counts, vec![3, 3, 3, 3, 3]);
    assert_eq!(r2_counts, vec![0, 0, 0, 0, 0]);

    let r1_ts: Vec<u64> =
        snapshots.iter().filter(|s| s.roi_id == R1).map(|s| s.ts).collect();
    assert!(r1_ts.windows(2).all(|w| w[1] - w[0] == 2000), "monotonic 2 s apart");
}

#[test]
fn scenario_point_in_polygon_rotation_stability() {
    let vertices = vec![pt(0.0, 0.0), pt(4.0, 0.0), pt(4.0, 4.0), pt(0.0, 4.0)];
    for rotation in 0..4 {
        let mut rotated = vertices.clone();
        rotated.rotate_left(rotation);
        let roi = Roi {
            id: R1,
            venue_id: VENUE,
            name: "rotated".to_string(),
            vertices: rotated,
            metadata: RoiMetadata::default(),
        };
        let (index, _) = RoiIndex::build(VENUE, vec![roi]);
        assert_eq!(
            index.containing(2.0, 2.0).as_slice(),
            &[R1],
            "strictly interior point must hit for rotation {rotation}"
        );
    }
}

#[test]
fn scenario_ttl_close_ends_all_visits_at_last_seen() {
    // One track inside two overlapping ROIs, then gone
    let r2 = RoiId(11);
    let mut h = Harness::new(
        vec![
            square(R1, "Zone A", 0.0, 0.0, 4.0, None),
            square(r2, "Zone B", 1.0, 1.0, 4.0, None),
        ],
        Vec::new(),
    );
    let k = track();
    h.observe(&k, 0, 2.0, 2.0);
    h.observe(&k, 3000, 2.0, 2.0);

    h.evict(&k);

    assert_eq!(h.closed.len(), 2);
    for visit in &h.closed {
        assert_eq!(visit.end_ts, Some(3000), "visits end at the last seen sample");
    }
}
