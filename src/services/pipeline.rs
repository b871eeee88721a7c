//! Per-venue pipeline: the single owner of a venue's live state
//!
//! One task per venue consumes the ingest queue and runs three timers: the
//! frame tick (TTL eviction, grace sweeps, frame fan-out, snapshot publish),
//! the occupancy tick (snapshots and tick-driven rules), and the staleness
//! tick (ROI/settings/rule refresh from the store). Everything downstream of
//! a sample - visits, queue sessions, occupancy, persistence, fan-out - is
//! driven from here, so no other task ever touches venue state.

use crate::domain::session::{epoch_ms, LedgerEntry, Severity};
use crate::domain::types::{
    RoiId, TrackFrame, TrackKey, TrackSample, TrackState, UnifiedTrack, VenueId,
};
use crate::infra::config::EngineSettings;
use crate::infra::metrics::Metrics;
use crate::io::store::Store;
use crate::services::fanout::{ServerEvent, VenueHub};
use crate::services::ingest::SampleQueue;
use crate::services::occupancy::OccupancyBoard;
use crate::services::persist::{WriteOp, WriterHandle};
use crate::services::queues::{QueueEngine, QueueEvent};
use crate::services::roi_index::RoiIndex;
use crate::services::visits::{ThresholdCache, VisitEngine, VisitEvent};
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Control-plane messages delivered to a running pipeline
#[derive(Debug)]
pub enum VenueControl {
    /// ROI CRUD happened: rebuild the index now
    RefreshRois,
    /// Zone settings changed for one ROI
    InvalidateThresholds(RoiId),
    /// Lane open/close toggled from the checkout API
    SetLaneState { roi_id: RoiId, is_open: bool },
    Stop,
}

/// Copy-on-write view published at tick boundaries for HTTP reads
#[derive(Debug, Default)]
pub struct VenueSnapshot {
    pub venue_id: VenueId,
    pub ts: u64,
    pub tracks: Vec<TrackState>,
    pub occupancy: FxHashMap<RoiId, u32>,
}

struct TrackEntry {
    track: UnifiedTrack,
    /// Arrival wall-clock, drives TTL eviction
    last_arrival: Instant,
}

pub struct VenuePipeline {
    venue_id: VenueId,
    settings: EngineSettings,
    store: Arc<Store>,
    writer: WriterHandle,
    hub: VenueHub,
    metrics: Arc<Metrics>,
    snapshot_tx: watch::Sender<Arc<VenueSnapshot>>,

    tracks: FxHashMap<TrackKey, TrackEntry>,
    roi_index: Arc<RoiIndex>,
    visit_engine: VisitEngine,
    thresholds: ThresholdCache,
    queue_engine: QueueEngine,
    occupancy: OccupancyBoard,
    /// Latest sample timestamp seen anywhere in the venue; drives grace and
    /// linger expiry so session math never touches the wall clock
    venue_latest_ts: u64,
    known_invalid_rois: FxHashSet<RoiId>,
    reported_violations: u64,
}

impl VenuePipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        venue_id: VenueId,
        settings: EngineSettings,
        store: Arc<Store>,
        writer: WriterHandle,
        hub: VenueHub,
        metrics: Arc<Metrics>,
        snapshot_tx: watch::Sender<Arc<VenueSnapshot>>,
    ) -> Self {
        Self {
            venue_id,
            store,
            writer,
            hub,
            metrics,
            snapshot_tx,
            tracks: FxHashMap::default(),
            roi_index: Arc::new(RoiIndex::default()),
            visit_engine: VisitEngine::new(venue_id),
            thresholds: ThresholdCache::new(settings),
            queue_engine: QueueEngine::new(
                venue_id,
                settings.service_linger_sec as u64 * 1000,
                settings.min_completion_ms,
            ),
            occupancy: OccupancyBoard::new(
                venue_id,
                settings.alert_quiescence_sec as u64 * 1000,
            ),
            venue_latest_ts: 0,
            known_invalid_rois: FxHashSet::default(),
            reported_violations: 0,
            settings,
        }
    }

    /// Consume the ingest queue until it closes or a stop arrives
    pub async fn run(
        mut self,
        ingest: SampleQueue,
        mut control_rx: mpsc::Receiver<VenueControl>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        self.refresh();
        info!(venue_id = %self.venue_id, rois = %self.roi_index.len(), "venue_pipeline_started");

        let mut frame_tick = interval(Duration::from_millis(self.settings.frame_interval_ms));
        frame_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // A missed snapshot tick is a gap, never a backfill
        let mut occupancy_tick =
            interval(Duration::from_millis(self.settings.occupancy_snapshot_interval_ms));
        occupancy_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut refresh_tick =
            interval(Duration::from_millis(self.settings.roi_refresh_interval_ms));
        refresh_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut batch: Vec<TrackSample> = Vec::with_capacity(256);
        let mut last_frame = Instant::now();

        loop {
            tokio::select! {
                more = ingest.pop_many(&mut batch, 512) => {
                    if !more {
                        break;
                    }
                    for sample in batch.drain(..) {
                        self.handle_sample(sample);
                    }
                }
                _ = frame_tick.tick() => {
                    self.on_frame_tick(&mut last_frame);
                }
                _ = occupancy_tick.tick() => {
                    self.on_occupancy_tick();
                }
                _ = refresh_tick.tick() => {
                    self.refresh();
                }
                ctrl = control_rx.recv() => {
                    match ctrl {
                        Some(VenueControl::RefreshRois) => self.refresh(),
                        Some(VenueControl::InvalidateThresholds(roi_id)) => {
                            self.thresholds.invalidate(roi_id);
                            self.refresh_settings();
                        }
                        Some(VenueControl::SetLaneState { roi_id, is_open }) => {
                            debug!(venue_id = %self.venue_id, roi_id = %roi_id, is_open = %is_open, "lane_state_changed");
                            self.queue_engine.set_lane_state(roi_id, is_open);
                        }
                        Some(VenueControl::Stop) | None => break,
                    }
                }
                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        self.drain_and_close(&ingest);
        info!(venue_id = %self.venue_id, "venue_pipeline_stopped");
    }

    fn handle_sample(&mut self, sample: TrackSample) {
        self.metrics.record_sample_received();
        if sample.ts > self.venue_latest_ts {
            self.venue_latest_ts = sample.ts;
        }

        let key = sample.track_key();
        let is_stale = match self.tracks.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                entry.last_arrival = Instant::now();
                if sample.ts <= entry.track.last_seen_ts {
                    // Duplicate or out-of-order: refresh liveness only
                    true
                } else {
                    entry.track.apply(&sample);
                    false
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(TrackEntry {
                    track: UnifiedTrack::from_sample(&sample),
                    last_arrival: Instant::now(),
                });
                false
            }
        };
        if is_stale {
            return;
        }

        let roi_set = self.roi_index.containing(sample.x, sample.z);
        if let Some(entry) = self.tracks.get_mut(&key) {
            entry.track.roi_set = roi_set.clone();
        }

        let mut events = Vec::new();
        self.visit_engine
            .observe(&key, sample.ts, &roi_set, &mut self.thresholds, &mut events);
        self.process_visit_events(events);
    }

    fn process_visit_events(&mut self, events: Vec<VisitEvent>) {
        let now_wall = epoch_ms();
        for event in events {
            match event {
                VisitEvent::Opened(visit) => {
                    self.metrics.record_visit_opened();
                    debug!(
                        venue_id = %self.venue_id,
                        roi_id = %visit.roi_id,
                        track = %visit.track_key,
                        start_ts = %visit.start_ts,
                        "visit_opened"
                    );
                    self.writer.submit(WriteOp::InsertVisit(visit.clone()));
                    let fired = self.occupancy.on_visit_opened(visit.roi_id, now_wall);
                    self.publish_ledger(fired);
                    self.emit_zone_status(visit.roi_id, "visit_opened", Some(&visit.track_key));

                    let is_queue = self
                        .roi_index
                        .get(visit.roi_id)
                        .is_some_and(|r| r.metadata.is_queue());
                    if is_queue {
                        let event = self.queue_engine.on_queue_visit_opened(
                            visit.roi_id,
                            &visit.track_key,
                            visit.start_ts,
                        );
                        self.handle_queue_event(event);
                    }
                    if self.queue_engine.is_service_roi(visit.roi_id) {
                        let event = self.queue_engine.on_service_visit_opened(
                            visit.roi_id,
                            &visit.track_key,
                            visit.start_ts,
                        );
                        self.handle_queue_event(event);
                    }
                }
                VisitEvent::Closed(visit) => {
                    self.metrics.record_visit_closed();
                    let end_ts = visit.end_ts.unwrap_or(visit.start_ts);
                    let duration_ms = visit.duration_ms.unwrap_or(0);
                    debug!(
                        venue_id = %self.venue_id,
                        roi_id = %visit.roi_id,
                        track = %visit.track_key,
                        duration_ms = %duration_ms,
                        is_dwell = %visit.is_dwell,
                        "visit_closed"
                    );
                    self.writer.submit(WriteOp::CloseVisit {
                        id: visit.id.clone(),
                        end_ts,
                        duration_ms,
                        is_dwell: visit.is_dwell,
                        is_engagement: visit.is_engagement,
                    });
                    let fired = self.occupancy.on_visit_closed(visit.roi_id, duration_ms, now_wall);
                    self.check_invariants(now_wall);
                    self.publish_ledger(fired);
                    self.emit_zone_status(visit.roi_id, "visit_closed", Some(&visit.track_key));
                    self.hub.broadcast(&ServerEvent::VisitClosed {
                        venue_id: self.venue_id,
                        visit: visit.clone(),
                    });

                    let is_queue = self
                        .roi_index
                        .get(visit.roi_id)
                        .is_some_and(|r| r.metadata.is_queue());
                    if is_queue {
                        let event = self.queue_engine.on_queue_visit_closed(
                            visit.roi_id,
                            &visit.track_key,
                            end_ts,
                        );
                        self.handle_queue_event(event);
                    }
                    if self.queue_engine.is_service_roi(visit.roi_id) {
                        let event = self.queue_engine.on_service_visit_closed(
                            visit.roi_id,
                            &visit.track_key,
                            end_ts,
                        );
                        self.handle_queue_event(event);
                    }
                }
            }
        }
    }

    fn handle_queue_event(&mut self, event: Option<QueueEvent>) {
        let Some(event) = event else { return };
        match &event {
            QueueEvent::Opened(session) => {
                self.metrics.record_queue_session_opened();
                debug!(
                    venue_id = %self.venue_id,
                    queue_roi = %session.queue_roi_id,
                    track = %session.track_key,
                    "queue_session_opened"
                );
            }
            QueueEvent::Updated(_) => {}
            QueueEvent::Closed(session) => {
                if session.is_abandoned {
                    self.metrics.record_queue_session_abandoned();
                } else {
                    self.metrics.record_queue_session_completed();
                }
                debug!(
                    venue_id = %self.venue_id,
                    queue_roi = %session.queue_roi_id,
                    track = %session.track_key,
                    abandoned = %session.is_abandoned,
                    "queue_session_closed"
                );
            }
        }
        let session = event.session().clone();
        self.writer.submit(WriteOp::UpsertQueueSession(session.clone()));
        self.hub
            .broadcast(&ServerEvent::QueueSessionUpdate { venue_id: self.venue_id, session });
    }

    fn on_frame_tick(&mut self, last_frame: &mut Instant) {
        // A stalled loop means frames are stale; tell the clients
        let lag = last_frame.elapsed();
        if lag > Duration::from_millis(self.settings.frame_interval_ms * 3) {
            warn!(venue_id = %self.venue_id, lag_ms = %lag.as_millis(), "frame_tick_degraded");
            self.hub.broadcast(&ServerEvent::EngineStatus {
                venue_id: self.venue_id,
                status: "degraded".to_string(),
                ts: epoch_ms(),
            });
        }
        *last_frame = Instant::now();

        // TTL eviction by arrival time; visit closes use sample timestamps
        let ttl = Duration::from_millis(self.settings.track_ttl_ms);
        let expired: Vec<TrackKey> = self
            .tracks
            .iter()
            .filter(|(_, entry)| entry.last_arrival.elapsed() >= ttl)
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            let Some(entry) = self.tracks.remove(&key) else { continue };
            debug!(venue_id = %self.venue_id, track = %key, "track_expired");
            let mut events = Vec::new();
            self.visit_engine.evict(&key, &mut self.thresholds, &mut events);
            self.process_visit_events(events);
            for queue_event in self.queue_engine.evict(&key) {
                self.handle_queue_event(Some(queue_event));
            }
            self.hub.broadcast(&ServerEvent::TrackRemoved {
                venue_id: self.venue_id,
                track_key: key,
                ts: entry.track.last_seen_ts,
            });
        }

        // Grace and linger expiry against venue sample time
        let mut events = Vec::new();
        self.visit_engine.sweep(self.venue_latest_ts, &mut self.thresholds, &mut events);
        self.process_visit_events(events);
        for queue_event in self.queue_engine.sweep(self.venue_latest_ts) {
            self.handle_queue_event(Some(queue_event));
        }

        // Frame and snapshot: membership derived from each track's latest
        // sample against the current index
        for entry in self.tracks.values_mut() {
            entry.track.roi_set = self.roi_index.containing(entry.track.x, entry.track.z);
        }
        let ts = epoch_ms();
        let tracks: Vec<TrackState> =
            self.tracks.values().map(|entry| TrackState::from(&entry.track)).collect();
        self.metrics.record_frame_emitted();
        self.hub.broadcast(&ServerEvent::Frame(TrackFrame {
            venue_id: self.venue_id,
            ts,
            tracks: tracks.clone(),
        }));
        self.snapshot_tx.send_replace(Arc::new(VenueSnapshot {
            venue_id: self.venue_id,
            ts,
            tracks,
            occupancy: self.occupancy.counts().clone(),
        }));
    }

    fn on_occupancy_tick(&mut self) {
        let ts = epoch_ms();
        for snapshot in self.occupancy.snapshot(&self.roi_index.roi_ids(), ts) {
            self.writer.submit(WriteOp::InsertSnapshot(snapshot));
        }

        // Mean speed of the tracks currently inside each ROI
        let mut sums: FxHashMap<RoiId, (f64, u32)> = FxHashMap::default();
        for entry in self.tracks.values() {
            let speed = entry.track.speed();
            for &roi_id in &entry.track.roi_set {
                let slot = sums.entry(roi_id).or_insert((0.0, 0));
                slot.0 += speed;
                slot.1 += 1;
            }
        }
        let velocities: FxHashMap<RoiId, f64> =
            sums.into_iter().map(|(roi, (sum, n))| (roi, sum / n as f64)).collect();

        let fired = self.occupancy.tick(&velocities, ts);
        self.publish_ledger(fired);
    }

    /// Reload ROIs, settings, links, lanes, and rules from the store.
    /// Lookups keep the previous index until the new one is swapped in.
    fn refresh(&mut self) {
        match self.store.rois_for_venue(self.venue_id) {
            Ok(rois) => {
                let (index, rejected) = RoiIndex::build(self.venue_id, rois);
                let now_wall = epoch_ms();
                let mut still_invalid = FxHashSet::default();
                let mut fresh_entries = Vec::new();
                for (roi, error) in &rejected {
                    still_invalid.insert(roi.id);
                    if !self.known_invalid_rois.contains(&roi.id) {
                        fresh_entries.push(LedgerEntry::system(
                            self.venue_id,
                            Some(roi.id),
                            Severity::Warning,
                            "Invalid ROI polygon",
                            format!("ROI '{}' excluded from tracking: {error}", roi.name),
                            now_wall,
                        ));
                    }
                }
                self.known_invalid_rois = still_invalid;
                self.publish_ledger(fresh_entries);
                self.roi_index = Arc::new(index);
            }
            Err(e) => {
                warn!(venue_id = %self.venue_id, error = %e, "roi_refresh_failed");
            }
        }
        self.refresh_settings();
    }

    fn refresh_settings(&mut self) {
        match self.store.zone_settings_for_venue(self.venue_id) {
            Ok(settings) => {
                let venue = self.store.venue_defaults(self.venue_id).ok().flatten();
                self.queue_engine
                    .set_lanes(settings.iter().map(|s| (s.roi_id, s.is_open)));
                self.thresholds.reload(settings, venue.as_ref());
            }
            Err(e) => warn!(venue_id = %self.venue_id, error = %e, "settings_refresh_failed"),
        }
        match self.store.zone_links(self.venue_id) {
            Ok(links) => self
                .queue_engine
                .set_links(links.into_iter().map(|l| (l.queue_roi_id, l.service_roi_id))),
            Err(e) => warn!(venue_id = %self.venue_id, error = %e, "links_refresh_failed"),
        }
        match self.store.alert_rules_for_venue(self.venue_id) {
            Ok(rules) => self.occupancy.set_rules(rules),
            Err(e) => warn!(venue_id = %self.venue_id, error = %e, "rules_refresh_failed"),
        }
    }

    fn emit_zone_status(&self, roi_id: RoiId, event: &str, track_key: Option<&TrackKey>) {
        self.hub.broadcast(&ServerEvent::ZoneStatus {
            venue_id: self.venue_id,
            roi_id,
            event: event.to_string(),
            occupancy: self.occupancy.occupancy(roi_id),
            track_key: track_key.cloned(),
            ts: epoch_ms(),
        });
    }

    fn publish_ledger(&mut self, entries: Vec<LedgerEntry>) {
        for entry in entries {
            self.writer.submit(WriteOp::InsertLedger(entry.clone()));
            self.hub.broadcast(&ServerEvent::LedgerEntry(entry));
        }
    }

    /// Escalate repeated invariant violations to a critical ledger entry
    fn check_invariants(&mut self, now_wall: u64) {
        let total = self.occupancy.invariant_violations();
        while self.reported_violations < total {
            self.reported_violations += 1;
            let running = self.metrics.record_invariant_violation();
            if running % 10 == 0 {
                let entry = LedgerEntry::system(
                    self.venue_id,
                    None,
                    Severity::Critical,
                    "Invariant violations",
                    format!("{running} internal invariant violations recorded"),
                    now_wall,
                );
                self.publish_ledger(vec![entry]);
            }
        }
    }

    /// Drain what is left, close every visit and session, detach clients
    fn drain_and_close(&mut self, ingest: &SampleQueue) {
        ingest.close();
        let mut rest = Vec::new();
        ingest.drain(&mut rest);
        for sample in rest {
            self.handle_sample(sample);
        }

        let mut events = Vec::new();
        self.visit_engine.close_all(&mut self.thresholds, &mut events);
        self.process_visit_events(events);
        for queue_event in self.queue_engine.flush_all(self.venue_latest_ts) {
            self.handle_queue_event(Some(queue_event));
        }
        for entry in self.tracks.drain().map(|(_, e)| e).collect::<Vec<_>>() {
            self.hub.broadcast(&ServerEvent::TrackRemoved {
                venue_id: self.venue_id,
                track_key: entry.track.key.clone(),
                ts: entry.track.last_seen_ts,
            });
        }
        self.hub.close_all();
    }
}
