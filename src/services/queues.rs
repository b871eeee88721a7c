//! Queue sessions over queue-typed ROIs
//!
//! A session opens when a visit opens on a queue ROI whose lane is open, and
//! resolves in one of two ways: the same track is observed in the linked
//! service ROI within the linger window (completed), or the window expires
//! (abandoned). Lanes that close keep their existing sessions running.
//!
//! Service entries are accepted while the queue visit is still in its grace
//! window, so a person who steps straight from the queue into the service
//! zone completes even though their queue visit has not formally closed yet.

use crate::domain::session::QueueSession;
use crate::domain::types::{RoiId, TrackKey, VenueId};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use tracing::debug;

/// Session transitions the pipeline persists and fans out
#[derive(Debug, Clone)]
pub enum QueueEvent {
    Opened(QueueSession),
    Updated(QueueSession),
    Closed(QueueSession),
}

impl QueueEvent {
    pub fn session(&self) -> &QueueSession {
        match self {
            QueueEvent::Opened(s) | QueueEvent::Updated(s) | QueueEvent::Closed(s) => s,
        }
    }
}

struct PendingService {
    session: QueueSession,
    /// Sample-time deadline: queue exit plus the linger window
    deadline_ts: u64,
}

/// All queue-session state for one venue
pub struct QueueEngine {
    venue_id: VenueId,
    /// queue ROI -> linked service ROI
    links: FxHashMap<RoiId, RoiId>,
    /// service ROI -> queue ROIs feeding it
    service_to_queues: FxHashMap<RoiId, SmallVec<[RoiId; 2]>>,
    /// Lane state; an absent entry means open
    closed_lanes: FxHashMap<RoiId, bool>,
    /// Sessions whose queue visit is still open (or in grace)
    active: FxHashMap<(TrackKey, RoiId), QueueSession>,
    /// Sessions past queue exit, waiting for a service entry
    awaiting_service: Vec<PendingService>,
    /// Sessions whose service visit is open
    in_service: FxHashMap<(TrackKey, RoiId), QueueSession>,
    linger_ms: u64,
    min_completion_ms: u64,
}

impl QueueEngine {
    pub fn new(venue_id: VenueId, linger_ms: u64, min_completion_ms: u64) -> Self {
        Self {
            venue_id,
            links: FxHashMap::default(),
            service_to_queues: FxHashMap::default(),
            closed_lanes: FxHashMap::default(),
            active: FxHashMap::default(),
            awaiting_service: Vec::new(),
            in_service: FxHashMap::default(),
            linger_ms,
            min_completion_ms,
        }
    }

    /// Replace zone links (refresh path)
    pub fn set_links(&mut self, links: impl IntoIterator<Item = (RoiId, RoiId)>) {
        self.links.clear();
        self.service_to_queues.clear();
        for (queue, service) in links {
            self.links.insert(queue, service);
            self.service_to_queues.entry(service).or_default().push(queue);
        }
    }

    /// Replace lane open/closed state (refresh path)
    pub fn set_lanes(&mut self, lanes: impl IntoIterator<Item = (RoiId, bool)>) {
        self.closed_lanes.clear();
        for (roi, is_open) in lanes {
            if !is_open {
                self.closed_lanes.insert(roi, true);
            }
        }
    }

    pub fn set_lane_state(&mut self, roi_id: RoiId, is_open: bool) {
        if is_open {
            self.closed_lanes.remove(&roi_id);
        } else {
            self.closed_lanes.insert(roi_id, true);
        }
    }

    pub fn lane_is_open(&self, roi_id: RoiId) -> bool {
        !self.closed_lanes.contains_key(&roi_id)
    }

    pub fn is_service_roi(&self, roi_id: RoiId) -> bool {
        self.service_to_queues.contains_key(&roi_id)
    }

    /// A visit opened on a queue ROI. Returns the new session unless the lane
    /// is closed or the track already has an unclosed session on this lane.
    pub fn on_queue_visit_opened(
        &mut self,
        queue_roi: RoiId,
        key: &TrackKey,
        start_ts: u64,
    ) -> Option<QueueEvent> {
        if !self.lane_is_open(queue_roi) {
            debug!(venue_id = %self.venue_id, roi_id = %queue_roi, track = %key, "queue_lane_closed_entry_ignored");
            return None;
        }
        let map_key = (key.clone(), queue_roi);
        if self.active.contains_key(&map_key) {
            return None;
        }
        // Sessions per (track, lane) are serial
        if self
            .awaiting_service
            .iter()
            .any(|p| p.session.queue_roi_id == queue_roi && p.session.track_key == *key)
        {
            return None;
        }
        let session = QueueSession::open(
            self.venue_id,
            queue_roi,
            self.links.get(&queue_roi).copied(),
            key.clone(),
            start_ts,
        );
        self.active.insert(map_key, session.clone());
        Some(QueueEvent::Opened(session))
    }

    /// The queue visit closed: record the exit and decide how the session
    /// continues (service watch, immediate abandonment, or completion when
    /// the service leg already happened during grace).
    pub fn on_queue_visit_closed(
        &mut self,
        queue_roi: RoiId,
        key: &TrackKey,
        end_ts: u64,
    ) -> Option<QueueEvent> {
        let mut session = self.active.remove(&(key.clone(), queue_roi))?;
        session.record_queue_exit(end_ts);

        if session.service_entry_ts.is_some() {
            // Service entry observed while the queue visit was still open
            return Some(if session.service_exit_ts.is_some() {
                QueueEvent::Closed(session)
            } else {
                self.in_service
                    .insert((key.clone(), session.service_roi_id.unwrap_or(queue_roi)), session.clone());
                QueueEvent::Updated(session)
            });
        }

        let waiting = session.waiting_time_ms.unwrap_or(0);
        if session.service_roi_id.is_none() && waiting < self.min_completion_ms {
            // Unlinked lane, walked straight through
            session.is_abandoned = true;
            return Some(QueueEvent::Closed(session));
        }

        let deadline_ts = session.queue_exit_ts.unwrap_or(end_ts) + self.linger_ms;
        self.awaiting_service.push(PendingService { session: session.clone(), deadline_ts });
        Some(QueueEvent::Updated(session))
    }

    /// A visit opened on a service ROI: complete a waiting session for this
    /// track, or mark the service entry on a still-active one.
    pub fn on_service_visit_opened(
        &mut self,
        service_roi: RoiId,
        key: &TrackKey,
        start_ts: u64,
    ) -> Option<QueueEvent> {
        if let Some(idx) = self.awaiting_service.iter().position(|p| {
            p.session.track_key == *key
                && p.session.service_roi_id == Some(service_roi)
                && start_ts <= p.deadline_ts
        }) {
            let mut session = self.awaiting_service.swap_remove(idx).session;
            session.service_entry_ts = Some(start_ts);
            self.in_service.insert((key.clone(), service_roi), session.clone());
            return Some(QueueEvent::Updated(session));
        }

        // Queue visit still open (grace window): note the entry in place
        let queues = self.service_to_queues.get(&service_roi)?.clone();
        for queue_roi in queues {
            if let Some(session) = self.active.get_mut(&(key.clone(), queue_roi)) {
                if session.service_entry_ts.is_none() {
                    session.service_entry_ts = Some(start_ts);
                    return Some(QueueEvent::Updated(session.clone()));
                }
            }
        }
        None
    }

    /// The service visit closed: finalize the completed session
    pub fn on_service_visit_closed(
        &mut self,
        service_roi: RoiId,
        key: &TrackKey,
        end_ts: u64,
    ) -> Option<QueueEvent> {
        if let Some(mut session) = self.in_service.remove(&(key.clone(), service_roi)) {
            session.service_exit_ts = Some(end_ts);
            return Some(QueueEvent::Closed(session));
        }

        // Eviction may close the service visit before the queue visit; keep
        // the exit so the queue-close path can finalize
        let queues = self.service_to_queues.get(&service_roi)?.clone();
        for queue_roi in queues {
            if let Some(session) = self.active.get_mut(&(key.clone(), queue_roi)) {
                if session.service_entry_ts.is_some() && session.service_exit_ts.is_none() {
                    session.service_exit_ts = Some(end_ts);
                    return None;
                }
            }
        }
        None
    }

    /// Expire linger windows against the venue's latest sample timestamp
    pub fn sweep(&mut self, venue_ts: u64) -> Vec<QueueEvent> {
        let mut closed = Vec::new();
        let mut i = 0;
        while i < self.awaiting_service.len() {
            if venue_ts > self.awaiting_service[i].deadline_ts {
                let mut session = self.awaiting_service.swap_remove(i).session;
                session.is_abandoned = true;
                closed.push(QueueEvent::Closed(session));
            } else {
                i += 1;
            }
        }
        closed
    }

    /// The track disappeared: it can never be observed in a service zone, so
    /// any session waiting on one is abandoned now
    pub fn evict(&mut self, key: &TrackKey) -> Vec<QueueEvent> {
        let mut closed = Vec::new();
        let mut i = 0;
        while i < self.awaiting_service.len() {
            if self.awaiting_service[i].session.track_key == *key {
                let mut session = self.awaiting_service.swap_remove(i).session;
                session.is_abandoned = true;
                closed.push(QueueEvent::Closed(session));
            } else {
                i += 1;
            }
        }
        closed
    }

    /// Abandon everything still pending (venue stop). Active and in-service
    /// sessions are expected to have been closed through the visit cascade
    /// first; whatever remains is flushed as abandoned.
    pub fn flush_all(&mut self, last_seen_ts: u64) -> Vec<QueueEvent> {
        let mut closed = Vec::new();
        for (_, mut session) in self.active.drain() {
            if session.queue_exit_ts.is_none() {
                session.record_queue_exit(last_seen_ts);
            }
            session.is_abandoned = true;
            closed.push(QueueEvent::Closed(session));
        }
        for pending in self.awaiting_service.drain(..) {
            let mut session = pending.session;
            session.is_abandoned = true;
            closed.push(QueueEvent::Closed(session));
        }
        for (_, mut session) in self.in_service.drain() {
            session.service_exit_ts = Some(last_seen_ts.max(session.service_entry_ts.unwrap_or(0)));
            closed.push(QueueEvent::Closed(session));
        }
        closed
    }

    pub fn active_count(&self) -> usize {
        self.active.len() + self.awaiting_service.len() + self.in_service.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const Q: RoiId = RoiId(20);
    const S: RoiId = RoiId(21);

    fn key() -> TrackKey {
        TrackKey::from_source("mock", 1)
    }

    fn engine_linked() -> QueueEngine {
        let mut engine = QueueEngine::new(VenueId(1), 30_000, 2_000);
        engine.set_links([(Q, S)]);
        engine
    }

    #[test]
    fn test_completion_through_linked_service() {
        let mut engine = engine_linked();
        let k = key();

        let opened = engine.on_queue_visit_opened(Q, &k, 0).unwrap();
        assert!(matches!(opened, QueueEvent::Opened(_)));
        assert_eq!(opened.session().queue_entry_ts, 0);
        assert_eq!(opened.session().service_roi_id, Some(S));

        let exited = engine.on_queue_visit_closed(Q, &k, 5000).unwrap();
        let session = exited.session();
        assert_eq!(session.queue_exit_ts, Some(5000));
        assert_eq!(session.waiting_time_ms, Some(5000));

        let entered = engine.on_service_visit_opened(S, &k, 7000).unwrap();
        assert_eq!(entered.session().service_entry_ts, Some(7000));
        assert!(!entered.session().is_abandoned);

        let closed = engine.on_service_visit_closed(S, &k, 12_000).unwrap();
        let session = closed.session();
        assert!(matches!(closed, QueueEvent::Closed(_)));
        assert_eq!(session.service_exit_ts, Some(12_000));
        assert!(!session.is_abandoned);
        assert_eq!(engine.active_count(), 0);
    }

    #[test]
    fn test_abandonment_on_linger_expiry() {
        let mut engine = engine_linked();
        let k = key();

        engine.on_queue_visit_opened(Q, &k, 0);
        engine.on_queue_visit_closed(Q, &k, 20_000);

        // Deadline is 50 000; nothing expires at it, only past it
        assert!(engine.sweep(50_000).is_empty());
        let closed = engine.sweep(50_001);
        assert_eq!(closed.len(), 1);
        let session = closed[0].session();
        assert!(session.is_abandoned);
        assert_eq!(session.waiting_time_ms, Some(20_000));
        assert_eq!(session.service_entry_ts, None);
    }

    #[test]
    fn test_service_entry_after_linger_does_not_complete() {
        let mut engine = engine_linked();
        let k = key();

        engine.on_queue_visit_opened(Q, &k, 0);
        engine.on_queue_visit_closed(Q, &k, 1000);
        // 40 000 > 1000 + 30 000
        assert!(engine.on_service_visit_opened(S, &k, 40_000).is_none());
        assert_eq!(engine.sweep(40_000).len(), 1);
    }

    #[test]
    fn test_closed_lane_rejects_new_sessions() {
        let mut engine = engine_linked();
        engine.set_lane_state(Q, false);
        assert!(engine.on_queue_visit_opened(Q, &key(), 0).is_none());
    }

    #[test]
    fn test_lane_close_keeps_existing_session() {
        let mut engine = engine_linked();
        let k = key();

        engine.on_queue_visit_opened(Q, &k, 0).unwrap();
        engine.set_lane_state(Q, false);

        // The open session still closes naturally
        let exited = engine.on_queue_visit_closed(Q, &k, 5000).unwrap();
        assert_eq!(exited.session().waiting_time_ms, Some(5000));
    }

    #[test]
    fn test_sessions_are_serial_per_track_and_lane() {
        let mut engine = engine_linked();
        let k = key();

        engine.on_queue_visit_opened(Q, &k, 0).unwrap();
        assert!(engine.on_queue_visit_opened(Q, &k, 100).is_none());

        engine.on_queue_visit_closed(Q, &k, 5000);
        // Still serial while awaiting service
        assert!(engine.on_queue_visit_opened(Q, &k, 6000).is_none());
    }

    #[test]
    fn test_unlinked_lane_short_pass_is_abandoned_immediately() {
        let mut engine = QueueEngine::new(VenueId(1), 30_000, 2_000);
        let k = key();

        engine.on_queue_visit_opened(Q, &k, 0).unwrap();
        let closed = engine.on_queue_visit_closed(Q, &k, 1500).unwrap();
        assert!(matches!(closed, QueueEvent::Closed(_)));
        assert!(closed.session().is_abandoned);
    }

    #[test]
    fn test_unlinked_lane_long_wait_abandons_after_linger() {
        let mut engine = QueueEngine::new(VenueId(1), 30_000, 2_000);
        let k = key();

        engine.on_queue_visit_opened(Q, &k, 0).unwrap();
        let updated = engine.on_queue_visit_closed(Q, &k, 10_000).unwrap();
        assert!(matches!(updated, QueueEvent::Updated(_)));

        let closed = engine.sweep(40_001);
        assert_eq!(closed.len(), 1);
        assert!(closed[0].session().is_abandoned);
    }

    #[test]
    fn test_service_entry_during_queue_grace() {
        // The queue visit is still open (grace) when the service visit opens
        let mut engine = engine_linked();
        let k = key();

        engine.on_queue_visit_opened(Q, &k, 0).unwrap();
        let noted = engine.on_service_visit_opened(S, &k, 7000).unwrap();
        assert_eq!(noted.session().service_entry_ts, Some(7000));

        // Queue visit finally closes at its last in-queue sample
        let updated = engine.on_queue_visit_closed(Q, &k, 5000).unwrap();
        assert!(matches!(updated, QueueEvent::Updated(_)));
        let session = updated.session();
        assert_eq!(session.queue_exit_ts, Some(5000));
        assert_eq!(session.service_entry_ts, Some(7000));
        assert!(!session.is_abandoned);

        let closed = engine.on_service_visit_closed(S, &k, 9000).unwrap();
        assert_eq!(closed.session().service_exit_ts, Some(9000));
    }

    #[test]
    fn test_service_close_before_queue_close_on_eviction() {
        // Eviction order is not deterministic; the service leg may close first
        let mut engine = engine_linked();
        let k = key();

        engine.on_queue_visit_opened(Q, &k, 0).unwrap();
        engine.on_service_visit_opened(S, &k, 7000).unwrap();
        assert!(engine.on_service_visit_closed(S, &k, 8000).is_none());

        let closed = engine.on_queue_visit_closed(Q, &k, 5000).unwrap();
        assert!(matches!(closed, QueueEvent::Closed(_)));
        let session = closed.session();
        assert_eq!(session.service_entry_ts, Some(7000));
        assert_eq!(session.service_exit_ts, Some(8000));
        assert!(!session.is_abandoned);
        assert_eq!(engine.active_count(), 0);
    }

    #[test]
    fn test_evict_abandons_awaiting_sessions() {
        let mut engine = engine_linked();
        let k = key();

        engine.on_queue_visit_opened(Q, &k, 0).unwrap();
        engine.on_queue_visit_closed(Q, &k, 5000).unwrap();

        let closed = engine.evict(&k);
        assert_eq!(closed.len(), 1);
        assert!(closed[0].session().is_abandoned);
        assert_eq!(engine.active_count(), 0);
    }

    #[test]
    fn test_flush_all_abandons_pending() {
        let mut engine = engine_linked();
        let k = key();
        let other = TrackKey::from_source("mock", 2);

        engine.on_queue_visit_opened(Q, &k, 0).unwrap();
        engine.on_queue_visit_opened(Q, &other, 100).unwrap();
        engine.on_queue_visit_closed(Q, &other, 4000).unwrap();

        let closed = engine.flush_all(10_000);
        assert_eq!(closed.len(), 2);
        assert!(closed.iter().all(|e| matches!(e, QueueEvent::Closed(_))));
        assert_eq!(engine.active_count(), 0);
    }
}
