//! Per-venue fan-out to live clients
//!
//! Every subscribed client owns a bounded queue. Frames are lossy state: on
//! overflow the oldest queued frame goes first, and an incoming frame that
//! still cannot fit is discarded. Lifecycle and ledger events are never
//! dropped; a client that cannot absorb them within the backpressure timeout
//! is disconnected instead.
//!
//! Events are serialized once per broadcast and shared between clients.

use crate::domain::session::{LedgerEntry, QueueSession, ZoneVisit};
use crate::domain::types::{RoiId, SourceStatus, TrackFrame, TrackKey, VenueId};
use crate::infra::metrics::Metrics;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Everything the engine pushes to live clients
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Frame(TrackFrame),
    TrackRemoved {
        #[serde(rename = "venueId")]
        venue_id: VenueId,
        #[serde(rename = "trackKey")]
        track_key: TrackKey,
        ts: u64,
    },
    ZoneStatus {
        #[serde(rename = "venueId")]
        venue_id: VenueId,
        #[serde(rename = "roiId")]
        roi_id: RoiId,
        event: String,
        occupancy: u32,
        #[serde(rename = "trackKey", skip_serializing_if = "Option::is_none")]
        track_key: Option<TrackKey>,
        ts: u64,
    },
    VisitClosed {
        #[serde(rename = "venueId")]
        venue_id: VenueId,
        visit: ZoneVisit,
    },
    QueueSessionUpdate {
        #[serde(rename = "venueId")]
        venue_id: VenueId,
        session: QueueSession,
    },
    LidarStatus(SourceStatus),
    LedgerEntry(LedgerEntry),
    EngineStatus {
        #[serde(rename = "venueId")]
        venue_id: VenueId,
        status: String,
        ts: u64,
    },
}

impl ServerEvent {
    /// Only frames may be discarded under backpressure
    fn is_lossy(&self) -> bool {
        matches!(self, ServerEvent::Frame(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MessageKind {
    Frame,
    Event,
}

/// A serialized event shared across client queues
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    kind: MessageKind,
    pub text: Arc<str>,
}

struct QueueState {
    deque: VecDeque<OutboundMessage>,
    stalled_since: Option<Instant>,
    closed: bool,
}

/// Bounded per-client delivery queue with the frame-drop policy
pub struct ClientQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
    stall_timeout: Duration,
    frames_dropped: AtomicU64,
}

/// Outcome of a push; `Disconnect` means the client exceeded the
/// backpressure timeout and must be dropped
#[derive(Debug, PartialEq, Eq)]
enum PushOutcome {
    Delivered,
    FrameDropped,
    Disconnect,
    Closed,
}

impl ClientQueue {
    fn new(capacity: usize, stall_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState {
                deque: VecDeque::with_capacity(capacity.min(64)),
                stalled_since: None,
                closed: false,
            }),
            notify: Notify::new(),
            capacity: capacity.max(1),
            stall_timeout,
            frames_dropped: AtomicU64::new(0),
        }
    }

    fn push(&self, message: OutboundMessage) -> PushOutcome {
        let outcome = {
            let mut state = self.state.lock();
            if state.closed {
                return PushOutcome::Closed;
            }

            let mut outcome = PushOutcome::Delivered;
            if state.deque.len() >= self.capacity {
                // Shed the oldest frame first; frames are redundant state
                if let Some(idx) =
                    state.deque.iter().position(|m| m.kind == MessageKind::Frame)
                {
                    state.deque.remove(idx);
                    self.frames_dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
            if state.deque.len() >= self.capacity && message.kind == MessageKind::Frame {
                // Still full and the newcomer is itself lossy
                self.frames_dropped.fetch_add(1, Ordering::Relaxed);
                outcome = PushOutcome::FrameDropped;
            } else {
                state.deque.push_back(message);
            }

            if state.deque.len() > self.capacity {
                // Only events past capacity: the consumer is stalling
                let stalled = *state.stalled_since.get_or_insert_with(Instant::now);
                if stalled.elapsed() >= self.stall_timeout {
                    state.closed = true;
                    outcome = PushOutcome::Disconnect;
                }
            } else {
                state.stalled_since = None;
            }
            outcome
        };
        self.notify.notify_one();
        outcome
    }

    /// Next message, waiting while the queue is empty. `None` once closed.
    pub async fn pop(&self) -> Option<OutboundMessage> {
        loop {
            {
                let mut state = self.state.lock();
                if let Some(message) = state.deque.pop_front() {
                    return Some(message);
                }
                if state.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    pub fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.state.lock().deque.len()
    }
}

struct ClientHandle {
    id: u64,
    queue: Arc<ClientQueue>,
}

struct HubInner {
    venue_id: VenueId,
    clients: Mutex<Vec<ClientHandle>>,
    next_client_id: AtomicU64,
    capacity: usize,
    stall_timeout: Duration,
    metrics: Arc<Metrics>,
}

/// Publisher side of one venue's live channel
#[derive(Clone)]
pub struct VenueHub {
    inner: Arc<HubInner>,
}

impl VenueHub {
    pub fn new(
        venue_id: VenueId,
        capacity: usize,
        stall_timeout: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            inner: Arc::new(HubInner {
                venue_id,
                clients: Mutex::new(Vec::new()),
                next_client_id: AtomicU64::new(1),
                capacity,
                stall_timeout,
                metrics,
            }),
        }
    }

    pub fn venue_id(&self) -> VenueId {
        self.inner.venue_id
    }

    /// Register a client; returns its delivery queue
    pub fn subscribe(&self) -> Arc<ClientQueue> {
        let queue = Arc::new(ClientQueue::new(self.inner.capacity, self.inner.stall_timeout));
        let id = self.inner.next_client_id.fetch_add(1, Ordering::Relaxed);
        self.inner.clients.lock().push(ClientHandle { id, queue: queue.clone() });
        self.inner.metrics.record_client_connected();
        debug!(venue_id = %self.inner.venue_id, client_id = %id, "client_subscribed");
        queue
    }

    pub fn client_count(&self) -> usize {
        self.inner.clients.lock().len()
    }

    /// Serialize once and push to every client, evicting the stalled ones
    pub fn broadcast(&self, event: &ServerEvent) {
        let text: Arc<str> = match serde_json::to_string(event) {
            Ok(json) => Arc::from(json),
            Err(e) => {
                warn!(venue_id = %self.inner.venue_id, error = %e, "event_serialize_failed");
                return;
            }
        };
        let kind = if event.is_lossy() { MessageKind::Frame } else { MessageKind::Event };

        let mut clients = self.inner.clients.lock();
        clients.retain(|client| {
            match client.queue.push(OutboundMessage { kind, text: text.clone() }) {
                PushOutcome::Delivered => true,
                PushOutcome::FrameDropped => {
                    self.inner.metrics.record_client_frame_dropped();
                    true
                }
                PushOutcome::Disconnect => {
                    warn!(
                        venue_id = %self.inner.venue_id,
                        client_id = %client.id,
                        "client_disconnected_backpressure"
                    );
                    self.inner.metrics.record_client_disconnected_slow();
                    client.queue.close();
                    false
                }
                PushOutcome::Closed => false,
            }
        });
    }

    /// Drop every client (venue stop)
    pub fn close_all(&self) {
        let mut clients = self.inner.clients.lock();
        for client in clients.drain(..) {
            client.queue.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::RoiId;

    fn hub(capacity: usize, stall: Duration) -> VenueHub {
        VenueHub::new(VenueId(1), capacity, stall, Arc::new(Metrics::new()))
    }

    fn frame_event(ts: u64) -> ServerEvent {
        ServerEvent::Frame(TrackFrame { venue_id: VenueId(1), ts, tracks: Vec::new() })
    }

    fn ledger_event(ts: u64) -> ServerEvent {
        ServerEvent::LedgerEntry(LedgerEntry::system(
            VenueId(1),
            Some(RoiId(10)),
            crate::domain::session::Severity::Info,
            "test",
            format!("event-{ts}"),
            ts,
        ))
    }

    #[test]
    fn test_frames_drop_oldest_first() {
        let hub = hub(2, Duration::from_secs(5));
        let queue = hub.subscribe();

        hub.broadcast(&frame_event(1));
        hub.broadcast(&frame_event(2));
        hub.broadcast(&frame_event(3));

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.frames_dropped(), 1);
        assert_eq!(hub.client_count(), 1);
    }

    #[test]
    fn test_events_displace_frames_and_survive() {
        let hub = hub(2, Duration::from_secs(5));
        let queue = hub.subscribe();

        hub.broadcast(&frame_event(1));
        hub.broadcast(&frame_event(2));
        hub.broadcast(&ledger_event(3));
        hub.broadcast(&ledger_event(4));
        hub.broadcast(&ledger_event(5));

        // All three events queued in order; frames were shed
        let state = queue.state.lock();
        let kinds: Vec<MessageKind> = state.deque.iter().map(|m| m.kind).collect();
        assert_eq!(kinds, vec![MessageKind::Event, MessageKind::Event, MessageKind::Event]);
        let texts: Vec<&str> = state.deque.iter().map(|m| &*m.text).collect();
        assert!(texts[0].contains("event-3"));
        assert!(texts[2].contains("event-5"));
    }

    #[test]
    fn test_stalled_client_disconnects_after_timeout() {
        let hub = hub(1, Duration::from_millis(0));
        let queue = hub.subscribe();

        hub.broadcast(&ledger_event(1));
        // Queue over capacity with events and zero tolerance: disconnect
        hub.broadcast(&ledger_event(2));
        hub.broadcast(&ledger_event(3));

        assert_eq!(hub.client_count(), 0);
        assert!(queue.is_closed());
    }

    #[test]
    fn test_healthy_client_is_not_disconnected() {
        let hub = hub(4, Duration::from_millis(0));
        let _queue = hub.subscribe();
        for ts in 0..3 {
            hub.broadcast(&ledger_event(ts));
        }
        assert_eq!(hub.client_count(), 1);
    }

    #[tokio::test]
    async fn test_pop_delivers_in_order_then_none_on_close() {
        let hub = hub(8, Duration::from_secs(5));
        let queue = hub.subscribe();

        hub.broadcast(&ledger_event(1));
        hub.broadcast(&frame_event(2));

        let first = queue.pop().await.unwrap();
        assert!(first.text.contains("event-1"));
        let second = queue.pop().await.unwrap();
        assert!(second.text.contains("\"frame\""));

        queue.close();
        assert!(queue.pop().await.is_none());
    }

    #[test]
    fn test_event_json_shape() {
        let event = ServerEvent::TrackRemoved {
            venue_id: VenueId(7),
            track_key: TrackKey::from_source("lidar-1", 42),
            ts: 1000,
        };
        let json = serde_json::to_string(&event).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "track_removed");
        assert_eq!(value["venueId"], 7);
        assert_eq!(value["trackKey"], "lidar-1:42");
    }
}
