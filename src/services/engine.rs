//! Venue registry and sample routing
//!
//! The engine owns one pipeline task per running venue plus the shared store
//! writer. Venues start lazily (first subscription or explicit ensure) and
//! every piece of per-venue state lives inside its pipeline; the registry
//! only holds the handles needed to reach it.

use crate::domain::session::epoch_ms;
use crate::domain::types::{RoiId, SourceMessage, SourceStatus, TrackSample, VenueId};
use crate::infra::config::EngineSettings;
use crate::infra::metrics::Metrics;
use crate::io::store::Store;
use crate::services::fanout::{ServerEvent, VenueHub};
use crate::services::ingest::SampleQueue;
use crate::services::persist::{create_store_writer, WriterHandle};
use crate::services::pipeline::{VenueControl, VenuePipeline, VenueSnapshot};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

struct VenueHandle {
    ingest: SampleQueue,
    control: mpsc::Sender<VenueControl>,
    hub: VenueHub,
    snapshot_rx: watch::Receiver<Arc<VenueSnapshot>>,
    task: JoinHandle<()>,
}

/// What a live-channel subscription gets back
#[derive(Clone)]
pub struct VenueAccess {
    pub hub: VenueHub,
    pub snapshot_rx: watch::Receiver<Arc<VenueSnapshot>>,
}

struct EngineInner {
    settings: EngineSettings,
    store: Arc<Store>,
    metrics: Arc<Metrics>,
    writer: WriterHandle,
    degraded_rx: watch::Receiver<bool>,
    venues: RwLock<FxHashMap<VenueId, VenueHandle>>,
    shutdown_tx: watch::Sender<bool>,
    writer_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Build the engine and spawn the store writer. Requires a runtime.
    pub fn new(settings: EngineSettings, store: Arc<Store>, metrics: Arc<Metrics>) -> Self {
        let (writer, writer_task, degraded_rx) =
            create_store_writer(store.clone(), metrics.clone(), 4096);
        let writer_join = tokio::spawn(writer_task.run());
        let (shutdown_tx, _) = watch::channel(false);
        let engine = Self {
            inner: Arc::new(EngineInner {
                settings,
                store,
                metrics,
                writer,
                degraded_rx: degraded_rx.clone(),
                venues: RwLock::new(FxHashMap::default()),
                shutdown_tx,
                writer_task: parking_lot::Mutex::new(Some(writer_join)),
            }),
        };

        // Live clients hear about a degraded store the moment it happens
        let watcher = engine.clone();
        let mut degraded_rx = degraded_rx;
        tokio::spawn(async move {
            while degraded_rx.changed().await.is_ok() {
                if *degraded_rx.borrow() {
                    watcher.broadcast_engine_status("degraded-persistence");
                    break;
                }
            }
        });
        engine
    }

    fn broadcast_engine_status(&self, status: &str) {
        let ts = epoch_ms();
        let venues = self.inner.venues.read();
        for (venue_id, handle) in venues.iter() {
            handle.hub.broadcast(&ServerEvent::EngineStatus {
                venue_id: *venue_id,
                status: status.to_string(),
                ts,
            });
        }
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.inner.metrics
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.inner.store
    }

    pub fn is_degraded(&self) -> bool {
        *self.inner.degraded_rx.borrow()
    }

    /// Start the venue pipeline if it is not running and return its handles.
    /// An already-running venue gets an ROI refresh so fresh subscribers see
    /// current zone state.
    pub fn ensure_venue(&self, venue_id: VenueId) -> VenueAccess {
        {
            let venues = self.inner.venues.read();
            if let Some(handle) = venues.get(&venue_id) {
                let _ = handle.control.try_send(VenueControl::RefreshRois);
                return VenueAccess {
                    hub: handle.hub.clone(),
                    snapshot_rx: handle.snapshot_rx.clone(),
                };
            }
        }

        let mut venues = self.inner.venues.write();
        // Double-check under the write lock
        if let Some(handle) = venues.get(&venue_id) {
            return VenueAccess {
                hub: handle.hub.clone(),
                snapshot_rx: handle.snapshot_rx.clone(),
            };
        }

        let settings = self.inner.settings;
        let ingest = SampleQueue::new(settings.ingest_buffer_size);
        let (control_tx, control_rx) = mpsc::channel(32);
        let hub = VenueHub::new(
            venue_id,
            settings.client_send_buffer_size,
            Duration::from_millis(settings.client_backpressure_timeout_ms),
            self.inner.metrics.clone(),
        );
        let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(VenueSnapshot::default()));

        let pipeline = VenuePipeline::new(
            venue_id,
            settings,
            self.inner.store.clone(),
            self.inner.writer.clone(),
            hub.clone(),
            self.inner.metrics.clone(),
            snapshot_tx,
        );
        let pipeline_ingest = ingest.clone();
        let shutdown_rx = self.inner.shutdown_tx.subscribe();
        let task = tokio::spawn(pipeline.run(pipeline_ingest, control_rx, shutdown_rx));

        info!(venue_id = %venue_id, "venue_started");
        let access = VenueAccess { hub: hub.clone(), snapshot_rx: snapshot_rx.clone() };
        venues.insert(venue_id, VenueHandle { ingest, control: control_tx, hub, snapshot_rx, task });
        access
    }

    /// Stop one venue: close its ingest queue and wait for the drain
    pub async fn stop_venue(&self, venue_id: VenueId) {
        let handle = self.inner.venues.write().remove(&venue_id);
        if let Some(handle) = handle {
            handle.ingest.close();
            if handle.task.await.is_err() {
                warn!(venue_id = %venue_id, "venue_task_panicked");
            }
            info!(venue_id = %venue_id, "venue_stopped");
        }
    }

    pub fn is_running(&self, venue_id: VenueId) -> bool {
        self.inner.venues.read().contains_key(&venue_id)
    }

    /// Route one source message: samples to their venue's queue, status to
    /// the affected hub (or all hubs for venue-agnostic sources)
    pub fn dispatch(&self, message: SourceMessage) {
        match message {
            SourceMessage::Sample(sample) => self.ingest(sample),
            SourceMessage::Status(status) => self.publish_source_status(status),
        }
    }

    /// Feed a sample to its venue. Samples for venues that are not running
    /// are discarded; subscription is what turns a venue on.
    pub fn ingest(&self, sample: TrackSample) {
        let venues = self.inner.venues.read();
        if let Some(handle) = venues.get(&sample.venue_id) {
            if handle.ingest.push(sample) {
                self.inner.metrics.record_sample_dropped_overflow();
            }
        }
    }

    pub fn publish_source_status(&self, status: SourceStatus) {
        let venues = self.inner.venues.read();
        match status.venue_id {
            Some(venue_id) => {
                if let Some(handle) = venues.get(&venue_id) {
                    handle.hub.broadcast(&ServerEvent::LidarStatus(status));
                }
            }
            None => {
                for handle in venues.values() {
                    handle.hub.broadcast(&ServerEvent::LidarStatus(status.clone()));
                }
            }
        }
    }

    /// Spawn the router that drains a source channel into the engine
    pub fn spawn_router(&self, mut rx: mpsc::Receiver<SourceMessage>) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                engine.dispatch(message);
            }
        })
    }

    /// Latest published snapshot for a running venue
    pub fn snapshot(&self, venue_id: VenueId) -> Option<Arc<VenueSnapshot>> {
        self.inner
            .venues
            .read()
            .get(&venue_id)
            .map(|handle| handle.snapshot_rx.borrow().clone())
    }

    /// Best-effort control message to a running venue
    pub fn control(&self, venue_id: VenueId, message: VenueControl) {
        let venues = self.inner.venues.read();
        if let Some(handle) = venues.get(&venue_id) {
            let _ = handle.control.try_send(message);
        }
    }

    /// ROI CRUD invalidation hook
    pub fn invalidate_rois(&self, venue_id: VenueId) {
        self.control(venue_id, VenueControl::RefreshRois);
    }

    /// ZoneSettings PUT invalidation hook
    pub fn invalidate_thresholds(&self, venue_id: VenueId, roi_id: RoiId) {
        self.control(venue_id, VenueControl::InvalidateThresholds(roi_id));
    }

    /// Stop every venue, flush pending writes, then stop the writer
    pub async fn shutdown(&self) {
        let _ = self.inner.shutdown_tx.send(true);
        let handles: Vec<(VenueId, VenueHandle)> =
            self.inner.venues.write().drain().collect();
        for (venue_id, handle) in handles {
            handle.ingest.close();
            if handle.task.await.is_err() {
                warn!(venue_id = %venue_id, "venue_task_panicked");
            }
        }
        self.inner.writer.flush().await;
        if let Some(task) = self.inner.writer_task.lock().take() {
            task.abort();
        }
        info!("engine_shutdown_complete");
    }
}
