//! Store writer task
//!
//! Decouples disk I/O from the venue pipelines: writes arrive over a bounded
//! channel and are retried on transient failure (250 ms / 1 s / 4 s). After
//! the retry budget the record is dropped and counted; in-memory state stays
//! consistent. A fatal error (schema mismatch, unwritable database) flips the
//! engine into degraded-persistence mode: the writer keeps draining so the
//! pipelines never block, but stops issuing inserts.

use crate::domain::session::{LedgerEntry, OccupancySnapshot, QueueSession, ZoneVisit};
use crate::io::store::Store;
use crate::infra::metrics::Metrics;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

const RETRY_DELAYS: [Duration; 3] =
    [Duration::from_millis(250), Duration::from_secs(1), Duration::from_secs(4)];

/// One persistence operation, idempotent by primary key
#[derive(Debug)]
pub enum WriteOp {
    InsertVisit(ZoneVisit),
    CloseVisit {
        id: String,
        end_ts: u64,
        duration_ms: u64,
        is_dwell: bool,
        is_engagement: bool,
    },
    UpsertQueueSession(QueueSession),
    InsertSnapshot(OccupancySnapshot),
    InsertLedger(LedgerEntry),
    /// Shutdown barrier: acked once everything queued before it is applied
    Flush(tokio::sync::oneshot::Sender<()>),
}

/// Cloneable handle the pipelines write through
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<WriteOp>,
    metrics: Arc<Metrics>,
}

impl WriterHandle {
    /// Non-blocking enqueue; a full writer queue drops the record (the
    /// in-memory state is authoritative, a lost row is recoverable noise)
    pub fn submit(&self, op: WriteOp) {
        if self.tx.try_send(op).is_err() {
            self.metrics.record_store_write_dropped();
            warn!("store_write_queue_full");
        }
    }

    /// Wait until every previously queued write has been applied
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = tokio::sync::oneshot::channel();
        if self.tx.send(WriteOp::Flush(ack_tx)).await.is_ok() {
            let _ = ack_rx.await;
        }
    }
}

pub struct StoreWriter {
    rx: mpsc::Receiver<WriteOp>,
    store: Arc<Store>,
    metrics: Arc<Metrics>,
    degraded_tx: watch::Sender<bool>,
}

/// Build the writer task plus its handle and degraded-mode watch
pub fn create_store_writer(
    store: Arc<Store>,
    metrics: Arc<Metrics>,
    buffer: usize,
) -> (WriterHandle, StoreWriter, watch::Receiver<bool>) {
    let (tx, rx) = mpsc::channel(buffer);
    let (degraded_tx, degraded_rx) = watch::channel(false);
    let handle = WriterHandle { tx, metrics: metrics.clone() };
    let writer = StoreWriter { rx, store, metrics, degraded_tx };
    (handle, writer, degraded_rx)
}

impl StoreWriter {
    /// Drain writes until every handle is dropped
    pub async fn run(mut self) {
        let mut degraded = false;
        while let Some(op) = self.rx.recv().await {
            if let WriteOp::Flush(ack) = op {
                let _ = ack.send(());
                continue;
            }
            if degraded {
                // Keep draining so pipelines never block, but stop inserting
                self.metrics.record_store_write_dropped();
                continue;
            }
            match self.apply_with_retry(&op).await {
                WriteResult::Ok => self.metrics.record_store_write_ok(),
                WriteResult::Dropped => self.metrics.record_store_write_dropped(),
                WriteResult::Fatal => {
                    degraded = true;
                    self.metrics.record_store_write_dropped();
                    let _ = self.degraded_tx.send(true);
                    error!("persistence_degraded_no_further_inserts");
                }
            }
        }
        info!("store_writer_stopped");
    }

    async fn apply_with_retry(&self, op: &WriteOp) -> WriteResult {
        let mut attempt = 0;
        loop {
            match self.apply(op) {
                Ok(()) => return WriteResult::Ok,
                Err(e) if is_fatal(&e) => {
                    error!(error = %e, "store_write_fatal");
                    return WriteResult::Fatal;
                }
                Err(e) => {
                    if attempt >= RETRY_DELAYS.len() {
                        error!(error = %e, op = ?op_kind(op), "store_write_dropped_after_retries");
                        return WriteResult::Dropped;
                    }
                    warn!(error = %e, attempt = attempt + 1, "store_write_retry");
                    self.metrics.record_store_write_retried();
                    tokio::time::sleep(RETRY_DELAYS[attempt]).await;
                    attempt += 1;
                }
            }
        }
    }

    fn apply(&self, op: &WriteOp) -> anyhow::Result<()> {
        match op {
            WriteOp::InsertVisit(visit) => self.store.insert_zone_visit(visit),
            WriteOp::CloseVisit { id, end_ts, duration_ms, is_dwell, is_engagement } => {
                self.store.close_zone_visit(id, *end_ts, *duration_ms, *is_dwell, *is_engagement)
            }
            WriteOp::UpsertQueueSession(session) => self.store.upsert_queue_session(session),
            WriteOp::InsertSnapshot(snapshot) => self.store.insert_occupancy_snapshot(snapshot),
            WriteOp::InsertLedger(entry) => self.store.insert_ledger_entry(entry),
            // Intercepted in run()
            WriteOp::Flush(_) => Ok(()),
        }
    }
}

enum WriteResult {
    Ok,
    Dropped,
    Fatal,
}

fn op_kind(op: &WriteOp) -> &'static str {
    match op {
        WriteOp::InsertVisit(_) => "insert_visit",
        WriteOp::CloseVisit { .. } => "close_visit",
        WriteOp::UpsertQueueSession(_) => "queue_session",
        WriteOp::InsertSnapshot(_) => "snapshot",
        WriteOp::InsertLedger(_) => "ledger",
        WriteOp::Flush(_) => "flush",
    }
}

/// Errors no retry can fix
fn is_fatal(e: &anyhow::Error) -> bool {
    let text = e.to_string();
    text.contains("no such table")
        || text.contains("no such column")
        || text.contains("readonly database")
        || text.contains("database disk image is malformed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{RoiId, TrackKey, VenueId};

    #[tokio::test]
    async fn test_writer_persists_and_stops_when_handles_drop() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let metrics = Arc::new(Metrics::new());
        let (handle, writer, _degraded) =
            create_store_writer(store.clone(), metrics.clone(), 64);
        let task = tokio::spawn(writer.run());

        let mut visit =
            ZoneVisit::open(VenueId(1), RoiId(10), TrackKey::from_source("mock", 1), 0);
        handle.submit(WriteOp::InsertVisit(visit.clone()));
        visit.close(5000, 60_000, 120_000);
        handle.submit(WriteOp::CloseVisit {
            id: visit.id.clone(),
            end_ts: 5000,
            duration_ms: 5000,
            is_dwell: false,
            is_engagement: false,
        });

        drop(handle);
        task.await.unwrap();

        let kpis = store.roi_kpis(RoiId(10), 0).unwrap();
        assert_eq!(kpis.total_visits, 1);
        assert_eq!(metrics.report().store_writes_ok, 2);
    }

    #[test]
    fn test_fatal_classification() {
        assert!(is_fatal(&anyhow::anyhow!("no such table: zone_visits")));
        assert!(is_fatal(&anyhow::anyhow!("attempt to write a readonly database")));
        assert!(!is_fatal(&anyhow::anyhow!("database is locked")));
    }
}
