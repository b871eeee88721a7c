//! Lock-free metrics collection and periodic reporting
//!
//! Counters are plain atomics so the per-venue pipelines never contend on a
//! lock in the sample hot path. The reporter swaps the rate counters to get a
//! consistent window.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;
use tracing::info;

/// Lock-free engine counters
pub struct Metrics {
    samples_received: AtomicU64,
    samples_dropped_overflow: AtomicU64,
    samples_malformed: AtomicU64,
    samples_since_report: AtomicU64,
    frames_emitted: AtomicU64,
    visits_opened: AtomicU64,
    visits_closed: AtomicU64,
    queue_sessions_opened: AtomicU64,
    queue_sessions_completed: AtomicU64,
    queue_sessions_abandoned: AtomicU64,
    store_writes_ok: AtomicU64,
    store_writes_retried: AtomicU64,
    store_writes_dropped: AtomicU64,
    clients_connected: AtomicU64,
    clients_disconnected_slow: AtomicU64,
    client_frames_dropped: AtomicU64,
    invariant_violations: AtomicU64,
    last_report_time: Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            samples_received: AtomicU64::new(0),
            samples_dropped_overflow: AtomicU64::new(0),
            samples_malformed: AtomicU64::new(0),
            samples_since_report: AtomicU64::new(0),
            frames_emitted: AtomicU64::new(0),
            visits_opened: AtomicU64::new(0),
            visits_closed: AtomicU64::new(0),
            queue_sessions_opened: AtomicU64::new(0),
            queue_sessions_completed: AtomicU64::new(0),
            queue_sessions_abandoned: AtomicU64::new(0),
            store_writes_ok: AtomicU64::new(0),
            store_writes_retried: AtomicU64::new(0),
            store_writes_dropped: AtomicU64::new(0),
            clients_connected: AtomicU64::new(0),
            clients_disconnected_slow: AtomicU64::new(0),
            client_frames_dropped: AtomicU64::new(0),
            invariant_violations: AtomicU64::new(0),
            last_report_time: Mutex::new(Instant::now()),
        }
    }

    #[inline]
    pub fn record_sample_received(&self) {
        self.samples_received.fetch_add(1, Ordering::Relaxed);
        self.samples_since_report.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_sample_dropped_overflow(&self) {
        self.samples_dropped_overflow.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_sample_malformed(&self) {
        self.samples_malformed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_frame_emitted(&self) {
        self.frames_emitted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_visit_opened(&self) {
        self.visits_opened.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_visit_closed(&self) {
        self.visits_closed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_queue_session_opened(&self) {
        self.queue_sessions_opened.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_queue_session_completed(&self) {
        self.queue_sessions_completed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_queue_session_abandoned(&self) {
        self.queue_sessions_abandoned.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_store_write_ok(&self) {
        self.store_writes_ok.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_store_write_retried(&self) {
        self.store_writes_retried.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_store_write_dropped(&self) {
        self.store_writes_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_client_connected(&self) {
        self.clients_connected.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_client_disconnected_slow(&self) {
        self.clients_disconnected_slow.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_client_frame_dropped(&self) {
        self.client_frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an internal invariant violation; returns the running total so
    /// callers can escalate above a threshold
    #[inline]
    pub fn record_invariant_violation(&self) -> u64 {
        self.invariant_violations.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn invariant_violations(&self) -> u64 {
        self.invariant_violations.load(Ordering::Relaxed)
    }

    /// Snapshot all counters and reset the rate window
    pub fn report(&self) -> MetricsSummary {
        let window_samples = self.samples_since_report.swap(0, Ordering::Relaxed);
        let elapsed = {
            let mut last = self.last_report_time.lock().unwrap_or_else(|e| e.into_inner());
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };
        let samples_per_sec = if elapsed.as_secs_f64() > 0.0 {
            window_samples as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        MetricsSummary {
            samples_received: self.samples_received.load(Ordering::Relaxed),
            samples_per_sec,
            samples_dropped_overflow: self.samples_dropped_overflow.load(Ordering::Relaxed),
            samples_malformed: self.samples_malformed.load(Ordering::Relaxed),
            frames_emitted: self.frames_emitted.load(Ordering::Relaxed),
            visits_opened: self.visits_opened.load(Ordering::Relaxed),
            visits_closed: self.visits_closed.load(Ordering::Relaxed),
            queue_sessions_opened: self.queue_sessions_opened.load(Ordering::Relaxed),
            queue_sessions_completed: self.queue_sessions_completed.load(Ordering::Relaxed),
            queue_sessions_abandoned: self.queue_sessions_abandoned.load(Ordering::Relaxed),
            store_writes_ok: self.store_writes_ok.load(Ordering::Relaxed),
            store_writes_retried: self.store_writes_retried.load(Ordering::Relaxed),
            store_writes_dropped: self.store_writes_dropped.load(Ordering::Relaxed),
            clients_connected: self.clients_connected.load(Ordering::Relaxed),
            clients_disconnected_slow: self.clients_disconnected_slow.load(Ordering::Relaxed),
            client_frames_dropped: self.client_frames_dropped.load(Ordering::Relaxed),
            invariant_violations: self.invariant_violations.load(Ordering::Relaxed),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct MetricsSummary {
    pub samples_received: u64,
    pub samples_per_sec: f64,
    pub samples_dropped_overflow: u64,
    pub samples_malformed: u64,
    pub frames_emitted: u64,
    pub visits_opened: u64,
    pub visits_closed: u64,
    pub queue_sessions_opened: u64,
    pub queue_sessions_completed: u64,
    pub queue_sessions_abandoned: u64,
    pub store_writes_ok: u64,
    pub store_writes_retried: u64,
    pub store_writes_dropped: u64,
    pub clients_connected: u64,
    pub clients_disconnected_slow: u64,
    pub client_frames_dropped: u64,
    pub invariant_violations: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            samples_total = %self.samples_received,
            samples_per_sec = format!("{:.1}", self.samples_per_sec),
            samples_dropped = %self.samples_dropped_overflow,
            samples_malformed = %self.samples_malformed,
            frames = %self.frames_emitted,
            visits_opened = %self.visits_opened,
            visits_closed = %self.visits_closed,
            queues_opened = %self.queue_sessions_opened,
            queues_completed = %self.queue_sessions_completed,
            queues_abandoned = %self.queue_sessions_abandoned,
            writes_ok = %self.store_writes_ok,
            writes_retried = %self.store_writes_retried,
            writes_dropped = %self.store_writes_dropped,
            clients = %self.clients_connected,
            clients_evicted = %self.clients_disconnected_slow,
            client_frames_dropped = %self.client_frames_dropped,
            invariant_violations = %self.invariant_violations,
            "metrics_summary"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = Metrics::new();
        metrics.record_sample_received();
        metrics.record_sample_received();
        metrics.record_visit_opened();
        metrics.record_visit_closed();
        metrics.record_queue_session_abandoned();

        let summary = metrics.report();
        assert_eq!(summary.samples_received, 2);
        assert_eq!(summary.visits_opened, 1);
        assert_eq!(summary.visits_closed, 1);
        assert_eq!(summary.queue_sessions_abandoned, 1);
    }

    #[test]
    fn test_rate_window_resets_on_report() {
        let metrics = Metrics::new();
        metrics.record_sample_received();
        let _ = metrics.report();
        let second = metrics.report();
        // Monotonic total survives, window count does not
        assert_eq!(second.samples_received, 1);
        assert_eq!(second.samples_per_sec, 0.0);
    }

    #[test]
    fn test_invariant_violation_returns_running_total() {
        let metrics = Metrics::new();
        assert_eq!(metrics.record_invariant_violation(), 1);
        assert_eq!(metrics.record_invariant_violation(), 2);
        assert_eq!(metrics.invariant_violations(), 2);
    }
}
