//! LiDAR concentrator connection pool
//!
//! One resilient TCP connection per configured endpoint. Concentrators
//! stream newline-delimited JSON trajectory frames. Dial timeout is 10 s;
//! reconnects back off exponentially from 1 s up to 30 s and reset once a
//! connection delivers. Every state change is surfaced as a status event;
//! transport errors never reach the pipelines.

use crate::domain::session::epoch_ms;
use crate::domain::types::{SourceMessage, SourceState, SourceStatus, VenueId};
use crate::infra::config::LidarEndpoint;
use crate::infra::metrics::Metrics;
use crate::io::codec;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Handle over all concentrator connection tasks
pub struct LidarPool {
    tasks: Vec<JoinHandle<()>>,
}

impl LidarPool {
    /// Spawn one connection task per endpoint
    pub fn spawn(
        endpoints: &[LidarEndpoint],
        tx: mpsc::Sender<SourceMessage>,
        metrics: Arc<Metrics>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let tasks = endpoints
            .iter()
            .cloned()
            .map(|endpoint| {
                let tx = tx.clone();
                let metrics = metrics.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(run_endpoint(endpoint, tx, metrics, shutdown))
            })
            .collect();
        Self { tasks }
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }
}

fn send_status(
    tx: &mpsc::Sender<SourceMessage>,
    endpoint: &LidarEndpoint,
    state: SourceState,
    detail: Option<String>,
) {
    let _ = tx.try_send(SourceMessage::Status(SourceStatus {
        source_id: endpoint.id.clone(),
        venue_id: Some(VenueId(endpoint.venue_id)),
        state,
        detail,
        ts: epoch_ms(),
    }));
}

async fn run_endpoint(
    endpoint: LidarEndpoint,
    tx: mpsc::Sender<SourceMessage>,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) {
    let venue_id = VenueId(endpoint.venue_id);
    let mut backoff = BACKOFF_INITIAL;

    loop {
        if *shutdown.borrow() {
            break;
        }
        send_status(&tx, &endpoint, SourceState::Connecting, None);

        let connect = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&endpoint.addr));
        let stream = tokio::select! {
            result = connect => result,
            _ = shutdown.changed() => break,
        };
        let stream = match stream {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!(source = %endpoint.id, addr = %endpoint.addr, error = %e, "lidar_connect_failed");
                send_status(&tx, &endpoint, SourceState::Error, Some(e.to_string()));
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = shutdown.changed() => break,
                }
                backoff = (backoff * 2).min(BACKOFF_CAP);
                continue;
            }
            Err(_) => {
                warn!(source = %endpoint.id, addr = %endpoint.addr, "lidar_connect_timeout");
                send_status(
                    &tx,
                    &endpoint,
                    SourceState::Error,
                    Some("connect timeout".to_string()),
                );
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = shutdown.changed() => break,
                }
                backoff = (backoff * 2).min(BACKOFF_CAP);
                continue;
            }
        };

        info!(source = %endpoint.id, addr = %endpoint.addr, "lidar_connected");
        send_status(&tx, &endpoint, SourceState::Online, None);
        backoff = BACKOFF_INITIAL;

        let mut lines = BufReader::new(stream).lines();
        loop {
            let line = tokio::select! {
                line = lines.next_line() => line,
                _ = shutdown.changed() => {
                    send_status(&tx, &endpoint, SourceState::Offline, None);
                    return;
                }
            };
            match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let frame = match codec::decode_frame(&line) {
                        Ok(frame) => frame,
                        Err(e) => {
                            metrics.record_sample_malformed();
                            debug!(source = %endpoint.id, error = %e, "lidar_frame_parse_failed");
                            continue;
                        }
                    };
                    let samples = codec::frame_to_samples(
                        frame,
                        &endpoint.id,
                        Some(venue_id),
                        epoch_ms(),
                    );
                    for sample in samples {
                        if tx.try_send(SourceMessage::Sample(sample)).is_err() {
                            metrics.record_sample_dropped_overflow();
                        }
                    }
                }
                Ok(None) => {
                    warn!(source = %endpoint.id, "lidar_connection_closed");
                    break;
                }
                Err(e) => {
                    warn!(source = %endpoint.id, error = %e, "lidar_read_error");
                    break;
                }
            }
        }

        send_status(&tx, &endpoint, SourceState::Offline, None);
        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = shutdown.changed() => break,
        }
        backoff = (backoff * 2).min(BACKOFF_CAP);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    fn endpoint(addr: String) -> LidarEndpoint {
        LidarEndpoint { id: "lidar-test".to_string(), addr, venue_id: 1 }
    }

    #[tokio::test]
    async fn test_pool_streams_frames_from_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket
                .write_all(
                    b"{\"ts\":1000,\"tracks\":[{\"id\":1,\"x\":2.0,\"z\":3.0}]}\nnot json\n{\"ts\":2000,\"tracks\":[{\"id\":1,\"x\":2.1,\"z\":3.1}]}\n",
                )
                .await
                .unwrap();
        });

        let (tx, mut rx) = mpsc::channel(64);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let metrics = Arc::new(Metrics::new());
        let _pool = LidarPool::spawn(&[endpoint(addr)], tx, metrics.clone(), shutdown_rx);

        let mut samples = Vec::new();
        let mut statuses = Vec::new();
        // connecting + online + 2 samples, then the peer closes
        for _ in 0..8 {
            match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
                Ok(Some(SourceMessage::Sample(sample))) => samples.push(sample),
                Ok(Some(SourceMessage::Status(status))) => {
                    let offline = status.state == SourceState::Offline;
                    statuses.push(status.state);
                    if offline && samples.len() == 2 {
                        break;
                    }
                }
                _ => break,
            }
        }
        server.await.unwrap();

        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].ts, 1000);
        assert_eq!(samples[0].venue_id, VenueId(1));
        assert_eq!(samples[1].ts, 2000);
        assert!(statuses.contains(&SourceState::Connecting));
        assert!(statuses.contains(&SourceState::Online));
        assert_eq!(metrics.report().samples_malformed, 1);
    }
}
