//! Floorsight - real-time spatial analytics for physical venues
//!
//! Fuses per-sensor object tracks into unified venue tracks, classifies them
//! against operator-drawn regions of interest, and derives zone visits,
//! queue sessions, occupancy, and rule-driven alerts in real time.
//!
//! Module structure:
//! - `domain/` - Core types (samples, tracks, geometry, visits, sessions)
//! - `io/` - External interfaces (LiDAR TCP, MQTT, mock generator, SQLite)
//! - `services/` - Engine (per-venue pipelines, visits, queues, fan-out)
//! - `infra/` - Infrastructure (config, metrics, embedded broker)
//! - `http/` - REST control surface and the /tracking WebSocket

use clap::Parser;
use floorsight::domain::types::VenueId;
use floorsight::http::{router, AppState};
use floorsight::infra::{broker, Config, Metrics};
use floorsight::io::{LidarPool, Store};
use floorsight::services::Engine;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::info;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Floorsight - venue spatial analytics engine
#[derive(Parser, Debug)]
#[command(name = "floorsight", version, about)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Structured logging, level via RUST_LOG (default info)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "floorsight_starting");

    let args = Args::parse();
    let config_path = Config::resolve_config_path(args.config.as_deref());
    let config = Config::load_from_path(&config_path);
    info!(
        config_file = %config.config_file(),
        port = %config.port(),
        database = %config.database_path(),
        mock = %config.mock().enabled,
        mqtt = %config.mqtt().enabled,
        lidar_endpoints = %config.lidar_endpoints().len(),
        frame_interval_ms = %config.engine().frame_interval_ms,
        track_ttl_ms = %config.engine().track_ttl_ms,
        "config_loaded"
    );

    // Embedded broker first so local MQTT sources can dial it
    broker::start_embedded_broker(config.broker());

    let store = Arc::new(Store::open(config.database_path())?);
    let metrics = Arc::new(Metrics::new());
    let engine = Engine::new(*config.engine(), store.clone(), metrics.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Sources feed one channel; the router fans samples out per venue
    let (source_tx, source_rx) = mpsc::channel(8192);
    let router_task = engine.spawn_router(source_rx);

    if !config.lidar_endpoints().is_empty() {
        let pool = LidarPool::spawn(
            config.lidar_endpoints(),
            source_tx.clone(),
            metrics.clone(),
            shutdown_rx.clone(),
        );
        info!(connections = %pool.task_count(), "lidar_pool_started");
        // Concentrator venues run even before anyone subscribes
        for endpoint in config.lidar_endpoints() {
            engine.ensure_venue(VenueId(endpoint.venue_id));
        }
    }

    if config.mqtt().enabled {
        let mqtt_config = config.mqtt().clone();
        let mqtt_tx = source_tx.clone();
        let mqtt_metrics = metrics.clone();
        let mqtt_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = floorsight::io::mqtt::start_mqtt_client(
                &mqtt_config,
                mqtt_tx,
                mqtt_metrics,
                mqtt_shutdown,
            )
            .await
            {
                tracing::error!(error = %e, "mqtt_client_error");
            }
        });
    }

    if config.mock().enabled {
        let bounds = {
            let store = store.clone();
            move |venue_id: VenueId| {
                store
                    .venue_defaults(venue_id)
                    .ok()
                    .flatten()
                    .map(|v| (v.width.max(1.0), v.depth.max(1.0)))
                    .unwrap_or((20.0, 20.0))
            }
        };
        let tasks = floorsight::io::mock::spawn_all(
            config.mock(),
            config.engine().frame_interval_ms,
            bounds,
            &source_tx,
            &shutdown_rx,
        );
        info!(generators = %tasks.len(), "mock_generators_started");
        for &venue in &config.mock().venues {
            engine.ensure_venue(VenueId(venue));
        }
    }

    // Periodic metrics summary
    {
        let metrics = metrics.clone();
        let interval_secs = config.metrics_interval_secs();
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_secs(interval_secs));
            loop {
                ticker.tick().await;
                metrics.report().log();
            }
        });
    }

    let state = AppState { engine: engine.clone(), store };
    let app = router(state);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.port()));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "http_listening");

    let server = axum::serve(listener, app).with_graceful_shutdown({
        let mut shutdown_rx = shutdown_rx.clone();
        async move {
            let _ = shutdown_rx.changed().await;
        }
    });

    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        let _ = shutdown_tx.send(true);
    });

    server.await?;

    // Drain every venue, flush writes, stop the writer
    drop(source_tx);
    engine.shutdown().await;
    router_task.abort();

    info!("floorsight shutdown complete");
    Ok(())
}
