//! Embedded MQTT broker using rumqttd
//!
//! Lets a single binary serve edge concentrators publishing trajectory
//! frames, without a separate broker deployment. The traffic shape is
//! narrow and known: QoS 0 publishes of small JSON frames that the engine
//! consumes immediately, so the router is sized for that instead of for
//! general-purpose messaging. Disabled by default.

use crate::infra::config::BrokerConfig;
use rumqttd::{Broker, Config, ConnectionSettings, RouterConfig, ServerSettings};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::thread;
use tracing::{info, warn};

/// Start the embedded MQTT broker on its own thread; returns immediately
pub fn start_embedded_broker(broker_config: &BrokerConfig) {
    if !broker_config.enabled {
        return;
    }

    let addr_str = format!("{}:{}", broker_config.bind_address, broker_config.port);
    let listen_addr: SocketAddr = match addr_str.parse() {
        Ok(addr) => addr,
        Err(e) => {
            warn!(error = %e, addr = %addr_str, "broker_invalid_bind_address");
            return;
        }
    };

    let config = trajectory_broker_config(broker_config, listen_addr);
    thread::spawn(move || {
        let mut broker = Broker::new(config);
        if let Err(e) = broker.start() {
            warn!(error = %e, "broker_start_failed");
        }
    });

    // start() blocks its own thread; give the listener a moment before clients dial
    thread::sleep(std::time::Duration::from_millis(100));
    info!(
        addr = %addr_str,
        max_connections = %broker_config.max_connections,
        "broker_started"
    );
}

/// rumqttd configuration shaped for concentrator trajectory feeds: one v4
/// listener, connection count from config, payload and retention limits
/// sized to the feed
fn trajectory_broker_config(broker: &BrokerConfig, listen: SocketAddr) -> Config {
    let v4 = ServerSettings {
        name: "v4".to_string(),
        listen,
        tls: None,
        next_connection_delay_ms: 1,
        connections: ConnectionSettings {
            connection_timeout_ms: 5000,
            // A trajectory frame is one JSON line per sensor tick; a venue
            // with hundreds of concurrent tracks serializes to a few tens
            // of KB. Anything past this is malformed, not a frame.
            max_payload_size: 64 * 1024,
            // QoS 0 only; unread frames go stale within a tick, so the
            // per-connection window stays small
            max_inflight_count: 64,
            auth: None,
            dynamic_filters: false,
            external_auth: None,
        },
    };

    Config {
        id: 0,
        router: RouterConfig {
            // Nothing is replayed: subscribers read live, so two segments
            // of roughly a minute of full-rate frames bound the log
            max_segment_size: 8 * 1024 * 1024,
            max_segment_count: 2,
            max_connections: broker.max_connections,
            max_outgoing_packet_count: 64,
            initialized_filters: None,
            ..Default::default()
        },
        v4: Some(HashMap::from([("v4".to_string(), v4)])),
        v5: None,
        ws: None,
        prometheus: None,
        metrics: None,
        bridge: None,
        console: None,
        cluster: None,
    }
}
