//! MQTT subscriber for edge trajectory topics
//!
//! Edge concentrators publish trajectory frames to `venues/{id}/trajectories`
//! at QoS 0. Delivery is at-most-once and duplicates are permitted; the
//! aggregator is idempotent on `(source, track, timestamp)`. Transport
//! errors never propagate downstream, they only surface as status events.

use crate::domain::session::epoch_ms;
use crate::domain::types::{SourceMessage, SourceState, SourceStatus, VenueId};
use crate::infra::config::MqttConfig;
use crate::infra::metrics::Metrics;
use crate::io::codec;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

const SOURCE_ID: &str = "mqtt";

/// Venue id from a `venues/{id}/trajectories` topic
fn venue_from_topic(topic: &str) -> Option<VenueId> {
    let mut parts = topic.split('/');
    if parts.next() != Some("venues") {
        return None;
    }
    let id = parts.next()?.parse().ok()?;
    Some(VenueId(id))
}

fn send_status(tx: &mpsc::Sender<SourceMessage>, state: SourceState, detail: Option<String>) {
    let _ = tx.try_send(SourceMessage::Status(SourceStatus {
        source_id: SOURCE_ID.to_string(),
        venue_id: None,
        state,
        detail,
        ts: epoch_ms(),
    }));
}

/// Run the MQTT client until shutdown; reconnects are handled by polling the
/// event loop again after a short pause
pub async fn start_mqtt_client(
    config: &MqttConfig,
    tx: mpsc::Sender<SourceMessage>,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let mut mqttoptions = MqttOptions::new("floorsight", &config.host, config.port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    if let (Some(username), Some(password)) = (&config.username, &config.password) {
        mqttoptions.set_credentials(username, password);
    }

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 100);
    client.subscribe(&config.topic, QoS::AtMostOnce).await?;
    info!(topic = %config.topic, host = %config.host, port = %config.port, "mqtt_subscribed");
    send_status(&tx, SourceState::Connecting, None);

    // Rate-limit drop warnings to one per second
    let mut last_drop_warn = Instant::now() - Duration::from_secs(2);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("mqtt_shutdown");
                    send_status(&tx, SourceState::Offline, None);
                    return Ok(());
                }
            }
            result = eventloop.poll() => {
                match result {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("mqtt_connected");
                        send_status(&tx, SourceState::Online, None);
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let received_ms = epoch_ms();
                        let topic_venue = venue_from_topic(&publish.topic);
                        let payload = match std::str::from_utf8(&publish.payload) {
                            Ok(s) => s,
                            Err(e) => {
                                metrics.record_sample_malformed();
                                warn!(error = %e, "mqtt_payload_not_utf8");
                                continue;
                            }
                        };
                        let frame = match codec::decode_frame(payload) {
                            Ok(frame) => frame,
                            Err(e) => {
                                metrics.record_sample_malformed();
                                debug!(error = %e, topic = %publish.topic, "mqtt_frame_parse_failed");
                                continue;
                            }
                        };
                        let samples =
                            codec::frame_to_samples(frame, SOURCE_ID, topic_venue, received_ms);
                        for sample in samples {
                            if let Err(e) = tx.try_send(SourceMessage::Sample(sample)) {
                                match e {
                                    TrySendError::Full(_) => {
                                        metrics.record_sample_dropped_overflow();
                                        if last_drop_warn.elapsed() > Duration::from_secs(1) {
                                            warn!("mqtt_sample_dropped: channel full");
                                            last_drop_warn = Instant::now();
                                        }
                                    }
                                    TrySendError::Closed(_) => {
                                        warn!("mqtt_source_channel_closed");
                                        return Ok(());
                                    }
                                }
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(error = %e, "mqtt_error");
                        send_status(&tx, SourceState::Error, Some(e.to_string()));
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        send_status(&tx, SourceState::Connecting, None);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_venue_from_topic() {
        assert_eq!(venue_from_topic("venues/7/trajectories"), Some(VenueId(7)));
        assert_eq!(venue_from_topic("venues/123/trajectories"), Some(VenueId(123)));
        assert_eq!(venue_from_topic("other/7/trajectories"), None);
        assert_eq!(venue_from_topic("venues/abc/trajectories"), None);
        assert_eq!(venue_from_topic("venues"), None);
    }
}
