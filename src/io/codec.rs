//! Trajectory frame decoding shared by the LiDAR and MQTT transports

use crate::domain::types::{ObjectType, TimestampValue, TrackSample, TrajectoryFrame, VenueId};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Parse ISO 8601 / RFC 3339 to epoch milliseconds
pub fn parse_iso_time(time_str: &str) -> Option<u64> {
    OffsetDateTime::parse(time_str, &Rfc3339)
        .ok()
        .map(|dt| (dt.unix_timestamp_nanos() / 1_000_000) as u64)
}

fn timestamp_to_epoch_ms(ts: &TimestampValue, fallback_ms: u64) -> u64 {
    match ts {
        TimestampValue::EpochMs(ms) => *ms,
        TimestampValue::IsoString(s) => parse_iso_time(s).unwrap_or(fallback_ms),
        TimestampValue::None => fallback_ms,
    }
}

/// Decode one JSON trajectory frame
pub fn decode_frame(payload: &str) -> Result<TrajectoryFrame, serde_json::Error> {
    serde_json::from_str(payload)
}

/// Flatten a frame into samples. `fallback_venue` covers transports that
/// carry the venue out of band; frames naming neither yield nothing.
pub fn frame_to_samples(
    frame: TrajectoryFrame,
    source_id: &str,
    fallback_venue: Option<VenueId>,
    received_wall_ms: u64,
) -> Vec<TrackSample> {
    let Some(venue_id) = frame.venue_id.map(VenueId).or(fallback_venue) else {
        return Vec::new();
    };
    let ts = timestamp_to_epoch_ms(&frame.ts, received_wall_ms);
    frame
        .tracks
        .into_iter()
        .map(|track| TrackSample {
            venue_id,
            source_id: source_id.to_string(),
            source_track_id: track.id,
            ts,
            x: track.x,
            z: track.z,
            vx: track.vx,
            vz: track.vz,
            object_type: track
                .obj_type
                .as_deref()
                .map(|t| t.parse().unwrap_or(ObjectType::Unknown))
                .unwrap_or_default(),
        })
        .collect()
}
