//! Shared types for venue tracking

use crate::domain::geometry::Point;
use serde::{Deserialize, Deserializer, Serialize};
use smallvec::SmallVec;
use std::collections::VecDeque;

/// Newtype wrapper for venue IDs to provide type safety
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct VenueId(pub i64);

impl std::fmt::Display for VenueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Newtype wrapper for ROI IDs to provide type safety
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct RoiId(pub i64);

impl std::fmt::Display for RoiId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Engine-assigned track identity, stable across frames.
///
/// Derived deterministically from `(source_id, source_track_id)`. Two sensors
/// observing the same physical object produce two keys; the engine performs
/// no cross-sensor re-identification.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct TrackKey(pub String);

impl TrackKey {
    pub fn from_source(source_id: &str, source_track_id: i64) -> Self {
        Self(format!("{source_id}:{source_track_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TrackKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Classification of a tracked object as reported by the sensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ObjectType {
    #[default]
    Person,
    Group,
    Unknown,
}

impl std::str::FromStr for ObjectType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_uppercase().as_str() {
            "PERSON" => ObjectType::Person,
            "GROUP" => ObjectType::Group,
            _ => ObjectType::Unknown,
        })
    }
}

/// A single normalized sensor observation.
///
/// Immutable; `ts` is the sensor's sample timestamp (epoch ms), which drives
/// all session math. Arrival wall-clock is never used for durations.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackSample {
    pub venue_id: VenueId,
    pub source_id: String,
    pub source_track_id: i64,
    pub ts: u64,
    pub x: f64,
    pub z: f64,
    pub vx: Option<f64>,
    pub vz: Option<f64>,
    pub object_type: ObjectType,
}

impl TrackSample {
    pub fn track_key(&self) -> TrackKey {
        TrackKey::from_source(&self.source_id, self.source_track_id)
    }
}

/// Concentrator frame timestamp - ISO 8601 string or epoch milliseconds
#[derive(Debug, Clone, Default)]
pub enum TimestampValue {
    #[default]
    None,
    IsoString(String),
    EpochMs(u64),
}

fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<TimestampValue, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::{self, Visitor};

    struct TimestampVisitor;

    impl<'de> Visitor<'de> for TimestampVisitor {
        type Value = TimestampValue;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a string or integer timestamp")
        }

        fn visit_str<E>(self, value: &str) -> Result<TimestampValue, E>
        where
            E: de::Error,
        {
            Ok(TimestampValue::IsoString(value.to_string()))
        }

        fn visit_string<E>(self, value: String) -> Result<TimestampValue, E>
        where
            E: de::Error,
        {
            Ok(TimestampValue::IsoString(value))
        }

        fn visit_u64<E>(self, value: u64) -> Result<TimestampValue, E>
        where
            E: de::Error,
        {
            Ok(TimestampValue::EpochMs(value))
        }

        fn visit_i64<E>(self, value: i64) -> Result<TimestampValue, E>
        where
            E: de::Error,
        {
            Ok(TimestampValue::EpochMs(u64::try_from(value).unwrap_or(0)))
        }
    }

    deserializer.deserialize_any(TimestampVisitor)
}

/// Wire format shared by the LiDAR concentrators and the MQTT trajectory feed.
///
/// One frame per message; `venue_id` may be omitted when the transport carries
/// it out of band (MQTT topic, connection config).
#[derive(Debug, Deserialize)]
pub struct TrajectoryFrame {
    #[serde(default)]
    pub venue_id: Option<i64>,
    #[serde(default, deserialize_with = "deserialize_timestamp")]
    pub ts: TimestampValue,
    #[serde(default)]
    pub tracks: Vec<TrajectoryTrack>,
}

#[derive(Debug, Deserialize)]
pub struct TrajectoryTrack {
    pub id: i64,
    pub x: f64,
    pub z: f64,
    #[serde(default)]
    pub vx: Option<f64>,
    #[serde(default)]
    pub vz: Option<f64>,
    #[serde(default, rename = "type")]
    pub obj_type: Option<String>,
}

/// Optional classification metadata attached to an ROI by the operator
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoiMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    /// `queue`, `service`, ... drives the queue engine
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

impl RoiMetadata {
    pub fn is_queue(&self) -> bool {
        self.zone_type.as_deref() == Some("queue")
    }

    pub fn is_service(&self) -> bool {
        self.zone_type.as_deref() == Some("service")
    }
}

/// A Region of Interest as persisted: an ordered vertex ring plus metadata.
/// Geometry validation happens when the ROI index ingests it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Roi {
    pub id: RoiId,
    pub venue_id: VenueId,
    pub name: String,
    pub vertices: Vec<Point>,
    #[serde(default)]
    pub metadata: RoiMetadata,
}

/// Maximum trail points retained per track
pub const TRAIL_CAPACITY: usize = 50;

/// A point on a track's recent path
#[derive(Debug, Clone, Copy, Serialize)]
pub struct TrailPoint {
    pub ts: u64,
    pub x: f64,
    pub z: f64,
}

/// The engine's authoritative record of one tracked object within a venue.
///
/// Mutated only by the venue pipeline. `roi_set` is derived from the latest
/// sample on every frame tick; no stale membership survives a new sample.
#[derive(Debug, Clone)]
pub struct UnifiedTrack {
    pub key: TrackKey,
    pub venue_id: VenueId,
    pub object_type: ObjectType,
    pub x: f64,
    pub z: f64,
    pub vx: f64,
    pub vz: f64,
    pub first_seen_ts: u64,
    pub last_seen_ts: u64,
    pub trail: VecDeque<TrailPoint>,
    pub roi_set: SmallVec<[RoiId; 4]>,
}

impl UnifiedTrack {
    pub fn from_sample(sample: &TrackSample) -> Self {
        let mut track = Self {
            key: sample.track_key(),
            venue_id: sample.venue_id,
            object_type: sample.object_type,
            x: sample.x,
            z: sample.z,
            vx: sample.vx.unwrap_or(0.0),
            vz: sample.vz.unwrap_or(0.0),
            first_seen_ts: sample.ts,
            last_seen_ts: sample.ts,
            trail: VecDeque::with_capacity(16),
            roi_set: SmallVec::new(),
        };
        track.trail.push_back(TrailPoint { ts: sample.ts, x: sample.x, z: sample.z });
        track
    }

    /// Apply a newer sample: update position, derive velocity when the sensor
    /// does not report one, extend the bounded trail.
    pub fn apply(&mut self, sample: &TrackSample) {
        let dt_ms = sample.ts.saturating_sub(self.last_seen_ts);
        match (sample.vx, sample.vz) {
            (Some(vx), Some(vz)) => {
                self.vx = vx;
                self.vz = vz;
            }
            _ if dt_ms > 0 => {
                let dt_s = dt_ms as f64 / 1000.0;
                self.vx = (sample.x - self.x) / dt_s;
                self.vz = (sample.z - self.z) / dt_s;
            }
            _ => {}
        }
        self.x = sample.x;
        self.z = sample.z;
        self.last_seen_ts = sample.ts;
        self.object_type = sample.object_type;
        if self.trail.len() == TRAIL_CAPACITY {
            self.trail.pop_front();
        }
        self.trail.push_back(TrailPoint { ts: sample.ts, x: sample.x, z: sample.z });
    }

    /// Speed magnitude in m/s
    pub fn speed(&self) -> f64 {
        (self.vx * self.vx + self.vz * self.vz).sqrt()
    }

    pub fn position(&self) -> Point {
        Point { x: self.x, z: self.z }
    }
}

/// Serializable view of a track for frames pushed to live clients
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackState {
    pub track_key: TrackKey,
    pub object_type: ObjectType,
    pub x: f64,
    pub z: f64,
    pub vx: f64,
    pub vz: f64,
    pub first_seen_ts: u64,
    pub last_seen_ts: u64,
    pub rois: Vec<RoiId>,
    pub trail: Vec<TrailPoint>,
}

impl From<&UnifiedTrack> for TrackState {
    fn from(track: &UnifiedTrack) -> Self {
        Self {
            track_key: track.key.clone(),
            object_type: track.object_type,
            x: track.x,
            z: track.z,
            vx: track.vx,
            vz: track.vz,
            first_seen_ts: track.first_seen_ts,
            last_seen_ts: track.last_seen_ts,
            rois: track.roi_set.to_vec(),
            trail: track.trail.iter().copied().collect(),
        }
    }
}

/// One frame tick's worth of live tracks for a venue
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackFrame {
    pub venue_id: VenueId,
    pub ts: u64,
    pub tracks: Vec<TrackState>,
}

/// Connection state of an upstream track source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceState {
    Connecting,
    Online,
    Offline,
    Error,
}

impl SourceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceState::Connecting => "connecting",
            SourceState::Online => "online",
            SourceState::Offline => "offline",
            SourceState::Error => "error",
        }
    }
}

/// Emitted on every source connection state change
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceStatus {
    pub source_id: String,
    /// Venue the source feeds; `None` broadcasts to every venue
    pub venue_id: Option<VenueId>,
    pub state: SourceState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub ts: u64,
}

/// What a track source hands to the engine
#[derive(Debug, Clone)]
pub enum SourceMessage {
    Sample(TrackSample),
    Status(SourceStatus),
}
