//! Services - the engine's business logic
//!
//! - `engine` - Venue registry: starts/stops pipelines, routes samples
//! - `pipeline` - Per-venue owner task: tick loop, TTL, frames, snapshots
//! - `ingest` - Bounded drop-oldest sample queue per venue
//! - `roi_index` - Copy-on-write polygon index answering containment queries
//! - `visits` - Zone-visit state machines and threshold resolution
//! - `queues` - Queue sessions with service linking and abandonment
//! - `occupancy` - Occupancy counters, snapshots, and alert-rule evaluation
//! - `fanout` - Per-venue hub pushing frames and events to live clients
//! - `persist` - Store writer task with retry and degraded-mode handling

pub mod engine;
pub mod fanout;
pub mod ingest;
pub mod occupancy;
pub mod persist;
pub mod pipeline;
pub mod queues;
pub mod roi_index;
pub mod visits;

pub use engine::Engine;
pub use fanout::{ServerEvent, VenueHub};
pub use roi_index::RoiIndex;
