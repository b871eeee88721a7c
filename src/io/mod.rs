//! IO modules - external system interfaces
//!
//! - `codec` - Trajectory frame decoding shared by the transports
//! - `lidar` - Resilient TCP pool for LiDAR concentrator feeds
//! - `mqtt` - MQTT subscriber for edge trajectory topics
//! - `mock` - Deterministic synthetic track generator
//! - `store` - SQLite persistence (the engine's narrow store contract)

pub mod codec;
pub mod lidar;
pub mod mock;
pub mod mqtt;
pub mod store;

pub use lidar::LidarPool;
pub use mock::MockGenerator;
pub use store::Store;
