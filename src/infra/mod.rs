//! Infrastructure - configuration, metrics, and broker
//!
//! - `config` - Application configuration (TOML loading, env overrides)
//! - `metrics` - Lock-free engine counters
//! - `broker` - Embedded MQTT broker (rumqttd) for self-contained deployments

pub mod broker;
pub mod config;
pub mod metrics;

pub use config::{Config, EngineSettings};
pub use metrics::Metrics;
