//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml
//!
//! A handful of deployment knobs can additionally be overridden through the
//! environment (PORT, MOCK_LIDAR, MQTT_ENABLED, TRACK_TTL_MS,
//! FRAME_INTERVAL_MS, OCCUPANCY_SNAPSHOT_INTERVAL_MS, SERVICE_LINGER_SEC,
//! DATABASE_PATH), which wins over the file.

use anyhow::Context;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: default_port() }
    }
}

fn default_port() -> u16 {
    3000
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: default_database_path() }
    }
}

fn default_database_path() -> String {
    "floorsight.db".to_string()
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct MockConfig {
    /// Enable the synthetic track generator
    #[serde(default)]
    pub enabled: bool,
    /// Venues the generator feeds
    #[serde(default)]
    pub venues: Vec<i64>,
    /// Simulated tracks per venue
    #[serde(default = "default_mock_tracks")]
    pub tracks: u32,
    /// RNG seed so runs are reproducible
    #[serde(default = "default_mock_seed")]
    pub seed: u64,
}

fn default_mock_tracks() -> u32 {
    3
}

fn default_mock_seed() -> u64 {
    42
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_mqtt_host")]
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    /// Trajectory topic filter; venue id is the second topic segment
    #[serde(default = "default_mqtt_topic")]
    pub topic: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            topic: default_mqtt_topic(),
            username: None,
            password: None,
        }
    }
}

fn default_mqtt_host() -> String {
    "localhost".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_mqtt_topic() -> String {
    "venues/+/trajectories".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_broker_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    /// Connection cap: one per concentrator on site, plus headroom for
    /// operator tooling. Sites run a handful of concentrators, not thousands.
    #[serde(default = "default_broker_max_connections")]
    pub max_connections: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_address: default_broker_bind_address(),
            port: 1883,
            max_connections: default_broker_max_connections(),
        }
    }
}

fn default_broker_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_broker_max_connections() -> usize {
    64
}

/// One LiDAR concentrator endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct LidarEndpoint {
    pub id: String,
    pub addr: String,
    pub venue_id: i64,
}

/// Engine timing and buffering knobs.
///
/// Every session-math constant lives here so tests and the HTTP layer see the
/// same values the pipeline runs with.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct EngineSettings {
    #[serde(default = "default_frame_interval_ms")]
    pub frame_interval_ms: u64,
    #[serde(default = "default_track_ttl_ms")]
    pub track_ttl_ms: u64,
    #[serde(default = "default_occupancy_snapshot_interval_ms")]
    pub occupancy_snapshot_interval_ms: u64,
    #[serde(default = "default_visit_end_grace_sec")]
    pub visit_end_grace_sec: u32,
    #[serde(default = "default_min_visit_duration_sec")]
    pub min_visit_duration_sec: u32,
    #[serde(default = "default_service_linger_sec")]
    pub service_linger_sec: u32,
    #[serde(default = "default_min_completion_ms")]
    pub min_completion_ms: u64,
    #[serde(default = "default_dwell_default_sec")]
    pub dwell_default_sec: u32,
    #[serde(default = "default_engagement_default_sec")]
    pub engagement_default_sec: u32,
    #[serde(default = "default_ingest_buffer_size")]
    pub ingest_buffer_size: usize,
    #[serde(default = "default_client_send_buffer_size")]
    pub client_send_buffer_size: usize,
    #[serde(default = "default_client_backpressure_timeout_ms")]
    pub client_backpressure_timeout_ms: u64,
    #[serde(default = "default_roi_refresh_interval_ms")]
    pub roi_refresh_interval_ms: u64,
    #[serde(default = "default_alert_quiescence_sec")]
    pub alert_quiescence_sec: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            frame_interval_ms: default_frame_interval_ms(),
            track_ttl_ms: default_track_ttl_ms(),
            occupancy_snapshot_interval_ms: default_occupancy_snapshot_interval_ms(),
            visit_end_grace_sec: default_visit_end_grace_sec(),
            min_visit_duration_sec: default_min_visit_duration_sec(),
            service_linger_sec: default_service_linger_sec(),
            min_completion_ms: default_min_completion_ms(),
            dwell_default_sec: default_dwell_default_sec(),
            engagement_default_sec: default_engagement_default_sec(),
            ingest_buffer_size: default_ingest_buffer_size(),
            client_send_buffer_size: default_client_send_buffer_size(),
            client_backpressure_timeout_ms: default_client_backpressure_timeout_ms(),
            roi_refresh_interval_ms: default_roi_refresh_interval_ms(),
            alert_quiescence_sec: default_alert_quiescence_sec(),
        }
    }
}

fn default_frame_interval_ms() -> u64 {
    100
}

fn default_track_ttl_ms() -> u64 {
    2000
}

fn default_occupancy_snapshot_interval_ms() -> u64 {
    2000
}

fn default_visit_end_grace_sec() -> u32 {
    3
}

fn default_min_visit_duration_sec() -> u32 {
    1
}

fn default_service_linger_sec() -> u32 {
    30
}

fn default_min_completion_ms() -> u64 {
    2000
}

fn default_dwell_default_sec() -> u32 {
    60
}

fn default_engagement_default_sec() -> u32 {
    120
}

fn default_ingest_buffer_size() -> usize {
    10_000
}

fn default_client_send_buffer_size() -> usize {
    256
}

fn default_client_backpressure_timeout_ms() -> u64 {
    5000
}

fn default_roi_refresh_interval_ms() -> u64 {
    5000
}

fn default_alert_quiescence_sec() -> u32 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval_secs")]
    pub interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval_secs() }
    }
}

fn default_metrics_interval_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize, Default)]
struct TomlConfig {
    #[serde(default)]
    server: ServerConfig,
    #[serde(default)]
    database: DatabaseConfig,
    #[serde(default)]
    mock: MockConfig,
    #[serde(default)]
    mqtt: MqttConfig,
    #[serde(default)]
    broker: BrokerConfig,
    #[serde(default)]
    lidar: Vec<LidarEndpoint>,
    #[serde(default)]
    engine: Option<EngineSettings>,
    #[serde(default)]
    metrics: MetricsConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    port: u16,
    database_path: String,
    mock: MockConfig,
    mqtt: MqttConfig,
    broker: BrokerConfig,
    lidar: Vec<LidarEndpoint>,
    engine: EngineSettings,
    metrics_interval_secs: u64,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            database_path: default_database_path(),
            mock: MockConfig::default(),
            mqtt: MqttConfig::default(),
            broker: BrokerConfig::default(),
            lidar: Vec::new(),
            engine: EngineSettings::default(),
            metrics_interval_secs: default_metrics_interval_secs(),
            config_file: "default".to_string(),
        }
    }
}

impl Config {
    /// Determine config file path from args or environment
    pub fn resolve_config_path(args_config: Option<&str>) -> String {
        if let Some(path) = args_config {
            return path.to_string();
        }
        if let Ok(path) = env::var("CONFIG_FILE") {
            return path;
        }
        "config/dev.toml".to_string()
    }

    /// Load configuration from a TOML file, then apply environment overrides
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        let mut config = Self {
            port: toml_config.server.port,
            database_path: toml_config.database.path,
            mock: toml_config.mock,
            mqtt: toml_config.mqtt,
            broker: toml_config.broker,
            lidar: toml_config.lidar,
            engine: toml_config.engine.unwrap_or_default(),
            metrics_interval_secs: toml_config.metrics.interval_secs,
            config_file: path.display().to_string(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load configuration - tries the TOML file first, falls back to defaults
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Warning: {e:#}. Using defaults.");
                let mut config = Self::default();
                config.apply_env_overrides();
                config
            }
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Some(port) = env_parse::<u16>("PORT") {
            self.port = port;
        }
        if let Ok(path) = env::var("DATABASE_PATH") {
            self.database_path = path;
        }
        if let Some(enabled) = env_bool("MOCK_LIDAR") {
            self.mock.enabled = enabled;
        }
        if let Some(enabled) = env_bool("MQTT_ENABLED") {
            self.mqtt.enabled = enabled;
        }
        if let Some(ms) = env_parse::<u64>("TRACK_TTL_MS") {
            self.engine.track_ttl_ms = ms;
        }
        if let Some(ms) = env_parse::<u64>("FRAME_INTERVAL_MS") {
            self.engine.frame_interval_ms = ms;
        }
        if let Some(ms) = env_parse::<u64>("OCCUPANCY_SNAPSHOT_INTERVAL_MS") {
            self.engine.occupancy_snapshot_interval_ms = ms;
        }
        if let Some(sec) = env_parse::<u32>("SERVICE_LINGER_SEC") {
            self.engine.service_linger_sec = sec;
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn database_path(&self) -> &str {
        &self.database_path
    }

    pub fn mock(&self) -> &MockConfig {
        &self.mock
    }

    pub fn mqtt(&self) -> &MqttConfig {
        &self.mqtt
    }

    pub fn broker(&self) -> &BrokerConfig {
        &self.broker
    }

    pub fn lidar_endpoints(&self) -> &[LidarEndpoint] {
        &self.lidar
    }

    pub fn engine(&self) -> &EngineSettings {
        &self.engine
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_bool(key: &str) -> Option<bool> {
    env::var(key).ok().map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "yes"))
}
