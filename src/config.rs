//! Sensor node settings, read from the environment

use anyhow::{bail, Context, Result};
use std::time::Duration;

pub const DEVICE_ID_VAR: &str = "NODE_DEVICE_ID";
pub const IP_VAR: &str = "NODE_IP";
pub const SERVER_VAR: &str = "NODE_SERVER";
pub const INTERVAL_VAR: &str = "NODE_INTERVAL_SECS";
pub const SEED_VAR: &str = "NODE_SEED";

/// Configuration for one emulated sensor
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Value sent in the `Device` field
    pub device_id: String,
    /// Value sent in the `IP` field
    pub ip: String,
    /// Ingestion server address
    pub server: String,
    /// Time between readings
    pub interval: Duration,
    /// Pause between the greeting and the payload
    pub settle_delay: Duration,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Bound on waiting for the greeting and for the server to close
    pub response_timeout: Duration,
    /// Backoff after the first failed exchange
    pub reconnect_delay: Duration,
    /// Maximum backoff
    pub max_reconnect_delay: Duration,
    /// Fixed seed for the measurement generator; random when unset
    pub seed: Option<u64>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            device_id: "ESP32-Sensor1".into(),
            ip: "192.168.1.100".into(),
            server: format!("127.0.0.1:{}", airsense_shared::protocol::DEFAULT_PORT),
            interval: Duration::from_secs(30),
            settle_delay: Duration::from_millis(2500),
            connect_timeout: Duration::from_secs(5),
            response_timeout: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(60),
            seed: None,
        }
    }
}

impl NodeConfig {
    /// Read settings from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through `lookup`, falling back to defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(device_id) = lookup(DEVICE_ID_VAR) {
            if device_id.trim().is_empty() {
                bail!("{} must not be empty", DEVICE_ID_VAR);
            }
            config.device_id = device_id;
        }
        if let Some(ip) = lookup(IP_VAR) {
            config.ip = ip;
        }
        if let Some(server) = lookup(SERVER_VAR) {
            config.server = server;
        }
        if let Some(secs) = lookup(INTERVAL_VAR) {
            let secs: u64 = secs.trim().parse().with_context(|| {
                format!("{} must be whole seconds, got {:?}", INTERVAL_VAR, secs)
            })?;
            if secs == 0 {
                bail!("{} must be at least 1", INTERVAL_VAR);
            }
            config.interval = Duration::from_secs(secs);
        }
        if let Some(seed) = lookup(SEED_VAR) {
            let seed: u64 = seed
                .trim()
                .parse()
                .with_context(|| format!("{} must be an unsigned integer", SEED_VAR))?;
            config.seed = Some(seed);
        }

        Ok(config)
    }
}
