//! Worker configuration
//!
//! Defines the worker's identity, where the master listens, and the
//! intervals driving heartbeats, log streaming, snapshots and the step
//! timeout watchdog.

use std::path::PathBuf;
use std::time::Duration;

/// Worker configuration
///
/// All timeouts and intervals are configurable to allow tuning
/// for different deployment scenarios (dev vs prod, fast vs slow networks).
#[derive(Debug, Clone)]
pub struct Config {
    /// Logical node name, half of the node key
    pub name: String,

    /// Address this node reports to the master, the other half of the key
    pub address: String,

    /// Master transport address (e.g., "127.0.0.1:7070")
    pub master_addr: String,

    /// Root of the local job store and workspaces
    pub data_dir: PathBuf,

    /// How often to send a heartbeat
    pub heartbeat_interval: Duration,

    /// How often to stream new output to the master
    pub log_send_interval: Duration,

    /// How often live durations are refreshed and persisted
    pub snapshot_interval: Duration,

    /// Maximum time a single step may run
    pub step_timeout: Duration,

    /// How often running steps are checked against `step_timeout`
    pub watchdog_interval: Duration,
}

impl Config {
    /// Creates a new configuration with defaults
    pub fn new(name: String, master_addr: String) -> Self {
        Self {
            name,
            address: "127.0.0.1".to_string(),
            master_addr,
            data_dir: PathBuf::from("./data/worker"),
            heartbeat_interval: Duration::from_secs(30),
            log_send_interval: Duration::from_millis(500),
            snapshot_interval: Duration::from_secs(2),
            step_timeout: Duration::from_secs(30 * 60),
            watchdog_interval: Duration::from_secs(60),
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Expected environment variables:
    /// - MASTER_ADDR (required)
    /// - WORKER_NAME (optional, default: random uuid)
    /// - WORKER_ADDRESS (optional, default: 127.0.0.1)
    /// - TETHER_DATA_DIR (optional, default: ./data/worker)
    /// - HEARTBEAT_INTERVAL (optional, seconds, default: 30)
    /// - LOG_SEND_INTERVAL (optional, milliseconds, default: 500)
    /// - SNAPSHOT_INTERVAL (optional, seconds, default: 2)
    /// - STEP_TIMEOUT (optional, seconds, default: 1800)
    /// - WATCHDOG_INTERVAL (optional, seconds, default: 60)
    pub fn from_env() -> anyhow::Result<Self> {
        let master_addr = std::env::var("MASTER_ADDR")
            .map_err(|_| anyhow::anyhow!("MASTER_ADDR environment variable not set"))?;

        let name =
            std::env::var("WORKER_NAME").unwrap_or_else(|_| uuid::Uuid::new_v4().to_string());

        let mut config = Self::new(name, master_addr);

        if let Ok(address) = std::env::var("WORKER_ADDRESS") {
            config.address = address;
        }
        if let Ok(data_dir) = std::env::var("TETHER_DATA_DIR") {
            config.data_dir = PathBuf::from(data_dir);
        }

        config.heartbeat_interval = env_duration("HEARTBEAT_INTERVAL", Duration::from_secs)
            .unwrap_or(config.heartbeat_interval);
        config.log_send_interval = env_duration("LOG_SEND_INTERVAL", Duration::from_millis)
            .unwrap_or(config.log_send_interval);
        config.snapshot_interval = env_duration("SNAPSHOT_INTERVAL", Duration::from_secs)
            .unwrap_or(config.snapshot_interval);
        config.step_timeout =
            env_duration("STEP_TIMEOUT", Duration::from_secs).unwrap_or(config.step_timeout);
        config.watchdog_interval = env_duration("WATCHDOG_INTERVAL", Duration::from_secs)
            .unwrap_or(config.watchdog_interval);

        Ok(config)
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.name.is_empty() {
            anyhow::bail!("name cannot be empty");
        }

        if self.name.contains('@') {
            anyhow::bail!("name cannot contain '@'");
        }

        if self.address.is_empty() {
            anyhow::bail!("address cannot be empty");
        }

        if self.master_addr.is_empty() {
            anyhow::bail!("master_addr cannot be empty");
        }

        if self.heartbeat_interval.is_zero() {
            anyhow::bail!("heartbeat_interval must be greater than 0");
        }

        if self.log_send_interval.is_zero() {
            anyhow::bail!("log_send_interval must be greater than 0");
        }

        if self.snapshot_interval.is_zero() {
            anyhow::bail!("snapshot_interval must be greater than 0");
        }

        if self.step_timeout.is_zero() {
            anyhow::bail!("step_timeout must be greater than 0");
        }

        if self.watchdog_interval.is_zero() {
            anyhow::bail!("watchdog_interval must be greater than 0");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(
            uuid::Uuid::new_v4().to_string(),
            "127.0.0.1:7070".to_string(),
        )
    }
}

fn env_duration(key: &str, unit: fn(u64) -> Duration) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(unit)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.log_send_interval, Duration::from_millis(500));
        assert_eq!(config.step_timeout, Duration::from_secs(1800));
        assert_eq!(config.watchdog_interval, Duration::from_secs(60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();

        // Valid config should pass
        assert!(config.validate().is_ok());

        // Empty name should fail
        config.name = String::new();
        assert!(config.validate().is_err());

        // Names are half of `name@address`
        config.name = "w1@host".to_string();
        assert!(config.validate().is_err());

        config.name = "w1".to_string();
        config.step_timeout = Duration::ZERO;
        assert!(config.validate().is_err());

        config.step_timeout = Duration::from_secs(60);
        assert!(config.validate().is_ok());
    }
}
