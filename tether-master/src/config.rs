//! Master configuration
//!
//! Listen addresses, storage location and the timing knobs for node expiry,
//! dispatch retries and live status queries.

use std::path::PathBuf;
use std::time::Duration;

/// Master configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP API bind address
    pub http_addr: String,

    /// Bind address workers connect their streams to
    pub transport_addr: String,

    /// Root of the job store
    pub data_dir: PathBuf,

    /// A node silent for longer than this is evicted
    pub node_timeout: Duration,

    /// How often the registry is scanned for silent nodes
    pub health_check_interval: Duration,

    /// Attempts at finding a live node before dispatch fails
    pub dispatch_retries: u32,

    /// Pause between dispatch attempts
    pub dispatch_retry_delay: Duration,

    /// Ceiling on redispatches of one execution after send failures
    pub max_redispatch: u32,

    /// How long to wait for a worker to answer a status query
    pub status_query_timeout: Duration,
}

impl Config {
    /// Creates a new configuration with defaults
    pub fn new(http_addr: String, transport_addr: String, data_dir: PathBuf) -> Self {
        Self {
            http_addr,
            transport_addr,
            data_dir,
            node_timeout: Duration::from_secs(180),
            health_check_interval: Duration::from_secs(60),
            dispatch_retries: 3,
            dispatch_retry_delay: Duration::from_secs(3),
            max_redispatch: 3,
            status_query_timeout: Duration::from_secs(10),
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Expected environment variables (all optional):
    /// - MASTER_HTTP_ADDR (default: 0.0.0.0:8080)
    /// - MASTER_TRANSPORT_ADDR (default: 0.0.0.0:7070)
    /// - TETHER_DATA_DIR (default: ./data/master)
    /// - NODE_TIMEOUT (seconds, default: 180)
    /// - HEALTH_CHECK_INTERVAL (seconds, default: 60)
    /// - DISPATCH_RETRIES (default: 3)
    /// - DISPATCH_RETRY_DELAY (seconds, default: 3)
    /// - MAX_REDISPATCH (default: 3)
    /// - STATUS_QUERY_TIMEOUT (seconds, default: 10)
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let http_addr = std::env::var("MASTER_HTTP_ADDR").unwrap_or(defaults.http_addr);
        let transport_addr =
            std::env::var("MASTER_TRANSPORT_ADDR").unwrap_or(defaults.transport_addr);
        let data_dir = std::env::var("TETHER_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir);

        Ok(Self {
            http_addr,
            transport_addr,
            data_dir,
            node_timeout: env_secs("NODE_TIMEOUT").unwrap_or(defaults.node_timeout),
            health_check_interval: env_secs("HEALTH_CHECK_INTERVAL")
                .unwrap_or(defaults.health_check_interval),
            dispatch_retries: env_parse("DISPATCH_RETRIES").unwrap_or(defaults.dispatch_retries),
            dispatch_retry_delay: env_secs("DISPATCH_RETRY_DELAY")
                .unwrap_or(defaults.dispatch_retry_delay),
            max_redispatch: env_parse("MAX_REDISPATCH").unwrap_or(defaults.max_redispatch),
            status_query_timeout: env_secs("STATUS_QUERY_TIMEOUT")
                .unwrap_or(defaults.status_query_timeout),
        })
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.http_addr.is_empty() {
            anyhow::bail!("http_addr cannot be empty");
        }

        if self.transport_addr.is_empty() {
            anyhow::bail!("transport_addr cannot be empty");
        }

        if self.http_addr == self.transport_addr {
            anyhow::bail!("http_addr and transport_addr must differ");
        }

        if self.node_timeout.is_zero() {
            anyhow::bail!("node_timeout must be greater than 0");
        }

        if self.health_check_interval.is_zero() {
            anyhow::bail!("health_check_interval must be greater than 0");
        }

        if self.dispatch_retries == 0 {
            anyhow::bail!("dispatch_retries must be greater than 0");
        }

        if self.status_query_timeout.is_zero() {
            anyhow::bail!("status_query_timeout must be greater than 0");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(
            "0.0.0.0:8080".to_string(),
            "0.0.0.0:7070".to_string(),
            PathBuf::from("./data/master"),
        )
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse::<T>().ok())
}

fn env_secs(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.node_timeout, Duration::from_secs(180));
        assert_eq!(config.dispatch_retries, 3);
        assert_eq!(config.max_redispatch, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();

        config.transport_addr = config.http_addr.clone();
        assert!(config.validate().is_err());
        config.transport_addr = "0.0.0.0:7070".to_string();

        config.node_timeout = Duration::ZERO;
        assert!(config.validate().is_err());
        config.node_timeout = Duration::from_secs(180);

        config.dispatch_retries = 0;
        assert!(config.validate().is_err());
        config.dispatch_retries = 1;

        assert!(config.validate().is_ok());
    }
}
