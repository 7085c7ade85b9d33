use crate::batch::SchedulerSettings;
use crate::transport::PoolSettings;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    /// Relay server host
    pub host: String,

    /// Relay server port
    pub port: u16,

    /// Connections kept open even when idle
    pub min_connections: usize,

    /// Hard ceiling on pooled connections
    pub max_connections: usize,

    pub connection_max_lifetime_seconds: u64,

    pub connection_max_idle_seconds: u64,

    /// Attempts per connection before giving up
    pub retry_limit: u32,

    /// Fixed delay between connection attempts
    pub retry_delay_ms: u64,

    /// How often the pool evicts and replenishes
    pub maintenance_interval_seconds: u64,

    /// Buffered operations that trigger an immediate flush
    pub max_batch_size: usize,

    pub flush_interval_seconds: f64,

    /// Serialized batches larger than this are marked compressed
    pub compression_threshold_bytes: usize,

    /// Default deadline for correlated sends and IPC round trips
    pub request_timeout_seconds: f64,

    /// Protocol version spoken by this deployment
    pub api_version: String,

    /// Write debug logs to a file
    pub debug: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug_log_path: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug_log_rotation: Option<DebugLogRotation>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug_log_keep: Option<usize>,

    /// Per-tool overlay: `[tools.<name>]`
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub tools: BTreeMap<String, ToolSettings>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9876,
            min_connections: 1,
            max_connections: 10,
            connection_max_lifetime_seconds: 3600,
            connection_max_idle_seconds: 300,
            retry_limit: 3,
            retry_delay_ms: 500,
            maintenance_interval_seconds: 60,
            max_batch_size: 100,
            flush_interval_seconds: 1.0,
            compression_threshold_bytes: 1024,
            request_timeout_seconds: 30.0,
            api_version: crate::protocol::API_VERSION.to_string(),
            debug: false,
            debug_log_path: None,
            debug_log_rotation: None,
            debug_log_keep: None,
            tools: BTreeMap::new(),
        }
    }
}

/// Deployment overlay for a single tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSettings {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Parameter defaults merged into requests that omit them
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub parameters: HashMap<String, serde_json::Value>,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            parameters: HashMap::new(),
        }
    }
}

fn default_enabled() -> bool {
    true
}

/// Debug log file rotation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DebugLogRotation {
    None,
    Daily,
    Session,
}

fn seconds(value: f64, fallback: Duration) -> Duration {
    Duration::try_from_secs_f64(value)
        .ok()
        .filter(|d| !d.is_zero())
        .unwrap_or(fallback)
}

impl Config {
    /// `host:port` of the relay server
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn request_timeout(&self) -> Duration {
        seconds(self.request_timeout_seconds, Duration::from_secs(30))
    }

    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            min_size: self.min_connections,
            max_size: self.max_connections,
            max_lifetime: Duration::from_secs(self.connection_max_lifetime_seconds),
            max_idle: Duration::from_secs(self.connection_max_idle_seconds),
            retry_limit: self.retry_limit,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            maintenance_interval: Duration::from_secs(self.maintenance_interval_seconds.max(1)),
            acquire_timeout: self.request_timeout(),
            api_version: self.api_version.clone(),
        }
    }

    pub fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            max_batch_size: self.max_batch_size,
            flush_interval: seconds(self.flush_interval_seconds, Duration::from_secs(1)),
            compression_threshold: self.compression_threshold_bytes,
        }
    }

    /// Reject combinations the pool and scheduler cannot honour
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_connections == 0 {
            anyhow::bail!("maxConnections must be at least 1");
        }
        if self.min_connections > self.max_connections {
            anyhow::bail!(
                "minConnections ({}) exceeds maxConnections ({})",
                self.min_connections,
                self.max_connections
            );
        }
        if self.max_batch_size == 0 {
            anyhow::bail!("maxBatchSize must be at least 1");
        }
        if !(self.request_timeout_seconds > 0.0) {
            anyhow::bail!("requestTimeoutSeconds must be positive");
        }
        if !(self.flush_interval_seconds > 0.0) {
            anyhow::bail!("flushIntervalSeconds must be positive");
        }
        Ok(())
    }

    /// Apply `HOSTLINK_*` environment overrides
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    pub(crate) fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(host) = lookup("HOSTLINK_HOST") {
            self.host = host;
        }

        if let Some(port) = lookup("HOSTLINK_PORT") {
            match port.parse::<u16>() {
                Ok(port) => self.port = port,
                Err(_) => tracing::warn!(value = %port, "ignoring invalid HOSTLINK_PORT"),
            }
        }

        if let Some(timeout) = lookup("HOSTLINK_REQUEST_TIMEOUT_SECONDS") {
            match timeout.parse::<f64>() {
                Ok(secs) if secs > 0.0 => self.request_timeout_seconds = secs,
                _ => tracing::warn!(
                    value = %timeout,
                    "ignoring invalid HOSTLINK_REQUEST_TIMEOUT_SECONDS"
                ),
            }
        }
    }
}
