//! Driftlog Configuration
//!
//! Configuration structures for a replication endpoint, loaded from TOML.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::event::ApplicationVersion;
use crate::replication::{RecoverySettings, ReplicationSettings};

/// Main driftlog configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftlogConfig {
    /// Endpoint identity and peering
    pub endpoint: EndpointConfig,

    /// Event log and replication tuning
    #[serde(default)]
    pub log: LogConfig,
}

/// Endpoint identity and peering configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Globally unique endpoint identifier. Must not contain `_`, which is
    /// reserved as the log-id separator.
    pub id: String,

    /// Address the acceptor binds for peer traffic
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Remote endpoint addresses as `"host:port"` strings
    #[serde(default)]
    pub connections: Vec<String>,

    /// Application identity used by the replication compatibility gate
    #[serde(default)]
    pub application: ApplicationConfig,
}

/// Application identity configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_application_name")]
    pub name: String,

    /// Application version, e.g. `"2.1"`
    #[serde(default)]
    pub version: ApplicationVersion,
}

/// Event log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Maximum number of events per replication read/write batch
    #[serde(default = "default_write_batch_size")]
    pub write_batch_size: usize,

    /// Timeout for local log writes in milliseconds
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,

    /// Timeout for local log reads in milliseconds
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Replication timing configuration
    #[serde(default)]
    pub replication: ReplicationConfig,

    /// Disaster recovery configuration
    #[serde(default)]
    pub recovery: RecoveryConfig,
}

/// Replication timing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Timeout for remote reads in milliseconds
    #[serde(default = "default_remote_read_timeout_ms")]
    pub remote_read_timeout_ms: u64,

    /// Maximum number of source-side sequence slots scanned per read
    #[serde(default = "default_remote_scan_limit")]
    pub remote_scan_limit: usize,

    /// Universal retry spacing in milliseconds
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Failure detection window in milliseconds. Must be at least
    /// `remote_read_timeout_ms + retry_delay_ms` so a single request cycle
    /// cannot trip the detector.
    #[serde(default = "default_failure_detection_limit_ms")]
    pub failure_detection_limit_ms: u64,
}

/// Disaster recovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// How often a failed remote recovery operation is retried
    #[serde(default = "default_remote_operation_retry_max")]
    pub remote_operation_retry_max: usize,

    /// Delay between remote recovery operation retries in milliseconds
    #[serde(default = "default_remote_operation_retry_delay_ms")]
    pub remote_operation_retry_delay_ms: u64,

    /// Timeout for a single remote recovery operation in milliseconds
    #[serde(default = "default_remote_operation_timeout_ms")]
    pub remote_operation_timeout_ms: u64,
}

fn default_bind_address() -> String {
    "0.0.0.0:7660".to_string()
}

fn default_application_name() -> String {
    "default".to_string()
}

fn default_write_batch_size() -> usize {
    100
}

fn default_write_timeout_ms() -> u64 {
    10_000
}

fn default_read_timeout_ms() -> u64 {
    10_000
}

fn default_remote_read_timeout_ms() -> u64 {
    10_000
}

fn default_remote_scan_limit() -> usize {
    10_000
}

fn default_retry_delay_ms() -> u64 {
    5_000
}

fn default_failure_detection_limit_ms() -> u64 {
    60_000
}

fn default_remote_operation_retry_max() -> usize {
    3
}

fn default_remote_operation_retry_delay_ms() -> u64 {
    10_000
}

fn default_remote_operation_timeout_ms() -> u64 {
    10_000
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_application_name(),
            version: ApplicationVersion::default(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            write_batch_size: default_write_batch_size(),
            write_timeout_ms: default_write_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            replication: ReplicationConfig::default(),
            recovery: RecoveryConfig::default(),
        }
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            remote_read_timeout_ms: default_remote_read_timeout_ms(),
            remote_scan_limit: default_remote_scan_limit(),
            retry_delay_ms: default_retry_delay_ms(),
            failure_detection_limit_ms: default_failure_detection_limit_ms(),
        }
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            remote_operation_retry_max: default_remote_operation_retry_max(),
            remote_operation_retry_delay_ms: default_remote_operation_retry_delay_ms(),
            remote_operation_timeout_ms: default_remote_operation_timeout_ms(),
        }
    }
}

impl DriftlogConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: DriftlogConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.endpoint.id.is_empty() {
            return Err(crate::Error::Config("endpoint.id cannot be empty".into()));
        }

        if self.endpoint.id.contains('_') {
            return Err(crate::Error::Config(format!(
                "endpoint.id {:?} must not contain '_'",
                self.endpoint.id
            )));
        }

        for connection in &self.endpoint.connections {
            parse_address(connection)?;
        }

        if self.log.write_batch_size == 0 {
            return Err(crate::Error::Config(
                "log.write_batch_size must be at least 1".into(),
            ));
        }

        if self.log.replication.remote_scan_limit == 0 {
            return Err(crate::Error::Config(
                "log.replication.remote_scan_limit must be at least 1".into(),
            ));
        }

        let replication = &self.log.replication;
        if replication.failure_detection_limit_ms
            < replication.remote_read_timeout_ms + replication.retry_delay_ms
        {
            return Err(crate::Error::Config(
                "log.replication.failure_detection_limit_ms must be at least \
                 remote_read_timeout_ms + retry_delay_ms"
                    .into(),
            ));
        }

        Ok(())
    }

    /// Get write timeout as Duration
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.log.write_timeout_ms)
    }

    /// Get read timeout as Duration
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.log.read_timeout_ms)
    }

    /// Get retry delay as Duration
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.log.replication.retry_delay_ms)
    }

    /// Collect all replication timing values
    pub fn replication_settings(&self) -> ReplicationSettings {
        ReplicationSettings {
            write_batch_size: self.log.write_batch_size,
            write_timeout: self.write_timeout(),
            read_timeout: self.read_timeout(),
            remote_read_timeout: Duration::from_millis(self.log.replication.remote_read_timeout_ms),
            remote_scan_limit: self.log.replication.remote_scan_limit,
            retry_delay: self.retry_delay(),
            failure_detection_limit: Duration::from_millis(
                self.log.replication.failure_detection_limit_ms,
            ),
            recovery: RecoverySettings {
                remote_operation_retry_max: self.log.recovery.remote_operation_retry_max,
                remote_operation_retry_delay: Duration::from_millis(
                    self.log.recovery.remote_operation_retry_delay_ms,
                ),
                remote_operation_timeout: Duration::from_millis(
                    self.log.recovery.remote_operation_timeout_ms,
                ),
            },
        }
    }
}

/// Parse a `"host:port"` connection address
pub(crate) fn parse_address(address: &str) -> crate::Result<(String, u16)> {
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| crate::Error::Config(format!("invalid connection address: {address}")))?;

    if host.is_empty() {
        return Err(crate::Error::Config(format!(
            "invalid connection address: {address}"
        )));
    }

    let port = port
        .parse::<u16>()
        .map_err(|_| crate::Error::Config(format!("invalid connection port: {address}")))?;

    Ok((host.to_string(), port))
}
