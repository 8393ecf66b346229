//! Replication Machinery
//!
//! Per-link replicators, per-connection bootstrap and availability
//! detection. A replication link is directed: its replicator pulls events
//! from a remote source log into a local target log.

pub(crate) mod connector;
pub(crate) mod detector;
pub(crate) mod replicator;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::filters::ReplicationFilter;
use crate::log::EventLog;

/// Timing and batching settings shared by the replication machinery
#[derive(Debug, Clone)]
pub struct ReplicationSettings {
    /// Maximum events per read/write batch
    pub write_batch_size: usize,
    /// Timeout for local log writes
    pub write_timeout: Duration,
    /// Timeout for local log reads
    pub read_timeout: Duration,
    /// Timeout for remote reads
    pub remote_read_timeout: Duration,
    /// Maximum source-side sequence slots scanned per read
    pub remote_scan_limit: usize,
    /// Universal retry spacing
    pub retry_delay: Duration,
    /// Failure detection window
    pub failure_detection_limit: Duration,
    /// Disaster recovery settings
    pub recovery: RecoverySettings,
}

/// Disaster recovery settings
#[derive(Debug, Clone)]
pub struct RecoverySettings {
    /// How often a failed remote recovery operation is retried
    pub remote_operation_retry_max: usize,
    /// Delay between retries
    pub remote_operation_retry_delay: Duration,
    /// Timeout for a single remote recovery operation
    pub remote_operation_timeout: Duration,
}

impl Default for ReplicationSettings {
    fn default() -> Self {
        Self {
            write_batch_size: 100,
            write_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(10),
            remote_read_timeout: Duration::from_secs(10),
            remote_scan_limit: 10_000,
            retry_delay: Duration::from_secs(5),
            failure_detection_limit: Duration::from_secs(60),
            recovery: RecoverySettings::default(),
        }
    }
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            remote_operation_retry_max: 3,
            remote_operation_retry_delay: Duration::from_secs(10),
            remote_operation_timeout: Duration::from_secs(10),
        }
    }
}

/// Symbolic address of a peer endpoint's acceptor
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerAddress {
    /// Peer system name
    pub name: String,
    /// Peer host
    pub host: String,
    /// Peer port
    pub port: u16,
}

impl PeerAddress {
    /// The socket address the transport dials
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "driftlog://{}@{}:{}/acceptor",
            self.name, self.host, self.port
        )
    }
}

/// A replication connection to a remote endpoint, optionally filtering the
/// events pulled per log.
#[derive(Debug, Clone)]
pub struct ReplicationConnection {
    /// Remote host
    pub host: String,
    /// Remote port
    pub port: u16,
    /// Remote system name
    pub name: String,
    /// Filters applied to pulled events, keyed by log name
    pub filters: HashMap<String, ReplicationFilter>,
}

impl ReplicationConnection {
    /// Create a connection to the given host and port
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            name: "default".to_string(),
            filters: HashMap::new(),
        }
    }

    /// Parse a connection from a `"host:port"` string
    pub fn parse(address: &str) -> crate::Result<Self> {
        let (host, port) = crate::config::parse_address(address)?;
        Ok(Self::new(&host, port))
    }

    /// Set the remote system name
    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Add a filter for events pulled from the named log
    pub fn with_filter(mut self, log_name: &str, filter: ReplicationFilter) -> Self {
        self.filters.insert(log_name.to_string(), filter);
        self
    }

    /// The peer acceptor's address
    pub fn address(&self) -> PeerAddress {
        PeerAddress {
            name: self.name.clone(),
            host: self.host.clone(),
            port: self.port,
        }
    }

    /// Whether this connection carries a non-trivial filter for the named
    /// log
    pub fn is_filtered(&self, log_name: &str) -> bool {
        self.filters
            .get(log_name)
            .map(|f| !f.is_trivial())
            .unwrap_or(false)
    }
}

/// The remote end of a replication link
#[derive(Clone)]
pub struct ReplicationSource {
    /// Remote endpoint id
    pub endpoint_id: String,
    /// Source log name
    pub log_name: String,
    /// Source log id
    pub log_id: String,
    /// Remote acceptor address
    pub address: PeerAddress,
}

/// The local end of a replication link
#[derive(Clone)]
pub struct ReplicationTarget {
    /// Local endpoint id
    pub endpoint_id: String,
    /// Target log name
    pub log_name: String,
    /// Target log id
    pub log_id: String,
    /// Handle to the local log
    pub log: Arc<dyn EventLog>,
}

/// A directed replication link from a remote source log to a local target
/// log
#[derive(Clone)]
pub struct ReplicationLink {
    pub source: ReplicationSource,
    pub target: ReplicationTarget,
}

impl fmt::Debug for ReplicationLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.source.log_id, self.target.log_id)
    }
}

/// A replication link annotated with the heads captured when disaster
/// recovery started
#[derive(Clone)]
pub struct RecoveryLink {
    /// The link to recover
    pub link: ReplicationLink,
    /// Source log head at recovery time
    pub remote_sequence_nr: u64,
    /// Target log head at recovery time
    pub local_sequence_nr: u64,
}

/// Tracks spawned background tasks so the endpoint can cancel them on
/// termination, together with any pending scheduled retries.
#[derive(Default)]
pub(crate) struct TaskSet {
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskSet {
    pub(crate) async fn track(&self, task: JoinHandle<()>) {
        self.tasks.lock().await.push(task);
    }

    pub(crate) async fn abort_all(&self) {
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_address_format() {
        let connection = ReplicationConnection::new("10.0.0.1", 7660).with_name("orders");
        let address = connection.address();

        assert_eq!(address.socket_addr(), "10.0.0.1:7660");
        assert_eq!(address.to_string(), "driftlog://orders@10.0.0.1:7660/acceptor");
    }

    #[test]
    fn test_connection_filter_detection() {
        let connection = ReplicationConnection::new("localhost", 7660)
            .with_filter("X", ReplicationFilter::Emitter("a".into()))
            .with_filter("Y", ReplicationFilter::NoFilter);

        assert!(connection.is_filtered("X"));
        assert!(!connection.is_filtered("Y"));
        assert!(!connection.is_filtered("Z"));
    }

    #[test]
    fn test_connection_parse() {
        let connection = ReplicationConnection::parse("127.0.0.1:7661").unwrap();
        assert_eq!(connection.host, "127.0.0.1");
        assert_eq!(connection.port, 7661);
        assert!(ReplicationConnection::parse("nonsense").is_err());
    }
}
