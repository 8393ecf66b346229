//! Replication Protocol
//!
//! Wire messages exchanged between endpoint acceptors and the replicators
//! pulling from them. Messages are bincode-encoded and carried in
//! checksummed, length-prefixed frames.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::event::{ApplicationVersion, DurableEvent, VectorTime};
use crate::filters::ReplicationFilter;

/// What an endpoint publishes to describe itself and the heads of its logs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationEndpointInfo {
    /// Endpoint identifier
    pub endpoint_id: String,
    /// Head sequence number per log name
    pub log_sequence_nrs: HashMap<String, u64>,
}

impl ReplicationEndpointInfo {
    /// Names of the logs the endpoint manages
    pub fn log_names(&self) -> HashSet<String> {
        self.log_sequence_nrs.keys().cloned().collect()
    }

    /// Head sequence number of a named log (0 if unknown)
    pub fn sequence_nr(&self, log_name: &str) -> u64 {
        self.log_sequence_nrs.get(log_name).copied().unwrap_or(0)
    }
}

/// A replication read request against a source log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationRead {
    /// First source sequence number to scan
    pub from_sequence_nr: u64,
    /// Maximum number of events to return
    pub max_events: usize,
    /// Maximum number of source sequence slots to scan
    pub scan_limit: usize,
    /// Filter the target wants applied at the source
    pub filter: ReplicationFilter,
    /// Log id of the requesting target log
    pub target_log_id: String,
    /// The target log's current version, letting the source pre-filter
    /// events the target already covers
    pub target_version: VectorTime,
}

/// Why a replication read was rejected or failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
pub enum ReplicationReadError {
    #[error("remote read timed out after {0} ms")]
    Timeout(u64),

    #[error("incompatible application version: source requires at least {required}, got {supplied}")]
    IncompatibleApplicationVersion {
        required: ApplicationVersion,
        supplied: ApplicationVersion,
    },

    #[error("source endpoint is recovering")]
    SourceRecovering,

    #[error("no source log named {0}")]
    UnknownSourceLog(String),

    #[error("{0}")]
    Failed(String),
}

/// Protocol messages for endpoint communication
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    // ========== Endpoint Info ==========
    /// Ask a peer acceptor for its endpoint info
    GetReplicationEndpointInfo,

    /// Endpoint info reply
    GetReplicationEndpointInfoSuccess { info: ReplicationEndpointInfo },

    // ========== Disaster Recovery ==========
    /// Ask a peer to clamp its replication progress for a recovered
    /// endpoint, carrying the recovered endpoint's info
    SynchronizeReplicationProgress { info: ReplicationEndpointInfo },

    /// Progress synchronisation reply with the peer's own info
    SynchronizeReplicationProgressSuccess { info: ReplicationEndpointInfo },

    /// Progress synchronisation failure
    SynchronizeReplicationProgressFailure { cause: String },

    // ========== Replication Reads ==========
    /// A replication read wrapped with the requesting endpoint's identity,
    /// checked by the source's application compatibility gate
    ReplicationReadEnvelope {
        read: ReplicationRead,
        source_log_name: String,
        application_name: String,
        application_version: ApplicationVersion,
    },

    /// Replication read reply
    ReplicationReadSuccess {
        events: Vec<DurableEvent>,
        from_sequence_nr: u64,
        replication_progress: u64,
        target_log_id: String,
        current_source_version: VectorTime,
    },

    /// Replication read failure
    ReplicationReadFailure {
        cause: ReplicationReadError,
        target_log_id: String,
    },
}

impl Message {
    /// Serialize message to bytes
    pub fn serialize(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize message from bytes
    pub fn deserialize(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// Get the message type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::GetReplicationEndpointInfo => "GetReplicationEndpointInfo",
            Message::GetReplicationEndpointInfoSuccess { .. } => "GetReplicationEndpointInfoSuccess",
            Message::SynchronizeReplicationProgress { .. } => "SynchronizeReplicationProgress",
            Message::SynchronizeReplicationProgressSuccess { .. } => {
                "SynchronizeReplicationProgressSuccess"
            }
            Message::SynchronizeReplicationProgressFailure { .. } => {
                "SynchronizeReplicationProgressFailure"
            }
            Message::ReplicationReadEnvelope { .. } => "ReplicationReadEnvelope",
            Message::ReplicationReadSuccess { .. } => "ReplicationReadSuccess",
            Message::ReplicationReadFailure { .. } => "ReplicationReadFailure",
        }
    }
}

/// Frame header for length-prefixed messages
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    /// Message length
    pub length: u32,
    /// Message checksum
    pub checksum: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    /// Create a header for the given message body
    pub fn new(data: &[u8]) -> Self {
        Self {
            length: data.len() as u32,
            checksum: crc32fast::hash(data),
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    /// Deserialize header from bytes
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        Self {
            length: u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            checksum: u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
        }
    }

    /// Check a received frame body against the header's checksum
    pub fn verify(&self, frame: &[u8]) -> crate::Result<()> {
        let actual = crc32fast::hash(frame);
        if actual != self.checksum {
            return Err(crate::Error::Network(format!(
                "corrupt frame: crc {actual:08x} does not match header crc {:08x}",
                self.checksum
            )));
        }
        Ok(())
    }
}
