//! Event Log Contract
//!
//! The durable event log is an external collaborator of the replication
//! core. This module pins down the operations the core relies on; the
//! bundled [`MemoryEventLog`] implements them in memory.

mod memory;

pub use memory::MemoryEventLog;

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;

use crate::error::Result;
use crate::event::{DurableEvent, Snapshot, VectorTime};
use crate::filters::ReplicationFilter;

/// Result of a replication read against a source log
#[derive(Debug, Clone)]
pub struct ReplicationReadResult {
    /// Events passing the filter and the causality pre-check, in sequence
    /// order
    pub events: Vec<DurableEvent>,
    /// Sequence number the scan started at
    pub from_sequence_nr: u64,
    /// Last source sequence slot covered by the scan, even if fewer events
    /// matched
    pub replication_progress: u64,
}

/// Result of a replication write against a target log
#[derive(Debug, Clone)]
pub struct ReplicationWriteResult {
    /// Events actually applied (duplicates are suppressed)
    pub events_written: usize,
    /// Stored replication progress for the source log after the write
    pub stored_progress: u64,
    /// The log's vector time after the write
    pub version_vector: VectorTime,
}

/// Operations a local event log offers to the replication core. The store
/// serialises its own operations; callers never share mutable state with it.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// The log id, `f(endpoint_id, log_name)`
    fn id(&self) -> &str;

    /// Current head sequence number
    async fn sequence_nr(&self) -> u64;

    /// Current aggregate vector time
    async fn current_version(&self) -> VectorTime;

    /// Last source sequence number whose events have been durably written
    /// from the given source log (0 if none)
    async fn replication_progress(&self, source_log_id: &str) -> Result<u64>;

    /// All stored replication progresses by source log id
    async fn replication_progresses(&self) -> Result<HashMap<String, u64>>;

    /// Read events for replication into a target log. Scans at most
    /// `scan_limit` sequence slots starting at `from_sequence_nr`, returns at
    /// most `max_events` events passing `filter`, and pre-filters events
    /// whose vector time is covered by `exclude`.
    async fn read_replication(
        &self,
        from_sequence_nr: u64,
        max_events: usize,
        scan_limit: usize,
        filter: &ReplicationFilter,
        exclude: &VectorTime,
    ) -> Result<ReplicationReadResult>;

    /// Write replicated events. Events whose vector time is covered by the
    /// log's current version are discarded; the stored progress for
    /// `source_log_id` is raised to `replication_progress` (never lowered).
    async fn write_replicated(
        &self,
        events: Vec<DurableEvent>,
        replication_progress: u64,
        source_log_id: &str,
    ) -> Result<ReplicationWriteResult>;

    /// Append locally emitted events, returning the new head sequence number
    async fn append(&self, payloads: Vec<Vec<u8>>, emitter_id: &str) -> Result<u64>;

    /// Plain read of stored events starting at `from_sequence_nr`
    async fn read(&self, from_sequence_nr: u64, max_events: usize) -> Result<Vec<DurableEvent>>;

    /// Logically delete events up to `to_sequence_nr`, remembering the
    /// remote logs that must still replicate them before physical deletion.
    /// Returns the effective deletion watermark.
    async fn delete(&self, to_sequence_nr: u64, remote_log_ids: HashSet<String>) -> Result<u64>;

    /// Current logical deletion watermark
    async fn deletion_watermark(&self) -> u64;

    /// Clamp the stored progress for a source log down to `to`. Used by
    /// recovery when the source endpoint has lost events beyond `to`.
    async fn synchronize_progress(&self, source_log_id: &str, to: u64) -> Result<()>;

    /// Raise the head sequence number to the log's own vector time entry if
    /// it fell behind. Returns the resulting sequence number.
    async fn adjust_clock(&self) -> Result<u64>;

    /// Store a snapshot for its emitter, replacing any previous one
    async fn save_snapshot(&self, snapshot: Snapshot) -> Result<()>;

    /// Load the stored snapshot for an emitter
    async fn load_snapshot(&self, emitter_id: &str) -> Result<Option<Snapshot>>;

    /// Delete snapshots whose covered vector time is not dominated by the
    /// log's current version. Returns the number of snapshots removed.
    async fn delete_invalid_snapshots(&self) -> Result<usize>;
}
