//! In-Memory Event Log
//!
//! Reference implementation of the event log contract. Events are held in an
//! append-only vector; sequence numbers start at 1 and deletion is logical,
//! so positions never shift.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{EventLog, ReplicationReadResult, ReplicationWriteResult};
use crate::error::Result;
use crate::event::{DurableEvent, Snapshot, VectorTime};
use crate::filters::ReplicationFilter;

struct LogState {
    events: Vec<DurableEvent>,
    sequence_nr: u64,
    version: VectorTime,
    progresses: HashMap<String, u64>,
    deletion_watermark: u64,
    deletion_remote_log_ids: HashSet<String>,
    snapshots: HashMap<String, Snapshot>,
}

/// In-memory event log
pub struct MemoryEventLog {
    id: String,
    endpoint_id: String,
    state: RwLock<LogState>,
}

impl MemoryEventLog {
    /// Create an empty log owned by the given endpoint
    pub fn new(id: String, endpoint_id: String) -> Self {
        Self {
            id,
            endpoint_id,
            state: RwLock::new(LogState {
                events: Vec::new(),
                sequence_nr: 0,
                version: VectorTime::new(),
                progresses: HashMap::new(),
                deletion_watermark: 0,
                deletion_remote_log_ids: HashSet::new(),
                snapshots: HashMap::new(),
            }),
        }
    }
}

#[async_trait]
impl EventLog for MemoryEventLog {
    fn id(&self) -> &str {
        &self.id
    }

    async fn sequence_nr(&self) -> u64 {
        self.state.read().await.sequence_nr
    }

    async fn current_version(&self) -> VectorTime {
        self.state.read().await.version.clone()
    }

    async fn replication_progress(&self, source_log_id: &str) -> Result<u64> {
        let state = self.state.read().await;
        Ok(state.progresses.get(source_log_id).copied().unwrap_or(0))
    }

    async fn replication_progresses(&self) -> Result<HashMap<String, u64>> {
        Ok(self.state.read().await.progresses.clone())
    }

    async fn read_replication(
        &self,
        from_sequence_nr: u64,
        max_events: usize,
        scan_limit: usize,
        filter: &ReplicationFilter,
        exclude: &VectorTime,
    ) -> Result<ReplicationReadResult> {
        let state = self.state.read().await;
        let from = from_sequence_nr.max(1);
        let head = state.sequence_nr;

        // Scan at most scan_limit slots; the last slot looked at is reported
        // as progress even when fewer events match the filter.
        let scan_end = head.min(from.saturating_add(scan_limit as u64).saturating_sub(1));
        let mut last_scanned = from.saturating_sub(1).min(head);
        let mut events = Vec::new();

        for seq in from..=scan_end {
            last_scanned = seq;
            let event = &state.events[(seq - 1) as usize];
            if filter.apply(event) && event.is_new_at(exclude) {
                events.push(event.clone());
                if events.len() >= max_events {
                    break;
                }
            }
        }

        Ok(ReplicationReadResult {
            events,
            from_sequence_nr: from,
            replication_progress: last_scanned,
        })
    }

    async fn write_replicated(
        &self,
        events: Vec<DurableEvent>,
        replication_progress: u64,
        source_log_id: &str,
    ) -> Result<ReplicationWriteResult> {
        let mut state = self.state.write().await;
        let mut events_written = 0;

        for mut event in events {
            // An event already covered by the log's version is a duplicate.
            if !event.is_new_at(&state.version) {
                continue;
            }
            state.sequence_nr += 1;
            event.local_log_id = self.id.clone();
            event.local_sequence_nr = state.sequence_nr;
            let timestamp = event.vector_timestamp.clone();
            state.version.merge(&timestamp);
            state.events.push(event);
            events_written += 1;
        }

        let entry = state
            .progresses
            .entry(source_log_id.to_string())
            .or_insert(0);
        if replication_progress > *entry {
            *entry = replication_progress;
        }
        let stored_progress = *entry;

        Ok(ReplicationWriteResult {
            events_written,
            stored_progress,
            version_vector: state.version.clone(),
        })
    }

    async fn append(&self, payloads: Vec<Vec<u8>>, emitter_id: &str) -> Result<u64> {
        let mut state = self.state.write().await;

        for payload in payloads {
            state.sequence_nr += 1;
            let mut timestamp = state.version.clone();
            timestamp.set(&self.endpoint_id, state.sequence_nr);
            let sequence_nr = state.sequence_nr;
            state.version.merge(&timestamp);
            state.events.push(DurableEvent {
                payload,
                emitter_id: emitter_id.to_string(),
                vector_timestamp: timestamp,
                local_log_id: self.id.clone(),
                local_sequence_nr: sequence_nr,
            });
        }

        Ok(state.sequence_nr)
    }

    async fn read(&self, from_sequence_nr: u64, max_events: usize) -> Result<Vec<DurableEvent>> {
        let state = self.state.read().await;
        let from = from_sequence_nr.max(1);
        if from > state.sequence_nr {
            return Ok(Vec::new());
        }
        Ok(state.events[(from - 1) as usize..]
            .iter()
            .take(max_events)
            .cloned()
            .collect())
    }

    async fn delete(&self, to_sequence_nr: u64, remote_log_ids: HashSet<String>) -> Result<u64> {
        let mut state = self.state.write().await;
        let watermark = state
            .deletion_watermark
            .max(to_sequence_nr.min(state.sequence_nr));
        state.deletion_watermark = watermark;
        state.deletion_remote_log_ids.extend(remote_log_ids);
        Ok(watermark)
    }

    async fn deletion_watermark(&self) -> u64 {
        self.state.read().await.deletion_watermark
    }

    async fn synchronize_progress(&self, source_log_id: &str, to: u64) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(progress) = state.progresses.get_mut(source_log_id) {
            if *progress > to {
                tracing::info!(
                    log = %self.id,
                    source_log_id,
                    from = *progress,
                    to,
                    "clamping replication progress of recovered source"
                );
                *progress = to;
            }
        }
        Ok(())
    }

    async fn adjust_clock(&self) -> Result<u64> {
        let mut state = self.state.write().await;
        let own_time = state.version.value_of(&self.endpoint_id);
        if state.sequence_nr < own_time {
            tracing::info!(
                log = %self.id,
                from = state.sequence_nr,
                to = own_time,
                "raising log sequence number to own vector time entry"
            );
            state.sequence_nr = own_time;
        }
        Ok(state.sequence_nr)
    }

    async fn save_snapshot(&self, snapshot: Snapshot) -> Result<()> {
        let mut state = self.state.write().await;
        state
            .snapshots
            .insert(snapshot.emitter_id.clone(), snapshot);
        Ok(())
    }

    async fn load_snapshot(&self, emitter_id: &str) -> Result<Option<Snapshot>> {
        Ok(self.state.read().await.snapshots.get(emitter_id).cloned())
    }

    async fn delete_invalid_snapshots(&self) -> Result<usize> {
        let mut state = self.state.write().await;
        let version = state.version.clone();
        let before = state.snapshots.len();
        state
            .snapshots
            .retain(|_, snapshot| snapshot.vector_timestamp.leq(&version));
        Ok(before - state.snapshots.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_log() -> MemoryEventLog {
        MemoryEventLog::new("b_X".to_string(), "b".to_string())
    }

    fn remote_event(seq: u64, emitter: &str, payload: &[u8]) -> DurableEvent {
        DurableEvent {
            payload: payload.to_vec(),
            emitter_id: emitter.to_string(),
            vector_timestamp: VectorTime::new().entry("a", seq),
            local_log_id: "a_X".to_string(),
            local_sequence_nr: seq,
        }
    }

    #[tokio::test]
    async fn test_append_assigns_sequence_and_clock() {
        let log = test_log();
        let head = log
            .append(vec![b"e1".to_vec(), b"e2".to_vec()], "emitter")
            .await
            .unwrap();

        assert_eq!(head, 2);
        assert_eq!(log.sequence_nr().await, 2);
        assert_eq!(log.current_version().await.value_of("b"), 2);

        let events = log.read(1, 10).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].local_sequence_nr, 1);
        assert_eq!(events[0].vector_timestamp.value_of("b"), 1);
        assert_eq!(events[1].vector_timestamp.value_of("b"), 2);
    }

    #[tokio::test]
    async fn test_write_replicated_suppresses_duplicates() {
        let log = test_log();
        let event = remote_event(1, "emitter", b"e1");

        let first = log
            .write_replicated(vec![event.clone()], 1, "a_X")
            .await
            .unwrap();
        assert_eq!(first.events_written, 1);
        assert_eq!(first.stored_progress, 1);

        // Same event delivered again: rejected by the vector-time check, but
        // progress still holds.
        let second = log.write_replicated(vec![event], 1, "a_X").await.unwrap();
        assert_eq!(second.events_written, 0);
        assert_eq!(second.stored_progress, 1);
        assert_eq!(log.sequence_nr().await, 1);
    }

    #[tokio::test]
    async fn test_progress_is_monotone() {
        let log = test_log();
        log.write_replicated(vec![remote_event(1, "e", b"1")], 5, "a_X")
            .await
            .unwrap();

        let result = log.write_replicated(Vec::new(), 3, "a_X").await.unwrap();
        assert_eq!(result.stored_progress, 5);
        assert_eq!(log.replication_progress("a_X").await.unwrap(), 5);

        let progresses = log.replication_progresses().await.unwrap();
        assert_eq!(progresses.get("a_X"), Some(&5));
    }

    #[tokio::test]
    async fn test_read_replication_reports_scanned_progress() {
        let log = test_log();
        let payloads = (1..=10).map(|n| format!("e{n}").into_bytes()).collect();
        log.append(payloads, "noise").await.unwrap();

        // Nothing matches, but the scanned range is reported as progress.
        let result = log
            .read_replication(
                1,
                100,
                4,
                &ReplicationFilter::Emitter("keep".into()),
                &VectorTime::new(),
            )
            .await
            .unwrap();
        assert!(result.events.is_empty());
        assert_eq!(result.replication_progress, 4);

        // Past the head, no slot is scanned.
        let result = log
            .read_replication(11, 100, 4, &ReplicationFilter::NoFilter, &VectorTime::new())
            .await
            .unwrap();
        assert!(result.events.is_empty());
        assert_eq!(result.replication_progress, 10);
    }

    #[tokio::test]
    async fn test_read_replication_stops_at_batch_limit() {
        let log = test_log();
        let payloads = (1..=10).map(|n| format!("e{n}").into_bytes()).collect();
        log.append(payloads, "emitter").await.unwrap();

        let result = log
            .read_replication(1, 3, 100, &ReplicationFilter::NoFilter, &VectorTime::new())
            .await
            .unwrap();
        assert_eq!(result.events.len(), 3);
        assert_eq!(result.replication_progress, 3);
    }

    #[tokio::test]
    async fn test_read_replication_excludes_covered_events() {
        let log = test_log();
        log.append(vec![b"e1".to_vec(), b"e2".to_vec(), b"e3".to_vec()], "e")
            .await
            .unwrap();

        let exclude = VectorTime::new().entry("b", 2);
        let result = log
            .read_replication(1, 100, 100, &ReplicationFilter::NoFilter, &exclude)
            .await
            .unwrap();
        assert_eq!(result.events.len(), 1);
        assert_eq!(result.events[0].local_sequence_nr, 3);
        assert_eq!(result.replication_progress, 3);
    }

    #[tokio::test]
    async fn test_delete_watermark() {
        let log = test_log();
        log.append((1..=5).map(|n| vec![n]).collect(), "e")
            .await
            .unwrap();

        let watermark = log.delete(3, HashSet::new()).await.unwrap();
        assert_eq!(watermark, 3);

        // Watermark is capped at the current head and never lowered.
        let watermark = log.delete(100, HashSet::new()).await.unwrap();
        assert_eq!(watermark, 5);
        let watermark = log.delete(1, HashSet::new()).await.unwrap();
        assert_eq!(watermark, 5);
        assert_eq!(log.deletion_watermark().await, 5);

        // Logical deletion: events still replicate.
        let result = log
            .read_replication(1, 100, 100, &ReplicationFilter::NoFilter, &VectorTime::new())
            .await
            .unwrap();
        assert_eq!(result.events.len(), 5);
    }

    #[tokio::test]
    async fn test_synchronize_progress_clamps_down_only() {
        let log = test_log();
        log.write_replicated(vec![remote_event(1, "e", b"1")], 5, "a_X")
            .await
            .unwrap();

        log.synchronize_progress("a_X", 3).await.unwrap();
        assert_eq!(log.replication_progress("a_X").await.unwrap(), 3);

        log.synchronize_progress("a_X", 10).await.unwrap();
        assert_eq!(log.replication_progress("a_X").await.unwrap(), 3);

        // Unknown source logs stay untracked.
        log.synchronize_progress("c_X", 1).await.unwrap();
        assert_eq!(log.replication_progress("c_X").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_adjust_clock_raises_sequence_nr() {
        let log = test_log();

        // A remote event can carry a higher entry for this endpoint than the
        // local sequence number, e.g. after this endpoint lost events that a
        // peer had already observed.
        let event = DurableEvent {
            payload: b"e".to_vec(),
            emitter_id: "e".to_string(),
            vector_timestamp: VectorTime::new().entry("a", 1).entry("b", 5),
            local_log_id: "a_X".to_string(),
            local_sequence_nr: 1,
        };
        log.write_replicated(vec![event], 1, "a_X").await.unwrap();
        assert_eq!(log.sequence_nr().await, 1);

        assert_eq!(log.adjust_clock().await.unwrap(), 5);
        assert_eq!(log.sequence_nr().await, 5);

        // Already-dominating sequence numbers are left alone.
        assert_eq!(log.adjust_clock().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_snapshot_invalidation() {
        let log = test_log();
        log.append(vec![b"e1".to_vec(), b"e2".to_vec()], "e")
            .await
            .unwrap();

        log.save_snapshot(Snapshot {
            emitter_id: "covered".to_string(),
            sequence_nr: 2,
            vector_timestamp: VectorTime::new().entry("b", 2),
            payload: Vec::new(),
        })
        .await
        .unwrap();
        log.save_snapshot(Snapshot {
            emitter_id: "dangling".to_string(),
            sequence_nr: 6,
            vector_timestamp: VectorTime::new().entry("b", 6),
            payload: Vec::new(),
        })
        .await
        .unwrap();

        assert_eq!(log.delete_invalid_snapshots().await.unwrap(), 1);
        assert!(log.load_snapshot("covered").await.unwrap().is_some());
        assert!(log.load_snapshot("dangling").await.unwrap().is_none());
    }
}
