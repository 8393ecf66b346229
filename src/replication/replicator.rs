//! Replicator
//!
//! Drives a single replication link: fetch the stored replication progress
//! from the target log, read a batch from the remote source log, write it
//! locally, then go idle until the retry delay elapses or a sibling's write
//! hints that new events may be available.
//!
//! The loop is strictly sequential; there is never more than one in-flight
//! request per link.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use super::detector::FailureDetectorHandle;
use super::{ReplicationLink, ReplicationSettings};
use crate::acceptor::Acceptor;
use crate::error::{Error, Result};
use crate::event::{ApplicationVersion, DurableEvent, VectorTime};
use crate::filters::ReplicationFilter;
use crate::log::ReplicationWriteResult;
use crate::network::NetworkClient;
use crate::protocol::{Message, ReplicationRead, ReplicationReadError};

struct ReadOutcome {
    events: Vec<DurableEvent>,
    replication_progress: u64,
}

pub(crate) struct Replicator {
    link: ReplicationLink,
    filter: ReplicationFilter,
    application_name: String,
    application_version: ApplicationVersion,
    settings: ReplicationSettings,
    client: Arc<NetworkClient>,
    acceptor: Arc<Acceptor>,
    detector: FailureDetectorHandle,
    due_rx: mpsc::Receiver<()>,
}

impl Replicator {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn(
        link: ReplicationLink,
        filter: ReplicationFilter,
        application_name: String,
        application_version: ApplicationVersion,
        settings: ReplicationSettings,
        client: Arc<NetworkClient>,
        acceptor: Arc<Acceptor>,
        detector: FailureDetectorHandle,
        due_rx: mpsc::Receiver<()>,
    ) -> JoinHandle<()> {
        let replicator = Self {
            link,
            filter,
            application_name,
            application_version,
            settings,
            client,
            acceptor,
            detector,
            due_rx,
        };
        tokio::spawn(replicator.run())
    }

    async fn run(mut self) {
        tracing::debug!(link = ?self.link, "replicator started");

        loop {
            // Fetching: learn where to resume from.
            let (mut from, mut target_version) = loop {
                match self.fetch_progress().await {
                    Ok((progress, version)) => break (progress + 1, version),
                    Err(e) => {
                        tracing::warn!(link = ?self.link, error = %e, "progress fetch failed");
                        tokio::time::sleep(self.settings.retry_delay).await;
                    }
                }
            };

            // Reading/Writing: pull batches until the source range is drained
            // or a request fails.
            loop {
                match self.read(from, &target_version).await {
                    Ok(read) => {
                        self.detector.available().await;
                        // The source scanned up to replication_progress; if
                        // that covered at least one slot there may be more
                        // behind it, so re-read without going idle.
                        let continue_replication = read.replication_progress >= from;

                        match self.write(read.events, read.replication_progress).await {
                            Ok(write) => {
                                self.acceptor
                                    .notify_written(
                                        &self.link.target.log_id,
                                        &self.link.source.log_id,
                                    )
                                    .await;
                                if continue_replication {
                                    from = write.stored_progress + 1;
                                    target_version = write.version_vector;
                                } else {
                                    break;
                                }
                            }
                            Err(e) => {
                                tracing::warn!(link = ?self.link, error = %e, "replication write failed");
                                break;
                            }
                        }
                    }
                    Err(cause) => {
                        tracing::debug!(link = ?self.link, error = %cause, "replication read failed");
                        self.detector.failure(cause).await;
                        break;
                    }
                }
            }

            // Idle: wait for the retry delay or a due hint.
            if !self.idle().await {
                tracing::debug!(link = ?self.link, "replicator stopped");
                return;
            }
        }
    }

    async fn fetch_progress(&self) -> Result<(u64, VectorTime)> {
        let log = &self.link.target.log;
        let fetch = async {
            let progress = log.replication_progress(&self.link.source.log_id).await?;
            let version = log.current_version().await;
            Ok::<_, Error>((progress, version))
        };
        match timeout(self.settings.read_timeout, fetch).await {
            Ok(result) => result,
            Err(_) => Err(Error::LogTimeout(self.settings.read_timeout)),
        }
    }

    async fn read(&self, from: u64, target_version: &VectorTime) -> Result<ReadOutcome> {
        let envelope = Message::ReplicationReadEnvelope {
            read: ReplicationRead {
                from_sequence_nr: from,
                max_events: self.settings.write_batch_size,
                scan_limit: self.settings.remote_scan_limit,
                filter: self.filter.clone(),
                target_log_id: self.link.target.log_id.clone(),
                target_version: target_version.clone(),
            },
            source_log_name: self.link.source.log_name.clone(),
            application_name: self.application_name.clone(),
            application_version: self.application_version,
        };

        let address = self.link.source.address.socket_addr();
        let reply = self
            .client
            .request(&address, envelope, self.settings.remote_read_timeout)
            .await;

        match reply {
            Ok(Message::ReplicationReadSuccess {
                events,
                replication_progress,
                target_log_id,
                ..
            }) if target_log_id == self.link.target.log_id => Ok(ReadOutcome {
                events,
                replication_progress,
            }),
            Ok(Message::ReplicationReadFailure { cause, .. }) => Err(Error::ReadFailure(cause)),
            Ok(other) => Err(Error::UnexpectedReply {
                address,
                message_type: other.type_name(),
            }),
            // A timed-out remote read is indistinguishable from a reported
            // read failure.
            Err(Error::ConnectionTimeout(_)) => Err(Error::ReadFailure(
                ReplicationReadError::Timeout(self.settings.remote_read_timeout.as_millis() as u64),
            )),
            Err(e) => Err(e),
        }
    }

    async fn write(
        &self,
        events: Vec<DurableEvent>,
        replication_progress: u64,
    ) -> Result<ReplicationWriteResult> {
        let write = self.link.target.log.write_replicated(
            events,
            replication_progress,
            &self.link.source.log_id,
        );
        match timeout(self.settings.write_timeout, write).await {
            Ok(result) => result,
            Err(_) => Err(Error::LogTimeout(self.settings.write_timeout)),
        }
    }

    /// Wait in the Idle state. Returns false when the endpoint is shutting
    /// down.
    async fn idle(&mut self) -> bool {
        // Hints that arrived while busy are stale; only a fresh one cancels
        // the scheduled retry.
        while self.due_rx.try_recv().is_ok() {}

        tokio::select! {
            due = self.due_rx.recv() => due.is_some(),
            _ = tokio::time::sleep(self.settings.retry_delay) => true,
        }
    }
}
