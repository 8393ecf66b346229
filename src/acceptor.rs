//! Acceptor
//!
//! Server-side counterpart of remote replicators. Answers endpoint info and
//! recovery requests in any mode; replication reads are only served in
//! normal mode, behind the application compatibility gate and the endpoint's
//! filter configuration. Also fans write notifications out to local
//! replicators sharing the written target log.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};

use crate::endpoint::EndpointContext;
use crate::event::ApplicationVersion;
use crate::network::RequestHandler;
use crate::protocol::{
    Message, ReplicationEndpointInfo, ReplicationRead, ReplicationReadError,
};

/// Acceptor mode. In `Recovering`, replication reads are rejected so no
/// events leave the endpoint while its logs are being re-seeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AcceptorMode {
    Recovering,
    Normal,
}

struct RegisteredReplicator {
    source_log_id: String,
    due_tx: mpsc::Sender<()>,
}

pub(crate) struct Acceptor {
    context: Arc<EndpointContext>,
    mode: RwLock<AcceptorMode>,
    /// Local replicators by target log id, for write fan-out
    registry: RwLock<HashMap<String, Vec<RegisteredReplicator>>>,
}

impl Acceptor {
    pub(crate) fn new(context: Arc<EndpointContext>) -> Self {
        Self {
            context,
            mode: RwLock::new(AcceptorMode::Recovering),
            registry: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) async fn set_mode(&self, mode: AcceptorMode) {
        *self.mode.write().await = mode;
    }

    /// Register a replicator writing to the given target log. Returns the
    /// channel its due hints arrive on.
    pub(crate) async fn register(
        &self,
        target_log_id: &str,
        source_log_id: &str,
    ) -> mpsc::Receiver<()> {
        // Capacity 1: a pending hint already says everything a second one
        // would.
        let (due_tx, due_rx) = mpsc::channel(1);
        let mut registry = self.registry.write().await;
        registry
            .entry(target_log_id.to_string())
            .or_default()
            .push(RegisteredReplicator {
                source_log_id: source_log_id.to_string(),
                due_tx,
            });
        due_rx
    }

    /// After a successful replication write, hint every other replicator of
    /// the same target log that new events may be available (source push).
    pub(crate) async fn notify_written(&self, target_log_id: &str, writer_source_log_id: &str) {
        let mut registry = self.registry.write().await;
        if let Some(entries) = registry.get_mut(target_log_id) {
            entries.retain(|entry| !entry.due_tx.is_closed());
            for entry in entries.iter() {
                if entry.source_log_id != writer_source_log_id {
                    let _ = entry.due_tx.try_send(());
                }
            }
        }
    }

    async fn handle_synchronize(&self, info: ReplicationEndpointInfo) -> Message {
        // The recovering endpoint may have lost events; progress stored
        // beyond its current heads must be taken back so the events it
        // re-pulls are replicated here again.
        for log_name in self.context.common_log_names(&info) {
            let log = &self.context.logs[&log_name];
            let source_log_id = crate::endpoint::log_id(&info.endpoint_id, &log_name);
            if let Err(e) = log
                .synchronize_progress(&source_log_id, info.sequence_nr(&log_name))
                .await
            {
                tracing::error!(
                    endpoint = %info.endpoint_id,
                    log = %log_name,
                    error = %e,
                    "progress synchronization failed"
                );
                return Message::SynchronizeReplicationProgressFailure {
                    cause: e.to_string(),
                };
            }
        }

        Message::SynchronizeReplicationProgressSuccess {
            info: self.context.info().await,
        }
    }

    async fn handle_read(
        &self,
        read: ReplicationRead,
        source_log_name: String,
        application_name: String,
        application_version: ApplicationVersion,
    ) -> Message {
        let target_log_id = read.target_log_id.clone();

        if *self.mode.read().await == AcceptorMode::Recovering {
            return Message::ReplicationReadFailure {
                cause: ReplicationReadError::SourceRecovering,
                target_log_id,
            };
        }

        // Application compatibility gate: same application name requires the
        // reader to be at least at this endpoint's version.
        if application_name == self.context.application_name
            && application_version < self.context.application_version
        {
            return Message::ReplicationReadFailure {
                cause: ReplicationReadError::IncompatibleApplicationVersion {
                    required: self.context.application_version,
                    supplied: application_version,
                },
                target_log_id,
            };
        }

        let Some(log) = self.context.logs.get(&source_log_name) else {
            return Message::ReplicationReadFailure {
                cause: ReplicationReadError::UnknownSourceLog(source_log_name),
                target_log_id,
            };
        };

        let filter = self
            .context
            .endpoint_filters
            .filter_for(&target_log_id, &source_log_name)
            .and(read.filter);

        match log
            .read_replication(
                read.from_sequence_nr,
                read.max_events,
                read.scan_limit,
                &filter,
                &read.target_version,
            )
            .await
        {
            Ok(result) => Message::ReplicationReadSuccess {
                events: result.events,
                from_sequence_nr: result.from_sequence_nr,
                replication_progress: result.replication_progress,
                target_log_id,
                current_source_version: log.current_version().await,
            },
            Err(e) => Message::ReplicationReadFailure {
                cause: ReplicationReadError::Failed(e.to_string()),
                target_log_id,
            },
        }
    }
}

#[async_trait]
impl RequestHandler for Acceptor {
    async fn handle(&self, peer: &str, message: Message) -> Option<Message> {
        match message {
            Message::GetReplicationEndpointInfo => {
                Some(Message::GetReplicationEndpointInfoSuccess {
                    info: self.context.info().await,
                })
            }
            Message::SynchronizeReplicationProgress { info } => {
                Some(self.handle_synchronize(info).await)
            }
            Message::ReplicationReadEnvelope {
                read,
                source_log_name,
                application_name,
                application_version,
            } => Some(
                self.handle_read(read, source_log_name, application_name, application_version)
                    .await,
            ),
            other => {
                tracing::debug!(peer, message = other.type_name(), "ignoring unexpected request");
                None
            }
        }
    }
}
