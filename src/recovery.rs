//! Disaster Recovery
//!
//! Re-seeds an endpoint whose logs lost events, without permanent state
//! divergence. Recovery runs as a strict sequence:
//!
//! 1. read the local endpoint info,
//! 2. synchronise replication progress with every remote (they clamp what
//!    they believe they already pulled from this endpoint, and reply with
//!    their own heads),
//! 3. replay unfiltered links up to the captured remote heads,
//! 4. replay filtered links,
//! 5. adjust local log clocks.
//!
//! An unfiltered link carries every causal predecessor an event on a
//! filtered link may depend on, so unfiltered links are replayed first.
//! Failures in steps 1–2 are reported with `partial_update = false` (no
//! writes happened yet, retry is safe); later failures with
//! `partial_update = true`.

use std::sync::Arc;

use crate::endpoint::EndpointContext;
use crate::error::{Error, Result};
use crate::filters::ReplicationFilter;
use crate::network::NetworkClient;
use crate::protocol::{Message, ReplicationEndpointInfo, ReplicationRead};
use crate::replication::{RecoveryLink, ReplicationConnection};

pub(crate) struct Recovery {
    context: Arc<EndpointContext>,
    connections: Vec<ReplicationConnection>,
    client: Arc<NetworkClient>,
}

impl Recovery {
    pub(crate) fn new(
        context: Arc<EndpointContext>,
        connections: Vec<ReplicationConnection>,
        client: Arc<NetworkClient>,
    ) -> Self {
        Self {
            context,
            connections,
            client,
        }
    }

    /// Run the recovery protocol. On success, returns the recovered links so
    /// activation can hand them to connectors as preset links.
    pub(crate) async fn run(&self) -> Result<Vec<RecoveryLink>> {
        // Step 1: local endpoint info.
        let info = self
            .read_endpoint_info()
            .await
            .map_err(|e| e.into_recovery(false))?;
        tracing::info!(
            endpoint = %info.endpoint_id,
            heads = ?info.log_sequence_nrs,
            remotes = self.connections.len(),
            "starting disaster recovery"
        );

        // Step 2: every remote clamps its progress for this endpoint and
        // reports its own heads.
        let links = self
            .synchronize_replication_progresses(&info)
            .await
            .map_err(|e| e.into_recovery(false))?;

        let (filtered, unfiltered): (Vec<_>, Vec<_>) = links
            .iter()
            .cloned()
            .partition(|link| self.is_filtered_link(link));

        // Steps 3 and 4: unfiltered links first, so causal predecessors are
        // back before any filtered event that may depend on them.
        self.recover_links(&unfiltered)
            .await
            .map_err(|e| e.into_recovery(true))?;
        self.recover_links(&filtered)
            .await
            .map_err(|e| e.into_recovery(true))?;

        // Step 5: restore seq >= own vector time entry on every local log.
        self.adjust_event_log_clocks()
            .await
            .map_err(|e| e.into_recovery(true))?;

        tracing::info!(endpoint = %info.endpoint_id, "disaster recovery completed");
        Ok(links)
    }

    async fn read_endpoint_info(&self) -> Result<ReplicationEndpointInfo> {
        Ok(self.context.info().await)
    }

    async fn synchronize_replication_progresses(
        &self,
        info: &ReplicationEndpointInfo,
    ) -> Result<Vec<RecoveryLink>> {
        let mut links = Vec::new();

        for connection in &self.connections {
            let address = connection.address();
            let reply = self
                .request_with_retry(
                    &address.socket_addr(),
                    Message::SynchronizeReplicationProgress { info: info.clone() },
                )
                .await?;

            match reply {
                Message::SynchronizeReplicationProgressSuccess { info: remote } => {
                    for log_name in self.context.common_log_names(&remote) {
                        let link = self.context.link_for(connection, &remote.endpoint_id, &log_name);
                        links.push(RecoveryLink {
                            remote_sequence_nr: remote.sequence_nr(&log_name),
                            local_sequence_nr: info.sequence_nr(&log_name),
                            link,
                        });
                    }
                }
                Message::SynchronizeReplicationProgressFailure { cause } => {
                    return Err(Error::Replication(format!(
                        "progress synchronization with {address} failed: {cause}"
                    )));
                }
                other => {
                    return Err(Error::UnexpectedReply {
                        address: address.socket_addr(),
                        message_type: other.type_name(),
                    });
                }
            }
        }

        Ok(links)
    }

    /// Whether the connection owning the link filters the link's log
    pub(crate) fn is_filtered_link(&self, link: &RecoveryLink) -> bool {
        self.connection_for(link)
            .map(|connection| connection.is_filtered(&link.link.source.log_name))
            .unwrap_or(false)
    }

    fn connection_for(&self, link: &RecoveryLink) -> Option<&ReplicationConnection> {
        self.connections
            .iter()
            .find(|connection| connection.address() == link.link.source.address)
    }

    async fn recover_links(&self, links: &[RecoveryLink]) -> Result<()> {
        for link in links {
            self.recover_link(link).await?;
        }
        Ok(())
    }

    /// Replay one link until the target log has observed every source
    /// sequence number up to the head captured at recovery start, then drop
    /// snapshots that reference events the replay did not bring back.
    async fn recover_link(&self, recovery_link: &RecoveryLink) -> Result<()> {
        let link = &recovery_link.link;
        let filter = self
            .connection_for(recovery_link)
            .and_then(|connection| connection.filters.get(&link.source.log_name).cloned())
            .unwrap_or(ReplicationFilter::NoFilter);

        tracing::info!(
            link = ?link,
            remote_sequence_nr = recovery_link.remote_sequence_nr,
            local_sequence_nr = recovery_link.local_sequence_nr,
            "recovering link"
        );

        loop {
            let progress = link
                .target
                .log
                .replication_progress(&link.source.log_id)
                .await?;
            if progress >= recovery_link.remote_sequence_nr {
                break;
            }

            let target_version = link.target.log.current_version().await;
            let envelope = Message::ReplicationReadEnvelope {
                read: ReplicationRead {
                    from_sequence_nr: progress + 1,
                    max_events: self.context.settings.write_batch_size,
                    scan_limit: self.context.settings.remote_scan_limit,
                    filter: filter.clone(),
                    target_log_id: link.target.log_id.clone(),
                    target_version,
                },
                source_log_name: link.source.log_name.clone(),
                application_name: self.context.application_name.clone(),
                application_version: self.context.application_version,
            };

            let reply = self
                .request_with_retry(&link.source.address.socket_addr(), envelope)
                .await?;

            match reply {
                Message::ReplicationReadSuccess {
                    events,
                    replication_progress,
                    ..
                } => {
                    link.target
                        .log
                        .write_replicated(events, replication_progress, &link.source.log_id)
                        .await?;
                }
                Message::ReplicationReadFailure { cause, .. } => {
                    return Err(Error::ReadFailure(cause));
                }
                other => {
                    return Err(Error::UnexpectedReply {
                        address: link.source.address.socket_addr(),
                        message_type: other.type_name(),
                    });
                }
            }
        }

        let removed = link.target.log.delete_invalid_snapshots().await?;
        if removed > 0 {
            tracing::info!(
                link = ?link,
                removed,
                "dropped snapshots referencing lost events"
            );
        }

        Ok(())
    }

    async fn adjust_event_log_clocks(&self) -> Result<()> {
        for (log_name, log) in &self.context.logs {
            let sequence_nr = log.adjust_clock().await?;
            tracing::debug!(log = %log_name, sequence_nr, "adjusted event log clock");
        }
        Ok(())
    }

    /// Send a remote recovery request, retrying transient failures with the
    /// configured spacing.
    async fn request_with_retry(&self, address: &str, message: Message) -> Result<Message> {
        let recovery = &self.context.settings.recovery;
        let mut attempt = 0;

        loop {
            match self
                .client
                .request(address, message.clone(), recovery.remote_operation_timeout)
                .await
            {
                Ok(reply) => return Ok(reply),
                Err(e) => {
                    attempt += 1;
                    if attempt > recovery.remote_operation_retry_max {
                        return Err(e);
                    }
                    tracing::debug!(
                        address,
                        error = %e,
                        attempt,
                        "recovery remote operation failed, retrying"
                    );
                    tokio::time::sleep(recovery.remote_operation_retry_delay).await;
                }
            }
        }
    }
}
