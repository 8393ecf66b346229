//! Connector
//!
//! Bootstraps replication for one remote connection: periodically asks the
//! peer acceptor for its endpoint info, derives one replication link per
//! common log name from the first reply, and spawns a replicator per link.
//! Recovery hands over an already-known link set instead, skipping
//! discovery.

use std::sync::Arc;

use crate::acceptor::Acceptor;
use crate::endpoint::EndpointContext;
use crate::filters::ReplicationFilter;
use crate::network::NetworkClient;
use crate::protocol::Message;
use crate::replication::{detector, ReplicationConnection, ReplicationLink, TaskSet};

use super::replicator::Replicator;

pub(crate) struct Connector {
    connection: ReplicationConnection,
    context: Arc<EndpointContext>,
    client: Arc<NetworkClient>,
    acceptor: Arc<Acceptor>,
    tasks: Arc<TaskSet>,
}

impl Connector {
    pub(crate) fn new(
        connection: ReplicationConnection,
        context: Arc<EndpointContext>,
        client: Arc<NetworkClient>,
        acceptor: Arc<Acceptor>,
        tasks: Arc<TaskSet>,
    ) -> Self {
        Self {
            connection,
            context,
            client,
            acceptor,
            tasks,
        }
    }

    pub(crate) async fn run(self, preset_links: Option<Vec<ReplicationLink>>) {
        let links = match preset_links {
            Some(links) => links,
            None => self.discover_links().await,
        };

        for link in links {
            self.spawn_replicator(link).await;
        }
    }

    /// Poll the peer for its endpoint info until the first success. Further
    /// info replies would carry no new links, so polling stops there.
    async fn discover_links(&self) -> Vec<ReplicationLink> {
        let address = self.connection.address();
        let socket_addr = address.socket_addr();
        let mut ticker = tokio::time::interval(self.context.settings.retry_delay);

        loop {
            ticker.tick().await;

            let reply = self
                .client
                .request(
                    &socket_addr,
                    Message::GetReplicationEndpointInfo,
                    self.context.settings.remote_read_timeout,
                )
                .await;

            match reply {
                Ok(Message::GetReplicationEndpointInfoSuccess { info }) => {
                    tracing::info!(
                        peer = %address,
                        endpoint = %info.endpoint_id,
                        "connected to remote endpoint"
                    );
                    return self.context.links_for(&self.connection, &info);
                }
                Ok(other) => {
                    tracing::debug!(
                        peer = %address,
                        message = other.type_name(),
                        "unexpected reply to endpoint info request"
                    );
                }
                Err(e) => {
                    tracing::debug!(peer = %address, error = %e, "endpoint info request failed");
                }
            }
        }
    }

    async fn spawn_replicator(&self, link: ReplicationLink) {
        let due_rx = self
            .acceptor
            .register(&link.target.log_id, &link.source.log_id)
            .await;

        let (detector_handle, detector_task) = detector::spawn(
            link.source.endpoint_id.clone(),
            link.source.log_name.clone(),
            self.context.settings.failure_detection_limit,
            self.context.events.clone(),
        );
        self.tasks.track(detector_task).await;

        let filter = self
            .connection
            .filters
            .get(&link.source.log_name)
            .cloned()
            .unwrap_or(ReplicationFilter::NoFilter);

        let task = Replicator::spawn(
            link,
            filter,
            self.context.application_name.clone(),
            self.context.application_version,
            self.context.settings.clone(),
            Arc::clone(&self.client),
            Arc::clone(&self.acceptor),
            detector_handle,
            due_rx,
        );
        self.tasks.track(task).await;
    }
}
