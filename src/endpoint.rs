//! Replication Endpoint
//!
//! Facade owning the local event logs, the replication connections, the
//! acceptor and the event bus. An endpoint is activated (or recovered, which
//! ends in activation) exactly once; from then on connectors discover peer
//! logs and replicators pull events into the local logs.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};

use crate::acceptor::{Acceptor, AcceptorMode};
use crate::config::DriftlogConfig;
use crate::error::{Error, Result};
use crate::event::ApplicationVersion;
use crate::filters::EndpointFilters;
use crate::log::{EventLog, MemoryEventLog};
use crate::network::{NetworkClient, NetworkServer, NetworkServerHandle, RequestHandler};
use crate::protocol::ReplicationEndpointInfo;
use crate::recovery::Recovery;
use crate::replication::connector::Connector;
use crate::replication::{
    PeerAddress, RecoveryLink, ReplicationConnection, ReplicationLink, ReplicationSettings,
    ReplicationSource, ReplicationTarget, TaskSet,
};

/// Canonical log id of a named log at the given endpoint. Injective as long
/// as endpoint ids never contain `_`, which construction enforces.
pub fn log_id(endpoint_id: &str, log_name: &str) -> String {
    format!("{endpoint_id}_{log_name}")
}

/// Events published on the endpoint's event bus
#[derive(Debug, Clone)]
pub enum EndpointEvent {
    /// A remote source log responded to replication reads
    Available {
        endpoint_id: String,
        log_name: String,
    },
    /// A remote source log failed for a full detection window
    Unavailable {
        endpoint_id: String,
        log_name: String,
        causes: Vec<Arc<Error>>,
    },
}

/// The narrow slice of endpoint state its collaborators need
pub(crate) struct EndpointContext {
    pub endpoint_id: String,
    pub application_name: String,
    pub application_version: ApplicationVersion,
    pub logs: HashMap<String, Arc<dyn EventLog>>,
    pub endpoint_filters: EndpointFilters,
    pub settings: ReplicationSettings,
    pub events: broadcast::Sender<EndpointEvent>,
}

impl EndpointContext {
    /// This endpoint's info: identity plus current log heads
    pub(crate) async fn info(&self) -> ReplicationEndpointInfo {
        let mut log_sequence_nrs = HashMap::new();
        for (log_name, log) in &self.logs {
            log_sequence_nrs.insert(log_name.clone(), log.sequence_nr().await);
        }
        ReplicationEndpointInfo {
            endpoint_id: self.endpoint_id.clone(),
            log_sequence_nrs,
        }
    }

    /// Log names managed both locally and by the peer, in stable order
    pub(crate) fn common_log_names(&self, info: &ReplicationEndpointInfo) -> Vec<String> {
        let mut names: Vec<String> = self
            .logs
            .keys()
            .filter(|name| info.log_sequence_nrs.contains_key(*name))
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// The replication link pulling the named log from the given remote
    /// endpoint over the given connection
    pub(crate) fn link_for(
        &self,
        connection: &ReplicationConnection,
        remote_endpoint_id: &str,
        log_name: &str,
    ) -> ReplicationLink {
        ReplicationLink {
            source: ReplicationSource {
                endpoint_id: remote_endpoint_id.to_string(),
                log_name: log_name.to_string(),
                log_id: log_id(remote_endpoint_id, log_name),
                address: connection.address(),
            },
            target: ReplicationTarget {
                endpoint_id: self.endpoint_id.clone(),
                log_name: log_name.to_string(),
                log_id: log_id(&self.endpoint_id, log_name),
                log: Arc::clone(&self.logs[log_name]),
            },
        }
    }

    /// One link per log name managed on both sides of the connection
    pub(crate) fn links_for(
        &self,
        connection: &ReplicationConnection,
        info: &ReplicationEndpointInfo,
    ) -> Vec<ReplicationLink> {
        self.common_log_names(info)
            .iter()
            .map(|log_name| self.link_for(connection, &info.endpoint_id, log_name))
            .collect()
    }
}

/// A replication endpoint
pub struct ReplicationEndpoint {
    context: Arc<EndpointContext>,
    connections: Vec<ReplicationConnection>,
    bind_address: String,
    client: Arc<NetworkClient>,
    acceptor: Arc<Acceptor>,
    active: AtomicBool,
    terminated: AtomicBool,
    server: Mutex<Option<NetworkServerHandle>>,
    tasks: Arc<TaskSet>,
}

impl ReplicationEndpoint {
    /// Create an endpoint managing the named logs, produced by
    /// `log_factory(log_name, log_id)`.
    pub fn new<F>(
        config: &DriftlogConfig,
        log_names: Vec<String>,
        connections: Vec<ReplicationConnection>,
        endpoint_filters: EndpointFilters,
        log_factory: F,
    ) -> Result<Self>
    where
        F: Fn(&str, &str) -> Arc<dyn EventLog>,
    {
        config.validate()?;
        let endpoint_id = config.endpoint.id.clone();

        let mut logs: HashMap<String, Arc<dyn EventLog>> = HashMap::new();
        for log_name in &log_names {
            let id = log_id(&endpoint_id, log_name);
            if logs
                .insert(log_name.clone(), log_factory(log_name, &id))
                .is_some()
            {
                return Err(Error::Config(format!("duplicate log name: {log_name}")));
            }
        }

        let mut addresses: HashSet<PeerAddress> = HashSet::new();
        for connection in &connections {
            if !addresses.insert(connection.address()) {
                return Err(Error::Config(format!(
                    "duplicate replication connection: {}",
                    connection.address()
                )));
            }
        }

        let (events, _) = broadcast::channel(256);
        let settings = config.replication_settings();
        let client = Arc::new(NetworkClient::new(settings.remote_read_timeout));

        let context = Arc::new(EndpointContext {
            endpoint_id,
            application_name: config.endpoint.application.name.clone(),
            application_version: config.endpoint.application.version,
            logs,
            endpoint_filters,
            settings,
            events,
        });
        let acceptor = Arc::new(Acceptor::new(Arc::clone(&context)));

        Ok(Self {
            context,
            connections,
            bind_address: config.endpoint.bind_address.clone(),
            client,
            acceptor,
            active: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            server: Mutex::new(None),
            tasks: Arc::new(TaskSet::default()),
        })
    }

    /// Create an endpoint with in-memory logs, connections taken from the
    /// configuration.
    pub fn from_config(config: &DriftlogConfig, log_names: Vec<String>) -> Result<Self> {
        let connections = config
            .endpoint
            .connections
            .iter()
            .map(|address| ReplicationConnection::parse(address))
            .collect::<Result<Vec<_>>>()?;
        Self::with_memory_logs(config, log_names, connections, EndpointFilters::no_filters())
    }

    /// Create an endpoint with in-memory logs
    pub fn with_memory_logs(
        config: &DriftlogConfig,
        log_names: Vec<String>,
        connections: Vec<ReplicationConnection>,
        endpoint_filters: EndpointFilters,
    ) -> Result<Self> {
        let endpoint_id = config.endpoint.id.clone();
        Self::new(config, log_names, connections, endpoint_filters, |_, id| {
            Arc::new(MemoryEventLog::new(id.to_string(), endpoint_id.clone()))
        })
    }

    /// This endpoint's id
    pub fn id(&self) -> &str {
        &self.context.endpoint_id
    }

    /// Names of the logs this endpoint manages
    pub fn log_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.context.logs.keys().cloned().collect();
        names.sort();
        names
    }

    /// Handle to a named local log
    pub fn log(&self, log_name: &str) -> Option<Arc<dyn EventLog>> {
        self.context.logs.get(log_name).cloned()
    }

    /// Canonical id of a named local log
    pub fn log_id(&self, log_name: &str) -> String {
        log_id(&self.context.endpoint_id, log_name)
    }

    /// Log names managed both locally and by the peer described by `info`
    pub fn common_log_names(&self, info: &ReplicationEndpointInfo) -> Vec<String> {
        self.context.common_log_names(info)
    }

    /// Subscribe to availability events
    pub fn subscribe(&self) -> broadcast::Receiver<EndpointEvent> {
        self.context.events.subscribe()
    }

    /// Address the acceptor is listening on, once activated
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.server.lock().await.as_ref().map(|s| s.local_addr())
    }

    /// Activate the endpoint: start the acceptor in normal mode and a
    /// connector per replication connection. Fails if the endpoint was
    /// already activated or a recovery is in progress.
    pub async fn activate(&self) -> Result<()> {
        self.acquire_lifecycle()?;

        self.acceptor.set_mode(AcceptorMode::Normal).await;
        if let Err(e) = self.start_server().await {
            self.active.store(false, Ordering::SeqCst);
            return Err(e);
        }
        self.start_connectors(HashMap::new()).await;

        tracing::info!(endpoint = %self.context.endpoint_id, "replication endpoint activated");
        Ok(())
    }

    /// Recover the endpoint after event loss, then activate it. Fails
    /// immediately if the endpoint has no replication connections. On
    /// failure the lifecycle slot is released again; whether a retry is safe
    /// is indicated by `Error::Recovery::partial_update`.
    pub async fn recover(&self) -> Result<()> {
        if self.connections.is_empty() {
            return Err(Error::IllegalState(
                "cannot recover an endpoint without replication connections".into(),
            ));
        }
        self.acquire_lifecycle()?;

        self.acceptor.set_mode(AcceptorMode::Recovering).await;
        if let Err(e) = self.start_server().await {
            self.active.store(false, Ordering::SeqCst);
            return Err(e);
        }

        let recovery = Recovery::new(
            Arc::clone(&self.context),
            self.connections.clone(),
            Arc::clone(&self.client),
        );

        match recovery.run().await {
            Ok(links) => {
                self.acceptor.set_mode(AcceptorMode::Normal).await;
                self.start_connectors(group_by_source(links)).await;
                tracing::info!(endpoint = %self.context.endpoint_id, "replication endpoint recovered");
                Ok(())
            }
            Err(e) => {
                self.stop_server().await;
                self.active.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    /// Logically delete events of a named local log up to `to_sequence_nr`,
    /// keeping them replicable until all listed remote endpoints have pulled
    /// past the watermark. Returns the effective deletion watermark.
    pub async fn delete(
        &self,
        log_name: &str,
        to_sequence_nr: u64,
        remote_endpoint_ids: HashSet<String>,
    ) -> Result<u64> {
        let log = self
            .log(log_name)
            .ok_or_else(|| Error::LogNotFound(log_name.to_string()))?;
        let remote_log_ids = remote_endpoint_ids
            .iter()
            .map(|endpoint_id| log_id(endpoint_id, log_name))
            .collect();
        log.delete(to_sequence_nr, remote_log_ids).await
    }

    /// Stop the acceptor and every connector, replicator and failure
    /// detector, cancelling pending retries.
    pub async fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
        self.stop_server().await;
        self.tasks.abort_all().await;
        self.client.close_all().await;
        tracing::info!(endpoint = %self.context.endpoint_id, "replication endpoint terminated");
    }

    /// Exactly one transition out of the created state is permitted
    fn acquire_lifecycle(&self) -> Result<()> {
        if self.terminated.load(Ordering::SeqCst) {
            return Err(Error::IllegalState("endpoint is terminated".into()));
        }
        if self
            .active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::IllegalState(
                "endpoint already activated or recovery in progress".into(),
            ));
        }
        Ok(())
    }

    async fn start_server(&self) -> Result<()> {
        let server = NetworkServer::bind(&self.bind_address).await?;
        tracing::info!(address = %server.local_addr(), "acceptor listening");
        let handler: Arc<dyn RequestHandler> = self.acceptor.clone();
        *self.server.lock().await = Some(server.spawn(handler));
        Ok(())
    }

    async fn stop_server(&self) {
        if let Some(server) = self.server.lock().await.take() {
            server.stop().await;
        }
    }

    async fn start_connectors(&self, mut preset: HashMap<PeerAddress, Vec<ReplicationLink>>) {
        for connection in &self.connections {
            let links = preset.remove(&connection.address());
            let connector = Connector::new(
                connection.clone(),
                Arc::clone(&self.context),
                Arc::clone(&self.client),
                Arc::clone(&self.acceptor),
                Arc::clone(&self.tasks),
            );
            self.tasks.track(tokio::spawn(connector.run(links))).await;
        }
    }
}

/// Group recovered links by the peer address they pull from, so connectors
/// can skip rediscovery.
fn group_by_source(links: Vec<RecoveryLink>) -> HashMap<PeerAddress, Vec<ReplicationLink>> {
    let mut grouped: HashMap<PeerAddress, Vec<ReplicationLink>> = HashMap::new();
    for link in links {
        grouped
            .entry(link.link.source.address.clone())
            .or_default()
            .push(link.link);
    }
    grouped
}
