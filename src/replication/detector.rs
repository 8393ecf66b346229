//! Failure Detector
//!
//! Aggregates per-(source endpoint, log) successes and failures and turns
//! them into availability events on the endpoint's event bus. `Available` is
//! rate-limited to one per detection window; a window that passes without
//! any success publishes `Unavailable` with the causes collected so far.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::endpoint::EndpointEvent;
use crate::error::Error;

pub(crate) enum DetectorSignal {
    Available,
    Failure(Error),
}

/// Handle used by a replicator to feed its failure detector
#[derive(Clone)]
pub(crate) struct FailureDetectorHandle {
    tx: mpsc::Sender<DetectorSignal>,
}

impl FailureDetectorHandle {
    pub(crate) async fn available(&self) {
        let _ = self.tx.send(DetectorSignal::Available).await;
    }

    pub(crate) async fn failure(&self, cause: Error) {
        let _ = self.tx.send(DetectorSignal::Failure(cause)).await;
    }
}

/// Spawn a failure detector for one (source endpoint, log name) pair
pub(crate) fn spawn(
    endpoint_id: String,
    log_name: String,
    limit: Duration,
    events: broadcast::Sender<EndpointEvent>,
) -> (FailureDetectorHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(64);
    let task = tokio::spawn(run(endpoint_id, log_name, limit, events, rx));
    (FailureDetectorHandle { tx }, task)
}

async fn run(
    endpoint_id: String,
    log_name: String,
    limit: Duration,
    events: broadcast::Sender<EndpointEvent>,
    mut rx: mpsc::Receiver<DetectorSignal>,
) {
    let mut causes: Vec<Arc<Error>> = Vec::new();
    let mut last_published: Option<Instant> = None;
    let mut deadline = Instant::now() + limit;

    loop {
        tokio::select! {
            signal = rx.recv() => match signal {
                None => break,
                Some(DetectorSignal::Available) => {
                    let publish = last_published
                        .map(|at| at.elapsed() >= limit)
                        .unwrap_or(true);
                    if publish {
                        tracing::debug!(endpoint_id = %endpoint_id, log_name = %log_name, "source available");
                        let _ = events.send(EndpointEvent::Available {
                            endpoint_id: endpoint_id.clone(),
                            log_name: log_name.clone(),
                        });
                        last_published = Some(Instant::now());
                    }
                    deadline = Instant::now() + limit;
                    causes.clear();
                }
                Some(DetectorSignal::Failure(cause)) => {
                    causes.push(Arc::new(cause));
                }
            },
            _ = tokio::time::sleep_until(deadline) => {
                tracing::warn!(
                    endpoint_id = %endpoint_id,
                    log_name = %log_name,
                    failures = causes.len(),
                    "source unavailable"
                );
                let _ = events.send(EndpointEvent::Unavailable {
                    endpoint_id: endpoint_id.clone(),
                    log_name: log_name.clone(),
                    causes: causes.drain(..).collect(),
                });
                deadline = Instant::now() + limit;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector(limit: Duration) -> (FailureDetectorHandle, broadcast::Receiver<EndpointEvent>) {
        let (events_tx, events_rx) = broadcast::channel(16);
        let (handle, _task) = spawn("a".to_string(), "X".to_string(), limit, events_tx);
        (handle, events_rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_success_publishes_available() {
        let (handle, mut events) = detector(Duration::from_secs(60));

        handle.available().await;
        match events.recv().await.unwrap() {
            EndpointEvent::Available {
                endpoint_id,
                log_name,
            } => {
                assert_eq!(endpoint_id, "a");
                assert_eq!(log_name, "X");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_available_is_rate_limited() {
        let (handle, mut events) = detector(Duration::from_secs(60));

        handle.available().await;
        assert!(matches!(
            events.recv().await.unwrap(),
            EndpointEvent::Available { .. }
        ));

        // A second success inside the window stays silent.
        handle.available().await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(events.try_recv().is_err());

        // After the window it is published again. The silent stretch in
        // between may have reported Unavailable; skip past those.
        tokio::time::sleep(Duration::from_secs(60)).await;
        handle.available().await;
        loop {
            match events.recv().await.unwrap() {
                EndpointEvent::Available { .. } => break,
                EndpointEvent::Unavailable { .. } => continue,
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_publishes_unavailable_with_causes() {
        let (handle, mut events) = detector(Duration::from_secs(60));

        handle
            .failure(Error::Network("first failure".into()))
            .await;
        handle
            .failure(Error::Network("second failure".into()))
            .await;

        match events.recv().await.unwrap() {
            EndpointEvent::Unavailable { causes, .. } => {
                assert_eq!(causes.len(), 2);
                assert!(causes[0].to_string().contains("first failure"));
            }
            other => panic!("unexpected event: {other:?}"),
        }

        // Causes were drained; the next window reports none.
        match events.recv().await.unwrap() {
            EndpointEvent::Unavailable { causes, .. } => assert!(causes.is_empty()),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_window() {
        let (handle, mut events) = detector(Duration::from_secs(60));

        handle.failure(Error::Network("transient".into())).await;
        tokio::time::sleep(Duration::from_secs(30)).await;

        handle.available().await;
        assert!(matches!(
            events.recv().await.unwrap(),
            EndpointEvent::Available { .. }
        ));

        // The collected cause was cleared by the success; the eventual
        // Unavailable carries no stale causes.
        match events.recv().await.unwrap() {
            EndpointEvent::Unavailable { causes, .. } => assert!(causes.is_empty()),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
