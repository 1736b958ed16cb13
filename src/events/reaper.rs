use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::{mpsc, RwLock};
use tracing::{info, warn};

use crate::docker::DockerManager;
use crate::events::{EventPublisher, TerminationReason};
use crate::image::kernel_id_from_container_name;

/// One dedup footprint: `(event type, action, actor id)`. Two events with an
/// identical footprint back-to-back are collapsed into one.
type Footprint = (String, String, String);

/// Consumes the daemon's event stream, publishes `kernel_terminated` for
/// `die` events, and hands the resolved kernel-id to the caller's cleanup
/// channel. Reconnects on stream error; exits cleanly when `shutdown` fires.
pub struct ContainerEventReaper {
    docker: DockerManager,
    publisher: EventPublisher,
    /// Reasons recorded by an in-flight `destroy_kernel_reason` for kernels
    /// it is intentionally killing, keyed by kernel-id. Consulted (and
    /// cleared) here so a die event produced by an intentional kill is
    /// published with the real reason instead of a guessed
    /// `self-terminated`, and so `kernel_terminated` fires exactly once per
    /// destroy rather than once from the caller and once from this reaper.
    pending_reasons: Arc<RwLock<HashMap<String, TerminationReason>>>,
}

impl ContainerEventReaper {
    pub fn new(
        docker: DockerManager,
        publisher: EventPublisher,
        pending_reasons: Arc<RwLock<HashMap<String, TerminationReason>>>,
    ) -> Self {
        Self {
            docker,
            publisher,
            pending_reasons,
        }
    }

    /// Run the reaper loop until `shutdown` resolves. Resolved kernel-ids
    /// needing `clean_kernel` are sent on `clean_tx`.
    pub async fn run(
        &self,
        clean_tx: mpsc::UnboundedSender<String>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        let mut last_footprint: Option<Footprint> = None;

        loop {
            if *shutdown.borrow() {
                return;
            }

            let mut stream = self.docker.container_events();
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                    }
                    next = stream.next() => {
                        match next {
                            Some(Ok(event)) => {
                                self.handle_event(event, &mut last_footprint, &clean_tx).await;
                            }
                            Some(Err(e)) => {
                                warn!(error = %e, "container event stream error, reconnecting");
                                break;
                            }
                            None => {
                                warn!("container event stream ended, reconnecting");
                                break;
                            }
                        }
                    }
                }
            }
        }
    }

    async fn handle_event(
        &self,
        event: bollard::models::EventMessage,
        last_footprint: &mut Option<Footprint>,
        clean_tx: &mpsc::UnboundedSender<String>,
    ) {
        let typ = event
            .typ
            .map(|t| format!("{t:?}"))
            .unwrap_or_else(|| "unknown".to_string());
        let action = event.action.unwrap_or_default();
        let actor_id = event
            .actor
            .as_ref()
            .and_then(|a| a.id.clone())
            .unwrap_or_default();

        let footprint = (typ, action.clone(), actor_id.clone());
        if last_footprint.as_ref() == Some(&footprint) {
            return;
        }
        *last_footprint = Some(footprint);

        if action != "die" {
            return;
        }

        let name = event
            .actor
            .and_then(|a| a.attributes)
            .and_then(|attrs| attrs.get("name").cloned())
            .unwrap_or_default();

        let Some(kernel_id) = kernel_id_from_container_name(&name) else {
            return;
        };

        info!(kernel_id, container = %actor_id, "container died, scheduling cleanup");
        let reason = self
            .pending_reasons
            .write()
            .await
            .remove(&kernel_id)
            .unwrap_or(TerminationReason::SelfTerminated);
        self.publisher.kernel_terminated(&kernel_id, reason, None).await;

        if clean_tx.send(kernel_id.clone()).is_err() {
            warn!(kernel_id, "cleanup channel closed, dropping die event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bollard::models::{EventMessage, EventMessageActor, EventMessageTypeEnum};
    use std::collections::HashMap;

    fn die_event(container_name: &str, actor_id: &str) -> EventMessage {
        let mut attrs = HashMap::new();
        attrs.insert("name".to_string(), container_name.to_string());
        EventMessage {
            typ: Some(EventMessageTypeEnum::CONTAINER),
            action: Some("die".to_string()),
            actor: Some(EventMessageActor {
                id: Some(actor_id.to_string()),
                attributes: Some(attrs),
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn dedups_consecutive_identical_footprints() {
        let docker = DockerManager::test_dummy();
        let publisher = EventPublisher::new("agent-1".into(), "127.0.0.1:1".into());
        let reaper = ContainerEventReaper::new(docker, publisher, Arc::new(RwLock::new(HashMap::new())));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut last = None;

        let e1 = die_event("kernel.python.k1", "c1");
        let e2 = die_event("kernel.python.k1", "c1");
        let e3 = die_event("kernel.python.k2", "c2");

        reaper.handle_event(e1, &mut last, &tx).await;
        reaper.handle_event(e2, &mut last, &tx).await;
        reaper.handle_event(e3, &mut last, &tx).await;

        drop(tx);
        let mut received = Vec::new();
        while let Some(id) = rx.recv().await {
            received.push(id);
        }
        assert_eq!(received, vec!["k1".to_string(), "k2".to_string()]);
    }

    #[tokio::test]
    async fn non_kernel_container_names_are_ignored() {
        let docker = DockerManager::test_dummy();
        let publisher = EventPublisher::new("agent-1".into(), "127.0.0.1:1".into());
        let reaper = ContainerEventReaper::new(docker, publisher, Arc::new(RwLock::new(HashMap::new())));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut last = None;

        reaper
            .handle_event(die_event("some-other-service", "c9"), &mut last, &tx)
            .await;
        drop(tx);
        assert!(rx.recv().await.is_none());
    }
}
