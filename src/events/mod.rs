pub mod reaper;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::warn;

/// Reasons a kernel can be reported terminated. Carried as the `detail`
/// argument of a `kernel_terminated` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    SelfTerminated,
    UserRequested,
    Restarting,
    ExecTimeout,
    IdleTimeout,
    AgentReset,
    AgentTermination,
}

impl TerminationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminationReason::SelfTerminated => "self-terminated",
            TerminationReason::UserRequested => "user-requested",
            TerminationReason::Restarting => "restarting",
            TerminationReason::ExecTimeout => "exec-timeout",
            TerminationReason::IdleTimeout => "idle-timeout",
            TerminationReason::AgentReset => "agent-reset",
            TerminationReason::AgentTermination => "agent-termination",
        }
    }
}

/// Fire-and-forget publisher for agent/kernel lifecycle events. Each event is
/// framed as `[event_name, instance_id, msgpack(args)]` and written to the
/// configured event address; failures are logged, never propagated — the
/// orchestrator's correctness never depends on an event actually arriving.
#[derive(Clone)]
pub struct EventPublisher {
    instance_id: String,
    conn: std::sync::Arc<Mutex<Option<TcpStream>>>,
    addr: String,
}

impl EventPublisher {
    pub fn new(instance_id: String, addr: String) -> Self {
        Self {
            instance_id,
            conn: std::sync::Arc::new(Mutex::new(None)),
            addr,
        }
    }

    async fn ensure_connected(&self) -> std::io::Result<()> {
        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            *guard = Some(TcpStream::connect(&self.addr).await?);
        }
        Ok(())
    }

    async fn publish_raw(&self, event_name: &str, args: &serde_json::Value) {
        let payload = match rmp_serde::to_vec(&(event_name, &self.instance_id, args)) {
            Ok(p) => p,
            Err(e) => {
                warn!(event = event_name, error = %e, "failed to encode event");
                return;
            }
        };

        if let Err(e) = self.ensure_connected().await {
            warn!(event = event_name, error = %e, "event publisher not connected");
            return;
        }

        let mut guard = self.conn.lock().await;
        if let Some(stream) = guard.as_mut() {
            let result = async {
                stream.write_u32(payload.len() as u32).await?;
                stream.write_all(&payload).await
            }
            .await;
            if let Err(e) = result {
                warn!(event = event_name, error = %e, "failed to publish event, dropping connection");
                *guard = None;
            }
        }
    }

    pub async fn instance_started(&self) {
        self.publish_raw("instance_started", &serde_json::json!({})).await;
    }

    pub async fn instance_terminated(&self, reason: &str) {
        self.publish_raw("instance_terminated", &serde_json::json!({ "reason": reason }))
            .await;
    }

    pub async fn instance_heartbeat(&self, payload: serde_json::Value) {
        self.publish_raw("instance_heartbeat", &payload).await;
    }

    pub async fn kernel_creating(&self, kernel_id: &str) {
        self.publish_raw("kernel_creating", &serde_json::json!({ "kernel_id": kernel_id }))
            .await;
    }

    pub async fn kernel_terminated(
        &self,
        kernel_id: &str,
        reason: TerminationReason,
        detail: Option<&str>,
    ) {
        self.publish_raw(
            "kernel_terminated",
            &serde_json::json!({
                "kernel_id": kernel_id,
                "reason": reason.as_str(),
                "detail": detail,
            }),
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn termination_reason_strings_match_wire_contract() {
        assert_eq!(TerminationReason::SelfTerminated.as_str(), "self-terminated");
        assert_eq!(TerminationReason::ExecTimeout.as_str(), "exec-timeout");
        assert_eq!(TerminationReason::AgentTermination.as_str(), "agent-termination");
    }

    #[tokio::test]
    async fn publish_against_unreachable_address_does_not_panic() {
        let publisher = EventPublisher::new("agent-1".into(), "127.0.0.1:1".into());
        publisher.instance_started().await;
        publisher
            .kernel_terminated("k1", TerminationReason::IdleTimeout, None)
            .await;
    }
}
