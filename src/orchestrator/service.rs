use tracing::info;

use crate::error::AgentResult;
use crate::runner::RunnerResult;

use super::Orchestrator;

impl Orchestrator {
    pub async fn start_service(
        &self,
        kernel_id: &str,
        service: String,
        port: u16,
        protocol: String,
        options: serde_json::Value,
    ) -> AgentResult<RunnerResult> {
        self.await_restart_if_in_flight(kernel_id).await;
        self.registry.touch(kernel_id).await;
        let runner = self.ensure_runner(kernel_id).await?;
        info!(kernel_id, service = %service, port, "starting in-kernel service");
        runner.feed_start_service(service, port, protocol, options).await
    }
}
