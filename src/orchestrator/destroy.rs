use tracing::{debug, info, warn};

use crate::error::AgentResult;
use crate::events::TerminationReason;

use super::Orchestrator;

impl Orchestrator {
    pub async fn destroy_kernel(
        &self,
        kernel_id: &str,
    ) -> AgentResult<Option<std::collections::HashMap<String, serde_json::Value>>> {
        self.destroy_kernel_reason(kernel_id, TerminationReason::UserRequested, true)
            .await
    }

    /// Kill the container and wait for the stats collector to observe its
    /// `terminated` status, returning the last sample. Resource freeing and
    /// registry removal happen in `clean_kernel`, invoked here on 404/409
    /// "not running", or otherwise left to the event reaper's `die` handler.
    pub(crate) async fn destroy_kernel_reason(
        &self,
        kernel_id: &str,
        reason: TerminationReason,
        wait_for_stats: bool,
    ) -> AgentResult<Option<std::collections::HashMap<String, serde_json::Value>>> {
        debug!(kernel_id, reason = reason.as_str(), "destroying kernel");

        let container_id = self
            .registry
            .with_mut(kernel_id, |r| r.container_id.clone())
            .await;

        let Some(container_id) = container_id else {
            self.publisher
                .kernel_terminated(kernel_id, TerminationReason::SelfTerminated, None)
                .await;
            self.clean_kernel(kernel_id).await;
            return Ok(None);
        };

        let runner = self.registry.with_mut(kernel_id, |r| r.runner.take()).await.flatten();
        if let Some(runner) = runner {
            runner.close().await;
        }

        // Record the real reason before killing, so the `die` event this
        // kill produces is reported by the reaper with `reason` instead of
        // a guessed `self-terminated` — and so the event fires exactly once
        // (P7), not once here and again off the reaper's die handler.
        self.pending_reasons
            .write()
            .await
            .insert(kernel_id.to_string(), reason);

        if let Err(e) = self.docker.kill_container(&container_id).await {
            warn!(kernel_id, error = %e, "failed to kill container, treating as already dead");
            self.pending_reasons.write().await.remove(kernel_id);
            self.clean_kernel(kernel_id).await;
            return Ok(None);
        }

        if wait_for_stats {
            let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
            while tokio::time::Instant::now() < deadline {
                if self.stats.is_terminated(&container_id).await {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }

        let last_stat = self.stats.last_stat(&container_id).await;
        info!(kernel_id, "kernel destroyed");
        Ok(last_stat)
    }
}
