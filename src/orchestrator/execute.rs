use std::collections::HashMap;

use tracing::warn;

use crate::error::{AgentError, AgentResult};
use crate::events::TerminationReason;

use super::types::{ExecuteMode, ExecuteRequest, ExecuteResponse, OutputFileManifest};
use super::Orchestrator;

const OUTPUT_FILE_CAP_BYTES: u64 = 100 * 1024 * 1024;

impl Orchestrator {
    pub async fn execute(
        &self,
        kernel_id: &str,
        req: ExecuteRequest,
    ) -> AgentResult<ExecuteResponse> {
        // Step 1: if a restart is in flight, wait for it.
        self.await_restart_if_in_flight(kernel_id).await;

        // Step 2: look up the record.
        if !self.registry.contains(kernel_id).await {
            self.publisher
                .kernel_terminated(kernel_id, TerminationReason::SelfTerminated, None)
                .await;
            return Err(AgentError::NotFound(kernel_id.to_string()));
        }

        // Step 3: touch last_used, ensure runner.
        self.registry.touch(kernel_id).await;
        let runner = self.ensure_runner(kernel_id).await?;

        let run_id = req.run_id.clone().unwrap_or_else(|| kernel_id.to_string());
        self.registry
            .with_mut(kernel_id, |r| {
                r.runner_tasks.insert(run_id.clone());
            })
            .await;

        // Step 9: if this future is dropped before the result comes back
        // (e.g. the caller's connection went away), this guard's `Drop`
        // plays the part of `asyncio`'s `CancelledError` handler — closing
        // the runner and clearing it from the record — instead of leaking
        // the task bookkeeping and a runner nobody can reach any more.
        let mut task_guard = RunTaskGuard::new(self.clone(), kernel_id.to_string(), run_id.clone());

        let output_dir = format!("{}/work/.output", self.scratch_dir(kernel_id));
        let initial_stats = scan_output_dir(&output_dir).await;

        let flush_timeout = std::time::Duration::from_millis(req.flush_timeout_ms.unwrap_or(2000));

        // Step 5: dispatch by mode.
        let send_result = match req.mode {
            ExecuteMode::Batch => runner.feed_batch(req.opts.clone()).await,
            ExecuteMode::Query => runner.feed_code(req.code.clone()).await,
            ExecuteMode::Input => runner.feed_input(req.code.clone()).await,
            ExecuteMode::Continue => Ok(()),
        };

        if let Err(e) = send_result {
            task_guard.disarm();
            self.registry
                .with_mut(kernel_id, |r| {
                    r.runner_tasks.remove(&run_id);
                })
                .await;
            return Err(e);
        }

        // Step 6: await the result.
        let result = runner.get_next_result(req.api_version, flush_timeout).await;

        task_guard.disarm();
        self.registry
            .with_mut(kernel_id, |r| {
                r.runner_tasks.remove(&run_id);
            })
            .await;

        let result = match result {
            Ok(r) => r,
            Err(AgentError::RunnerTimeout(msg)) => {
                warn!(kernel_id, "runner timed out, closing connection");
                if let Some(runner) = self.registry.with_mut(kernel_id, |r| r.runner.take()).await.flatten() {
                    runner.close().await;
                }
                return Err(AgentError::RunnerTimeout(msg));
            }
            Err(e) => return Err(e),
        };

        // Step 7/8: on finish/exec-timeout, diff `.output` and report files.
        let mut files = Vec::new();
        if result.status == "finished" || result.status == "exec-timeout" {
            let upload_requested = result
                .options
                .as_ref()
                .and_then(|o| o.get("upload_output_files"))
                .and_then(|v| v.as_bool())
                .unwrap_or(true);

            if upload_requested {
                let final_stats = scan_output_dir(&output_dir).await;
                files = diff_output_stats(&initial_stats, &final_stats);
            }
        }

        if result.status == "exec-timeout" {
            let orch = self.clone();
            let kernel_id = kernel_id.to_string();
            tokio::spawn(async move {
                if let Err(e) = orch
                    .destroy_kernel_reason(&kernel_id, TerminationReason::ExecTimeout, false)
                    .await
                {
                    warn!(kernel_id = %kernel_id, error = %e, "failed to destroy kernel after exec-timeout");
                }
            });
        }

        Ok(ExecuteResponse {
            status: result.status,
            console: result.console,
            exceptions: result.exceptions,
            options: result.options,
            files,
        })
    }

    pub async fn interrupt_kernel(&self, kernel_id: &str) -> AgentResult<()> {
        self.await_restart_if_in_flight(kernel_id).await;
        self.registry.touch(kernel_id).await;
        let runner = self.ensure_runner(kernel_id).await?;
        runner.feed_interrupt().await
    }

    pub async fn get_completions(
        &self,
        kernel_id: &str,
        text: String,
        opts: serde_json::Value,
    ) -> AgentResult<Vec<String>> {
        self.await_restart_if_in_flight(kernel_id).await;
        self.registry.touch(kernel_id).await;
        let runner = self.ensure_runner(kernel_id).await?;
        let result = runner.feed_and_get_completion(text, opts).await?;
        Ok(result
            .console
            .into_iter()
            .filter_map(|v| v.as_str().map(String::from))
            .collect())
    }
}

/// Armed for the lifetime of one `execute` call's in-flight runner I/O;
/// `disarm` once the call reaches a normal exit. If dropped while still
/// armed — the only way that happens is the surrounding future itself being
/// dropped, i.e. cancellation — spawns the cleanup `execute`'s own
/// cancellation branch would otherwise have run inline.
struct RunTaskGuard {
    orchestrator: Orchestrator,
    kernel_id: String,
    run_id: String,
    armed: bool,
}

impl RunTaskGuard {
    fn new(orchestrator: Orchestrator, kernel_id: String, run_id: String) -> Self {
        Self {
            orchestrator,
            kernel_id,
            run_id,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for RunTaskGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let orchestrator = self.orchestrator.clone();
        let kernel_id = self.kernel_id.clone();
        let run_id = self.run_id.clone();
        tokio::spawn(async move {
            warn!(kernel_id = %kernel_id, run_id = %run_id, "execute cancelled, closing runner");
            let runner = orchestrator
                .registry()
                .with_mut(&kernel_id, |r| {
                    r.runner_tasks.remove(&run_id);
                    r.runner.take()
                })
                .await
                .flatten();
            if let Some(runner) = runner {
                runner.close().await;
            }
        });
    }
}

async fn scan_output_dir(dir: &str) -> HashMap<String, (u64, std::time::SystemTime)> {
    let mut out = HashMap::new();
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return out;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let Ok(meta) = entry.metadata().await else {
            continue;
        };
        if !meta.is_file() {
            continue;
        }
        let size = meta.len();
        let modified = meta.modified().unwrap_or(std::time::SystemTime::UNIX_EPOCH);
        if let Some(name) = entry.file_name().to_str() {
            out.insert(name.to_string(), (size, modified));
        }
    }
    out
}

fn diff_output_stats(
    initial: &HashMap<String, (u64, std::time::SystemTime)>,
    finalv: &HashMap<String, (u64, std::time::SystemTime)>,
) -> Vec<OutputFileManifest> {
    let mut out = Vec::new();
    for (name, (size, modified)) in finalv {
        let changed = match initial.get(name) {
            Some((prev_size, prev_modified)) => prev_size != size || prev_modified != modified,
            None => true,
        };
        if changed && *size > 0 && *size < OUTPUT_FILE_CAP_BYTES {
            out.push(OutputFileManifest {
                filename: name.clone(),
                size: *size,
            });
        }
    }
    out
}
