use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tracing::{info, warn};

use crate::error::{AgentError, AgentResult};
use crate::events::TerminationReason;

use super::types::{CreateKernelConfig, RestartKernelResponse};
use super::Orchestrator;

const RESTART_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-kernel restart coordination: `{Idle -> Destroying -> AwaitingCreate ->
/// Running}`. `request_lock` serializes concurrent restarts of the same
/// kernel; `destroy`/`done` are `watch` channels rather than `Notify` so a
/// transition signalled from the event reaper's own task before
/// `restart_kernel` starts waiting on it is never lost — `Notify::notify_
/// waiters` only wakes waiters already polling, which would otherwise race
/// `clean_kernel`'s background signal and stall every restart for the full
/// timeout.
pub struct RestartTracker {
    request_lock: Mutex<()>,
    destroy_tx: watch::Sender<bool>,
    destroy_rx: watch::Receiver<bool>,
    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
}

impl RestartTracker {
    fn new() -> Self {
        let (destroy_tx, destroy_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);
        Self {
            request_lock: Mutex::new(()),
            destroy_tx,
            destroy_rx,
            done_tx,
            done_rx,
        }
    }

    pub(crate) fn signal_destroyed(&self) {
        let _ = self.destroy_tx.send(true);
    }

    pub(crate) fn signal_done(&self) {
        let _ = self.done_tx.send(true);
    }

    fn reset(&self) {
        let _ = self.destroy_tx.send(false);
        let _ = self.done_tx.send(false);
    }

    /// Wait up to `timeout` for `signal_destroyed`. Returns `true` if it
    /// fired (including if it already had, before this call started).
    async fn await_destroyed(&self, timeout: Duration) -> bool {
        let mut rx = self.destroy_rx.clone();
        if *rx.borrow() {
            return true;
        }
        tokio::time::timeout(timeout, async {
            loop {
                if rx.changed().await.is_err() {
                    return;
                }
                if *rx.borrow() {
                    return;
                }
            }
        })
        .await
        .is_ok()
    }

    /// Block until a restart in flight for this kernel completes. A no-op if
    /// no restart is in progress or it has already finished.
    pub async fn await_done(&self) {
        let mut rx = self.done_rx.clone();
        if *rx.borrow() {
            return;
        }
        loop {
            if rx.changed().await.is_err() {
                return;
            }
            if *rx.borrow() {
                return;
            }
        }
    }
}

impl Orchestrator {
    pub async fn restart_kernel(
        &self,
        kernel_id: &str,
        new_config: CreateKernelConfig,
    ) -> AgentResult<RestartKernelResponse> {
        let tracker = {
            let mut trackers = self.restart_trackers.write().await;
            trackers
                .entry(kernel_id.to_string())
                .or_insert_with(|| Arc::new(RestartTracker::new()))
                .clone()
        };

        let _request_guard = tracker.request_lock.lock().await;
        tracker.reset();

        info!(kernel_id, "restarting kernel");

        // Step 1: destroy with reason `restarting`.
        self.destroy_kernel_reason(kernel_id, TerminationReason::Restarting, false)
            .await?;

        // Step 2: wait on destroy signal, capped at RESTART_TIMEOUT.
        let destroyed = tracker.await_destroyed(RESTART_TIMEOUT).await;

        if !destroyed {
            warn!(kernel_id, "restart timed out waiting for destroy to complete");
            let mut trackers = self.restart_trackers.write().await;
            trackers.remove(kernel_id);
            drop(trackers);
            self.clean_kernel(kernel_id).await;
            return Err(AgentError::RestartTimeout(kernel_id.to_string()));
        }

        // Step 3: re-create, reusing the on-disk resource spec verbatim.
        let created = self
            .create_kernel_inner(kernel_id.to_string(), new_config, true)
            .await;

        {
            let mut trackers = self.restart_trackers.write().await;
            trackers.remove(kernel_id);
        }

        let created = created?;
        tracker.signal_done();

        info!(kernel_id, container_id = %created.container_id, "kernel restarted");

        Ok(RestartKernelResponse {
            container_id: created.container_id,
            repl_in_port: created.repl_in_port,
            repl_out_port: created.repl_out_port,
            stdin_port: created.stdin_port,
            stdout_port: created.stdout_port,
            service_ports: created.service_ports,
        })
    }

    /// Used by `execute` (§4.7 step 1): await any in-flight restart of this
    /// kernel before proceeding, so the call observes the fresh container.
    pub(crate) async fn await_restart_if_in_flight(&self, kernel_id: &str) {
        let tracker = {
            let trackers = self.restart_trackers.read().await;
            trackers.get(kernel_id).cloned()
        };
        if let Some(tracker) = tracker {
            if tracker.request_lock.try_lock().is_err() {
                tracker.await_done().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn await_destroyed_does_not_miss_a_signal_sent_before_the_wait_starts() {
        let tracker = Arc::new(RestartTracker::new());
        tracker.reset();
        // Signal before anyone calls await_destroyed — this is the exact
        // race a background reaper task can win against restart_kernel.
        tracker.signal_destroyed();
        let destroyed = tracker.await_destroyed(Duration::from_millis(50)).await;
        assert!(destroyed);
    }

    #[tokio::test]
    async fn await_destroyed_times_out_when_never_signalled() {
        let tracker = Arc::new(RestartTracker::new());
        tracker.reset();
        let destroyed = tracker.await_destroyed(Duration::from_millis(20)).await;
        assert!(!destroyed);
    }

    #[tokio::test]
    async fn await_done_unblocks_a_waiter_signalled_after_it_starts_waiting() {
        let tracker = Arc::new(RestartTracker::new());
        tracker.reset();
        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move {
                tracker.await_done().await;
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        tracker.signal_done();
        tokio::time::timeout(Duration::from_millis(100), waiter)
            .await
            .expect("await_done should unblock")
            .unwrap();
    }

    #[tokio::test]
    async fn reset_clears_a_previously_signalled_tracker_for_reuse() {
        let tracker = Arc::new(RestartTracker::new());
        tracker.signal_destroyed();
        tracker.signal_done();
        tracker.reset();
        assert!(!tracker.await_destroyed(Duration::from_millis(20)).await);
    }
}
