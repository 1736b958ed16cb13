pub mod create;
pub mod destroy;
pub mod execute;
pub mod files;
pub mod restart;
pub mod service;
pub mod types;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex, RwLock};
use tracing::{info, warn};

use crate::config::AgentConfig;
use crate::docker::DockerManager;
use crate::error::{AgentError, AgentResult};
use crate::events::{EventPublisher, TerminationReason};
use crate::registry::KernelRegistry;
use crate::resources::ResourceMaps;
use crate::runner::{KernelRunner, RunnerFeatures};
use crate::stats::StatsCollector;

use self::restart::RestartTracker;

/// How long `destroy_all(.., wait = true)` waits for each kernel's
/// `clean_kernel` to finish before giving up on it (§4.12 shutdown).
const BLOCKING_CLEAN_TIMEOUT: Duration = Duration::from_secs(15);

/// The orchestrator owns every piece of shared mutable state the kernel
/// lifecycle touches (registry, resource maps) and every collaborator it
/// talks to (daemon, stats fan-in, event publisher). Cloning is cheap — it
/// is a handle of `Arc`s, matching how the host crate's own scheduler-shaped
/// types are passed around `axum` state.
#[derive(Clone)]
pub struct Orchestrator {
    pub(crate) config: Arc<AgentConfig>,
    pub(crate) docker: DockerManager,
    pub(crate) resources: ResourceMaps,
    pub(crate) registry: KernelRegistry,
    pub(crate) publisher: EventPublisher,
    pub(crate) stats: StatsCollector,
    pub(crate) restart_trackers: Arc<RwLock<HashMap<String, Arc<RestartTracker>>>>,
    /// The reason a not-yet-dead kernel is *intentionally* being destroyed,
    /// recorded just before the container is killed so the event reaper's
    /// `die`-triggered publish (`events/reaper.rs`) can report the real
    /// reason instead of always guessing `self-terminated` — and so the two
    /// paths publish `kernel_terminated` exactly once between them, not
    /// twice (§8 P7).
    pub(crate) pending_reasons: Arc<RwLock<HashMap<String, TerminationReason>>>,
    /// Per-kernel completion signal for a shutdown-style `destroy_all(..,
    /// wait = true)`: registered before the destroy is issued, signalled by
    /// `clean_kernel` once it finishes freeing that kernel's resources.
    /// Stands in for §4.12's `blocking_cleans` event.
    blocking_cleans: Arc<RwLock<HashMap<String, watch::Sender<bool>>>>,
    runner_creation_lock: Arc<Mutex<()>>,
}

impl Orchestrator {
    pub fn new(
        config: Arc<AgentConfig>,
        docker: DockerManager,
        resources: ResourceMaps,
        registry: KernelRegistry,
        publisher: EventPublisher,
        stats: StatsCollector,
    ) -> Self {
        Self {
            config,
            docker,
            resources,
            registry,
            publisher,
            stats,
            restart_trackers: Arc::new(RwLock::new(HashMap::new())),
            pending_reasons: Arc::new(RwLock::new(HashMap::new())),
            blocking_cleans: Arc::new(RwLock::new(HashMap::new())),
            runner_creation_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Register a completion gate for `kernel_id` before issuing its
    /// destroy, so a later `await_blocking_clean` can't miss a `clean_kernel`
    /// that finishes first — the channel is state-based, not edge-based, so
    /// there's no window to lose the signal the way a plain `Notify` would.
    async fn register_blocking_clean(&self, kernel_id: &str) {
        let (tx, _rx) = watch::channel(false);
        self.blocking_cleans
            .write()
            .await
            .insert(kernel_id.to_string(), tx);
    }

    /// Wait (up to `BLOCKING_CLEAN_TIMEOUT`) for `clean_kernel` to finish for
    /// a kernel previously passed to `register_blocking_clean`. Safe to call
    /// even if the kernel was never registered or already finished.
    async fn await_blocking_clean(&self, kernel_id: &str) {
        let mut rx = {
            let gates = self.blocking_cleans.read().await;
            match gates.get(kernel_id) {
                Some(tx) => tx.subscribe(),
                None => return,
            }
        };
        if *rx.borrow() {
            self.blocking_cleans.write().await.remove(kernel_id);
            return;
        }
        let _ = tokio::time::timeout(BLOCKING_CLEAN_TIMEOUT, rx.changed()).await;
        self.blocking_cleans.write().await.remove(kernel_id);
    }

    /// Signal that `clean_kernel` has finished for `kernel_id`, waking any
    /// `await_blocking_clean` waiter. A no-op if nothing registered a gate.
    async fn signal_blocking_clean(&self, kernel_id: &str) {
        if let Some(tx) = self.blocking_cleans.read().await.get(kernel_id) {
            let _ = tx.send(true);
        }
    }

    pub fn registry(&self) -> &KernelRegistry {
        &self.registry
    }

    pub async fn ping_kernel(&self, kernel_id: &str) -> AgentResult<()> {
        if self.registry.contains(kernel_id).await {
            self.registry.touch(kernel_id).await;
            Ok(())
        } else {
            Err(AgentError::NotFound(kernel_id.to_string()))
        }
    }

    pub async fn get_logs(&self, kernel_id: &str) -> AgentResult<String> {
        self.registry.touch(kernel_id).await;
        let container_id = self
            .registry
            .with_mut(kernel_id, |r| r.container_id.clone())
            .await
            .ok_or_else(|| AgentError::NotFound(kernel_id.to_string()))?;
        self.docker
            .logs_tail(&container_id)
            .await
            .map_err(AgentError::Other)
    }

    /// Construct (or reuse) the single runner for a kernel. Runner
    /// *construction* is serialized process-wide by `runner_creation_lock`;
    /// the lock is released before any network I/O past the TCP handshake,
    /// so it never gates `get_next_result`/`feed_*` traffic (P6).
    pub(crate) async fn ensure_runner(&self, kernel_id: &str) -> AgentResult<KernelRunner> {
        if let Some(Some(runner)) = self
            .registry
            .with_mut(kernel_id, |r| r.runner.clone())
            .await
        {
            return Ok(runner);
        }

        let _guard = self.runner_creation_lock.lock().await;

        // Re-check: another task may have constructed the runner while we
        // waited for the lock.
        if let Some(Some(runner)) = self
            .registry
            .with_mut(kernel_id, |r| r.runner.clone())
            .await
        {
            return Ok(runner);
        }

        let (host, repl_in_port) = self
            .registry
            .with_mut(kernel_id, |r| (r.kernel_host.clone(), r.repl_in_port))
            .await
            .ok_or_else(|| AgentError::NotFound(kernel_id.to_string()))?;

        let runner = KernelRunner::connect(&host, repl_in_port, RunnerFeatures::default()).await?;

        self.registry
            .with_mut(kernel_id, |r| r.runner = Some(runner.clone()))
            .await;

        Ok(runner)
    }

    /// The shared cleanup path invoked from both `destroy_kernel` and the
    /// event reaper on `die`. Per §4.10, container deletion and port return
    /// happen unconditionally first; only the scratch-dir/CPU/accelerator
    /// free and the registry removal are skipped when a restart is in
    /// flight for this kernel — the upcoming re-create reuses those
    /// allocations and will overwrite the registry entry itself.
    pub async fn clean_kernel(&self, kernel_id: &str) {
        info!(kernel_id, "cleaning up kernel");

        let runner = self
            .registry
            .with_mut(kernel_id, |r| r.runner.take())
            .await
            .flatten();
        if let Some(runner) = runner {
            runner.close().await;
        }

        let snapshot = self
            .registry
            .with_mut(kernel_id, |r| (r.container_id.clone(), r.host_ports.clone()))
            .await;
        let Some((container_id, host_ports)) = snapshot else {
            self.signal_blocking_clean(kernel_id).await;
            return;
        };

        if let Err(e) = self
            .docker
            .remove_container(&container_id, self.config.debug_skip_container_deletion)
            .await
        {
            warn!(kernel_id, error = %e, "failed to remove container during cleanup");
        }

        {
            let mut ports = self.resources.ports.write().await;
            ports.free_group(&host_ports);
        }

        // Prune the old container-id index entry now — if a restart is in
        // flight the registry entry itself survives (it's about to be
        // overwritten by the re-create's `insert`, not removed), so
        // `remove`'s own index cleanup below would never run for it.
        self.registry.forget_container(&container_id);
        self.stats.forget_container(&container_id).await;

        let tracker = {
            let trackers = self.restart_trackers.read().await;
            trackers.get(kernel_id).cloned()
        };

        if let Some(tracker) = tracker {
            tracker.signal_destroyed();
            self.signal_blocking_clean(kernel_id).await;
            return;
        }

        let record = self.registry.remove(kernel_id).await;
        let Some(record) = record else {
            self.signal_blocking_clean(kernel_id).await;
            return;
        };

        {
            let mut cpu = self.resources.cpu.write().await;
            cpu.free(&record.resource_spec.cpu_set);
        }
        {
            let mut accel = self.resources.accelerators.write().await;
            for (class, shares) in &record.resource_spec.accelerator_shares {
                if let Some(map) = accel.get_mut(class) {
                    map.free(shares);
                }
            }
        }

        let scratch_dir = format!("{}/{}", self.config.scratch_root, kernel_id);
        if let Err(e) = tokio::fs::remove_dir_all(&scratch_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(kernel_id, error = %e, "failed to remove scratch directory");
            }
        }

        self.signal_blocking_clean(kernel_id).await;
    }

    /// Destroy every live kernel with the given reason, used by both
    /// `reset()` and the shutdown sequence. Returns once every kernel has
    /// been asked to stop; when `wait` is set, also blocks on each kernel's
    /// `clean_kernel` actually finishing (§4.12's `blocking_cleans`) before
    /// returning, so the caller can safely tear down the Docker client and
    /// stats task right after.
    pub async fn destroy_all(&self, reason: TerminationReason, wait: bool) {
        let ids = self.registry.all_kernel_ids().await;
        for id in ids {
            if wait {
                self.register_blocking_clean(&id).await;
            }
            if let Err(e) = self.destroy_kernel_reason(&id, reason, wait).await {
                warn!(kernel_id = %id, error = %e, "failed to destroy kernel during bulk teardown");
            }
            if wait {
                self.await_blocking_clean(&id).await;
            }
        }
    }

    pub async fn reset(&self) {
        self.destroy_all(TerminationReason::AgentReset, false).await;
    }
}
