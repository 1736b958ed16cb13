use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::RwLock;

use crate::image::ImageRef;
use crate::resources::ports::ServicePortDecl;
use crate::resources::spec::KernelResourceSpec;
use crate::runner::KernelRunner;

/// A bound service port — the declared container-side port plus the host
/// port actually drawn from the pool for it.
#[derive(Debug, Clone)]
pub struct BoundServicePort {
    pub decl: ServicePortDecl,
    pub host_port: u16,
}

/// Everything the agent knows about one live kernel.
pub struct KernelRecord {
    pub kernel_id: String,
    pub image: ImageRef,
    pub container_id: String,
    pub kernel_host: String,
    pub repl_in_port: u16,
    pub repl_out_port: u16,
    pub stdin_port: Option<u16>,
    pub stdout_port: Option<u16>,
    pub service_ports: Vec<BoundServicePort>,
    pub host_ports: Vec<u16>,
    pub exec_timeout_secs: u64,
    pub last_used: Instant,
    pub resource_spec: KernelResourceSpec,
    pub runner_tasks: HashSet<String>,
    pub runner: Option<KernelRunner>,
}

impl KernelRecord {
    pub fn touch(&mut self) {
        self.last_used = Instant::now();
    }

    pub fn idle_for(&self) -> std::time::Duration {
        self.last_used.elapsed()
    }
}

/// Thread-safe kernel-id -> KernelRecord mapping, owned by the orchestrator.
#[derive(Clone, Default)]
pub struct KernelRegistry {
    inner: Arc<RwLock<HashMap<String, KernelRecord>>>,
    /// container-id -> kernel-id, kept alongside `inner` so the stats
    /// fan-in's per-frame callback can resolve a kernel-id synchronously
    /// (it runs outside any async context the registry's own lock needs).
    container_index: Arc<std::sync::Mutex<HashMap<String, String>>>,
}

impl KernelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, record: KernelRecord) {
        self.container_index
            .lock()
            .unwrap()
            .insert(record.container_id.clone(), record.kernel_id.clone());
        let mut map = self.inner.write().await;
        map.insert(record.kernel_id.clone(), record);
    }

    pub async fn remove(&self, kernel_id: &str) -> Option<KernelRecord> {
        let mut map = self.inner.write().await;
        let removed = map.remove(kernel_id);
        if let Some(record) = &removed {
            self.container_index.lock().unwrap().remove(&record.container_id);
        }
        removed
    }

    /// Resolve a container-id back to its owning kernel-id, synchronously —
    /// used by the stats fan-in's per-frame resolver callback.
    pub fn kernel_id_for_container(&self, container_id: &str) -> Option<String> {
        self.container_index.lock().unwrap().get(container_id).cloned()
    }

    /// Prune a stale `container_id -> kernel_id` index entry without
    /// touching the record itself. Needed on the restart-in-flight cleanup
    /// path, where the registry entry for `kernel_id` is about to be
    /// overwritten wholesale by the re-create's `insert` rather than
    /// removed, so `remove`'s own index cleanup never runs for the old
    /// container id.
    pub fn forget_container(&self, container_id: &str) {
        self.container_index.lock().unwrap().remove(container_id);
    }

    pub async fn contains(&self, kernel_id: &str) -> bool {
        let map = self.inner.read().await;
        map.contains_key(kernel_id)
    }

    pub async fn touch(&self, kernel_id: &str) {
        let mut map = self.inner.write().await;
        if let Some(record) = map.get_mut(kernel_id) {
            record.touch();
        }
    }

    pub async fn all_kernel_ids(&self) -> Vec<String> {
        let map = self.inner.read().await;
        map.keys().cloned().collect()
    }

    /// Kernel ids whose last use exceeds `threshold`. Used by the idle
    /// reaper; empty when `threshold` is zero-disabled by the caller.
    pub async fn idle_kernels(&self, threshold: std::time::Duration) -> Vec<String> {
        let map = self.inner.read().await;
        map.values()
            .filter(|r| r.idle_for() >= threshold)
            .map(|r| r.kernel_id.clone())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Run an async-free closure against a mutable reference to a record.
    /// Used by callers that need to read/mutate several fields atomically
    /// without holding the lock across an await point.
    pub async fn with_mut<R>(
        &self,
        kernel_id: &str,
        f: impl FnOnce(&mut KernelRecord) -> R,
    ) -> Option<R> {
        let mut map = self.inner.write().await;
        map.get_mut(kernel_id).map(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::ImageRef;
    use crate::resources::spec::KernelResourceSpec;
    use std::collections::BTreeMap;

    fn dummy_record(id: &str) -> KernelRecord {
        KernelRecord {
            kernel_id: id.to_string(),
            image: ImageRef::parse("x/kernel-python:3.9"),
            container_id: "abc".into(),
            kernel_host: "127.0.0.1".into(),
            repl_in_port: 30000,
            repl_out_port: 30001,
            stdin_port: None,
            stdout_port: None,
            service_ports: Vec::new(),
            host_ports: vec![30000, 30001],
            exec_timeout_secs: 0,
            last_used: Instant::now(),
            resource_spec: KernelResourceSpec {
                shares: BTreeMap::new(),
                accelerator_shares: BTreeMap::new(),
                mounts: Vec::new(),
                numa_node: 0,
                cpu_set: Default::default(),
                memory_limit: 0,
                scratch_disk_size: 0,
            },
            runner_tasks: HashSet::new(),
            runner: None,
        }
    }

    #[tokio::test]
    async fn insert_then_contains() {
        let reg = KernelRegistry::new();
        reg.insert(dummy_record("k1")).await;
        assert!(reg.contains("k1").await);
    }

    #[tokio::test]
    async fn remove_drops_entry() {
        let reg = KernelRegistry::new();
        reg.insert(dummy_record("k1")).await;
        let removed = reg.remove("k1").await;
        assert!(removed.is_some());
        assert!(!reg.contains("k1").await);
    }

    #[tokio::test]
    async fn touch_updates_last_used() {
        let reg = KernelRegistry::new();
        reg.insert(dummy_record("k1")).await;
        reg.with_mut("k1", |r| {
            r.last_used -= std::time::Duration::from_secs(100);
        })
        .await;
        let idle_before = reg.idle_kernels(std::time::Duration::from_secs(1)).await;
        assert_eq!(idle_before, vec!["k1".to_string()]);
        reg.touch("k1").await;
        let idle_after = reg.idle_kernels(std::time::Duration::from_secs(1)).await;
        assert!(idle_after.is_empty());
    }

    #[tokio::test]
    async fn container_index_resolves_and_clears() {
        let reg = KernelRegistry::new();
        reg.insert(dummy_record("k1")).await;
        assert_eq!(reg.kernel_id_for_container("abc"), Some("k1".to_string()));
        reg.remove("k1").await;
        assert_eq!(reg.kernel_id_for_container("abc"), None);
    }

    #[tokio::test]
    async fn idle_kernels_respects_threshold() {
        let reg = KernelRegistry::new();
        reg.insert(dummy_record("k1")).await;
        let idle = reg.idle_kernels(std::time::Duration::from_secs(3600)).await;
        assert!(idle.is_empty());
    }

    #[tokio::test]
    async fn len_and_is_empty() {
        let reg = KernelRegistry::new();
        assert!(reg.is_empty().await);
        reg.insert(dummy_record("k1")).await;
        assert_eq!(reg.len().await, 1);
    }
}
