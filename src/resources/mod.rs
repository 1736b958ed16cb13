pub mod accelerator;
pub mod cpu;
pub mod ports;
pub mod spec;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::config::AgentConfig;

use self::accelerator::AcceleratorAllocMap;
use self::cpu::CpuAllocMap;
use self::ports::PortPool;

/// The three shared allocation maps the orchestrator draws on. Grouped
/// behind one struct so bootstrap can construct and reconcile them together;
/// each field is independently locked, matching how the host crate's
/// `Scheduler` composes several independently-locked pieces of state.
#[derive(Clone)]
pub struct ResourceMaps {
    pub cpu: Arc<RwLock<CpuAllocMap>>,
    pub ports: Arc<RwLock<PortPool>>,
    pub accelerators: Arc<RwLock<HashMap<String, AcceleratorAllocMap>>>,
}

impl ResourceMaps {
    pub fn new(config: &AgentConfig, num_cores: usize) -> Self {
        let (lo, hi) = config.container_port_range;
        Self {
            cpu: Arc::new(RwLock::new(CpuAllocMap::single_node(num_cores))),
            ports: Arc::new(RwLock::new(PortPool::new(lo, hi))),
            accelerators: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register an accelerator class discovered at bootstrap (or by a
    /// plugin), with its device id list.
    pub async fn register_accelerator(&self, class: &str, device_ids: &[String]) {
        let mut map = self.accelerators.write().await;
        map.insert(
            class.to_string(),
            AcceleratorAllocMap::new(class, device_ids),
        );
    }
}
