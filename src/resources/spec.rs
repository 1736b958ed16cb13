use std::collections::BTreeMap;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::AgentResult;

/// Reserved share keys — every other key names an accelerator class.
pub const SHARE_CPU: &str = "_cpu";
pub const SHARE_MEM: &str = "_mem";
pub const SHARE_GPU: &str = "_gpu";
pub const SHARE_TPU: &str = "_tpu";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MountPermission {
    #[serde(rename = "ro")]
    ReadOnly,
    #[serde(rename = "rw")]
    ReadWrite,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelMount {
    pub host_path: String,
    pub kernel_path: String,
    pub permission: MountPermission,
}

/// Resource grant for one kernel, persisted verbatim to
/// `<scratch>/<kernel>/config/resource.txt` so a restart can reuse it
/// without re-allocating.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelResourceSpec {
    /// share-kind -> amount. `_cpu`/`_mem`/`_gpu`/`_tpu` hold flat amounts;
    /// any other key names an accelerator class and holds device shares.
    pub shares: BTreeMap<String, f64>,
    pub accelerator_shares: BTreeMap<String, BTreeMap<String, f64>>,
    pub mounts: Vec<KernelMount>,
    pub numa_node: usize,
    pub cpu_set: std::collections::BTreeSet<usize>,
    pub memory_limit: u64,
    pub scratch_disk_size: u64,
}

impl KernelResourceSpec {
    /// Serialize in the line-oriented `KEY=value` shape the runtime mounts
    /// read at `/home/config/resource.txt`.
    pub fn to_resource_txt(&self, device_limits: &HashMap<String, DeviceLimits>) -> String {
        let mut out = String::new();
        for (kind, amount) in &self.shares {
            out.push_str(&format!("{kind}={amount}\n"));
        }
        out.push_str(&format!(
            "NUMA_NODE={}\nCPU_SET={}\nMEMORY_LIMIT={}\nSCRATCH_DISK_SIZE={}\n",
            self.numa_node,
            self.cpu_set
                .iter()
                .map(|c| c.to_string())
                .collect::<Vec<_>>()
                .join(","),
            self.memory_limit,
            self.scratch_disk_size,
        ));
        for (kind, per_device) in &self.accelerator_shares {
            let kind_upper = kind.to_uppercase();
            let shares: Vec<String> = per_device
                .iter()
                .map(|(dev, share)| format!("{dev}:{share}"))
                .collect();
            out.push_str(&format!("{kind_upper}_SHARES={}\n", shares.join(",")));
            if let Some(limits) = device_limits.get(kind) {
                let mem: Vec<String> = limits
                    .memory_limits
                    .iter()
                    .map(|(dev, v)| format!("{dev}:{v}"))
                    .collect();
                let proc: Vec<String> = limits
                    .processor_limits
                    .iter()
                    .map(|(dev, v)| format!("{dev}:{v}"))
                    .collect();
                out.push_str(&format!("{kind_upper}_MEMORY_LIMITS={}\n", mem.join(",")));
                out.push_str(&format!("{kind_upper}_PROCESSOR_LIMITS={}\n", proc.join(",")));
            }
        }
        out
    }

    pub fn from_json(raw: &str) -> AgentResult<Self> {
        serde_json::from_str(raw).map_err(|e| crate::error::AgentError::Other(e.into()))
    }

    pub fn to_json(&self) -> AgentResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| crate::error::AgentError::Other(e.into()))
    }
}

/// Per-device memory/processor limits derived from an accelerator share,
/// via that accelerator's `share_to_spec`.
#[derive(Debug, Clone, Default)]
pub struct DeviceLimits {
    pub memory_limits: BTreeMap<String, u64>,
    pub processor_limits: BTreeMap<String, f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_spec() -> KernelResourceSpec {
        let mut shares = BTreeMap::new();
        shares.insert(SHARE_CPU.to_string(), 2.0);
        shares.insert(SHARE_MEM.to_string(), 1.0);
        KernelResourceSpec {
            shares,
            accelerator_shares: BTreeMap::new(),
            mounts: vec![KernelMount {
                host_path: "/mnt/vfolders/x".into(),
                kernel_path: "/home/work/x".into(),
                permission: MountPermission::ReadWrite,
            }],
            numa_node: 0,
            cpu_set: [0usize, 1].into_iter().collect(),
            memory_limit: 1 << 30,
            scratch_disk_size: 0,
        }
    }

    #[test]
    fn json_round_trip_is_bit_identical() {
        let spec = sample_spec();
        let json = spec.to_json().unwrap();
        let back = KernelResourceSpec::from_json(&json).unwrap();
        assert_eq!(spec, back);
    }

    #[test]
    fn resource_txt_includes_core_fields() {
        let spec = sample_spec();
        let txt = spec.to_resource_txt(&HashMap::new());
        assert!(txt.contains("_cpu=2"));
        assert!(txt.contains("_mem=1"));
        assert!(txt.contains("NUMA_NODE=0"));
        assert!(txt.contains("CPU_SET=0,1"));
        assert!(txt.contains("MEMORY_LIMIT=1073741824"));
    }

    #[test]
    fn resource_txt_includes_accelerator_limits_when_present() {
        let mut spec = sample_spec();
        let mut per_device = BTreeMap::new();
        per_device.insert("gpu0".to_string(), 0.5);
        spec.accelerator_shares.insert("cuda".to_string(), per_device);

        let mut limits = HashMap::new();
        let mut mem = BTreeMap::new();
        mem.insert("gpu0".to_string(), 4u64 << 30);
        let mut proc = BTreeMap::new();
        proc.insert("gpu0".to_string(), 0.5);
        limits.insert(
            "cuda".to_string(),
            DeviceLimits {
                memory_limits: mem,
                processor_limits: proc,
            },
        );

        let txt = spec.to_resource_txt(&limits);
        assert!(txt.contains("CUDA_SHARES=gpu0:0.5"));
        assert!(txt.contains("CUDA_MEMORY_LIMITS=gpu0:4294967296"));
        assert!(txt.contains("CUDA_PROCESSOR_LIMITS=gpu0:0.5"));
    }
}
