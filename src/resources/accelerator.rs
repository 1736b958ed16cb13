use std::collections::{BTreeMap, HashMap};

use crate::error::{AgentError, AgentResult};
use crate::resources::spec::DeviceLimits;

/// Default per-device memory capacity assumed when a plugin doesn't report
/// one explicitly. 16 GiB is a conservative stand-in for a mid-range
/// accelerator; real device discovery would report this per device.
const DEFAULT_DEVICE_MEMORY_BYTES: u64 = 16 << 30;

/// A single accelerator device and its free fractional share, in [0, 1].
#[derive(Debug, Clone)]
struct Device {
    id: String,
    free_share: f64,
    total_memory_bytes: u64,
}

/// Per-device share allocator for one accelerator class (e.g. "cuda", "tpu").
///
/// `alloc` greedy-packs a requested total share across devices, filling the
/// device with the most free share first.
#[derive(Debug, Clone)]
pub struct AcceleratorAllocMap {
    class: String,
    devices: Vec<Device>,
}

impl AcceleratorAllocMap {
    pub fn new(class: impl Into<String>, device_ids: &[String]) -> Self {
        Self::with_device_memory(class, device_ids, DEFAULT_DEVICE_MEMORY_BYTES)
    }

    pub fn with_device_memory(
        class: impl Into<String>,
        device_ids: &[String],
        total_memory_bytes: u64,
    ) -> Self {
        Self {
            class: class.into(),
            devices: device_ids
                .iter()
                .map(|id| Device {
                    id: id.clone(),
                    free_share: 1.0,
                    total_memory_bytes,
                })
                .collect(),
        }
    }

    pub fn class(&self) -> &str {
        &self.class
    }

    /// Map a per-device share allocation to the `(memory_limit,
    /// processor_limit)` pair written into `resource.txt`'s
    /// `<KIND>_MEMORY_LIMITS`/`<KIND>_PROCESSOR_LIMITS` lines (§4.3 step 4).
    /// The processor limit is the share itself; the memory limit scales the
    /// device's total capacity by that share.
    fn share_to_spec(&self, device_id: &str, share: f64) -> Option<(u64, f64)> {
        self.devices
            .iter()
            .find(|d| d.id == device_id)
            .map(|d| ((d.total_memory_bytes as f64 * share) as u64, share))
    }

    /// Derive the `DeviceLimits` for a previously allocated per-device share
    /// map, via `share_to_spec`.
    pub fn device_limits(&self, shares: &BTreeMap<String, f64>) -> DeviceLimits {
        let mut memory_limits = BTreeMap::new();
        let mut processor_limits = BTreeMap::new();
        for (device_id, &share) in shares {
            if let Some((mem, proc_limit)) = self.share_to_spec(device_id, share) {
                memory_limits.insert(device_id.clone(), mem);
                processor_limits.insert(device_id.clone(), proc_limit);
            }
        }
        DeviceLimits {
            memory_limits,
            processor_limits,
        }
    }

    fn total_free(&self) -> f64 {
        self.devices.iter().map(|d| d.free_share).sum()
    }

    /// Allocate `total_share` across devices by greedy packing. Returns the
    /// per-device share map.
    pub fn alloc(&mut self, total_share: f64) -> AgentResult<HashMap<String, f64>> {
        let available = self.total_free();
        if total_share <= 0.0 || total_share > available + 1e-9 {
            return Err(AgentError::InsufficientAccel {
                class: self.class.clone(),
                requested: total_share,
                available,
            });
        }

        let mut remaining = total_share;
        let mut result = HashMap::new();

        // Sort device indices by descending free share without cloning Device.
        let mut order: Vec<usize> = (0..self.devices.len()).collect();
        order.sort_by(|&a, &b| {
            self.devices[b]
                .free_share
                .partial_cmp(&self.devices[a].free_share)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        for idx in order {
            if remaining <= 1e-9 {
                break;
            }
            let dev = &mut self.devices[idx];
            if dev.free_share <= 1e-9 {
                continue;
            }
            let take = remaining.min(dev.free_share);
            dev.free_share -= take;
            remaining -= take;
            result.insert(dev.id.clone(), take);
        }

        Ok(result)
    }

    /// Restore a previously allocated per-device share map.
    pub fn free(&mut self, shares: &HashMap<String, f64>) {
        for dev in &mut self.devices {
            if let Some(&share) = shares.get(&dev.id) {
                dev.free_share = (dev.free_share + share).min(1.0);
            }
        }
    }

    /// Per-device free share, for reporting (e.g. heartbeat slot counts).
    pub fn free_shares(&self) -> HashMap<String, f64> {
        self.devices
            .iter()
            .map(|d| (d.id.clone(), d.free_share))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_device_map() -> AcceleratorAllocMap {
        AcceleratorAllocMap::new("cuda", &["gpu0".to_string(), "gpu1".to_string()])
    }

    #[test]
    fn alloc_fits_single_device() {
        let mut map = two_device_map();
        let shares = map.alloc(0.5).unwrap();
        assert_eq!(shares.len(), 1);
        assert_eq!(*shares.values().next().unwrap(), 0.5);
    }

    #[test]
    fn alloc_spills_across_devices_when_needed() {
        let mut map = two_device_map();
        let shares = map.alloc(1.5).unwrap();
        let total: f64 = shares.values().sum();
        assert!((total - 1.5).abs() < 1e-9);
        assert_eq!(shares.len(), 2);
    }

    #[test]
    fn alloc_rejects_over_budget() {
        let mut map = two_device_map();
        let err = map.alloc(2.5).unwrap_err();
        match err {
            AgentError::InsufficientAccel { requested, .. } => assert_eq!(requested, 2.5),
            _ => panic!("wrong error kind"),
        }
    }

    #[test]
    fn free_restores_budget() {
        let mut map = two_device_map();
        let shares = map.alloc(1.5).unwrap();
        map.free(&shares);
        let total_free: f64 = map.free_shares().values().sum();
        assert!((total_free - 2.0).abs() < 1e-9);
    }

    #[test]
    fn share_to_spec_scales_memory_by_share() {
        let map = AcceleratorAllocMap::with_device_memory(
            "cuda",
            &["gpu0".to_string()],
            8 << 30,
        );
        let (mem, proc_limit) = map.share_to_spec("gpu0", 0.5).unwrap();
        assert_eq!(mem, 4 << 30);
        assert_eq!(proc_limit, 0.5);
    }

    #[test]
    fn device_limits_covers_every_allocated_device() {
        let mut map = two_device_map();
        let shares: BTreeMap<String, f64> = map.alloc(1.5).unwrap().into_iter().collect();
        let limits = map.device_limits(&shares);
        assert_eq!(limits.memory_limits.len(), shares.len());
        assert_eq!(limits.processor_limits.len(), shares.len());
    }

    #[test]
    fn per_device_budget_never_exceeds_one() {
        let mut map = two_device_map();
        let s1 = map.alloc(1.0).unwrap();
        let s2 = map.alloc(1.0).unwrap();
        for dev in map.free_shares().values() {
            assert!(*dev >= -1e-9);
        }
        // s1 and s2 together must not double-book a device
        let mut combined: HashMap<String, f64> = HashMap::new();
        for (k, v) in s1.into_iter().chain(s2.into_iter()) {
            *combined.entry(k).or_insert(0.0) += v;
        }
        for v in combined.values() {
            assert!(*v <= 1.0 + 1e-9);
        }
    }
}
