use anyhow::{Context, Result};

/// Agent configuration, sourced entirely from the environment. CLI-flag
/// parsing is out of scope here — each flag of the original agent's surface
/// is exposed as an equivalent environment variable.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Logical namespace this agent belongs to (env: AGENT_NAMESPACE).
    pub namespace: String,

    /// Address this agent's RPC server binds to (env: AGENT_BIND_ADDR).
    pub bind_addr: String,

    /// Hostname/IP advertised to the manager and embedded in kernel records
    /// (env: AGENT_HOST_OVERRIDE, falls back to the bind host).
    pub agent_host_override: Option<String>,

    /// Port the stats fan-in socket listens on (env: STAT_PORT).
    pub stat_port: u16,

    /// Inclusive host port range drawn from for kernel container ports
    /// (env: CONTAINER_PORT_RANGE_START / CONTAINER_PORT_RANGE_END).
    pub container_port_range: (u16, u16),

    /// host:port of the etcd-compatible metadata service (env: ETCD_ADDR).
    pub etcd_addr: String,

    /// Idle-kernel reap threshold in seconds; 0 disables the reaper
    /// (env: IDLE_TIMEOUT).
    pub idle_timeout_secs: u64,

    /// Root directory for per-kernel scratch dirs (env: SCRATCH_ROOT).
    pub scratch_root: String,

    /// Root directory virtual-folder mounts are resolved under (env: VFOLDER_MOUNT).
    pub vfolder_mount: String,

    /// Optional debug bind-mount overrides, applied to every created container.
    pub debug_kernel_path: Option<String>,
    pub debug_jail_path: Option<String>,
    pub debug_hook_path: Option<String>,

    /// Skip actually deleting containers on cleanup — debugging aid
    /// (env: DEBUG_SKIP_CONTAINER_DELETION).
    pub debug_skip_container_deletion: bool,

    /// name -> canonical-image aliasing table, e.g. "python" -> "x/kernel-python:3.9"
    /// (env: KERNEL_ALIASES, comma-separated "alias=target" pairs).
    pub kernel_aliases: Vec<(String, String)>,

    /// Hexadecimal CPU mask restricting which cores this agent may allocate
    /// (env: LIMIT_CPUS; absent = all cores visible to the process).
    pub limit_cpus_mask: Option<String>,

    /// Hexadecimal accelerator-slot mask, analogous to limit_cpus_mask
    /// (env: LIMIT_GPUS).
    pub limit_gpus_mask: Option<String>,

    /// Docker registry namespace prefix used when resolving bare image names
    /// (env: DOCKER_REGISTRY, defaults to etcd's nodes/docker_registry at boot).
    pub docker_registry: String,
}

impl AgentConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            namespace: std::env::var("AGENT_NAMESPACE").unwrap_or_else(|_| "default".into()),
            bind_addr: std::env::var("AGENT_BIND_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:6001".into()),
            agent_host_override: std::env::var("AGENT_HOST_OVERRIDE").ok(),
            stat_port: std::env::var("STAT_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(6002),
            container_port_range: (
                std::env::var("CONTAINER_PORT_RANGE_START")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(30000),
                std::env::var("CONTAINER_PORT_RANGE_END")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(31000),
            ),
            etcd_addr: std::env::var("ETCD_ADDR").unwrap_or_else(|_| "127.0.0.1:2379".into()),
            idle_timeout_secs: std::env::var("IDLE_TIMEOUT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(600),
            scratch_root: std::env::var("SCRATCH_ROOT")
                .unwrap_or_else(|_| "/var/cache/scratches".into()),
            vfolder_mount: std::env::var("VFOLDER_MOUNT").unwrap_or_else(|_| "/mnt".into()),
            debug_kernel_path: std::env::var("DEBUG_KERNEL_PATH").ok(),
            debug_jail_path: std::env::var("DEBUG_JAIL_PATH").ok(),
            debug_hook_path: std::env::var("DEBUG_HOOK_PATH").ok(),
            debug_skip_container_deletion: std::env::var("DEBUG_SKIP_CONTAINER_DELETION")
                .map(|v| v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            kernel_aliases: std::env::var("KERNEL_ALIASES")
                .ok()
                .map(|raw| parse_kernel_aliases(&raw))
                .unwrap_or_default(),
            limit_cpus_mask: std::env::var("LIMIT_CPUS").ok(),
            limit_gpus_mask: std::env::var("LIMIT_GPUS").ok(),
            docker_registry: std::env::var("DOCKER_REGISTRY").unwrap_or_else(|_| "lablup".into()),
        })
    }

    /// Resolve the host address advertised to the manager and embedded in
    /// kernel connection info.
    pub fn advertised_host(&self) -> Result<String> {
        if let Some(h) = &self.agent_host_override {
            return Ok(h.clone());
        }
        let host = self
            .bind_addr
            .rsplit_once(':')
            .map(|(h, _)| h)
            .context("AGENT_BIND_ADDR missing a port")?;
        if host.is_empty() || host == "0.0.0.0" {
            return Ok("127.0.0.1".to_string());
        }
        Ok(host.to_string())
    }

    /// Look up a kernel alias, returning the original name unchanged if
    /// no alias is configured for it.
    pub fn resolve_alias<'a>(&'a self, name: &'a str) -> &'a str {
        self.kernel_aliases
            .iter()
            .find(|(alias, _)| alias == name)
            .map(|(_, target)| target.as_str())
            .unwrap_or(name)
    }
}

/// Parse "alias=target,alias2=target2" into pairs. Malformed entries
/// (missing '=') are skipped rather than failing configuration load.
fn parse_kernel_aliases(raw: &str) -> Vec<(String, String)> {
    raw.split(',')
        .filter_map(|pair| pair.split_once('='))
        .map(|(a, b)| (a.trim().to_string(), b.trim().to_string()))
        .collect()
}

/// Parse a hexadecimal CPU/GPU mask into a sorted set of slot indices, e.g.
/// "f" -> {0,1,2,3}. Returns None (no restriction) for an absent mask.
pub fn parse_hex_mask(mask: &Option<String>) -> Option<std::collections::BTreeSet<usize>> {
    let mask = mask.as_ref()?;
    let cleaned = mask.trim_start_matches("0x");
    let value = u128::from_str_radix(cleaned, 16).ok()?;
    let mut set = std::collections::BTreeSet::new();
    for i in 0..128 {
        if value & (1 << i) != 0 {
            set.insert(i);
        }
    }
    Some(set)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> AgentConfig {
        AgentConfig {
            namespace: "default".into(),
            bind_addr: "0.0.0.0:6001".into(),
            agent_host_override: None,
            stat_port: 6002,
            container_port_range: (30000, 31000),
            etcd_addr: "127.0.0.1:2379".into(),
            idle_timeout_secs: 600,
            scratch_root: "/var/cache/scratches".into(),
            vfolder_mount: "/mnt".into(),
            debug_kernel_path: None,
            debug_jail_path: None,
            debug_hook_path: None,
            debug_skip_container_deletion: false,
            kernel_aliases: Vec::new(),
            limit_cpus_mask: None,
            limit_gpus_mask: None,
            docker_registry: "lablup".into(),
        }
    }

    #[test]
    fn advertised_host_uses_override() {
        let cfg = AgentConfig {
            agent_host_override: Some("10.0.0.5".into()),
            ..base_config()
        };
        assert_eq!(cfg.advertised_host().unwrap(), "10.0.0.5");
    }

    #[test]
    fn advertised_host_falls_back_to_loopback_for_wildcard_bind() {
        let cfg = base_config();
        assert_eq!(cfg.advertised_host().unwrap(), "127.0.0.1");
    }

    #[test]
    fn advertised_host_uses_bind_host_when_specific() {
        let cfg = AgentConfig {
            bind_addr: "192.168.1.10:6001".into(),
            ..base_config()
        };
        assert_eq!(cfg.advertised_host().unwrap(), "192.168.1.10");
    }

    #[test]
    fn resolve_alias_returns_target_when_present() {
        let cfg = AgentConfig {
            kernel_aliases: vec![("python".into(), "x/kernel-python:3.9".into())],
            ..base_config()
        };
        assert_eq!(cfg.resolve_alias("python"), "x/kernel-python:3.9");
    }

    #[test]
    fn resolve_alias_passthrough_when_absent() {
        let cfg = base_config();
        assert_eq!(cfg.resolve_alias("x/kernel-python:3.9"), "x/kernel-python:3.9");
    }

    #[test]
    fn parse_kernel_aliases_skips_malformed_entries() {
        let parsed = parse_kernel_aliases("python=x/kernel-python:3.9,garbage,r=x/kernel-r:4.0");
        assert_eq!(
            parsed,
            vec![
                ("python".to_string(), "x/kernel-python:3.9".to_string()),
                ("r".to_string(), "x/kernel-r:4.0".to_string()),
            ]
        );
    }

    #[test]
    fn parse_hex_mask_none_when_absent() {
        assert_eq!(parse_hex_mask(&None), None);
    }

    #[test]
    fn parse_hex_mask_decodes_bits() {
        let set = parse_hex_mask(&Some("f".to_string())).unwrap();
        assert_eq!(set, [0usize, 1, 2, 3].into_iter().collect());
    }

    #[test]
    fn parse_hex_mask_handles_0x_prefix() {
        let set = parse_hex_mask(&Some("0x3".to_string())).unwrap();
        assert_eq!(set, [0usize, 1].into_iter().collect());
    }
}
