use std::collections::{BTreeMap, HashMap};

use tracing::{debug, info, warn};

use crate::error::{AgentError, AgentResult};
use crate::image::{container_name, get_label, parse_service_ports_label, ImageRef};
use crate::registry::{BoundServicePort, KernelRecord};
use crate::resources::spec::{KernelMount, KernelResourceSpec, MountPermission, SHARE_CPU, SHARE_GPU, SHARE_MEM, SHARE_TPU};

use super::types::{bound_service_ports_to_decls, CreateKernelConfig, CreateKernelResponse};
use super::Orchestrator;

const MEM_SLOT_BYTES: f64 = 1u64.wrapping_shl(30) as f64;

impl Orchestrator {
    pub async fn create_kernel(
        &self,
        kernel_id: String,
        config: CreateKernelConfig,
    ) -> AgentResult<CreateKernelResponse> {
        self.create_kernel_inner(kernel_id, config, false).await
    }

    /// `restarting` reuses the on-disk resource spec verbatim instead of
    /// allocating fresh CPU/accelerator shares (§4.3/§4.5).
    pub(crate) async fn create_kernel_inner(
        &self,
        kernel_id: String,
        config: CreateKernelConfig,
        restarting: bool,
    ) -> AgentResult<CreateKernelResponse> {
        self.publisher.kernel_creating(&kernel_id).await;
        debug!(kernel_id = %kernel_id, restarting, "creating kernel");

        // Phase 1: resolve image.
        let resolved = self.config.resolve_alias(&config.lang).to_string();
        let image = ImageRef::parse(&resolved);

        if !self
            .docker
            .inspect_image(&image.canonical)
            .await
            .map_err(AgentError::Other)?
        {
            self.docker
                .ensure_image(&image.canonical)
                .await
                .map_err(|e| AgentError::ImagePullFailed {
                    image: image.canonical.clone(),
                    source: e,
                })?;
        }

        let labels = self.docker.image_labels(&image.canonical).await;
        let corecount_envs: Vec<String> = get_label(&labels, "envs.corecount")
            .map(|raw| raw.split(',').map(str::trim).map(String::from).collect())
            .unwrap_or_default();
        let features: Vec<String> = get_label(&labels, "features")
            .map(|raw| raw.split(',').map(str::trim).map(String::from).collect())
            .unwrap_or_default();
        let service_port_decls = get_label(&labels, "service-ports")
            .map(parse_service_ports_label)
            .unwrap_or_default();

        // Phase 2: build resource spec.
        let scratch_dir = self.scratch_dir(&kernel_id);
        let resource_spec = if restarting {
            self.load_resource_spec(&kernel_id).await?
        } else {
            self.allocate_resource_spec(&config, &scratch_dir).await?
        };

        // Phase 3: environment.
        let mut env: Vec<String> = vec!["LD_PRELOAD=/home/backend.ai/libbaihook.so".to_string()];
        for name in &corecount_envs {
            env.push(format!("{name}={}", resource_spec.cpu_set.len()));
        }
        if features.iter().any(|f| f == "UID_MATCH") {
            let uid = std::env::var("UID").unwrap_or_else(|_| "0".to_string());
            env.push(format!("LOCAL_USER_ID={uid}"));
        }
        for (k, v) in &config.envs {
            env.push(format!("{k}={v}"));
        }

        // Phase 4: persist config.
        if let Err(e) = self.persist_kernel_config(&kernel_id, &resource_spec, &env).await {
            self.rollback(&kernel_id, &resource_spec, restarting).await;
            return Err(AgentError::Other(e));
        }

        // Phase 5: compose container config.
        let is_git_kernel = image.short_name.contains("git");
        let mut container_ports: Vec<u16> = vec![2000, 2001];
        container_ports.extend(service_port_decls.iter().map(|d| d.container_port));
        if is_git_kernel {
            container_ports.extend([2002, 2003]);
        }

        let host_ports = {
            let mut pool = self.resources.ports.write().await;
            match pool.alloc_group(container_ports.len()) {
                Ok(ports) => ports,
                Err(e) => {
                    self.rollback(&kernel_id, &resource_spec, restarting).await;
                    return Err(e);
                }
            }
        };

        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
        let mut port_bindings: HashMap<String, Option<Vec<bollard::models::PortBinding>>> =
            HashMap::new();
        for (container_port, host_port) in container_ports.iter().zip(host_ports.iter()) {
            let key = format!("{container_port}/tcp");
            exposed_ports.insert(key.clone(), HashMap::new());
            port_bindings.insert(
                key,
                Some(vec![bollard::models::PortBinding {
                    host_ip: Some("0.0.0.0".to_string()),
                    host_port: Some(host_port.to_string()),
                }]),
            );
        }

        let mut extra_binds = Vec::new();
        if let Some(p) = &self.config.debug_kernel_path {
            extra_binds.push(format!("{p}:/home/backend.ai/kernel:ro"));
        }
        if let Some(p) = &self.config.debug_jail_path {
            extra_binds.push(format!("{p}:/home/backend.ai/jail:ro"));
        }
        if let Some(p) = &self.config.debug_hook_path {
            extra_binds.push(format!("{p}:/home/backend.ai/libbaihook.so:ro"));
        }

        let mut mounts = resource_spec.mounts.clone();
        mounts.push(KernelMount {
            host_path: format!("{scratch_dir}/config"),
            kernel_path: "/home/config".to_string(),
            permission: MountPermission::ReadOnly,
        });
        mounts.push(KernelMount {
            host_path: format!("{scratch_dir}/work"),
            kernel_path: "/home/work".to_string(),
            permission: MountPermission::ReadWrite,
        });

        let name = container_name(&image, &kernel_id);
        let cpu_set_str = resource_spec
            .cpu_set
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let cpu_slot = resource_spec.shares.get(SHARE_CPU).copied().unwrap_or(1.0);

        // Phase 6: start.
        let container_id = match self
            .docker
            .create_kernel_container(
                &name,
                &image.canonical,
                env,
                &cpu_set_str,
                cpu_slot,
                resource_spec.numa_node,
                resource_spec.memory_limit,
                port_bindings,
                exposed_ports,
                &mounts,
                &extra_binds,
            )
            .await
        {
            Ok(id) => id,
            Err(e) => {
                self.rollback(&kernel_id, &resource_spec, restarting).await;
                let mut pool = self.resources.ports.write().await;
                pool.free_group(&host_ports);
                return Err(AgentError::ContainerStartFailed {
                    kernel_id: kernel_id.clone(),
                    source: e,
                });
            }
        };

        for (container_port, expected_host_port) in container_ports.iter().zip(host_ports.iter()) {
            match self.docker.bound_host_port(&container_id, *container_port).await {
                Ok(Some(actual)) if actual != *expected_host_port => {
                    warn!(
                        kernel_id = %kernel_id,
                        container_port,
                        expected = expected_host_port,
                        actual,
                        "daemon-reported host port does not match drawn port"
                    );
                }
                Ok(_) => {}
                Err(e) => warn!(kernel_id = %kernel_id, error = %e, "failed to verify bound port"),
            }
        }

        let host = self
            .config
            .advertised_host()
            .unwrap_or_else(|_| "127.0.0.1".to_string());

        let mut port_iter = host_ports.iter().copied();
        let repl_in_port = port_iter.next().unwrap_or(2000);
        let repl_out_port = port_iter.next().unwrap_or(2001);
        let bound_service_ports: Vec<BoundServicePort> = service_port_decls
            .into_iter()
            .zip(port_iter.by_ref())
            .map(|(decl, host_port)| BoundServicePort { decl, host_port })
            .collect();
        // Legacy stdin/stdout ports (2002/2003), drawn only for git-named
        // images (see `container_ports` above); they're the remainder of
        // `port_iter` once the repl and service ports have been consumed.
        let stdin_port = is_git_kernel.then(|| port_iter.next()).flatten();
        let stdout_port = is_git_kernel.then(|| port_iter.next()).flatten();

        // Phase 7: publish.
        let record = KernelRecord {
            kernel_id: kernel_id.clone(),
            image,
            container_id: container_id.clone(),
            kernel_host: host.clone(),
            repl_in_port,
            repl_out_port,
            stdin_port,
            stdout_port,
            service_ports: bound_service_ports,
            host_ports: host_ports.clone(),
            exec_timeout_secs: 0,
            last_used: std::time::Instant::now(),
            resource_spec: resource_spec.clone(),
            runner_tasks: Default::default(),
            runner: None,
        };
        let service_ports = bound_service_ports_to_decls(&record.service_ports);
        self.registry.insert(record).await;

        info!(kernel_id = %kernel_id, container_id = %container_id, "kernel created");

        Ok(CreateKernelResponse {
            id: kernel_id,
            kernel_host: host,
            repl_in_port,
            repl_out_port,
            stdin_port,
            stdout_port,
            service_ports,
            container_id,
            resource_spec,
        })
    }

    pub(crate) fn scratch_dir(&self, kernel_id: &str) -> String {
        format!("{}/{}", self.config.scratch_root, kernel_id)
    }

    async fn allocate_resource_spec(
        &self,
        config: &CreateKernelConfig,
        _scratch_dir: &str,
    ) -> AgentResult<KernelResourceSpec> {
        let cpu_slot: f64 = config.limits.cpu_slot.parse().unwrap_or(1.0);
        let mem_slot: f64 = config.limits.mem_slot.parse().unwrap_or(1.0);
        let gpu_slot: f64 = config.limits.gpu_slot.parse().unwrap_or(0.0);
        let tpu_slot: f64 = config.limits.tpu_slot.parse().unwrap_or(0.0);

        let requested = cpu_slot.ceil().max(1.0) as usize;
        let available = {
            let cpu = self.resources.cpu.read().await;
            cpu.free_count()
        };
        let num_cores = requested.min(available.max(1));

        let (numa_node, cpu_set) = {
            let mut cpu = self.resources.cpu.write().await;
            cpu.alloc(num_cores)?
        };

        let memory_limit = (mem_slot * MEM_SLOT_BYTES) as u64;

        let mut shares = BTreeMap::new();
        shares.insert(SHARE_CPU.to_string(), cpu_slot);
        shares.insert(SHARE_MEM.to_string(), mem_slot);
        shares.insert(SHARE_GPU.to_string(), gpu_slot);
        shares.insert(SHARE_TPU.to_string(), tpu_slot);

        let mut accelerator_shares = BTreeMap::new();
        for (class, slot) in [("gpu", gpu_slot), ("tpu", tpu_slot)] {
            if slot <= 0.0 {
                continue;
            }
            let mut accel = self.resources.accelerators.write().await;
            if let Some(map) = accel.get_mut(class) {
                match map.alloc(slot) {
                    Ok(per_device) => {
                        accelerator_shares.insert(class.to_string(), per_device.into_iter().collect());
                    }
                    Err(e) => {
                        let mut cpu = self.resources.cpu.write().await;
                        cpu.free(&cpu_set);
                        return Err(e);
                    }
                }
            }
        }

        let mounts = config
            .mounts
            .iter()
            .map(|m| KernelMount {
                host_path: m.host_path.clone(),
                kernel_path: m.kernel_path.clone(),
                permission: m.permission,
            })
            .collect();

        Ok(KernelResourceSpec {
            shares,
            accelerator_shares,
            mounts,
            numa_node,
            cpu_set,
            memory_limit,
            scratch_disk_size: 0,
        })
    }

    async fn load_resource_spec(&self, kernel_id: &str) -> AgentResult<KernelResourceSpec> {
        let path = format!("{}/config/resource_spec.json", self.scratch_dir(kernel_id));
        let raw = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| AgentError::Other(anyhow::anyhow!("failed to read {path}: {e}")))?;
        KernelResourceSpec::from_json(&raw)
    }

    /// Derive the `<KIND>_MEMORY_LIMITS`/`<KIND>_PROCESSOR_LIMITS` values for
    /// `resource.txt`, one `DeviceLimits` per accelerator class the spec
    /// allocated a share on, via that class's `share_to_spec` (§4.3 step 4).
    async fn compute_device_limits(
        &self,
        resource_spec: &KernelResourceSpec,
    ) -> HashMap<String, crate::resources::spec::DeviceLimits> {
        let accel = self.resources.accelerators.read().await;
        resource_spec
            .accelerator_shares
            .iter()
            .filter_map(|(class, shares)| {
                accel.get(class).map(|map| (class.clone(), map.device_limits(shares)))
            })
            .collect()
    }

    async fn persist_kernel_config(
        &self,
        kernel_id: &str,
        resource_spec: &KernelResourceSpec,
        env: &[String],
    ) -> anyhow::Result<()> {
        let scratch_dir = self.scratch_dir(kernel_id);
        tokio::fs::create_dir_all(format!("{scratch_dir}/work")).await?;
        tokio::fs::create_dir_all(format!("{scratch_dir}/work/.output")).await?;
        tokio::fs::create_dir_all(format!("{scratch_dir}/config")).await?;

        let environ_txt = env.join("\n") + "\n";
        tokio::fs::write(format!("{scratch_dir}/config/environ.txt"), environ_txt).await?;

        let device_limits = self.compute_device_limits(resource_spec).await;
        let resource_txt = resource_spec.to_resource_txt(&device_limits);
        tokio::fs::write(format!("{scratch_dir}/config/resource.txt"), resource_txt).await?;

        tokio::fs::write(
            format!("{scratch_dir}/config/resource_spec.json"),
            resource_spec.to_json()?,
        )
        .await?;

        Ok(())
    }

    /// Undo any allocation made so far on a failed create. Ports are handled
    /// by the caller, since they may not yet have been drawn at the point of
    /// failure.
    async fn rollback(&self, kernel_id: &str, spec: &KernelResourceSpec, restarting: bool) {
        warn!(kernel_id = %kernel_id, "rolling back failed create");
        if !restarting {
            let mut cpu = self.resources.cpu.write().await;
            cpu.free(&spec.cpu_set);
            let mut accel = self.resources.accelerators.write().await;
            for (class, shares) in &spec.accelerator_shares {
                if let Some(map) = accel.get_mut(class) {
                    map.free(shares);
                }
            }
        }
        let scratch_dir = self.scratch_dir(kernel_id);
        let _ = tokio::fs::remove_dir_all(&scratch_dir).await;
    }
}
