use std::collections::HashMap;

use anyhow::{Context, Result};
use bollard::models::{ContainerCreateBody, EventMessage, HostConfig, Mount, MountTypeEnum};
use bollard::query_parameters::{
    CreateContainerOptions, CreateImageOptions, EventsOptions, InspectContainerOptions,
    KillContainerOptions, ListContainersOptions, RemoveContainerOptions, StartContainerOptions,
};
use bollard::Docker;
use futures::{Stream, StreamExt};
use tracing::{info, warn};

use crate::config::AgentConfig;
use crate::resources::spec::KernelMount;

/// Thin wrapper over the Docker daemon client, scoped to the operations the
/// kernel lifecycle orchestrator needs.
#[derive(Debug, Clone)]
pub struct DockerManager {
    pub docker: Docker,
}

impl DockerManager {
    #[cfg(test)]
    pub(crate) fn test_dummy() -> Self {
        let docker =
            Docker::connect_with_http("http://localhost:1", 1, bollard::API_DEFAULT_VERSION)
                .expect("dummy Docker client");
        Self { docker }
    }

    pub async fn new(_config: &AgentConfig) -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().context("failed to connect to Docker")?;

        let version = docker
            .version()
            .await
            .context("failed to get Docker version — is the Docker socket mounted?")?;
        info!(
            docker_version = version.version.as_deref().unwrap_or("unknown"),
            "connected to Docker"
        );

        Ok(Self { docker })
    }

    /// List every container whose name starts with `kernel.` — i.e. every
    /// container this agent (this or a prior instance) manages.
    pub async fn list_kernel_containers(&self) -> Result<Vec<bollard::models::ContainerSummary>> {
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                ..Default::default()
            }))
            .await
            .context("failed to list containers")?;

        Ok(containers
            .into_iter()
            .filter(|c| {
                c.names
                    .as_ref()
                    .and_then(|n| n.first())
                    .map(|n| n.trim_start_matches('/').starts_with("kernel."))
                    .unwrap_or(false)
            })
            .collect())
    }

    pub async fn inspect_image(&self, reference: &str) -> Result<bool> {
        Ok(self.docker.inspect_image(reference).await.is_ok())
    }

    /// Labels carried by an image, empty if the image has none or the
    /// inspect call fails.
    pub async fn image_labels(&self, reference: &str) -> HashMap<String, String> {
        self.docker
            .inspect_image(reference)
            .await
            .ok()
            .and_then(|info| info.config)
            .and_then(|c| c.labels)
            .unwrap_or_default()
    }

    /// One-shot scan for kernel images already present locally, matching
    /// `^.+/kernel-.+$`. Used at bootstrap and by the periodic rescan timer.
    pub async fn scan_kernel_images(&self) -> Result<Vec<String>> {
        let images = self.docker.list_images(None).await?;
        Ok(images
            .into_iter()
            .flat_map(|img| img.repo_tags)
            .filter(|tag| {
                tag.rsplit_once('/')
                    .map(|(_, name)| name.starts_with("kernel-"))
                    .unwrap_or(false)
            })
            .collect())
    }

    /// Pull an image if not already present locally.
    pub async fn ensure_image(&self, reference: &str) -> Result<()> {
        if self.inspect_image(reference).await? {
            return Ok(());
        }

        let (repo, tag) = reference.rsplit_once(':').unwrap_or((reference, "latest"));
        info!(image = %reference, "pulling image");

        let mut stream = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: Some(repo.to_string()),
                tag: Some(tag.to_string()),
                ..Default::default()
            }),
            None,
            None,
        );

        while let Some(result) = stream.next().await {
            result.context("image pull failed")?;
        }

        info!(image = %reference, "image pulled");
        Ok(())
    }

    /// Tail the container's combined stdout/stderr, newest lines last.
    pub async fn logs_tail(&self, container_id: &str) -> Result<String> {
        use bollard::query_parameters::LogsOptions;

        let mut stream = self.docker.logs(
            container_id,
            Some(LogsOptions {
                stdout: true,
                stderr: true,
                tail: "200".to_string(),
                ..Default::default()
            }),
        );

        let mut out = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(log) => out.push_str(&log.to_string()),
                Err(e) => {
                    warn!(container = %container_id, error = %e, "log stream error");
                    break;
                }
            }
        }
        Ok(out)
    }

    pub async fn inspect_container(
        &self,
        container_id: &str,
    ) -> Result<bollard::models::ContainerInspectResponse> {
        Ok(self
            .docker
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await?)
    }

    /// Create and start a kernel container. Returns the container id.
    /// Callers own rollback: on failure here the caller is responsible for
    /// returning any ports/cpu/accelerator shares it already reserved.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_kernel_container(
        &self,
        name: &str,
        image: &str,
        env: Vec<String>,
        cpu_set: &str,
        cpu_slot: f64,
        numa_node: usize,
        memory_limit: u64,
        port_bindings: HashMap<String, Option<Vec<bollard::models::PortBinding>>>,
        exposed_ports: HashMap<String, HashMap<(), ()>>,
        mounts: &[KernelMount],
        extra_binds: &[String],
    ) -> Result<String> {
        let mut docker_mounts: Vec<Mount> = mounts
            .iter()
            .map(|m| Mount {
                source: Some(m.host_path.clone()),
                target: Some(m.kernel_path.clone()),
                typ: Some(MountTypeEnum::BIND),
                read_only: Some(matches!(
                    m.permission,
                    crate::resources::spec::MountPermission::ReadOnly
                )),
                ..Default::default()
            })
            .collect();

        for bind in extra_binds {
            if let Some((host, rest)) = bind.split_once(':') {
                let (container, ro) = match rest.rsplit_once(':') {
                    Some((c, "ro")) => (c, true),
                    _ => (rest, false),
                };
                docker_mounts.push(Mount {
                    source: Some(host.to_string()),
                    target: Some(container.to_string()),
                    typ: Some(MountTypeEnum::BIND),
                    read_only: Some(ro),
                    ..Default::default()
                });
            }
        }

        let host_config = HostConfig {
            memory: Some(memory_limit as i64),
            memory_swap: Some(0),
            cpu_period: Some(100_000),
            cpu_quota: Some((100_000_f64 * cpu_slot) as i64),
            cpuset_cpus: Some(cpu_set.to_string()),
            cpuset_mems: Some(numa_node.to_string()),
            security_opt: Some(vec!["seccomp=unconfined".to_string()]),
            port_bindings: Some(port_bindings),
            mounts: Some(docker_mounts),
            ..Default::default()
        };

        let container_config = ContainerCreateBody {
            image: Some(image.to_string()),
            env: Some(env),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            stop_signal: Some("SIGINT".to_string()),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: Some(name.to_string()),
                    ..Default::default()
                }),
                container_config,
            )
            .await
            .context("failed to create kernel container")?;

        if let Err(e) = self
            .docker
            .start_container(&created.id, None::<StartContainerOptions>)
            .await
        {
            warn!(container = %created.id, error = %e, "failed to start kernel container — removing");
            let _ = self
                .docker
                .remove_container(
                    &created.id,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await;
            return Err(e).context("failed to start kernel container");
        }

        Ok(created.id)
    }

    pub async fn kill_container(&self, container_id: &str) -> Result<()> {
        match self
            .docker
            .kill_container(container_id, None::<KillContainerOptions>)
            .await
        {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError { status_code, .. })
                if status_code == 404 || status_code == 409 =>
            {
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn remove_container(&self, container_id: &str, skip_deletion: bool) -> Result<()> {
        if skip_deletion {
            return Ok(());
        }
        match self
            .docker
            .remove_container(
                container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError { status_code, .. })
                if status_code == 404 || status_code == 409 =>
            {
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Report the host port the daemon actually bound for a container port,
    /// for the §4.3 create-time round-trip check against the port drawn
    /// from the pool.
    pub async fn bound_host_port(&self, container_id: &str, container_port: u16) -> Result<Option<u16>> {
        let info = self.inspect_container(container_id).await?;
        let key = format!("{container_port}/tcp");
        let port = info
            .network_settings
            .and_then(|ns| ns.ports)
            .and_then(|ports| ports.get(&key).cloned().flatten())
            .and_then(|bindings| bindings.into_iter().next())
            .and_then(|b| b.host_port)
            .and_then(|p| p.parse::<u16>().ok());
        Ok(port)
    }

    /// Run a command inside a container via the daemon's exec endpoint and
    /// collect its combined stdout/stderr. Used by `list_files`, which
    /// delegates directory listing to a one-liner run inside the kernel
    /// rather than inspecting the container's filesystem from the host.
    pub async fn exec_run(&self, container_id: &str, cmd: Vec<String>) -> Result<String> {
        use bollard::exec::{CreateExecOptions, StartExecResults};

        let exec = self
            .docker
            .create_exec(
                container_id,
                CreateExecOptions {
                    cmd: Some(cmd),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .context("failed to create exec")?;

        let mut out = String::new();
        if let StartExecResults::Attached { mut output, .. } =
            self.docker.start_exec(&exec.id, None).await?
        {
            while let Some(chunk) = output.next().await {
                out.push_str(&chunk?.to_string());
            }
        }
        Ok(out)
    }

    /// Stream daemon events filtered to container-type events, for the
    /// reaper. Reconnection on stream-end is the caller's responsibility.
    pub fn container_events(&self) -> impl Stream<Item = Result<EventMessage>> + '_ {
        let mut filters = HashMap::new();
        filters.insert("type".to_string(), vec!["container".to_string()]);
        self.docker
            .events(Some(EventsOptions {
                filters: Some(filters),
                ..Default::default()
            }))
            .map(|r| r.map_err(Into::into))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn inspect_image_against_unreachable_daemon_is_false_not_panic() {
        let dm = DockerManager::test_dummy();
        let exists = dm.inspect_image("x/kernel-python:3.9").await.unwrap();
        assert!(!exists);
    }
}
