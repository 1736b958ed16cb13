mod config;
mod docker;
mod error;
mod events;
mod image;
mod metadata;
mod orchestrator;
mod registry;
mod resources;
mod rpc;
mod runner;
mod stats;

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::config::AgentConfig;
use crate::docker::DockerManager;
use crate::events::reaper::ContainerEventReaper;
use crate::events::{EventPublisher, TerminationReason};
use crate::image::ImageRef;
use crate::metadata::{keys, MetadataClient};
use crate::orchestrator::Orchestrator;
use crate::registry::{KernelRecord, KernelRegistry};
use crate::resources::spec::KernelResourceSpec;
use crate::resources::ResourceMaps;
use crate::stats::StatsCollector;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(3);
const IDLE_REAPER_INTERVAL: Duration = Duration::from_secs(10);
const IMAGE_RESCAN_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kernel_agent=info,tower_http=info".into()),
        )
        .init();

    info!("Starting kernel agent v{}", env!("CARGO_PKG_VERSION"));

    let mut config = AgentConfig::from_env()?;
    let instance_id =
        std::env::var("AGENT_INSTANCE_ID").unwrap_or_else(|_| format!("i-{}", uuid::Uuid::new_v4()));
    info!(instance_id = %instance_id, bind_addr = %config.bind_addr, "configuration loaded");

    let docker = DockerManager::new(&config).await?;
    let metadata = MetadataClient::connect(&config.etcd_addr).await?;

    info!("waiting for manager to register in the metadata service");
    metadata.wait_for_key(keys::MANAGER).await?;

    let event_addr = metadata.get_with_default(keys::MANAGER_EVENT_ADDR, "127.0.0.1:8081").await?;
    config.idle_timeout_secs = metadata
        .get_with_default(keys::IDLE_TIMEOUT, &config.idle_timeout_secs.to_string())
        .await?
        .parse()
        .unwrap_or(config.idle_timeout_secs);
    config.docker_registry = metadata
        .get_with_default(keys::DOCKER_REGISTRY, &config.docker_registry)
        .await?;
    config.vfolder_mount = metadata
        .get_with_default(keys::VFOLDER_MOUNT, &config.vfolder_mount)
        .await?;
    // nodes/redis is read for parity with the manager's own bootstrap but is
    // never dialed here — the in-memory StatsCollector cache already covers
    // the stats fan-in this agent needs (see DESIGN.md).
    let _redis_addr = metadata.get(keys::REDIS).await?;

    metadata
        .put(&keys::agent_status(&instance_id), "starting")
        .await?;
    metadata
        .put(&keys::agent_ip(&instance_id), &config.advertised_host()?)
        .await?;

    let config = Arc::new(config);

    let num_cores = config::parse_hex_mask(&config.limit_cpus_mask)
        .map(|set| set.len())
        .unwrap_or_else(|| std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1));
    info!(num_cores, "cpu allocation map sized");

    let resources = ResourceMaps::new(&config, num_cores);
    detect_accelerator_plugins(&resources).await;

    let registry = KernelRegistry::new();
    let publisher = EventPublisher::new(instance_id.clone(), event_addr);
    let stats = StatsCollector::new();

    let orchestrator = Orchestrator::new(
        config.clone(),
        docker.clone(),
        resources,
        registry,
        publisher.clone(),
        stats.clone(),
    );

    let images = docker.scan_kernel_images().await.unwrap_or_default();
    info!(count = images.len(), "bootstrap image scan complete");

    if let Err(e) = reconcile_containers(&orchestrator, &config).await {
        warn!(error = %e, "container reconciliation failed");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    {
        let registry = orchestrator.registry().clone();
        let stats = stats.clone();
        let bind_addr = (IpAddr::V4(Ipv4Addr::UNSPECIFIED), config.stat_port);
        tokio::spawn(async move {
            if let Err(e) = stats
                .run(bind_addr, move |cid: &str| registry.kernel_id_for_container(cid))
                .await
            {
                error!(error = %e, "stats fan-in exited");
            }
        });
    }

    let (clean_tx, mut clean_rx) = mpsc::unbounded_channel::<String>();
    {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            while let Some(kernel_id) = clean_rx.recv().await {
                orchestrator.clean_kernel(&kernel_id).await;
            }
        });
    }

    {
        let reaper = ContainerEventReaper::new(
            docker.clone(),
            publisher.clone(),
            orchestrator.pending_reasons.clone(),
        );
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            reaper.run(clean_tx, shutdown_rx).await;
        });
    }

    spawn_heartbeat_task(orchestrator.clone(), config.clone(), publisher.clone(), shutdown_rx.clone());
    spawn_idle_reaper_task(orchestrator.clone(), config.idle_timeout_secs, shutdown_rx.clone());
    spawn_image_rescan_task(docker.clone(), shutdown_rx.clone());

    publisher.instance_started().await;
    metadata.put(&keys::agent_status(&instance_id), "running").await?;
    info!("agent bootstrap complete");

    let app = rpc::build_router(orchestrator.clone());
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "RPC server listening");

    let signal = tokio::select! {
        result = axum::serve(listener, app) => {
            if let Err(e) = result {
                error!(error = %e, "RPC server exited with error");
            }
            None
        }
        signal = wait_for_shutdown_signal() => Some(signal),
    };

    if let Some(signal) = signal {
        info!(?signal, "shutdown signal received, winding down");
    }

    let _ = shutdown_tx.send(true);
    let _ = metadata.delete_prefix(&keys::agent_status(&instance_id)).await;

    if matches!(signal, Some(ShutdownSignal::Term)) {
        orchestrator
            .destroy_all(TerminationReason::AgentTermination, true)
            .await;
        publisher.instance_terminated(TerminationReason::AgentTermination.as_str()).await;
    } else {
        publisher.instance_terminated("agent-interrupted").await;
    }

    info!("agent shutdown complete");
    Ok(())
}

#[derive(Debug, Clone, Copy)]
enum ShutdownSignal {
    Term,
    Int,
}

async fn wait_for_shutdown_signal() -> ShutdownSignal {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    tokio::select! {
        _ = sigterm.recv() => ShutdownSignal::Term,
        _ = sigint.recv() => ShutdownSignal::Int,
    }
}

/// Accelerator plugin discovery is a no-op in this build — there is no
/// CUDA/TPU plugin integration to probe, mirroring the orchestrator's own
/// `check_images`-is-a-stub precedent. Kept as an explicit bootstrap step so
/// a real plugin hook has an obvious place to land.
async fn detect_accelerator_plugins(_resources: &ResourceMaps) {
    info!("accelerator plugin detection is a no-op in this build");
}

/// Restore registry/resource state for containers that survived a restart
/// of this agent process. Containers no longer alive are reported
/// terminated rather than reconciled.
async fn reconcile_containers(orchestrator: &Orchestrator, config: &AgentConfig) -> Result<()> {
    let containers = orchestrator.docker.list_kernel_containers().await?;
    let mut restored = 0usize;
    let mut reaped = 0usize;

    for c in &containers {
        let Some(container_id) = c.id.clone() else {
            continue;
        };
        let Some(name) = c.names.as_ref().and_then(|n| n.first()).cloned() else {
            continue;
        };
        let trimmed = name.trim_start_matches('/').to_string();
        let Some(kernel_id) = crate::image::kernel_id_from_container_name(&trimmed) else {
            continue;
        };

        let alive = matches!(
            c.state,
            Some(bollard::models::ContainerSummaryStateEnum::RUNNING)
                | Some(bollard::models::ContainerSummaryStateEnum::RESTARTING)
                | Some(bollard::models::ContainerSummaryStateEnum::PAUSED)
        );

        if !alive {
            orchestrator
                .publisher
                .kernel_terminated(&kernel_id, TerminationReason::SelfTerminated, None)
                .await;
            reaped += 1;
            continue;
        }

        let scratch_dir = format!("{}/{}", config.scratch_root, kernel_id);
        let spec_path = format!("{scratch_dir}/config/resource_spec.json");
        let spec = match tokio::fs::read_to_string(&spec_path).await {
            Ok(raw) => match KernelResourceSpec::from_json(&raw) {
                Ok(spec) => spec,
                Err(e) => {
                    warn!(kernel_id, error = %e, "failed to parse resource spec during reconcile, skipping");
                    continue;
                }
            },
            Err(e) => {
                warn!(kernel_id, error = %e, "missing resource spec during reconcile, skipping");
                continue;
            }
        };

        let repl_in_port = orchestrator.docker.bound_host_port(&container_id, 2000).await.ok().flatten();
        let repl_out_port = orchestrator.docker.bound_host_port(&container_id, 2001).await.ok().flatten();
        let (Some(repl_in_port), Some(repl_out_port)) = (repl_in_port, repl_out_port) else {
            warn!(kernel_id, "could not recover bound repl ports during reconcile, skipping");
            continue;
        };

        {
            let mut cpu = orchestrator.resources.cpu.write().await;
            cpu.mark_taken(&spec.cpu_set);
        }
        let short_name = trimmed
            .strip_prefix("kernel.")
            .and_then(|rest| rest.strip_suffix(&format!(".{kernel_id}")))
            .unwrap_or(trimmed.as_str());
        let image = ImageRef::parse(short_name);
        let host = config.advertised_host().unwrap_or_else(|_| "127.0.0.1".to_string());

        let mut host_ports = vec![repl_in_port, repl_out_port];
        let (mut stdin_port, mut stdout_port) = (None, None);
        if image.short_name.contains("git") {
            stdin_port = orchestrator.docker.bound_host_port(&container_id, 2002).await.ok().flatten();
            stdout_port = orchestrator.docker.bound_host_port(&container_id, 2003).await.ok().flatten();
            host_ports.extend(stdin_port);
            host_ports.extend(stdout_port);
        }

        {
            let mut ports = orchestrator.resources.ports.write().await;
            ports.mark_taken(&host_ports);
        }

        let record = KernelRecord {
            kernel_id: kernel_id.clone(),
            image,
            container_id,
            kernel_host: host,
            repl_in_port,
            repl_out_port,
            stdin_port,
            stdout_port,
            service_ports: Vec::new(),
            host_ports,
            exec_timeout_secs: 0,
            last_used: std::time::Instant::now(),
            resource_spec: spec,
            runner_tasks: Default::default(),
            runner: None,
        };
        orchestrator.registry().insert(record).await;
        restored += 1;
    }

    info!(restored, reaped, total = containers.len(), "container reconciliation complete");
    Ok(())
}

fn spawn_heartbeat_task(
    orchestrator: Orchestrator,
    config: Arc<AgentConfig>,
    publisher: EventPublisher,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
        interval.tick().await; // first tick is immediate — skip it
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                _ = interval.tick() => {
                    let cpu_slots = orchestrator.resources.cpu.read().await.num_cores();
                    let (gpu_slots, tpu_slots) = accelerator_slot_totals(&orchestrator).await;
                    let images = orchestrator.docker.scan_kernel_images().await.unwrap_or_default();
                    let host = config.advertised_host().unwrap_or_else(|_| "127.0.0.1".to_string());

                    let payload = serde_json::json!({
                        "ip": host,
                        "region": config.namespace,
                        "addr": config.bind_addr,
                        "mem_slots": 0,
                        "cpu_slots": cpu_slots,
                        "gpu_slots": gpu_slots,
                        "tpu_slots": tpu_slots,
                        "images": encode_images_field(&images),
                    });
                    publisher.instance_heartbeat(payload).await;
                }
            }
        }
    });
}

async fn accelerator_slot_totals(orchestrator: &Orchestrator) -> (f64, f64) {
    let accel = orchestrator.resources.accelerators.read().await;
    let gpu = accel.get("gpu").map(|m| m.free_shares().len() as f64).unwrap_or(0.0);
    let tpu = accel.get("tpu").map(|m| m.free_shares().len() as f64).unwrap_or(0.0);
    (gpu, tpu)
}

/// Encode the locally visible kernel image set the way the heartbeat wire
/// format expects: msgpack, then snappy-compressed, then base64'd so the
/// bytes travel inside a JSON payload.
fn encode_images_field(images: &[String]) -> String {
    use base64::Engine;

    let tagged: Vec<(String, String)> = images.iter().map(|tag| (tag.clone(), tag.clone())).collect();
    let packed = match rmp_serde::to_vec(&tagged) {
        Ok(p) => p,
        Err(e) => {
            warn!(error = %e, "failed to msgpack-encode image list for heartbeat");
            return String::new();
        }
    };
    let compressed = snap::raw::Encoder::new().compress_vec(&packed).unwrap_or_default();
    base64::engine::general_purpose::STANDARD.encode(compressed)
}

fn spawn_idle_reaper_task(orchestrator: Orchestrator, idle_timeout_secs: u64, mut shutdown: watch::Receiver<bool>) {
    if idle_timeout_secs == 0 {
        info!("idle reaper disabled (IDLE_TIMEOUT=0)");
        return;
    }
    tokio::spawn(async move {
        let threshold = Duration::from_secs(idle_timeout_secs);
        let mut interval = tokio::time::interval(IDLE_REAPER_INTERVAL);
        interval.tick().await; // first tick is immediate — skip it
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                _ = interval.tick() => {
                    let idle = orchestrator.registry().idle_kernels(threshold).await;
                    for kernel_id in idle {
                        if let Err(e) = orchestrator
                            .destroy_kernel_reason(&kernel_id, TerminationReason::IdleTimeout, false)
                            .await
                        {
                            warn!(kernel_id = %kernel_id, error = %e, "failed to destroy idle kernel");
                        }
                    }
                }
            }
        }
    });
}

fn spawn_image_rescan_task(docker: DockerManager, mut shutdown: watch::Receiver<bool>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(IMAGE_RESCAN_INTERVAL);
        interval.tick().await; // first tick is immediate — skip it
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                _ = interval.tick() => {
                    match docker.scan_kernel_images().await {
                        Ok(images) => info!(count = images.len(), "periodic image rescan complete"),
                        Err(e) => warn!(error = %e, "periodic image rescan failed"),
                    }
                }
            }
        }
    });
}
