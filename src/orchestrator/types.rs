use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::registry::BoundServicePort;
use crate::resources::ports::ServicePortDecl;
use crate::resources::spec::{KernelResourceSpec, MountPermission};

/// Resource request slots, as submitted by the control plane. Each is a
/// decimal string so fractional accelerator shares (e.g. "0.5") round-trip
/// without floating point surprises in transit.
#[derive(Debug, Clone, Deserialize)]
pub struct KernelLimits {
    pub cpu_slot: String,
    pub mem_slot: String,
    #[serde(default = "zero_slot")]
    pub gpu_slot: String,
    #[serde(default = "zero_slot")]
    pub tpu_slot: String,
}

fn zero_slot() -> String {
    "0".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct MountRequest {
    pub host_path: String,
    pub kernel_path: String,
    #[serde(default = "default_permission")]
    pub permission: MountPermission,
}

fn default_permission() -> MountPermission {
    MountPermission::ReadWrite
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateKernelConfig {
    pub lang: String,
    pub limits: KernelLimits,
    #[serde(default)]
    pub mounts: Vec<MountRequest>,
    #[serde(default)]
    pub envs: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateKernelResponse {
    pub id: String,
    pub kernel_host: String,
    pub repl_in_port: u16,
    pub repl_out_port: u16,
    pub stdin_port: Option<u16>,
    pub stdout_port: Option<u16>,
    pub service_ports: Vec<ServicePortDecl>,
    pub container_id: String,
    pub resource_spec: KernelResourceSpec,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestartKernelResponse {
    pub container_id: String,
    pub repl_in_port: u16,
    pub repl_out_port: u16,
    pub stdin_port: Option<u16>,
    pub stdout_port: Option<u16>,
    pub service_ports: Vec<ServicePortDecl>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecuteMode {
    Batch,
    Query,
    Input,
    Continue,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecuteRequest {
    pub api_version: u32,
    pub run_id: Option<String>,
    pub mode: ExecuteMode,
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub opts: serde_json::Value,
    pub flush_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OutputFileManifest {
    pub filename: String,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecuteResponse {
    pub status: String,
    pub console: Vec<serde_json::Value>,
    pub exceptions: Vec<String>,
    pub options: Option<serde_json::Value>,
    pub files: Vec<OutputFileManifest>,
}

pub(crate) fn bound_service_ports_to_decls(ports: &[BoundServicePort]) -> Vec<ServicePortDecl> {
    ports.iter().map(|p| p.decl.clone()).collect()
}
