use anyhow::{Context, Result};
use etcd_client::{Client, GetOptions, WatchOptions};
use tracing::info;

/// Thin wrapper over the etcd-compatible metadata service. Every key this
/// agent reads or writes lives under one of a handful of fixed prefixes —
/// see the module-level constants.
#[derive(Clone)]
pub struct MetadataClient {
    client: Client,
}

pub mod keys {
    pub const MANAGER: &str = "nodes/manager";
    pub const REDIS: &str = "nodes/redis";
    pub const MANAGER_EVENT_ADDR: &str = "nodes/manager/event_addr";
    pub const IDLE_TIMEOUT: &str = "nodes/idle_timeout";
    pub const DOCKER_REGISTRY: &str = "nodes/docker_registry";
    pub const VFOLDER_MOUNT: &str = "volumes/_mount";

    pub fn agent_status(instance_id: &str) -> String {
        format!("nodes/agents/{instance_id}")
    }

    pub fn agent_ip(instance_id: &str) -> String {
        format!("nodes/agents/{instance_id}/ip")
    }
}

impl MetadataClient {
    pub async fn connect(addr: &str) -> Result<Self> {
        let client = Client::connect([addr], None)
            .await
            .context("failed to connect to metadata service")?;
        Ok(Self { client })
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut client = self.client.clone();
        let resp = client.get(key, None).await?;
        Ok(resp
            .kvs()
            .first()
            .map(|kv| kv.value_str().unwrap_or_default().to_string()))
    }

    pub async fn get_with_default(&self, key: &str, default: &str) -> Result<String> {
        Ok(self.get(key).await?.unwrap_or_else(|| default.to_string()))
    }

    pub async fn put(&self, key: &str, value: &str) -> Result<()> {
        let mut client = self.client.clone();
        client.put(key, value, None).await?;
        Ok(())
    }

    pub async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        let mut client = self.client.clone();
        client
            .delete(prefix, Some(etcd_client::DeleteOptions::new().with_prefix()))
            .await?;
        Ok(())
    }

    pub async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let mut client = self.client.clone();
        let resp = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await?;
        Ok(resp
            .kvs()
            .iter()
            .map(|kv| {
                (
                    kv.key_str().unwrap_or_default().to_string(),
                    kv.value_str().unwrap_or_default().to_string(),
                )
            })
            .collect())
    }

    /// Block until a value appears at `key` (either already present, or via
    /// a `put` watch event). Used during bootstrap to wait for the manager
    /// to register itself.
    pub async fn wait_for_key(&self, key: &str) -> Result<String> {
        if let Some(v) = self.get(key).await? {
            return Ok(v);
        }

        info!(key, "waiting for key to appear in metadata service");
        let mut client = self.client.clone();
        let (mut watcher, mut stream) = client.watch(key, Some(WatchOptions::new())).await?;
        let result = loop {
            match stream.message().await? {
                Some(resp) => {
                    if let Some(event) = resp.events().iter().find(|e| e.event_type() == etcd_client::EventType::Put) {
                        if let Some(kv) = event.kv() {
                            break kv.value_str().unwrap_or_default().to_string();
                        }
                    }
                }
                None => anyhow::bail!("metadata watch stream closed before {key} appeared"),
            }
        };
        watcher.cancel().await.ok();
        Ok(result)
    }
}
