use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const STAT_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatFrame {
    pub cid: String,
    pub status: String,
    pub data: HashMap<String, serde_json::Value>,
}

/// Per-container collector state, keyed by container id.
#[derive(Debug, Clone, Default)]
pub struct StatCollectorState {
    pub last_stat: Option<HashMap<String, serde_json::Value>>,
    pub terminated: bool,
}

struct CacheEntry {
    data: HashMap<String, serde_json::Value>,
    inserted_at: Instant,
}

/// Fan-in for per-container stats samples pushed by sidecar collectors,
/// mirrored into a TTL cache keyed by kernel-id.
#[derive(Clone)]
pub struct StatsCollector {
    by_container: Arc<RwLock<HashMap<String, StatCollectorState>>>,
    cache: Arc<RwLock<HashMap<String, CacheEntry>>>,
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsCollector {
    pub fn new() -> Self {
        Self {
            by_container: Arc::new(RwLock::new(HashMap::new())),
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Bind the stats ingress socket and loop forever accepting frames.
    /// `resolve_kernel_id` maps an unknown container id (e.g. after an
    /// agent restart) back to a kernel-id so the cache key stays
    /// kernel-id-based rather than container-id-based.
    pub async fn run(
        &self,
        bind_addr: (std::net::IpAddr, u16),
        resolve_kernel_id: impl Fn(&str) -> Option<String> + Send + Sync + 'static,
    ) -> anyhow::Result<()> {
        let listener = TcpListener::bind(bind_addr).await?;
        info!(addr = ?bind_addr, "stats fan-in listening");
        let resolve_kernel_id = Arc::new(resolve_kernel_id);

        loop {
            let (mut socket, peer) = match listener.accept().await {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "stats fan-in accept failed");
                    continue;
                }
            };
            let this = self.clone();
            let resolve = resolve_kernel_id.clone();
            tokio::spawn(async move {
                loop {
                    let len = match socket.read_u32().await {
                        Ok(l) => l,
                        Err(_) => break,
                    };
                    let mut buf = vec![0u8; len as usize];
                    if socket.read_exact(&mut buf).await.is_err() {
                        break;
                    }
                    let frame: StatFrame = match rmp_serde::from_slice(&buf) {
                        Ok(f) => f,
                        Err(e) => {
                            warn!(error = %e, peer = %peer, "malformed stats frame");
                            continue;
                        }
                    };
                    this.ingest(frame, resolve.as_ref()).await;
                }
            });
        }
    }

    async fn ingest(&self, frame: StatFrame, resolve_kernel_id: &(impl Fn(&str) -> Option<String> + ?Sized)) {
        let terminated = frame.status == "terminated";
        {
            let mut map = self.by_container.write().await;
            let entry = map.entry(frame.cid.clone()).or_default();
            entry.last_stat = Some(frame.data.clone());
            entry.terminated = terminated;
        }

        if let Some(kernel_id) = resolve_kernel_id(&frame.cid) {
            let mut cache = self.cache.write().await;
            cache.insert(
                kernel_id,
                CacheEntry {
                    data: frame.data,
                    inserted_at: Instant::now(),
                },
            );
        } else {
            debug!(cid = %frame.cid, "stats frame for unknown container");
        }
    }

    pub async fn last_stat(&self, container_id: &str) -> Option<HashMap<String, serde_json::Value>> {
        let map = self.by_container.read().await;
        map.get(container_id).and_then(|s| s.last_stat.clone())
    }

    pub async fn is_terminated(&self, container_id: &str) -> bool {
        let map = self.by_container.read().await;
        map.get(container_id).map(|s| s.terminated).unwrap_or(false)
    }

    /// Read the cached sample for a kernel, honoring the TTL — an expired
    /// entry reads back as absent rather than being lazily evicted here.
    pub async fn cached(&self, kernel_id: &str) -> Option<HashMap<String, serde_json::Value>> {
        let cache = self.cache.read().await;
        cache.get(kernel_id).and_then(|entry| {
            if entry.inserted_at.elapsed() < STAT_TTL {
                Some(entry.data.clone())
            } else {
                None
            }
        })
    }

    pub async fn forget_container(&self, container_id: &str) {
        let mut map = self.by_container.write().await;
        map.remove(container_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ingest_updates_last_stat_and_cache() {
        let collector = StatsCollector::new();
        let mut data = HashMap::new();
        data.insert("cpu_used".to_string(), serde_json::json!(12));
        let frame = StatFrame {
            cid: "c1".into(),
            status: "ongoing".into(),
            data,
        };
        collector.ingest(frame, &|cid: &str| Some(format!("kernel-for-{cid}"))).await;

        assert!(collector.last_stat("c1").await.is_some());
        assert!(!collector.is_terminated("c1").await);
        assert!(collector.cached("kernel-for-c1").await.is_some());
    }

    #[tokio::test]
    async fn terminated_status_sets_flag() {
        let collector = StatsCollector::new();
        let frame = StatFrame {
            cid: "c1".into(),
            status: "terminated".into(),
            data: HashMap::new(),
        };
        collector.ingest(frame, &|_: &str| None).await;
        assert!(collector.is_terminated("c1").await);
    }

    #[tokio::test]
    async fn unresolvable_container_skips_cache_but_updates_container_state() {
        let collector = StatsCollector::new();
        let frame = StatFrame {
            cid: "orphan".into(),
            status: "ongoing".into(),
            data: HashMap::new(),
        };
        collector.ingest(frame, &|_: &str| None).await;
        assert!(collector.last_stat("orphan").await.is_some());
    }

    #[tokio::test]
    async fn forget_container_clears_state() {
        let collector = StatsCollector::new();
        let frame = StatFrame {
            cid: "c1".into(),
            status: "ongoing".into(),
            data: HashMap::new(),
        };
        collector.ingest(frame, &|_: &str| None).await;
        collector.forget_container("c1").await;
        assert!(collector.last_stat("c1").await.is_none());
    }
}
