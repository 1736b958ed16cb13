use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::{AgentError, AgentResult};

/// Feature flags the runner negotiates with the in-kernel code runner on
/// construction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunnerFeatures {
    pub input: bool,
    pub continuation: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RunnerRequest {
    FeedBatch { opts: serde_json::Value },
    FeedCode { text: String },
    FeedInput { text: String },
    FeedInterrupt,
    FeedAndGetCompletion { text: String, opts: serde_json::Value },
    FeedStartService { name: String, port: u16, protocol: String, options: serde_json::Value },
    GetNextResult { api_version: u32, flush_timeout_ms: u64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerResult {
    pub status: String,
    pub console: Vec<serde_json::Value>,
    pub exceptions: Vec<String>,
    pub options: Option<serde_json::Value>,
}

/// A connection to one kernel's in-container code runner, reached over its
/// `repl_in`/`repl_out` port pair. At most one exists per kernel at a time —
/// enforced by the orchestrator's runner-construction lock, not by this type.
#[derive(Clone)]
pub struct KernelRunner {
    inner: std::sync::Arc<Mutex<TcpStream>>,
    features: RunnerFeatures,
}

impl KernelRunner {
    /// Connect to a kernel's runner. Construction itself does no
    /// long-running negotiation beyond the TCP handshake — kept outside
    /// the process-wide creation lock's hold time.
    pub async fn connect(
        kernel_host: &str,
        repl_in_port: u16,
        features: RunnerFeatures,
    ) -> AgentResult<Self> {
        let stream = TcpStream::connect((kernel_host, repl_in_port))
            .await
            .map_err(|e| AgentError::RunnerTimeout(e.to_string()))?;
        Ok(Self {
            inner: std::sync::Arc::new(Mutex::new(stream)),
            features,
        })
    }

    pub fn features(&self) -> &RunnerFeatures {
        &self.features
    }

    async fn send(&self, req: &RunnerRequest) -> AgentResult<()> {
        let payload = rmp_serde::to_vec(req).map_err(|e| AgentError::Other(e.into()))?;
        let mut stream = self.inner.lock().await;
        stream
            .write_u32(payload.len() as u32)
            .await
            .map_err(|e| AgentError::Other(e.into()))?;
        stream
            .write_all(&payload)
            .await
            .map_err(|e| AgentError::Other(e.into()))?;
        Ok(())
    }

    pub async fn feed_batch(&self, opts: serde_json::Value) -> AgentResult<()> {
        self.send(&RunnerRequest::FeedBatch { opts }).await
    }

    pub async fn feed_code(&self, text: String) -> AgentResult<()> {
        self.send(&RunnerRequest::FeedCode { text }).await
    }

    pub async fn feed_input(&self, text: String) -> AgentResult<()> {
        self.send(&RunnerRequest::FeedInput { text }).await
    }

    pub async fn feed_interrupt(&self) -> AgentResult<()> {
        self.send(&RunnerRequest::FeedInterrupt).await
    }

    pub async fn feed_and_get_completion(
        &self,
        text: String,
        opts: serde_json::Value,
    ) -> AgentResult<RunnerResult> {
        self.send(&RunnerRequest::FeedAndGetCompletion { text, opts })
            .await?;
        self.get_next_result(1, Duration::from_secs(5)).await
    }

    pub async fn feed_start_service(
        &self,
        name: String,
        port: u16,
        protocol: String,
        options: serde_json::Value,
    ) -> AgentResult<RunnerResult> {
        self.send(&RunnerRequest::FeedStartService {
            name,
            port,
            protocol,
            options,
        })
        .await?;
        self.get_next_result(1, Duration::from_secs(5)).await
    }

    /// Read one response frame, bounded by `flush_timeout`. A timeout is
    /// surfaced as `RunnerTimeout` — the caller decides whether that means
    /// the kernel hung (and should be destroyed with reason exec-timeout).
    pub async fn get_next_result(
        &self,
        _api_version: u32,
        flush_timeout: Duration,
    ) -> AgentResult<RunnerResult> {
        let mut stream = self.inner.lock().await;
        let read = tokio::time::timeout(flush_timeout, async {
            let len = stream.read_u32().await?;
            let mut buf = vec![0u8; len as usize];
            stream.read_exact(&mut buf).await?;
            Ok::<_, std::io::Error>(buf)
        })
        .await;

        match read {
            Ok(Ok(buf)) => {
                rmp_serde::from_slice(&buf).map_err(|e| AgentError::Other(e.into()))
            }
            Ok(Err(e)) => Err(AgentError::Other(e.into())),
            Err(_) => Err(AgentError::RunnerTimeout(
                "timed out waiting for runner result".into(),
            )),
        }
    }

    /// Close the underlying connection. Best-effort: a shutdown failure is
    /// logged, not propagated — the kernel is being torn down regardless.
    pub async fn close(&self) {
        let mut stream = self.inner.lock().await;
        if let Err(e) = stream.shutdown().await {
            warn!(error = %e, "failed to cleanly shut down runner connection");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runner_request_round_trips_through_msgpack() {
        let req = RunnerRequest::FeedCode {
            text: "print(1)".into(),
        };
        let bytes = rmp_serde::to_vec(&req).unwrap();
        let back: RunnerRequest = rmp_serde::from_slice(&bytes).unwrap();
        match back {
            RunnerRequest::FeedCode { text } => assert_eq!(text, "print(1)"),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn runner_result_round_trips_through_msgpack() {
        let result = RunnerResult {
            status: "finished".into(),
            console: vec![serde_json::json!(["stdout", "hi"])],
            exceptions: Vec::new(),
            options: None,
        };
        let bytes = rmp_serde::to_vec(&result).unwrap();
        let back: RunnerResult = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(back.status, "finished");
    }

    #[tokio::test]
    async fn connect_fails_fast_against_closed_port() {
        // Port 1 is reserved/unlikely to be listening; connect should fail
        // quickly rather than hang.
        let result = KernelRunner::connect("127.0.0.1", 1, RunnerFeatures::default()).await;
        assert!(result.is_err());
    }
}
