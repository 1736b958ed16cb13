use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::error;

/// Every fallible outcome the orchestrator and its collaborators can produce.
///
/// Bootstrap-time glue (connecting to the daemon, reading the initial config)
/// uses `anyhow::Result` instead — this enum covers the typed failure surface
/// exposed to RPC callers.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("kernel not found: {0}")]
    NotFound(String),

    #[error("insufficient cpu: requested {requested}, available {available}")]
    InsufficientCpu { requested: usize, available: usize },

    #[error("insufficient ports: requested {requested}, available {available}")]
    InsufficientPorts { requested: usize, available: usize },

    #[error("insufficient accelerator share on {class}: requested {requested}, available {available}")]
    InsufficientAccel {
        class: String,
        requested: f64,
        available: f64,
    },

    #[error("failed to pull image {image}: {source}")]
    ImagePullFailed {
        image: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to start container for kernel {kernel_id}: {source}")]
    ContainerStartFailed {
        kernel_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("restart of kernel {0} timed out")]
    RestartTimeout(String),

    #[error("requested file exceeds the download size cap: {size} > {cap}")]
    FileTooLarge { size: u64, cap: u64 },

    #[error("path escapes the kernel work directory: {0}")]
    MalformedPath(String),

    #[error("runner for kernel {0} timed out")]
    RunnerTimeout(String),

    #[error("execution in kernel {0} exceeded its time limit")]
    ExecTimeout(String),

    #[error("container daemon unavailable: {0}")]
    DaemonUnavailable(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AgentError {
    fn status(&self) -> StatusCode {
        match self {
            AgentError::NotFound(_) => StatusCode::NOT_FOUND,
            AgentError::InsufficientCpu { .. }
            | AgentError::InsufficientPorts { .. }
            | AgentError::InsufficientAccel { .. } => StatusCode::SERVICE_UNAVAILABLE,
            AgentError::MalformedPath(_) => StatusCode::BAD_REQUEST,
            AgentError::FileTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            AgentError::RestartTimeout(_)
            | AgentError::RunnerTimeout(_)
            | AgentError::ExecTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AgentError::DaemonUnavailable(_) => StatusCode::BAD_GATEWAY,
            AgentError::ImagePullFailed { .. }
            | AgentError::ContainerStartFailed { .. }
            | AgentError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Name surfaced to RPC callers in the error body — distinct from the
    /// human-readable Display text, which may leak internal detail.
    fn kind(&self) -> &'static str {
        match self {
            AgentError::NotFound(_) => "NOT_FOUND",
            AgentError::InsufficientCpu { .. } => "INSUFFICIENT_CPU",
            AgentError::InsufficientPorts { .. } => "INSUFFICIENT_PORTS",
            AgentError::InsufficientAccel { .. } => "INSUFFICIENT_ACCEL",
            AgentError::ImagePullFailed { .. } => "IMAGE_PULL_FAILED",
            AgentError::ContainerStartFailed { .. } => "CONTAINER_START_FAILED",
            AgentError::RestartTimeout(_) => "RESTART_TIMEOUT",
            AgentError::FileTooLarge { .. } => "FILE_TOO_LARGE",
            AgentError::MalformedPath(_) => "MALFORMED_PATH",
            AgentError::RunnerTimeout(_) => "RUNNER_TIMEOUT",
            AgentError::ExecTimeout(_) => "EXEC_TIMEOUT",
            AgentError::DaemonUnavailable(_) => "DAEMON_UNAVAILABLE",
            AgentError::Other(_) => "INTERNAL",
        }
    }
}

impl IntoResponse for AgentError {
    fn into_response(self) -> Response {
        let status = self.status();
        // NotFound/validation errors are expected traffic; anything else is
        // logged with full detail before a sanitized body crosses the wire.
        if status == StatusCode::INTERNAL_SERVER_ERROR || status == StatusCode::BAD_GATEWAY {
            error!(kind = self.kind(), error = %self, "RPC call failed");
        }
        (
            status,
            Json(serde_json::json!({
                "error": self.kind(),
                "message": self.to_string(),
            })),
        )
            .into_response()
    }
}

pub type AgentResult<T> = Result<T, AgentError>;
