use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{AgentError, AgentResult};

use super::Orchestrator;

const DOWNLOAD_CAP_BYTES: u64 = 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileListEntry {
    pub filename: String,
    pub size: u64,
    pub mode: String,
    pub is_dir: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileListing {
    pub files: Vec<FileListEntry>,
    pub errors: Vec<String>,
    pub abspath: String,
}

impl Orchestrator {
    pub async fn upload_file(
        &self,
        kernel_id: &str,
        filename: &str,
        data: Vec<u8>,
    ) -> AgentResult<()> {
        self.await_restart_if_in_flight(kernel_id).await;
        if !self.registry.contains(kernel_id).await {
            return Err(AgentError::NotFound(kernel_id.to_string()));
        }
        self.registry.touch(kernel_id).await;

        let dest = resolve_under(&self.work_dir(kernel_id), filename)?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                AgentError::Other(anyhow::anyhow!("failed to create directory for upload: {e}"))
            })?;
        }

        tokio::fs::write(&dest, &data)
            .await
            .map_err(|e| AgentError::Other(anyhow::anyhow!("failed to write uploaded file: {e}")))?;

        info!(kernel_id, filename, size = data.len(), "file uploaded");
        Ok(())
    }

    pub async fn download_file(&self, kernel_id: &str, filepath: &str) -> AgentResult<Vec<u8>> {
        self.await_restart_if_in_flight(kernel_id).await;
        if !self.registry.contains(kernel_id).await {
            return Err(AgentError::NotFound(kernel_id.to_string()));
        }
        self.registry.touch(kernel_id).await;

        let src = resolve_under(&self.work_dir(kernel_id), filepath)?;
        let meta = tokio::fs::metadata(&src)
            .await
            .map_err(|e| AgentError::Other(anyhow::anyhow!("failed to stat {filepath}: {e}")))?;
        if meta.len() > DOWNLOAD_CAP_BYTES {
            return Err(AgentError::FileTooLarge {
                size: meta.len(),
                cap: DOWNLOAD_CAP_BYTES,
            });
        }

        tokio::fs::read(&src)
            .await
            .map_err(|e| AgentError::Other(anyhow::anyhow!("failed to read {filepath}: {e}")))
    }

    /// Lists a directory inside the *container*, not the host scratch dir —
    /// a carried-over wart (§9): the original agent shells a listing
    /// one-liner through the daemon's exec endpoint rather than inspecting
    /// the bind-mounted work directory from the host, and this preserves
    /// that behavior rather than silently replacing it with a host-side
    /// `read_dir`.
    pub async fn list_files(&self, kernel_id: &str, path: &str) -> AgentResult<FileListing> {
        self.await_restart_if_in_flight(kernel_id).await;
        self.registry.touch(kernel_id).await;
        let container_id = self
            .registry
            .with_mut(kernel_id, |r| r.container_id.clone())
            .await
            .ok_or_else(|| AgentError::NotFound(kernel_id.to_string()))?;

        let script = list_dir_script(path);
        let output = self
            .docker
            .exec_run(
                &container_id,
                vec!["python3".to_string(), "-c".to_string(), script],
            )
            .await
            .map_err(AgentError::Other)?;

        serde_json::from_str(output.trim()).map_err(|e| {
            warn!(kernel_id, error = %e, "failed to parse list_files output");
            AgentError::Other(anyhow::anyhow!("malformed list_files output: {e}"))
        })
    }

    fn work_dir(&self, kernel_id: &str) -> PathBuf {
        Path::new(&self.scratch_dir(kernel_id)).join("work")
    }
}

/// One-liner run inside the kernel container to enumerate `target`, matching
/// the `{files, errors, abspath}` shape the control plane expects.
fn list_dir_script(target: &str) -> String {
    format!(
        "import json, os\n\
files, errors = [], []\n\
target = {target:?}\n\
try:\n\
\tfor name in sorted(os.listdir(target)):\n\
\t\tfull = os.path.join(target, name)\n\
\t\ttry:\n\
\t\t\tst = os.stat(full)\n\
\t\t\tfiles.append({{'filename': name, 'size': st.st_size, 'mode': oct(st.st_mode), 'is_dir': os.path.isdir(full)}})\n\
\t\texcept OSError as e:\n\
\t\t\terrors.append(str(e))\n\
except OSError as e:\n\
\terrors.append(str(e))\n\
print(json.dumps({{'files': files, 'errors': errors, 'abspath': os.path.abspath(target)}}))\n"
    )
}

/// Resolve `relative` under `base`, rejecting absolute paths and any
/// component that would escape it (§7 MALFORMED_PATH).
fn resolve_under(base: &Path, relative: &str) -> AgentResult<PathBuf> {
    let rel = Path::new(relative);
    if rel.is_absolute() {
        return Err(AgentError::MalformedPath(relative.to_string()));
    }
    let mut resolved = base.to_path_buf();
    for component in rel.components() {
        match component {
            std::path::Component::Normal(part) => resolved.push(part),
            std::path::Component::CurDir => {}
            _ => return Err(AgentError::MalformedPath(relative.to_string())),
        }
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_under_accepts_plain_relative_path() {
        let base = Path::new("/scratch/k1/work");
        let resolved = resolve_under(base, "output.txt").unwrap();
        assert_eq!(resolved, base.join("output.txt"));
    }

    #[test]
    fn resolve_under_accepts_nested_relative_path() {
        let base = Path::new("/scratch/k1/work");
        let resolved = resolve_under(base, "sub/dir/file.txt").unwrap();
        assert_eq!(resolved, base.join("sub").join("dir").join("file.txt"));
    }

    #[test]
    fn resolve_under_rejects_absolute_path() {
        let base = Path::new("/scratch/k1/work");
        assert!(resolve_under(base, "/etc/passwd").is_err());
    }

    #[test]
    fn resolve_under_rejects_parent_escape() {
        let base = Path::new("/scratch/k1/work");
        assert!(resolve_under(base, "../../../etc/passwd").is_err());
    }

    #[test]
    fn list_dir_script_embeds_target_as_python_literal() {
        let script = list_dir_script("/home/work");
        assert!(script.contains("target = \"/home/work\""));
        assert!(script.contains("json.dumps"));
    }

    #[test]
    fn file_listing_round_trips_through_json() {
        let listing = FileListing {
            files: vec![FileListEntry {
                filename: "a.txt".into(),
                size: 12,
                mode: "0o644".into(),
                is_dir: false,
            }],
            errors: Vec::new(),
            abspath: "/home/work".into(),
        };
        let json = serde_json::to_string(&listing).unwrap();
        let back: FileListing = serde_json::from_str(&json).unwrap();
        assert_eq!(back.files.len(), 1);
        assert_eq!(back.abspath, "/home/work");
    }
}
