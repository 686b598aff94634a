use std::path::{Path, PathBuf};

use crate::error::RunnerError;

/// Root scratch directory: `<systemTemp>/videoconverter/`.
fn scratch_root() -> PathBuf {
    std::env::temp_dir().join("videoconverter")
}

/// Ensures `<systemTemp>/videoconverter/` exists (runner startup sequence).
pub async fn ensure_scratch_root() -> anyhow::Result<PathBuf> {
    let root = scratch_root();
    tokio::fs::create_dir_all(&root).await?;
    Ok(root)
}

/// Per-task scratch directory and the fixed layout within it (spec §6
/// "Scratch layout").
#[derive(Debug, Clone)]
pub struct TaskWorkspace {
    task_id: String,
    dir: PathBuf,
}

impl TaskWorkspace {
    /// Creates `<systemTemp>/videoconverter/<taskId>/`, entered when a task
    /// reaches the `Downloading` state.
    pub async fn create(task_id: &str) -> anyhow::Result<Self> {
        let dir = scratch_root().join(task_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| RunnerError::download(format!("creating scratch dir: {e}")))?;
        Ok(Self {
            task_id: task_id.to_string(),
            dir,
        })
    }

    /// Builds the same paths as [`Self::create`] without touching the
    /// filesystem, for terminal transitions that only need to clean up
    /// whatever may already be there.
    pub fn at(task_id: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            dir: scratch_root().join(task_id),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Destination of the downloaded source file within the scratch dir.
    pub fn download_dest(&self) -> PathBuf {
        self.dir.join("source")
    }

    /// `<systemTemp>/videoconverter/<taskId>_converted.mp4`, a sibling of
    /// the scratch directory rather than a child of it, matching the
    /// control plane's fixed naming.
    pub fn converted_path(&self) -> PathBuf {
        scratch_root().join(format!("{}_converted.mp4", self.task_id))
    }

    /// Deterministic cleanup: removes the scratch dir and, if present, the
    /// converted output. Errors are logged, never propagated — cleanup
    /// failure must not block a terminal transition from completing.
    pub async fn cleanup(&self) {
        if let Err(err) = tokio::fs::remove_dir_all(&self.dir).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(task_id = %self.task_id, dir = %self.dir.display(), error = %err, "failed to remove scratch dir");
            }
        }
        let converted = self.converted_path();
        if let Err(err) = tokio::fs::remove_file(&converted).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(task_id = %self.task_id, path = %converted.display(), error = %err, "failed to remove converted file");
            }
        }
    }
}
