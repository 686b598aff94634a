use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::backend::Backend;
use crate::carry::CarryStore;
use crate::downloader::Downloader;
use crate::error::RunnerError;
use crate::model::{Stage, Task, TaskError, TaskStatus};
use crate::transcoder::Transcoder;
use crate::uploader::{UploadMetadata, Uploader};
use crate::workspace::TaskWorkspace;

/// Shared collaborators every state needs to drive its stage. Cheap to
/// clone: everything behind it is either `Arc` or itself cheaply cloneable
/// (`reqwest::Client`, `tokio_util::sync::CancellationToken`).
#[derive(Clone)]
pub struct StateContext {
    pub backend: Arc<Backend>,
    pub carry: Arc<CarryStore>,
    pub downloader: Arc<Downloader>,
    pub transcoder: Arc<Transcoder>,
    pub cancel: CancellationToken,
}

/// The five (plus terminal) explicit states from spec §4.6. Each
/// implements `process` returning the next state to drive immediately, or
/// `None` to yield at a stage boundary — the queue schedules the next
/// stage. Grounded on the teacher's `WorkerStage` enum (`api.rs`) and
/// `run_worker_task`'s command-dispatch loop (`worker.rs`), generalized
/// from two stages to this pipeline's five.
#[derive(Debug, Clone)]
pub enum TaskState {
    Waiting,
    Downloading,
    Converting,
    Uploading,
    Complete,
    Failed(RunnerError),
}

impl TaskState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Downloading => "downloading",
            Self::Converting => "converting",
            Self::Uploading => "uploading",
            Self::Complete => "complete",
            Self::Failed(_) => "failed",
        }
    }

    /// "Starting a processor with stage X enters directly at the
    /// corresponding entry state" (spec §4.6).
    pub fn entry_for(stage: Stage) -> Self {
        match stage {
            Stage::Download => Self::Downloading,
            Stage::Convert => Self::Converting,
            Stage::Upload => Self::Uploading,
        }
    }

    /// Drives this state once. A returned `Ok(Some(next))` means "drive
    /// `next` immediately within this stage"; `Ok(None)` means "yield".
    /// Any `Err` is the caller's signal to transition to `Failed` on a
    /// fresh state instance (spec §4.6's exception-routing rule).
    pub async fn process(
        &self,
        task: &mut Task,
        ctx: &StateContext,
    ) -> Result<Option<TaskState>, RunnerError> {
        match self {
            Self::Waiting => {
                task.status = TaskStatus::Downloading;
                Ok(Some(Self::Downloading))
            }
            Self::Downloading => self.process_downloading(task, ctx).await,
            Self::Converting => self.process_converting(task, ctx).await,
            Self::Uploading => self.process_uploading(task, ctx).await,
            Self::Complete => self.process_complete(task, ctx).await,
            Self::Failed(err) => self.process_failed(task, ctx, err).await,
        }
    }

    async fn process_downloading(
        &self,
        task: &mut Task,
        ctx: &StateContext,
    ) -> Result<Option<TaskState>, RunnerError> {
        task.status = TaskStatus::Downloading;
        let workspace = TaskWorkspace::create(&task.id)
            .await
            .map_err(|e| RunnerError::download(e.to_string()))?;
        ctx.carry.create(&task.id);

        let task_id = task.id.clone();
        let backend = Arc::clone(&ctx.backend);
        let dest = workspace.download_dest();
        let on_progress = move |record: crate::model::ProgressRecord| {
            let backend = Arc::clone(&backend);
            let task_id = task_id.clone();
            tokio::spawn(async move {
                if let Err(err) = backend.download_progress(&task_id, &record).await {
                    tracing::warn!(task_id, error = %err, "dropping download progress tick");
                }
            });
        };

        let downloaded = ctx
            .downloader
            .download(&task.source, &dest, ctx.cancel.clone(), on_progress)
            .await
            .map_err(|e| e.with_temp_files(vec![workspace.dir().to_path_buf()]))?;

        let downloaded_str = downloaded.display().to_string();
        ctx.carry.set_downloaded(&task.id, downloaded_str.clone());

        if let Err(err) = ctx.backend.download_complete(&task.id, &downloaded_str).await {
            tracing::warn!(task_id = %task.id, error = %err, "downloadComplete call failed");
        }

        Ok(None)
    }

    async fn process_converting(
        &self,
        task: &mut Task,
        ctx: &StateContext,
    ) -> Result<Option<TaskState>, RunnerError> {
        task.status = TaskStatus::Converting;
        let entry = ctx.carry.get(&task.id).ok_or_else(|| {
            RunnerError::convert(format!("no carry entry for task {}", task.id))
        })?;
        let downloaded_path = entry.downloaded_file_path.ok_or_else(|| {
            RunnerError::convert(format!("task {} has no downloadedFilePath in carry", task.id))
        })?;

        let workspace = TaskWorkspace::create(&task.id)
            .await
            .map_err(|e| RunnerError::convert(e.to_string()))?;
        let output = workspace.converted_path();

        let task_id = task.id.clone();
        let backend = Arc::clone(&ctx.backend);
        let on_progress = move |record: crate::model::ProgressRecord| {
            let backend = Arc::clone(&backend);
            let task_id = task_id.clone();
            tokio::spawn(async move {
                if let Err(err) = backend.convert_progress(&task_id, &record).await {
                    tracing::warn!(task_id, error = %err, "dropping convert progress tick");
                }
            });
        };

        let outcome = ctx
            .transcoder
            .transcode(
                std::path::Path::new(&downloaded_path),
                &output,
                &task.convert_params,
                ctx.cancel.clone(),
                on_progress,
            )
            .await
            .map_err(|e| e.with_temp_files(vec![output.clone()]))?;

        ctx.carry
            .set_converted(&task.id, output.display().to_string());
        task.convert_info = Some(crate::model::ProgressRecord {
            progress: 100.0,
            current_bitrate: Some(outcome.bitrate_kbps),
            ..Default::default()
        });
        task.video_duration_ms = Some(outcome.duration_ms);

        Ok(None)
    }

    async fn process_uploading(
        &self,
        task: &mut Task,
        ctx: &StateContext,
    ) -> Result<Option<TaskState>, RunnerError> {
        task.status = TaskStatus::Uploading;
        let entry = ctx.carry.get(&task.id).ok_or_else(|| {
            RunnerError::upload(format!("no carry entry for task {}", task.id))
        })?;
        let converted_path = entry.converted_file_path.ok_or_else(|| {
            RunnerError::upload(format!("task {} has no convertedFilePath in carry", task.id))
        })?;

        let creds = ctx
            .backend
            .minio_credentials()
            .await
            .map_err(|e| RunnerError::upload(format!("fetching object-store credentials: {e}")))?;
        let uploader = Uploader::new(&creds.endpoint, &creds.access_key, &creds.secret_key, &creds.bucket).await;

        let local_size = tokio::fs::metadata(&converted_path)
            .await
            .map(|m| m.len())
            .unwrap_or_default();
        let resolution = task.convert_params.resolution.as_ref();
        let metadata = UploadMetadata {
            task_id: task.id.clone(),
            timestamp: chrono::Utc::now().timestamp_millis().to_string(),
            duration: task.video_duration_ms.unwrap_or_default().to_string(),
            bitrate: task
                .convert_info
                .as_ref()
                .and_then(|i| i.current_bitrate)
                .unwrap_or_default()
                .to_string(),
            size: local_size.to_string(),
            width: resolution.map(|r| r.w.to_string()).unwrap_or_default(),
            height: resolution.map(|r| r.h.to_string()).unwrap_or_default(),
        };

        let task_id = task.id.clone();
        let backend = Arc::clone(&ctx.backend);
        let on_progress = move |record: crate::model::ProgressRecord| {
            let backend = Arc::clone(&backend);
            let task_id = task_id.clone();
            tokio::spawn(async move {
                if let Err(err) = backend.upload_progress(&task_id, &record).await {
                    tracing::warn!(task_id, error = %err, "dropping upload progress tick");
                }
            });
        };

        let object_key = format!("{}.mp4", task.id);
        let target_url = uploader
            .upload(
                std::path::Path::new(&converted_path),
                &object_key,
                &metadata,
                on_progress,
            )
            .await?;

        task.upload_info = Some(crate::model::ProgressRecord {
            progress: 100.0,
            target_url: Some(target_url),
            ..Default::default()
        });

        Ok(Some(Self::Complete))
    }

    async fn process_complete(
        &self,
        task: &mut Task,
        ctx: &StateContext,
    ) -> Result<Option<TaskState>, RunnerError> {
        task.status = TaskStatus::Finished;
        let target_url = task
            .upload_info
            .as_ref()
            .and_then(|i| i.target_url.clone())
            .unwrap_or_default();

        if let Err(err) = ctx.backend.complete(&task.id, &target_url).await {
            tracing::warn!(task_id = %task.id, error = %err, "complete call failed");
        }

        let compression_ratio = compression_ratio(&ctx.carry.get(&task.id)).await;
        task.result = Some(crate::model::TaskResult {
            total_duration_ms: task.video_duration_ms.unwrap_or_default(),
            compression_ratio,
            status: crate::model::ResultStatus::Success,
        });

        TaskWorkspace::at(&task.id).cleanup().await;
        ctx.carry.delete(&task.id);
        Ok(None)
    }

    async fn process_failed(
        &self,
        task: &mut Task,
        ctx: &StateContext,
        err: &RunnerError,
    ) -> Result<Option<TaskState>, RunnerError> {
        task.status = TaskStatus::Failed;
        let task_error = TaskError::from(err);

        if let Err(call_err) = ctx.backend.fail(&task.id, &task_error).await {
            tracing::warn!(task_id = %task.id, error = %call_err, "fail call failed");
        }
        task.error = Some(task_error);

        TaskWorkspace::at(&task.id).cleanup().await;
        ctx.carry.delete(&task.id);
        Ok(None)
    }
}

/// Drains a chain of immediately-driven transitions starting from `state`,
/// stopping at the first yield (`Ok(None)`) or error. On error, drives a
/// fresh `Failed` instance once, per spec §4.6.
pub async fn drive(mut state: TaskState, task: &mut Task, ctx: &StateContext) {
    loop {
        match state.process(task, ctx).await {
            Ok(Some(next)) => state = next,
            Ok(None) => break,
            Err(err) => {
                let failed = TaskState::Failed(err);
                let _ = failed.process(task, ctx).await;
                break;
            }
        }
    }
}

/// `downloadedFilePath` size over `convertedFilePath` size, read from the
/// carry entry before it is torn down in `Complete`. Falls back to `1.0`
/// (no measurable compression) when either file is unreadable.
async fn compression_ratio(entry: &Option<crate::carry::CarryEntry>) -> f64 {
    let Some(entry) = entry else { return 1.0 };
    let (Some(downloaded), Some(converted)) =
        (&entry.downloaded_file_path, &entry.converted_file_path)
    else {
        return 1.0;
    };
    let original = tokio::fs::metadata(downloaded).await.map(|m| m.len()).ok();
    let compressed = tokio::fs::metadata(converted).await.map(|m| m.len()).ok();
    match (original, compressed) {
        (Some(original), Some(compressed)) if compressed > 0 => {
            original as f64 / compressed as f64
        }
        _ => 1.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_for_maps_each_stage_to_its_state() {
        assert!(matches!(TaskState::entry_for(Stage::Download), TaskState::Downloading));
        assert!(matches!(TaskState::entry_for(Stage::Convert), TaskState::Converting));
        assert!(matches!(TaskState::entry_for(Stage::Upload), TaskState::Uploading));
    }

    #[test]
    fn names_match_spec_identifiers() {
        assert_eq!(TaskState::Waiting.name(), "waiting");
        assert_eq!(TaskState::Downloading.name(), "downloading");
        assert_eq!(TaskState::Converting.name(), "converting");
        assert_eq!(TaskState::Uploading.name(), "uploading");
        assert_eq!(TaskState::Complete.name(), "complete");
        assert_eq!(TaskState::Failed(RunnerError::download("x")).name(), "failed");
    }

    #[test]
    fn failed_state_preserves_the_original_error_code() {
        let err = RunnerError::convert("ffmpeg exited 1").with_command("ffmpeg -i in.mp4");
        let TaskState::Failed(carried) = TaskState::Failed(err) else {
            unreachable!()
        };
        let task_error = TaskError::from(&carried);
        assert_eq!(task_error.code, crate::error::ErrorCode::ConvertError);
        assert_eq!(task_error.command.as_deref(), Some("ffmpeg -i in.mp4"));
    }

    #[tokio::test]
    async fn compression_ratio_compares_downloaded_and_converted_sizes() {
        let dir = tempfile::tempdir().unwrap();
        let downloaded = dir.path().join("source");
        let converted = dir.path().join("converted.mp4");
        tokio::fs::write(&downloaded, vec![0u8; 1000]).await.unwrap();
        tokio::fs::write(&converted, vec![0u8; 250]).await.unwrap();

        let entry = Some(crate::carry::CarryEntry {
            downloaded_file_path: Some(downloaded.display().to_string()),
            converted_file_path: Some(converted.display().to_string()),
        });
        assert!((compression_ratio(&entry).await - 4.0).abs() < 0.001);
    }

    #[tokio::test]
    async fn compression_ratio_falls_back_when_paths_are_missing() {
        assert_eq!(compression_ratio(&None).await, 1.0);
        assert_eq!(
            compression_ratio(&Some(crate::carry::CarryEntry::default())).await,
            1.0
        );
    }
}
