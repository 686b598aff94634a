use serde::{Deserialize, Serialize};

use crate::error::ErrorCode;

/// `status` ∈ {WAITING, DOWNLOADING, CONVERTING, UPLOADING, FINISHED,
/// FAILED, PAUSED}, serialized the way the control plane expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
    Waiting,
    Downloading,
    Converting,
    Uploading,
    Finished,
    Failed,
    Paused,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resolution {
    pub w: u32,
    pub h: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvertParams {
    #[serde(rename = "videoCodec")]
    pub video_codec: String,
    #[serde(rename = "audioCodec")]
    pub audio_codec: String,
    pub preset: String,
    pub resolution: Option<Resolution>,
}

/// The shape shared by `downloadInfo`/`convertInfo`/`uploadInfo`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProgressRecord {
    #[serde(rename = "startTime")]
    pub start_time: i64,
    #[serde(rename = "endTime", skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
    #[serde(rename = "fileSize", skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    #[serde(rename = "totalSize", skip_serializing_if = "Option::is_none")]
    pub total_size: Option<u64>,
    #[serde(rename = "currentSize")]
    pub current_size: u64,
    pub progress: f64,
    #[serde(rename = "currentSpeed")]
    pub current_speed: f64,
    #[serde(rename = "averageSpeed")]
    pub average_speed: f64,
    pub eta: f64,

    // convert-only
    #[serde(rename = "currentFps", skip_serializing_if = "Option::is_none")]
    pub current_fps: Option<f64>,
    #[serde(rename = "currentFrame", skip_serializing_if = "Option::is_none")]
    pub current_frame: Option<u64>,
    #[serde(rename = "currentBitrate", skip_serializing_if = "Option::is_none")]
    pub current_bitrate: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preset: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<ConvertParams>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<Resolution>,

    // upload-only
    #[serde(rename = "targetUrl", skip_serializing_if = "Option::is_none")]
    pub target_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    #[serde(rename = "totalDuration")]
    pub total_duration_ms: u64,
    #[serde(rename = "compressionRatio")]
    pub compression_ratio: f64,
    pub status: ResultStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskError {
    pub message: String,
    pub code: ErrorCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(rename = "tempFiles", skip_serializing_if = "Option::is_none")]
    pub temp_files: Option<Vec<String>>,
}

impl From<&crate::error::RunnerError> for TaskError {
    fn from(err: &crate::error::RunnerError) -> Self {
        use crate::error::RunnerError as E;
        let (command, path) = match err {
            E::Convert { command, .. } => (command.clone(), None),
            E::Upload { path, .. } => (None, path.clone()),
            _ => (None, None),
        };
        let temp_files = err.temp_files();
        Self {
            message: err.to_string(),
            code: err.code(),
            command,
            path,
            temp_files: (!temp_files.is_empty())
                .then(|| temp_files.iter().map(|p| p.display().to_string()).collect()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub source: String,
    pub status: TaskStatus,
    pub priority: i64,
    #[serde(rename = "convertParams")]
    pub convert_params: ConvertParams,
    #[serde(rename = "downloadInfo", skip_serializing_if = "Option::is_none")]
    pub download_info: Option<ProgressRecord>,
    #[serde(rename = "convertInfo", skip_serializing_if = "Option::is_none")]
    pub convert_info: Option<ProgressRecord>,
    #[serde(rename = "uploadInfo", skip_serializing_if = "Option::is_none")]
    pub upload_info: Option<ProgressRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,

    /// Transcoded video duration, stashed here by the `Converting` state so
    /// `Complete` can populate `result.totalDuration` without re-probing the
    /// file. Not part of the control plane's wire contract for this entity.
    #[serde(skip, default)]
    pub video_duration_ms: Option<u64>,
}

/// The three pipeline stages a task passes through, used both as the
/// queue key (C8) and the state-machine entry point (C7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Download,
    Convert,
    Upload,
}

impl Stage {
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Download => Some(Self::Convert),
            Self::Convert => Some(Self::Upload),
            Self::Upload => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_status_round_trips_as_uppercase() {
        let json = serde_json::to_string(&TaskStatus::Downloading).unwrap();
        assert_eq!(json, "\"DOWNLOADING\"");
        let back: TaskStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back, TaskStatus::Downloading);
    }

    #[test]
    fn finished_and_failed_are_terminal() {
        assert!(TaskStatus::Finished.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Uploading.is_terminal());
    }

    #[test]
    fn stage_next_advances_through_pipeline() {
        assert_eq!(Stage::Download.next(), Some(Stage::Convert));
        assert_eq!(Stage::Convert.next(), Some(Stage::Upload));
        assert_eq!(Stage::Upload.next(), None);
    }

    #[test]
    fn task_error_carries_command_only_for_convert_errors() {
        let err = crate::error::RunnerError::convert("ffmpeg exited 1").with_command("ffmpeg -i in.mp4");
        let task_err = TaskError::from(&err);
        assert_eq!(task_err.command.as_deref(), Some("ffmpeg -i in.mp4"));
        assert!(task_err.path.is_none());
    }
}
