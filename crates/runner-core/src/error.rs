use std::path::PathBuf;

/// The runner's single error type. Every state processor that fails
/// produces one of these, which maps 1:1 onto the `task.error` shape the
/// control plane expects (`{ message, code, command?, path?, tempFiles? }`).
#[derive(Debug, Clone, thiserror::Error)]
pub enum RunnerError {
    #[error("{message}")]
    Download {
        message: String,
        temp_files: Vec<PathBuf>,
    },

    #[error("{message}")]
    Convert {
        message: String,
        command: Option<String>,
        temp_files: Vec<PathBuf>,
    },

    #[error("{message}")]
    Upload {
        message: String,
        path: Option<String>,
        temp_files: Vec<PathBuf>,
    },

    #[error("{message}")]
    Config { message: String },

    #[error("{message}")]
    Unexpected { message: String },
}

/// The five error kinds from the control-plane's `task.error.code`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    DownloadError,
    ConvertError,
    UploadError,
    ConfigError,
    UnexpectedError,
}

impl RunnerError {
    pub fn download(message: impl Into<String>) -> Self {
        Self::Download {
            message: message.into(),
            temp_files: Vec::new(),
        }
    }

    pub fn convert(message: impl Into<String>) -> Self {
        Self::Convert {
            message: message.into(),
            command: None,
            temp_files: Vec::new(),
        }
    }

    pub fn upload(message: impl Into<String>) -> Self {
        Self::Upload {
            message: message.into(),
            path: None,
            temp_files: Vec::new(),
        }
    }

    pub fn with_temp_files(mut self, files: Vec<PathBuf>) -> Self {
        match &mut self {
            Self::Download { temp_files, .. }
            | Self::Convert { temp_files, .. }
            | Self::Upload { temp_files, .. } => *temp_files = files,
            Self::Config { .. } | Self::Unexpected { .. } => {}
        }
        self
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        if let Self::Convert { command: slot, .. } = &mut self {
            *slot = Some(command.into());
        }
        self
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Download { .. } => ErrorCode::DownloadError,
            Self::Convert { .. } => ErrorCode::ConvertError,
            Self::Upload { .. } => ErrorCode::UploadError,
            Self::Config { .. } => ErrorCode::ConfigError,
            Self::Unexpected { .. } => ErrorCode::UnexpectedError,
        }
    }

    pub fn temp_files(&self) -> &[PathBuf] {
        match self {
            Self::Download { temp_files, .. }
            | Self::Convert { temp_files, .. }
            | Self::Upload { temp_files, .. } => temp_files,
            Self::Config { .. } | Self::Unexpected { .. } => &[],
        }
    }

    /// Downcasts an `anyhow::Error` produced by internal plumbing back into
    /// a `RunnerError`, classifying anything unrecognized as `Unexpected`.
    /// Used at the boundary where a stage processor must report a
    /// `task.error` for any failure, not just the ones it raised directly.
    pub fn classify(err: anyhow::Error) -> Self {
        match err.downcast::<RunnerError>() {
            Ok(runner_err) => runner_err,
            Err(err) => Self::Unexpected {
                message: err.to_string(),
            },
        }
    }
}

impl From<runner_config::ConfigError> for RunnerError {
    fn from(err: runner_config::ConfigError) -> Self {
        Self::Config {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_recovers_typed_error_through_anyhow() {
        let original = RunnerError::download("head request failed");
        let wrapped: anyhow::Error = original.into();
        let recovered = RunnerError::classify(wrapped);
        assert_eq!(recovered.code(), ErrorCode::DownloadError);
    }

    #[test]
    fn classify_falls_back_to_unexpected() {
        let wrapped = anyhow::anyhow!("some unrelated io failure");
        let recovered = RunnerError::classify(wrapped);
        assert_eq!(recovered.code(), ErrorCode::UnexpectedError);
    }

    #[test]
    fn with_temp_files_is_a_no_op_on_config_and_unexpected() {
        let err = RunnerError::Config {
            message: "missing BASE_URL".into(),
        }
        .with_temp_files(vec![PathBuf::from("/tmp/x")]);
        assert!(err.temp_files().is_empty());
    }
}
