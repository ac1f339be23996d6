use std::path::PathBuf;

use thiserror::Error;

/// Errors that stop a pipeline run before (or instead of) processing items.
///
/// Per-item failures are never represented here; they are recorded as
/// [`StageFailure`](crate::stage::StageFailure) values against the item.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Checkpoint at {} is corrupt: {}", .path.display(), .reason)]
    CorruptCheckpoint { path: PathBuf, reason: String },

    #[error("Unknown stage: {0}")]
    UnknownStage(String),

    #[error("Worker task failed: {0}")]
    Worker(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl PipelineError {
    pub fn config(message: impl Into<String>) -> Self {
        PipelineError::Config(message.into())
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corrupt_checkpoint_display() {
        let err = PipelineError::CorruptCheckpoint {
            path: PathBuf::from("/tmp/run.json"),
            reason: "expected value at line 1 column 1".into(),
        };
        assert_eq!(
            err.to_string(),
            "Checkpoint at /tmp/run.json is corrupt: expected value at line 1 column 1"
        );
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<PipelineError>();
    }
}
