use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    ConfigFormat(String),

    #[error("missing or unknown configuration key: {0}")]
    ConfigKey(String),

    #[error("invalid configuration: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("trainer initialization failed: {0}")]
    Initialization(String),

    #[error("training failed: {0}")]
    Runtime(String),

    #[error("invalid dataset: {0}")]
    Dataset(String),

    #[error("failed to load checkpoint {}: {reason}", .path.display())]
    CheckpointLoad { path: PathBuf, reason: String },

    #[error("gradient for parameter '{0}' has zero or non-finite norm")]
    DegenerateGradient(String),

    #[error("invalid EMA transition: {0}")]
    EmaState(&'static str),

    #[error("invalid FGM transition: {0}")]
    FgmState(&'static str),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
}

impl TrainingError {
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }

    pub fn checkpoint_load(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::CheckpointLoad {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

impl From<candle_core::Error> for TrainingError {
    fn from(value: candle_core::Error) -> Self {
        TrainingError::Runtime(value.to_string())
    }
}

impl From<toml::de::Error> for TrainingError {
    fn from(value: toml::de::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for TrainingError {
    fn from(value: serde_json::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}
