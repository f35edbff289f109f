//! Error type shared across the training crate.

use std::path::PathBuf;

pub type TrainResult<T> = Result<T, TrainError>;

#[derive(Debug, thiserror::Error)]
pub enum TrainError {
    #[error("{kind} `{name}` is not implemented")]
    NotImplemented { kind: &'static str, name: String },
    #[error("invalid training config: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Dataset(#[from] ecg_dataset::EcgDatasetError),
    #[error("recorder error: {0}")]
    Recorder(#[from] burn::record::RecorderError),
    #[error("io error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("json error at {path:?}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("training interrupted; state saved to {0:?}")]
    Interrupted(PathBuf),
    #[error("{0}")]
    Other(String),
}

impl TrainError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn json(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        Self::Json {
            path: path.into(),
            source,
        }
    }
}
