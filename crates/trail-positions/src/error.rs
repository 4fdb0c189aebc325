use std::{io, path::PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PositionsError {
    #[error("positions file {} is a directory", .path.display())]
    IsDirectory { path: PathBuf },

    #[error("failed to read positions file {}: {source}", .path.display())]
    Read { path: PathBuf, source: io::Error },

    #[error("invalid yaml positions file [{}]: {source}", .path.display())]
    InvalidYaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("failed to write positions file {}: {source}", .path.display())]
    Write { path: PathBuf, source: io::Error },

    #[error("failed to encode positions: {0}")]
    Encode(#[from] serde_yaml::Error),

    #[error("invalid offset {value:?} for path {path} labels {labels}")]
    InvalidOffset {
        path: String,
        labels: String,
        value: String,
    },

    #[error("positions sync period must be greater than zero")]
    InvalidSyncPeriod,

    #[error("positions sync loop requires a tokio runtime")]
    NoRuntime,

    #[error("positions store is stopped")]
    Stopped,
}
