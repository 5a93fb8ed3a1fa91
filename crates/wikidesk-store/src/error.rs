use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("settings io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("settings file {path} is locked by another process")]
    Locked { path: PathBuf },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("settings state poisoned")]
    Poisoned,
    #[error("Try to remove workspace, but id {0} is not existed")]
    WorkspaceNotFound(String),
    #[error("main wiki path of sub wiki {id} is unknown, can not update its tag association")]
    MissingMainWikiPath { id: String },
    #[error("workspace change hook failed for {id}: {message}")]
    Hook { id: String, message: String },
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }
}
