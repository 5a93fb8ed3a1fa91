use std::path::PathBuf;
use thiserror::Error;
use wikidesk_core::unit_ipc::FrameError;
use wikidesk_core::{OperationError, Workspace};
use wikidesk_store::StoreError;

#[derive(Debug, Error)]
pub enum WikiError {
    #[error("workspace {0} not found")]
    WorkspaceNotFound(String),
    #[error("sub wiki {name} can not find its main wiki {main_wiki_id}")]
    SubWikiMainWikiNotExist { name: String, main_wiki_id: String },
    /// A unit reported a boot error or a fatal error. `retry` is set when the
    /// configuration was already repaired and a new start is expected to succeed.
    #[error("wiki runtime error in {wiki}: {message}")]
    Runtime {
        wiki: String,
        message: String,
        retry: bool,
        workspace: Option<Box<Workspace>>,
    },
    #[error("Did not receive an init message from execution unit {label} after {timeout_ms}ms")]
    SpawnTimeout { label: String, timeout_ms: u64 },
    #[error("failed to spawn execution unit {label}: {message}")]
    Spawn { label: String, message: String },
    #[error("Still no wiki for {0} after the unit started signal, maybe its server failed to start")]
    UnitMissing(String),
    #[error("execution unit {label} exited")]
    UnitClosed { label: String },
    #[error("execution unit {label} rejected {call}: {message}")]
    Request {
        label: String,
        call: String,
        message: String,
    },
    #[error("execution unit {label} returned an unexpected payload for {call}: {message}")]
    Decode {
        label: String,
        call: String,
        message: String,
    },
    #[error("failed to terminate execution unit {label}: {message}")]
    Terminate { label: String, message: String },
    #[error("can not link sub wiki {sub_wiki_path} into {link_path}: {source}")]
    Link {
        sub_wiki_path: PathBuf,
        link_path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("path {0} does not exist")]
    PathNotExist(PathBuf),
    #[error("wiki already exists at {0}")]
    WikiExisted(PathBuf),
    #[error("can not create folder at {path}: {source}")]
    CantCreateFolder {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("wiki template is missing at {0}")]
    WikiTemplateMissing(PathBuf),
    #[error("copy wiki template failed: {message}, ({parent}, {folder_name})")]
    CopyWikiTemplate {
        parent: PathBuf,
        folder_name: String,
        message: String,
    },
    #[error("{path} is not a wiki folder, {missing} is missing")]
    NotAWikiFolder { path: PathBuf, missing: PathBuf },
    #[error("wiki folder path needs to be an absolute path, got {0:?}")]
    NeedAbsoluteWikiPath(String),
    #[error("{0} is not an html wiki file")]
    HtmlCanNotLoad(PathBuf),
    #[error("{0} already exists")]
    AlreadyExist(PathBuf),
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{collaborator} failed: {message}")]
    Collaborator {
        collaborator: &'static str,
        message: String,
    },
    #[error(transparent)]
    Operation(#[from] OperationError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl WikiError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        WikiError::Io {
            path: path.into(),
            source,
        }
    }

    /// The port was bumped and persisted, so starting again should work.
    pub fn is_retryable(&self) -> bool {
        matches!(self, WikiError::Runtime { retry: true, .. })
    }

    /// The unit never completed its init handshake. Restarting usually clears it.
    pub fn is_transient_init_timeout(&self) -> bool {
        matches!(self, WikiError::SpawnTimeout { .. })
    }

    /// Workspace record as it was after the failing start repaired it.
    pub fn repaired_workspace(&self) -> Option<&Workspace> {
        match self {
            WikiError::Runtime {
                workspace: Some(workspace),
                ..
            } => Some(workspace),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_uses_variants() {
        let port = WikiError::Runtime {
            wiki: "/wikis/main".to_string(),
            message: "listen EADDRINUSE".to_string(),
            retry: true,
            workspace: None,
        };
        assert!(port.is_retryable());
        assert!(!port.is_transient_init_timeout());

        let timeout = WikiError::SpawnTimeout {
            label: "w1".to_string(),
            timeout_ms: 60_000,
        };
        assert!(timeout.is_transient_init_timeout());
        assert!(!timeout.is_retryable());
        assert!(timeout.to_string().contains("Did not receive an init message"));
    }
}
