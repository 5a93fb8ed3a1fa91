use crate::WikiError;
use async_trait::async_trait;
use serde_json::Value;
use std::path::Path;
use tracing::{debug, info};
use wikidesk_core::{WikiOperation, Workspace};

/// The view layer that hosts one page per workspace.
#[async_trait]
pub trait ViewHost: Send + Sync {
    /// Resolves once the workspace's view has finished loading.
    async fn wait_view_loaded(&self, workspace_id: &str) -> Result<(), WikiError>;
    /// Runs a view-bound operation inside the workspace's loaded view.
    async fn send_to_view(
        &self,
        workspace_id: &str,
        operation: WikiOperation,
    ) -> Result<Value, WikiError>;
    /// Re-provisions the workspace's view, which starts its wiki again.
    async fn restart_workspace_view(&self, workspace_id: &str) -> Result<(), WikiError>;
}

#[async_trait]
pub trait IntervalSync: Send + Sync {
    async fn start_interval_sync_if_needed(&self, workspace: &Workspace);
    async fn stop_interval_sync(&self, workspace_id: &str);
}

#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// User name from the app preferences, used when a workspace has none.
    async fn default_user_name(&self) -> Option<String>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GitUserInfo {
    pub user_name: String,
    pub email: Option<String>,
    pub access_token: Option<String>,
}

#[async_trait]
pub trait GitService: Send + Sync {
    async fn clone_repo(
        &self,
        remote_url: &str,
        target: &Path,
        user: &GitUserInfo,
    ) -> Result<(), WikiError>;
}

/// Interval sync for setups without a sync backend.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoIntervalSync;

#[async_trait]
impl IntervalSync for NoIntervalSync {
    async fn start_interval_sync_if_needed(&self, workspace: &Workspace) {
        if workspace.sync_on_interval || workspace.backup_on_interval {
            debug!(
                event = "interval_sync_unavailable",
                workspace_id = %workspace.id
            );
        }
    }

    async fn stop_interval_sync(&self, _workspace_id: &str) {}
}

#[derive(Debug, Default, Clone)]
pub struct StaticAuth {
    user_name: Option<String>,
}

impl StaticAuth {
    pub fn new(user_name: Option<String>) -> Self {
        Self { user_name }
    }
}

#[async_trait]
impl AuthProvider for StaticAuth {
    async fn default_user_name(&self) -> Option<String> {
        self.user_name.clone()
    }
}

/// Git backend for setups that can not clone.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoGit;

#[async_trait]
impl GitService for NoGit {
    async fn clone_repo(
        &self,
        remote_url: &str,
        target: &Path,
        _user: &GitUserInfo,
    ) -> Result<(), WikiError> {
        info!(
            event = "git_clone_unavailable",
            remote_url = %remote_url,
            target = %target.display()
        );
        Err(WikiError::Collaborator {
            collaborator: "git",
            message: format!("no git backend configured to clone {remote_url}"),
        })
    }
}
