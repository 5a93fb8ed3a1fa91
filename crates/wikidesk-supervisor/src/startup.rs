use crate::collaborators::{AuthProvider, IntervalSync, ViewHost};
use crate::supervisor::WikiSupervisor;
use crate::WikiError;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use wikidesk_core::Workspace;
use wikidesk_store::WorkspaceStore;

/// Decides how a workspace comes up: main workspaces start their own unit, sub
/// workspaces restart the main workspace that serves their content.
pub struct StartupOrchestrator {
    supervisor: Arc<WikiSupervisor>,
    store: Arc<WorkspaceStore>,
    auth: Arc<dyn AuthProvider>,
    views: Arc<dyn ViewHost>,
    sync: Arc<dyn IntervalSync>,
    start_locks: Mutex<HashSet<String>>,
}

impl StartupOrchestrator {
    pub fn new(
        supervisor: Arc<WikiSupervisor>,
        store: Arc<WorkspaceStore>,
        auth: Arc<dyn AuthProvider>,
        views: Arc<dyn ViewHost>,
        sync: Arc<dyn IntervalSync>,
    ) -> Self {
        Self {
            supervisor,
            store,
            auth,
            views,
            sync,
            start_locks: Mutex::new(HashSet::new()),
        }
    }

    pub async fn wiki_startup(&self, workspace: &Workspace) -> Result<(), WikiError> {
        let result = if workspace.is_sub_wiki {
            self.start_sub_wiki(workspace).await
        } else {
            self.start_main_wiki(workspace).await
        };
        self.sync.start_interval_sync_if_needed(workspace).await;
        result
    }

    /// Stops and starts the unit of a main workspace. For a sub workspace only its
    /// interval sync is restarted.
    pub async fn restart_wiki(&self, workspace: &Workspace) -> Result<(), WikiError> {
        let user_name = self.user_name(workspace).await;
        self.sync.stop_interval_sync(&workspace.id).await;
        let result = if workspace.is_sub_wiki {
            Ok(())
        } else {
            info!(event = "wiki_restart", workspace_id = %workspace.id);
            self.supervisor.stop_wiki(&workspace.id).await;
            self.supervisor.start_wiki(&workspace.id, &user_name).await
        };
        self.sync.start_interval_sync_if_needed(workspace).await;
        result
    }

    pub async fn set_start_lock_on(&self, workspace_id: &str) {
        self.start_locks.lock().await.insert(workspace_id.to_string());
    }

    pub async fn set_all_start_locks_off(&self) {
        self.start_locks.lock().await.clear();
    }

    pub async fn check_start_lock(&self, workspace_id: &str) -> bool {
        self.start_locks.lock().await.contains(workspace_id)
    }

    /// The workspace's own user name, then the app-wide default, then empty.
    pub async fn user_name(&self, workspace: &Workspace) -> String {
        let own = workspace.user_name.trim();
        if !own.is_empty() {
            return own.to_string();
        }
        self.auth.default_user_name().await.unwrap_or_default()
    }

    async fn start_sub_wiki(&self, workspace: &Workspace) -> Result<(), WikiError> {
        let Some(main_id) = workspace.main_wiki_id.as_deref() else {
            warn!(event = "sub_wiki_without_main", workspace_id = %workspace.id);
            return Ok(());
        };
        if self.check_start_lock(main_id).await {
            debug!(
                event = "sub_wiki_main_starting",
                workspace_id = %workspace.id,
                main_wiki_id = %main_id
            );
            return Ok(());
        }
        let Some(main) = self.store.get(main_id).await else {
            return Err(WikiError::SubWikiMainWikiNotExist {
                name: workspace.display_name().to_string(),
                main_wiki_id: main_id.to_string(),
            });
        };
        self.restart_wiki(&main).await
    }

    async fn start_main_wiki(&self, workspace: &Workspace) -> Result<(), WikiError> {
        let user_name = self.user_name(workspace).await;
        self.set_start_lock_on(&workspace.id).await;
        let err = match self.supervisor.start_wiki(&workspace.id, &user_name).await {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };
        warn!(event = "start_wiki_failed", workspace_id = %workspace.id, error = %err);
        if err.is_retryable() {
            warn!(event = "start_wiki_retry_via_view", workspace_id = %workspace.id);
            if let Err(view_err) = self.views.restart_workspace_view(&workspace.id).await {
                warn!(
                    event = "workspace_view_restart_failed",
                    workspace_id = %workspace.id,
                    error = %view_err
                );
            }
            return Ok(());
        }
        if err.is_transient_init_timeout() {
            warn!(event = "start_wiki_retry_restart", workspace_id = %workspace.id);
            let latest = self
                .store
                .get(&workspace.id)
                .await
                .unwrap_or_else(|| workspace.clone());
            return self.restart_wiki(&latest).await;
        }
        Err(err)
    }
}
