use crate::collaborators::{AuthProvider, GitService, IntervalSync, ViewHost};
use crate::config::SupervisorConfig;
use crate::folders::WikiFolders;
use crate::launcher::UnitLauncher;
use crate::plugin_content::update_sub_wiki_plugin_content;
use crate::router::CommandRouter;
use crate::startup::StartupOrchestrator;
use crate::supervisor::WikiSupervisor;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};
use wikidesk_store::{TagChange, WorkspaceChangeHook, WorkspaceStore};

/// External services the wiki service depends on.
#[derive(Clone)]
pub struct Collaborators {
    pub views: Arc<dyn ViewHost>,
    pub sync: Arc<dyn IntervalSync>,
    pub auth: Arc<dyn AuthProvider>,
    pub git: Arc<dyn GitService>,
}

/// Owns the supervisor, router, orchestrator and folder helpers for one store.
pub struct WikiService {
    store: Arc<WorkspaceStore>,
    supervisor: Arc<WikiSupervisor>,
    router: Arc<CommandRouter>,
    startup: Arc<StartupOrchestrator>,
    folders: WikiFolders,
}

impl WikiService {
    /// Builds the service and registers it as the store's tag change hook.
    pub fn new(
        config: SupervisorConfig,
        store: Arc<WorkspaceStore>,
        launcher: Arc<dyn UnitLauncher>,
        collaborators: Collaborators,
    ) -> Arc<Self> {
        let Collaborators {
            views,
            sync,
            auth,
            git,
        } = collaborators;
        let folders = WikiFolders::new(config.template_folder.clone(), git);
        let supervisor = Arc::new(WikiSupervisor::new(
            config,
            store.clone(),
            launcher,
            sync.clone(),
        ));
        let router = Arc::new(CommandRouter::new(supervisor.clone(), views.clone()));
        let startup = Arc::new(StartupOrchestrator::new(
            supervisor.clone(),
            store.clone(),
            auth,
            views,
            sync,
        ));
        let service = Arc::new(Self {
            store: store.clone(),
            supervisor,
            router,
            startup,
            folders,
        });
        let hook: Arc<dyn WorkspaceChangeHook> = service.clone();
        store.set_change_hook(Arc::downgrade(&hook));
        service
    }

    pub fn store(&self) -> &Arc<WorkspaceStore> {
        &self.store
    }

    pub fn supervisor(&self) -> &Arc<WikiSupervisor> {
        &self.supervisor
    }

    pub fn router(&self) -> &Arc<CommandRouter> {
        &self.router
    }

    pub fn startup(&self) -> &Arc<StartupOrchestrator> {
        &self.startup
    }

    pub fn folders(&self) -> &WikiFolders {
        &self.folders
    }

    /// Stops every unit and writes pending settings to disk.
    pub async fn shutdown(&self) {
        self.supervisor.stop_all_wiki().await;
        if let Err(err) = self.store.flush() {
            warn!(event = "settings_flush_failed", error = %err);
        }
        info!(event = "wiki_service_shutdown");
    }
}

#[async_trait]
impl WorkspaceChangeHook for WikiService {
    /// Rewrites the main wiki's routes for the new tag, then restarts so the main
    /// wiki picks them up. A failed rewrite vetoes the change.
    async fn before_tag_change(
        &self,
        change: TagChange,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let TagChange {
            previous,
            next,
            main_wiki_path,
        } = change;
        update_sub_wiki_plugin_content(
            Path::new(&main_wiki_path),
            Path::new(&next.wiki_folder_location),
            next.tag_name.as_deref(),
            previous.tag_name.as_deref(),
        )
        .await?;
        if let Err(err) = self.startup.wiki_startup(&next).await {
            warn!(
                event = "tag_change_restart_failed",
                workspace_id = %next.id,
                error = %err
            );
        }
        Ok(())
    }
}
