use async_trait::async_trait;
use serde_json::Value;
use std::sync::{Arc, OnceLock, Weak};
use tracing::{info, warn};
use wikidesk_core::unit_ipc::UnitCall;
use wikidesk_core::WikiOperation;
use wikidesk_supervisor::{ViewHost, WikiError, WikiService};

/// View host for running without a window. Server-capable operations go straight
/// to the unit, view-only ones are logged and acknowledged.
#[derive(Default)]
pub struct HeadlessViews {
    service: OnceLock<Weak<WikiService>>,
}

impl HeadlessViews {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, service: &Arc<WikiService>) {
        if self.service.set(Arc::downgrade(service)).is_err() {
            warn!(event = "headless_views_already_attached");
        }
    }

    fn service(&self) -> Result<Arc<WikiService>, WikiError> {
        self.service
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| WikiError::Collaborator {
                collaborator: "views",
                message: "wiki service is not attached".to_string(),
            })
    }
}

#[async_trait]
impl ViewHost for HeadlessViews {
    async fn wait_view_loaded(&self, _workspace_id: &str) -> Result<(), WikiError> {
        Ok(())
    }

    async fn send_to_view(
        &self,
        workspace_id: &str,
        operation: WikiOperation,
    ) -> Result<Value, WikiError> {
        let channel = operation.channel();
        if !channel.runs_in_server() {
            info!(
                event = "view_operation_skipped",
                workspace_id = %workspace_id,
                operation = %channel
            );
            return Ok(Value::Null);
        }
        let unit = self
            .service()?
            .supervisor()
            .get_worker_ensure(workspace_id)
            .await?;
        unit.call(UnitCall::Operation { operation }).await
    }

    /// Starts the workspace's wiki again in the background.
    async fn restart_workspace_view(&self, workspace_id: &str) -> Result<(), WikiError> {
        let service = self.service()?;
        let workspace = service
            .store()
            .get(workspace_id)
            .await
            .ok_or_else(|| WikiError::WorkspaceNotFound(workspace_id.to_string()))?;
        info!(event = "headless_view_restart", workspace_id = %workspace.id);
        tokio::spawn(async move {
            if let Err(err) = service.startup().wiki_startup(&workspace).await {
                warn!(
                    event = "headless_view_restart_failed",
                    workspace_id = %workspace.id,
                    error = %err
                );
            }
        });
        Ok(())
    }
}
