use crate::collaborators::ViewHost;
use crate::supervisor::WikiSupervisor;
use crate::WikiError;
use futures_util::stream::{self, Stream};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use wikidesk_core::operations::SetTiddlerText;
use wikidesk_core::unit_ipc::UnitCall;
use wikidesk_core::{
    BrowserOperation, ChangedTiddlers, IpcRoute, IpcRouteResponse, OperationError,
    ServerOperation, WikiOperation,
};

pub const LANGUAGE_TIDDLER_TITLE: &str = "$:/language";
const LANGUAGE_ATTEMPTS: u32 = 10;
const LANGUAGE_FIRST_DELAY: Duration = Duration::from_secs(2);
const LANGUAGE_MAX_DELAY: Duration = Duration::from_secs(30);
const LANGUAGE_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(15);

/// Dispatches workspace-scoped commands to the live unit or to the workspace's view.
pub struct CommandRouter {
    supervisor: Arc<WikiSupervisor>,
    views: Arc<dyn ViewHost>,
}

impl CommandRouter {
    pub fn new(supervisor: Arc<WikiSupervisor>, views: Arc<dyn ViewHost>) -> Self {
        Self { supervisor, views }
    }

    /// Invokes a server route on the unit and returns its response as-is, whatever
    /// the status code. Never retries.
    pub async fn call_route(
        &self,
        workspace_id: &str,
        route: IpcRoute,
    ) -> Result<IpcRouteResponse, WikiError> {
        let unit = self.supervisor.get_worker_ensure(workspace_id).await?;
        debug!(event = "route_call", workspace_id = %workspace_id, route = route.name());
        unit.route(route).await
    }

    pub async fn operation_in_server<O: ServerOperation>(
        &self,
        workspace_id: &str,
        operation: O,
    ) -> Result<O::Output, WikiError> {
        let unit = self.supervisor.get_worker_ensure(workspace_id).await?;
        unit.operation(operation).await
    }

    /// Runs a named server-bound operation with a positional argument list.
    pub async fn operation_in_server_by_name(
        &self,
        workspace_id: &str,
        name: &str,
        args: &Value,
    ) -> Result<Value, WikiError> {
        let operation = WikiOperation::from_positional(name, args)?;
        let channel = operation.channel();
        if !channel.runs_in_server() {
            return Err(OperationError::NotServerBound { operation: channel }.into());
        }
        let unit = self.supervisor.get_worker_ensure(workspace_id).await?;
        unit.call(UnitCall::Operation { operation }).await
    }

    /// Runs an operation inside the workspace's view once both the unit and the view
    /// are up.
    pub async fn operation_in_browser<O: BrowserOperation>(
        &self,
        workspace_id: &str,
        operation: O,
    ) -> Result<O::Output, WikiError> {
        let operation: WikiOperation = operation.into();
        let channel = operation.channel();
        let value = self.dispatch_to_view(workspace_id, operation).await?;
        serde_json::from_value(value).map_err(|err| WikiError::Decode {
            label: workspace_id.to_string(),
            call: channel.to_string(),
            message: err.to_string(),
        })
    }

    /// Named form of [`CommandRouter::operation_in_browser`]. Unknown names and
    /// argument values that are not an ordered list are rejected before anything
    /// is dispatched.
    pub async fn operation_in_browser_by_name(
        &self,
        workspace_id: &str,
        name: &str,
        args: &Value,
    ) -> Result<Value, WikiError> {
        let operation = WikiOperation::from_positional(name, args)?;
        self.dispatch_to_view(workspace_id, operation).await
    }

    /// Stream of the unit's change notifications. The unit is looked up on first
    /// poll, so the stream can be created before the unit is started. Each call
    /// gets its own subscription.
    pub fn change_observer(
        &self,
        workspace_id: &str,
    ) -> impl Stream<Item = ChangedTiddlers> + Send + 'static {
        enum ObserverState {
            Pending(Arc<WikiSupervisor>, String),
            Subscribed(broadcast::Receiver<ChangedTiddlers>),
        }

        let initial = ObserverState::Pending(self.supervisor.clone(), workspace_id.to_string());
        stream::unfold(initial, |state| async move {
            let mut receiver = match state {
                ObserverState::Subscribed(receiver) => receiver,
                ObserverState::Pending(supervisor, id) => {
                    let subscribed = match supervisor.get_worker_ensure(&id).await {
                        Ok(unit) => unit.subscribe_changes().await,
                        Err(err) => Err(err),
                    };
                    match subscribed {
                        Ok(receiver) => receiver,
                        Err(err) => {
                            warn!(event = "change_observer_failed", workspace_id = %id, error = %err);
                            return None;
                        }
                    }
                }
            };
            loop {
                match receiver.recv().await {
                    Ok(changed) => return Some((changed, ObserverState::Subscribed(receiver))),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(event = "change_observer_lagged", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
    }

    /// Sets the wiki's UI language in the background, retrying with backoff while
    /// the view is still coming up.
    pub fn set_wiki_language(
        self: &Arc<Self>,
        workspace_id: &str,
        language: &str,
    ) -> JoinHandle<Result<(), WikiError>> {
        let router = self.clone();
        let id = workspace_id.to_string();
        let language = language.to_string();
        tokio::spawn(async move {
            let mut delay = LANGUAGE_FIRST_DELAY;
            let mut attempt = 1;
            loop {
                tokio::time::sleep(delay).await;
                let operation = SetTiddlerText {
                    title: LANGUAGE_TIDDLER_TITLE.to_string(),
                    value: language.clone(),
                };
                let result = match tokio::time::timeout(
                    LANGUAGE_ATTEMPT_TIMEOUT,
                    router.operation_in_browser(&id, operation),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(WikiError::Collaborator {
                        collaborator: "view",
                        message: format!(
                            "setting language timed out after {}ms",
                            LANGUAGE_ATTEMPT_TIMEOUT.as_millis()
                        ),
                    }),
                };
                match result {
                    Ok(()) => {
                        info!(event = "wiki_language_set", workspace_id = %id, language = %language);
                        return Ok(());
                    }
                    Err(err) if attempt >= LANGUAGE_ATTEMPTS => {
                        warn!(event = "wiki_language_failed", workspace_id = %id, error = %err);
                        return Err(err);
                    }
                    Err(err) => {
                        debug!(event = "wiki_language_retry", workspace_id = %id, attempt, error = %err);
                        attempt += 1;
                        delay = next_backoff(delay);
                    }
                }
            }
        })
    }

    async fn dispatch_to_view(
        &self,
        workspace_id: &str,
        operation: WikiOperation,
    ) -> Result<Value, WikiError> {
        self.supervisor.get_worker_ensure(workspace_id).await?;
        self.views.wait_view_loaded(workspace_id).await?;
        debug!(
            event = "browser_operation",
            workspace_id = %workspace_id,
            channel = %operation.channel()
        );
        self.views.send_to_view(workspace_id, operation).await
    }
}

fn next_backoff(current: Duration) -> Duration {
    let next = current + current;
    if next > LANGUAGE_MAX_DELAY {
        LANGUAGE_MAX_DELAY
    } else {
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_cap() {
        assert_eq!(next_backoff(Duration::from_secs(2)), Duration::from_secs(4));
        assert_eq!(next_backoff(Duration::from_secs(16)), Duration::from_secs(30));
        assert_eq!(next_backoff(LANGUAGE_MAX_DELAY), LANGUAGE_MAX_DELAY);
    }
}
