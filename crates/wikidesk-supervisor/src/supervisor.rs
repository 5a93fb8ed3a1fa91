use crate::collaborators::IntervalSync;
use crate::config::SupervisorConfig;
use crate::launcher::UnitLauncher;
use crate::unit::{UnitEvent, UnitHandle};
use crate::wiki_log::{wiki_log_file_name, WikiLog};
use crate::WikiError;
use futures_util::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch, Mutex, RwLock};
use tracing::{debug, error, info, warn};
use wikidesk_core::operations::AddTiddler;
use wikidesk_core::unit_ipc::{
    is_address_in_use, BootMessage, ControlAction, StartConfig, UnitCall,
};
use wikidesk_core::{MetadataPatch, Workspace};
use wikidesk_store::WorkspaceStore;

pub const ALLOW_ALL_EXTERNAL_FILTERS_TITLE: &str = "$:/config/Server/AllowAllExternalFilters";
const CONTROL_ERROR_WITHOUT_MESSAGE: &str = "get control error without message";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WikiErrorLogs {
    pub content: String,
    pub file_path: String,
}

/// Owns the workspace id to unit map and every unit lifecycle transition.
pub struct WikiSupervisor {
    config: SupervisorConfig,
    store: Arc<WorkspaceStore>,
    launcher: Arc<dyn UnitLauncher>,
    sync: Arc<dyn IntervalSync>,
    units: RwLock<HashMap<String, Arc<UnitHandle>>>,
    started: Mutex<HashMap<String, watch::Sender<u64>>>,
    start_gates: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl WikiSupervisor {
    pub fn new(
        config: SupervisorConfig,
        store: Arc<WorkspaceStore>,
        launcher: Arc<dyn UnitLauncher>,
        sync: Arc<dyn IntervalSync>,
    ) -> Self {
        Self {
            config,
            store,
            launcher,
            sync,
            units: RwLock::new(HashMap::new()),
            started: Mutex::new(HashMap::new()),
            start_gates: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub async fn get_worker(&self, workspace_id: &str) -> Option<Arc<UnitHandle>> {
        self.units.read().await.get(workspace_id).cloned()
    }

    /// Ids that still hold a started signal or a start gate.
    pub async fn start_state_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.started.lock().await.keys().cloned().collect();
        ids.extend(self.start_gates.lock().await.keys().cloned());
        ids.sort();
        ids.dedup();
        ids
    }

    pub async fn live_workspace_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.units.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Returns the live unit, waiting for the next "unit started" signal if none is
    /// registered yet.
    pub async fn get_worker_ensure(&self, workspace_id: &str) -> Result<Arc<UnitHandle>, WikiError> {
        let mut started = self.started_signal(workspace_id).await;
        if let Some(unit) = self.get_worker(workspace_id).await {
            return Ok(unit);
        }
        debug!(event = "unit_wait_started", workspace_id = %workspace_id);
        let _ = started.changed().await;
        match self.get_worker(workspace_id).await {
            Some(unit) => Ok(unit),
            None => {
                error!(event = "unit_missing_after_started", workspace_id = %workspace_id);
                Err(WikiError::UnitMissing(workspace_id.to_string()))
            }
        }
    }

    /// Starts the unit of a main workspace and resolves once it has booted.
    ///
    /// Starts for one id are serialized. A unit still registered for the id is
    /// stopped first.
    pub async fn start_wiki(
        self: &Arc<Self>,
        workspace_id: &str,
        user_name: &str,
    ) -> Result<(), WikiError> {
        let gate = self.start_gate(workspace_id).await;
        let guard = gate.lock().await;

        if self.get_worker(workspace_id).await.is_some() {
            error!(
                event = "double_wiki_instance",
                workspace_id = %workspace_id,
                "Unexpected double start of wiki unit, stopping the previous one"
            );
            self.stop_wiki(workspace_id).await;
        }
        let Some(workspace) = self.store.get(workspace_id).await else {
            error!(event = "start_wiki_workspace_missing", workspace_id = %workspace_id);
            drop(guard);
            drop(gate);
            self.prune_start_state(workspace_id).await;
            return Ok(());
        };
        if workspace.is_sub_wiki {
            error!(event = "start_wiki_sub_wiki", workspace_id = %workspace_id);
            drop(guard);
            drop(gate);
            self.prune_start_state(workspace_id).await;
            return Ok(());
        }

        self.store
            .update_metadata(workspace_id, MetadataPatch::new().is_loading(true))
            .await;
        let config = self.start_config(&workspace, user_name);
        debug!(event = "unit_spawn", workspace_id = %workspace_id, home_path = %config.home_path);
        let (unit, events) =
            match UnitHandle::spawn(self.launcher.as_ref(), workspace_id, self.config.spawn_timeout)
                .await
            {
                Ok(spawned) => spawned,
                Err(err) => {
                    self.store
                        .update_metadata(
                            workspace_id,
                            MetadataPatch::new().is_loading(false).failed(err.to_string()),
                        )
                        .await;
                    drop(guard);
                    drop(gate);
                    self.prune_start_state(workspace_id).await;
                    return Err(err);
                }
            };
        self.units
            .write()
            .await
            .insert(workspace_id.to_string(), unit.clone());
        self.notify_started(workspace_id).await;
        drop(guard);
        drop(gate);

        let log = WikiLog::open(self.config.log_dir.as_deref(), workspace_id, &workspace.name);
        let (boot_tx, boot_rx) = oneshot::channel();
        tokio::spawn(
            self.clone()
                .monitor_unit(workspace, unit.clone(), events, log, boot_tx),
        );
        unit.start(config).await?;

        match boot_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err),
            Err(_) => {
                return Err(WikiError::UnitClosed {
                    label: workspace_id.to_string(),
                })
            }
        }

        let supervisor = self.clone();
        let id = workspace_id.to_string();
        tokio::spawn(async move {
            if let Err(err) = supervisor.after_wiki_start(&id).await {
                warn!(event = "after_wiki_start_failed", workspace_id = %id, error = %err);
            }
        });
        Ok(())
    }

    /// Stops the unit of `workspace_id`. Never fails; problems are logged.
    pub async fn stop_wiki(&self, workspace_id: &str) {
        let Some(unit) = self.get_worker(workspace_id).await else {
            warn!(
                event = "stop_wiki_no_unit",
                workspace_id = %workspace_id,
                "No running unit, maybe the wiki server of this workspace failed to start"
            );
            return;
        };
        self.sync.stop_interval_sync(workspace_id).await;
        debug!(event = "unit_before_exit", workspace_id = %workspace_id);
        match tokio::time::timeout(self.config.before_exit_timeout, unit.before_exit()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                error!(event = "unit_before_exit_failed", workspace_id = %workspace_id, error = %err);
            }
            Err(_) => {
                warn!(
                    event = "unit_before_exit_timeout",
                    workspace_id = %workspace_id,
                    timeout_ms = self.config.before_exit_timeout.as_millis() as u64
                );
            }
        }
        if let Err(err) = unit.terminate().await {
            error!(event = "unit_terminate_failed", workspace_id = %workspace_id, error = %err);
        }
        self.deregister(workspace_id, &unit).await;
        info!(event = "wiki_stopped", workspace_id = %workspace_id);
    }

    /// Stops every live unit concurrently and waits for all of them.
    pub async fn stop_all_wiki(&self) {
        let ids = self.live_workspace_ids().await;
        debug!(event = "stop_all_wiki", count = ids.len());
        join_all(ids.iter().map(|id| self.stop_wiki(id))).await;
        info!(event = "all_wiki_stopped");
    }

    /// Post-start step: HTTP API wikis accept external filters without extra setup.
    pub async fn after_wiki_start(&self, workspace_id: &str) -> Result<(), WikiError> {
        let Some(workspace) = self.store.get(workspace_id).await else {
            error!(event = "after_wiki_start_workspace_missing", workspace_id = %workspace_id);
            return Ok(());
        };
        if workspace.is_sub_wiki || !workspace.enable_http_api {
            return Ok(());
        }
        let unit = self.get_worker_ensure(workspace_id).await?;
        unit.operation(AddTiddler {
            title: ALLOW_ALL_EXTERNAL_FILTERS_TITLE.to_string(),
            text: "yes".to_string(),
            extra_meta: Default::default(),
        })
        .await?;
        info!(event = "http_api_filters_enabled", workspace_id = %workspace_id);
        Ok(())
    }

    /// Converts a single-file html wiki into a wiki folder using a throwaway unit.
    pub async fn extract_wiki_html(
        &self,
        html_path: &Path,
        save_folder: &Path,
    ) -> Result<(), WikiError> {
        if !is_html_wiki(html_path) {
            return Err(WikiError::HtmlCanNotLoad(html_path.to_path_buf()));
        }
        if tokio::fs::try_exists(save_folder).await.unwrap_or(false) {
            return Err(WikiError::AlreadyExist(save_folder.to_path_buf()));
        }
        self.one_shot(
            "extract-wiki-html",
            UnitCall::ExtractWikiHtml {
                html_path: html_path.to_string_lossy().to_string(),
                save_folder: save_folder.to_string_lossy().to_string(),
                package_folder: self.config.package_folder_string(),
            },
        )
        .await
    }

    /// Packs a wiki folder into a single html file using a throwaway unit.
    pub async fn packet_html_from_wiki_folder(
        &self,
        wiki_folder: &Path,
        html_path: &Path,
    ) -> Result<(), WikiError> {
        self.one_shot(
            "packet-html",
            UnitCall::PacketHtmlFromWikiFolder {
                wiki_folder: wiki_folder.to_string_lossy().to_string(),
                html_path: html_path.to_string_lossy().to_string(),
                package_folder: self.config.package_folder_string(),
            },
        )
        .await
    }

    /// File path of a tiddler, asking the given workspace or else the active one.
    pub async fn get_tiddler_file_path(
        &self,
        title: &str,
        workspace_id: Option<&str>,
    ) -> Result<Option<String>, WikiError> {
        let id = match workspace_id {
            Some(id) => id.to_string(),
            None => match self.store.get_active().await {
                Some(active) => active.id,
                None => return Ok(None),
            },
        };
        let Some(unit) = self.get_worker(&id).await else {
            return Ok(None);
        };
        let metadata = unit.tiddler_file_metadata(title).await?;
        Ok(metadata.and_then(|metadata| metadata.filepath))
    }

    pub fn wiki_log_path(&self, workspace_id: &str, wiki_name: &str) -> Option<PathBuf> {
        self.config
            .log_dir
            .as_ref()
            .map(|dir| dir.join(wiki_log_file_name(workspace_id, wiki_name)))
    }

    pub async fn get_wiki_error_logs(
        &self,
        workspace_id: &str,
        wiki_name: &str,
    ) -> Result<WikiErrorLogs, WikiError> {
        let file_name = wiki_log_file_name(workspace_id, wiki_name);
        let path = self
            .wiki_log_path(workspace_id, wiki_name)
            .unwrap_or_else(|| PathBuf::from(file_name));
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|err| WikiError::io(&path, err))?;
        Ok(WikiErrorLogs {
            content,
            file_path: path.to_string_lossy().to_string(),
        })
    }

    fn start_config(&self, workspace: &Workspace, user_name: &str) -> StartConfig {
        StartConfig {
            home_path: workspace.wiki_folder_location.clone(),
            host: self.config.host.clone(),
            port: workspace.port,
            https: workspace.https.clone(),
            token_auth: workspace.token_auth,
            auth_token: workspace.auth_token.clone(),
            read_only_mode: workspace.read_only_mode,
            excluded_plugins: workspace.excluded_plugins.clone(),
            root_tiddler: workspace.root_tiddler.clone(),
            enable_http_api: workspace.enable_http_api,
            user_name: user_name.to_string(),
            is_dev: self.config.is_dev,
            open_debugger: self.config.open_debugger,
            package_folder: self.config.package_folder_string(),
        }
    }

    async fn one_shot(&self, label: &str, call: UnitCall) -> Result<(), WikiError> {
        let (unit, _events) =
            UnitHandle::spawn(self.launcher.as_ref(), label, self.config.spawn_timeout).await?;
        let result = unit.call(call).await.map(|_| ());
        if let Err(err) = unit.terminate().await {
            warn!(event = "one_shot_unit_terminate_failed", label = %label, error = %err);
        }
        if let Err(err) = &result {
            error!(event = "one_shot_unit_failed", label = %label, error = %err);
        }
        result
    }

    async fn started_signal(&self, workspace_id: &str) -> watch::Receiver<u64> {
        let mut started = self.started.lock().await;
        started
            .entry(workspace_id.to_string())
            .or_insert_with(|| watch::channel(0).0)
            .subscribe()
    }

    async fn notify_started(&self, workspace_id: &str) {
        if let Some(signal) = self.started.lock().await.get(workspace_id) {
            signal.send_modify(|generation| *generation += 1);
        }
    }

    async fn start_gate(&self, workspace_id: &str) -> Arc<Mutex<()>> {
        self.start_gates
            .lock()
            .await
            .entry(workspace_id.to_string())
            .or_default()
            .clone()
    }

    /// Removes the map entry only if it still points at `unit`.
    async fn deregister(&self, workspace_id: &str, unit: &Arc<UnitHandle>) -> bool {
        let is_current = {
            let mut units = self.units.write().await;
            let is_current = units
                .get(workspace_id)
                .is_some_and(|current| Arc::ptr_eq(current, unit));
            if is_current {
                units.remove(workspace_id);
            }
            is_current
        };
        if is_current {
            self.prune_start_state(workspace_id).await;
        }
        is_current
    }

    /// Drops the started signal and start gate of an id nobody waits on or starts.
    async fn prune_start_state(&self, workspace_id: &str) {
        {
            let mut started = self.started.lock().await;
            if started
                .get(workspace_id)
                .is_some_and(|signal| signal.receiver_count() == 0)
            {
                started.remove(workspace_id);
            }
        }
        let mut gates = self.start_gates.lock().await;
        if gates
            .get(workspace_id)
            .is_some_and(|gate| Arc::strong_count(gate) == 1)
        {
            gates.remove(workspace_id);
        }
    }

    async fn monitor_unit(
        self: Arc<Self>,
        workspace: Workspace,
        unit: Arc<UnitHandle>,
        mut events: mpsc::Receiver<UnitEvent>,
        mut log: WikiLog,
        boot_tx: oneshot::Sender<Result<(), WikiError>>,
    ) {
        let id = workspace.id.clone();
        let mut boot_tx = Some(boot_tx);
        while let Some(event) = events.recv().await {
            match event {
                UnitEvent::Fatal(message) => {
                    log.line("error", &message);
                    error!(event = "unit_fatal_error", workspace_id = %id, error = %message);
                    settle(
                        &mut boot_tx,
                        Err(WikiError::Runtime {
                            wiki: workspace.name.clone(),
                            message,
                            retry: false,
                            workspace: None,
                        }),
                    );
                }
                UnitEvent::Log(fields) => log.fields("info", &fields),
                UnitEvent::Boot(BootMessage::Stdout { message }) => log.line("info", &message),
                UnitEvent::Boot(BootMessage::Stderr { message }) => log.line("warn", &message),
                UnitEvent::Boot(BootMessage::Control {
                    action,
                    message,
                    argv,
                    code,
                }) => {
                    if let Some(argv) = argv {
                        if let Err(err) = self
                            .store
                            .update_with(&id, true, |record| record.last_node_js_argv = argv)
                            .await
                        {
                            warn!(event = "unit_argv_persist_failed", workspace_id = %id, error = %err);
                        }
                    }
                    match action {
                        ControlAction::Start => {
                            debug!(event = "unit_boot_start", workspace_id = %id, message = ?message);
                        }
                        ControlAction::Listening => {
                            info!(event = "unit_boot_listening", workspace_id = %id, message = ?message);
                        }
                        ControlAction::Booted => {
                            self.store
                                .update_metadata(&id, MetadataPatch::new().clear_error())
                                .await;
                            if let Some(tx) = boot_tx.take() {
                                let settle_delay = self.config.boot_settle;
                                let booted_id = id.clone();
                                tokio::spawn(async move {
                                    tokio::time::sleep(settle_delay).await;
                                    info!(event = "wiki_booted", workspace_id = %booted_id);
                                    let _ = tx.send(Ok(()));
                                });
                            }
                        }
                        ControlAction::Error => {
                            let message =
                                message.unwrap_or_else(|| CONTROL_ERROR_WITHOUT_MESSAGE.to_string());
                            let failure = self
                                .handle_boot_error(&workspace, message, code.as_deref())
                                .await;
                            settle(&mut boot_tx, Err(failure));
                        }
                    }
                }
                UnitEvent::Terminated { exit_code } => {
                    self.deregister(&id, &unit).await;
                    info!(
                        event = "unit_terminated",
                        workspace_id = %id,
                        exit_code = exit_code.unwrap_or(-1),
                        "Wiki unit stopped, can be a normal quit or an unexpected error"
                    );
                    log.line("info", "unit terminated");
                    settle(&mut boot_tx, Ok(()));
                    break;
                }
            }
        }
        settle(
            &mut boot_tx,
            Err(WikiError::UnitClosed {
                label: unit.label().to_string(),
            }),
        );
    }

    /// Records a boot failure and, for a port conflict, moves the workspace to the
    /// next port so that a retry can succeed.
    async fn handle_boot_error(
        &self,
        workspace: &Workspace,
        message: String,
        code: Option<&str>,
    ) -> WikiError {
        let id = &workspace.id;
        error!(event = "unit_boot_error", workspace_id = %id, error = %message);
        self.store
            .update_metadata(
                id,
                MetadataPatch::new().is_loading(false).failed(message.clone()),
            )
            .await;

        if !is_address_in_use(code, &message) {
            return WikiError::Runtime {
                wiki: workspace.wiki_folder_location.clone(),
                message,
                retry: false,
                workspace: Some(Box::new(workspace.clone())),
            };
        }

        let old_port = workspace.port;
        let new_port = old_port.saturating_add(1);
        let from = format!(":{old_port}");
        let to = format!(":{new_port}");
        let updated = self
            .store
            .update_with(id, true, |record| {
                record.port = new_port;
                record.home_url = record.home_url.replace(&from, &to);
                record.last_url = record.last_url.as_ref().map(|url| url.replace(&from, &to));
            })
            .await;
        if let Err(err) = updated {
            warn!(event = "unit_port_bump_persist_failed", workspace_id = %id, error = %err);
        }
        info!(event = "unit_port_bumped", workspace_id = %id, old_port, new_port);
        let repaired = self.store.get(id).await.unwrap_or_else(|| {
            let mut fallback = workspace.clone();
            fallback.port = new_port;
            fallback
        });
        WikiError::Runtime {
            wiki: workspace.wiki_folder_location.clone(),
            message,
            retry: true,
            workspace: Some(Box::new(repaired)),
        }
    }
}

fn settle(
    boot_tx: &mut Option<oneshot::Sender<Result<(), WikiError>>>,
    result: Result<(), WikiError>,
) {
    if let Some(tx) = boot_tx.take() {
        let _ = tx.send(result);
    }
}

fn is_html_wiki(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("html") || ext.eq_ignore_ascii_case("htm"))
}
