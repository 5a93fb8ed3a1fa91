pub mod error;
pub mod sanitize;
pub mod settings;

pub use error::StoreError;
pub use sanitize::{find_main_workspace, sanitize_workspace, AuthTokenIssuer, RandomTokenIssuer};
pub use settings::{JsonSettingsFile, MemorySettings, SettingsBackend};

use async_trait::async_trait;
use futures_util::Stream;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock, Weak};
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, warn};
use wikidesk_core::{
    default_home_url, new_workspace_id, workspace_sorter, MetadataPatch, NewWorkspaceConfig,
    Workspace, WorkspaceMetadata, WorkspaceWithMetadata, WorkspacesSnapshot, DEFAULT_WIKI_PORT,
};

pub const WORKSPACES_SETTING_KEY: &str = "workspaces";

/// A sub workspace is about to be committed with a different tag.
#[derive(Debug, Clone)]
pub struct TagChange {
    pub previous: Workspace,
    pub next: Workspace,
    pub main_wiki_path: String,
}

/// Side effects that must finish before a tag change is persisted.
#[async_trait]
pub trait WorkspaceChangeHook: Send + Sync {
    async fn before_tag_change(
        &self,
        change: TagChange,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// The view layer's page selection, cleared whenever a workspace becomes active.
#[async_trait]
pub trait PageSelection: Send + Sync {
    async fn active_page(&self) -> Option<String>;
    async fn clear_active_page(&self, page_id: Option<String>);
}

#[derive(Debug, Default)]
struct StoreState {
    workspaces: BTreeMap<String, Workspace>,
    metadata: BTreeMap<String, WorkspaceMetadata>,
}

impl StoreState {
    fn snapshot(&self) -> WorkspacesSnapshot {
        let workspaces = self
            .workspaces
            .iter()
            .map(|(id, workspace)| {
                let metadata = self.metadata.get(id).cloned().unwrap_or_default();
                (
                    id.clone(),
                    WorkspaceWithMetadata {
                        workspace: workspace.clone(),
                        metadata,
                    },
                )
            })
            .collect();
        WorkspacesSnapshot { workspaces }
    }

    fn find_key(&self, id: &str) -> Option<String> {
        if self.workspaces.contains_key(id) {
            return Some(id.to_string());
        }
        self.workspaces
            .keys()
            .find(|key| key.eq_ignore_ascii_case(id))
            .cloned()
    }

    fn sorted(&self) -> Vec<Workspace> {
        let mut list: Vec<Workspace> = self.workspaces.values().cloned().collect();
        list.sort_by(workspace_sorter);
        list
    }
}

/// Persisted workspace registry plus the runtime metadata side table.
///
/// Every write is sanitized, persisted through the settings backend and then
/// published as a fresh snapshot. New subscribers see the latest snapshot first.
pub struct WorkspaceStore {
    settings: Arc<dyn SettingsBackend>,
    tokens: Arc<dyn AuthTokenIssuer>,
    state: RwLock<StoreState>,
    snapshot_tx: watch::Sender<WorkspacesSnapshot>,
    change_hook: OnceLock<Weak<dyn WorkspaceChangeHook>>,
    pages: OnceLock<Arc<dyn PageSelection>>,
}

impl WorkspaceStore {
    pub fn load(
        settings: Arc<dyn SettingsBackend>,
        tokens: Arc<dyn AuthTokenIssuer>,
    ) -> Result<Self, StoreError> {
        let raw = settings.get_setting(WORKSPACES_SETTING_KEY)?;
        let mut parsed = BTreeMap::new();
        match raw {
            Some(Value::Object(entries)) => {
                for (id, value) in entries {
                    if value.is_null() {
                        continue;
                    }
                    match serde_json::from_value::<Workspace>(value) {
                        Ok(mut workspace) => {
                            if workspace.id.is_empty() {
                                workspace.id = id.clone();
                            }
                            parsed.insert(id, workspace);
                        }
                        Err(err) => {
                            warn!(event = "workspace_record_invalid", workspace_id = %id, error = %err);
                        }
                    }
                }
            }
            Some(other) => {
                warn!(event = "workspace_setting_not_object", value = %other);
            }
            None => {}
        }

        let workspaces: BTreeMap<String, Workspace> = parsed
            .iter()
            .map(|(id, workspace)| {
                (
                    id.clone(),
                    sanitize_workspace(workspace.clone(), &parsed, tokens.as_ref()),
                )
            })
            .collect();
        info!(event = "workspace_store_loaded", count = workspaces.len());

        let state = StoreState {
            workspaces,
            metadata: BTreeMap::new(),
        };
        let (snapshot_tx, _) = watch::channel(state.snapshot());
        Ok(Self {
            settings,
            tokens,
            state: RwLock::new(state),
            snapshot_tx,
            change_hook: OnceLock::new(),
            pages: OnceLock::new(),
        })
    }

    /// Installs the before-change hook. The store only keeps a weak reference.
    pub fn set_change_hook(&self, hook: Weak<dyn WorkspaceChangeHook>) {
        if self.change_hook.set(hook).is_err() {
            warn!(event = "workspace_change_hook_already_set");
        }
    }

    pub fn set_page_selection(&self, pages: Arc<dyn PageSelection>) {
        if self.pages.set(pages).is_err() {
            warn!(event = "workspace_page_selection_already_set");
        }
    }

    /// Looks a workspace up by id, falling back to a case-insensitive match.
    pub async fn get(&self, id: &str) -> Option<Workspace> {
        let state = self.state.read().await;
        let key = state.find_key(id)?;
        state.workspaces.get(&key).cloned()
    }

    pub async fn get_all(&self) -> BTreeMap<String, Workspace> {
        self.state.read().await.workspaces.clone()
    }

    pub async fn get_workspaces_as_list(&self) -> Vec<Workspace> {
        self.state.read().await.sorted()
    }

    pub async fn count_workspaces(&self) -> usize {
        self.state.read().await.workspaces.len()
    }

    pub async fn get_sub_workspaces_as_list(&self, main_id: &str) -> Vec<Workspace> {
        self.get_workspaces_as_list()
            .await
            .into_iter()
            .filter(|workspace| {
                workspace.is_sub_wiki && workspace.main_wiki_id.as_deref() == Some(main_id)
            })
            .collect()
    }

    pub async fn get_by_wiki_folder_location(&self, location: &str) -> Option<Workspace> {
        self.get_workspaces_as_list()
            .await
            .into_iter()
            .find(|workspace| workspace.wiki_folder_location == location)
    }

    pub async fn get_by_wiki_name(&self, name: &str) -> Option<Workspace> {
        self.get_workspaces_as_list()
            .await
            .into_iter()
            .find(|workspace| workspace.name == name)
    }

    pub async fn get_main_workspace(&self, sub: &Workspace) -> Option<Workspace> {
        let state = self.state.read().await;
        find_main_workspace(sub, &state.workspaces).cloned()
    }

    /// Replaces the record for `id`.
    pub async fn set(
        &self,
        id: &str,
        workspace: Workspace,
        immediate: bool,
    ) -> Result<(), StoreError> {
        self.commit(id, workspace, immediate).await.map(|_| ())
    }

    /// Applies `apply` to the current record. Returns `Ok(false)` when the id is unknown.
    pub async fn update_with<F>(
        &self,
        id: &str,
        immediate: bool,
        apply: F,
    ) -> Result<bool, StoreError>
    where
        F: FnOnce(&mut Workspace),
    {
        let Some(mut workspace) = self.get(id).await else {
            error!(
                event = "workspace_update_missing",
                workspace_id = %id,
                "Could not update workspace because it does not exist"
            );
            return Ok(false);
        };
        let base = workspace.clone();
        apply(&mut workspace);
        let key = workspace.id.clone();
        self.commit_from(&key, Some(base), workspace, immediate).await?;
        Ok(true)
    }

    /// Shallow merges camelCase JSON fields over the current record.
    pub async fn update_json(
        &self,
        id: &str,
        partial: Value,
        immediate: bool,
    ) -> Result<bool, StoreError> {
        let Value::Object(fields) = partial else {
            return Err(StoreError::Serialization(<serde_json::Error as serde::de::Error>::custom(
                "workspace update must be a JSON object",
            )));
        };
        let Some(current) = self.get(id).await else {
            error!(
                event = "workspace_update_missing",
                workspace_id = %id,
                "Could not update workspace because it does not exist"
            );
            return Ok(false);
        };
        let mut merged = serde_json::to_value(&current)?;
        if let Value::Object(target) = &mut merged {
            for (key, value) in fields {
                target.insert(key, value);
            }
        }
        let mut next: Workspace = serde_json::from_value(merged)?;
        next.id = current.id.clone();
        let key = current.id.clone();
        self.commit_from(&key, Some(current), next, immediate).await?;
        Ok(true)
    }

    pub async fn set_workspaces(
        &self,
        workspaces: BTreeMap<String, Workspace>,
    ) -> Result<(), StoreError> {
        for (id, workspace) in workspaces {
            self.commit(&id, workspace, false).await?;
        }
        Ok(())
    }

    pub async fn remove(&self, id: &str) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if state.workspaces.remove(id).is_none() {
            return Err(StoreError::WorkspaceNotFound(id.to_string()));
        }
        state.metadata.remove(id);
        self.persist(&state, false)?;
        self.snapshot_tx.send_replace(state.snapshot());
        info!(event = "workspace_removed", workspace_id = %id);
        Ok(())
    }

    pub async fn create(&self, config: NewWorkspaceConfig) -> Result<Workspace, StoreError> {
        let id = new_workspace_id();
        let max_order = {
            let state = self.state.read().await;
            state
                .workspaces
                .values()
                .map(|workspace| workspace.order)
                .fold(0, i64::max)
        };
        let workspace = Workspace {
            home_url: default_home_url(&id),
            id: id.clone(),
            name: config.name,
            order: max_order + 1,
            is_sub_wiki: config.is_sub_wiki,
            main_wiki_id: config.main_wiki_id,
            main_wiki_to_link: config.main_wiki_to_link,
            wiki_folder_location: config.wiki_folder_location,
            tag_name: config.tag_name,
            port: config.port.unwrap_or(DEFAULT_WIKI_PORT),
            https: config.https,
            token_auth: config.token_auth,
            read_only_mode: config.read_only_mode,
            storage_service: config.storage_service,
            user_name: config.user_name,
            root_tiddler: config.root_tiddler,
            backup_on_interval: config.backup_on_interval.unwrap_or(true),
            picture_path: config.picture_path,
            ..Workspace::default()
        };
        let created = self.commit(&id, workspace, false).await?;
        info!(
            event = "workspace_created",
            workspace_id = %created.id,
            name = %created.name,
            is_sub_wiki = created.is_sub_wiki
        );
        Ok(created)
    }

    pub async fn get_active(&self) -> Option<Workspace> {
        self.get_workspaces_as_list()
            .await
            .into_iter()
            .find(|workspace| workspace.active)
    }

    pub async fn get_first(&self) -> Option<Workspace> {
        self.get_workspaces_as_list().await.into_iter().next()
    }

    /// Neighbor before `id` in display order, wrapping to the last one.
    pub async fn get_previous(&self, id: &str) -> Option<Workspace> {
        let list = self.get_workspaces_as_list().await;
        let index = list.iter().position(|workspace| workspace.id == id)?;
        if index == 0 {
            return list.last().cloned();
        }
        list.get(index - 1).cloned()
    }

    /// Neighbor after `id` in display order, wrapping to the first one.
    pub async fn get_next(&self, id: &str) -> Option<Workspace> {
        let list = self.get_workspaces_as_list().await;
        let index = list.iter().position(|workspace| workspace.id == id)?;
        if index + 1 >= list.len() {
            return list.first().cloned();
        }
        list.get(index + 1).cloned()
    }

    /// Activates `id` and deactivates every other workspace in one commit, then
    /// clears the active page.
    pub async fn set_active(&self, id: &str, previous: Option<&str>) -> Result<(), StoreError> {
        {
            let mut state = self.state.write().await;
            let Some(key) = state.find_key(id) else {
                error!(event = "workspace_activate_missing", workspace_id = %id);
                return Ok(());
            };
            let known = state.workspaces.clone();
            for (other_id, workspace) in state.workspaces.iter_mut() {
                let should_be_active = *other_id == key;
                if workspace.active == should_be_active && !should_be_active {
                    continue;
                }
                let mut next = workspace.clone();
                next.active = should_be_active;
                if should_be_active {
                    next.hibernated = false;
                }
                *workspace = sanitize_workspace(next, &known, self.tokens.as_ref());
            }
            self.persist(&state, false)?;
            self.snapshot_tx.send_replace(state.snapshot());
            debug!(
                event = "workspace_activated",
                workspace_id = %key,
                previous = %previous.unwrap_or("")
            );
        }
        if let Some(pages) = self.pages.get() {
            let active_page = pages.active_page().await;
            pages.clear_active_page(active_page).await;
        }
        Ok(())
    }

    pub async fn clear_active(&self, previous: Option<&str>) -> Result<(), StoreError> {
        if let Some(previous) = previous {
            self.update_with(previous, false, |workspace| workspace.active = false)
                .await?;
        }
        Ok(())
    }

    pub async fn get_metadata(&self, id: &str) -> WorkspaceMetadata {
        self.state
            .read()
            .await
            .metadata
            .get(id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn get_all_metadata(&self) -> BTreeMap<String, WorkspaceMetadata> {
        self.state.read().await.metadata.clone()
    }

    /// Shallow merges `patch` into the metadata of `id` and republishes the snapshot.
    pub async fn update_metadata(&self, id: &str, patch: MetadataPatch) {
        let mut state = self.state.write().await;
        let merged = state
            .metadata
            .get(id)
            .cloned()
            .unwrap_or_default()
            .merged(&patch);
        state.metadata.insert(id.to_string(), merged);
        self.snapshot_tx.send_replace(state.snapshot());
    }

    pub async fn workspace_did_fail_load(&self, id: &str) -> bool {
        self.get_metadata(id).await.did_fail_load()
    }

    pub async fn get_workspaces_with_metadata(&self) -> WorkspacesSnapshot {
        self.state.read().await.snapshot()
    }

    /// Snapshot stream. The receiver already holds the latest snapshot.
    pub fn subscribe(&self) -> watch::Receiver<WorkspacesSnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// Current record of one workspace, then one item per committed change.
    pub fn watch_workspace(
        &self,
        id: &str,
    ) -> impl Stream<Item = Option<Workspace>> + Send + 'static {
        let receiver = self.snapshot_tx.subscribe();
        let id = id.to_string();
        futures_util::stream::unfold((receiver, true), move |(mut receiver, first)| {
            let id = id.clone();
            async move {
                if !first && receiver.changed().await.is_err() {
                    return None;
                }
                let current = receiver
                    .borrow_and_update()
                    .get(&id)
                    .map(|entry| entry.workspace.clone());
                Some((current, (receiver, false)))
            }
        })
    }

    pub async fn remove_workspace_picture(&self, id: &str) -> Result<(), StoreError> {
        let Some(mut workspace) = self.get(id).await else {
            return Err(StoreError::WorkspaceNotFound(id.to_string()));
        };
        let Some(picture_path) = workspace.picture_path.take() else {
            return Ok(());
        };
        match std::fs::remove_file(&picture_path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(StoreError::io(picture_path, err)),
        }
        let key = workspace.id.clone();
        self.commit(&key, workspace, false).await.map(|_| ())
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.settings.flush()
    }

    async fn commit(
        &self,
        id: &str,
        workspace: Workspace,
        immediate: bool,
    ) -> Result<Workspace, StoreError> {
        let base = self.state.read().await.workspaces.get(id).cloned();
        self.commit_from(id, base, workspace, immediate).await
    }

    /// Commits `workspace` as an edit of `base`. The hook runs without the store
    /// lock, so writes that landed meanwhile are kept and only the fields this edit
    /// changed are applied on top of them.
    async fn commit_from(
        &self,
        id: &str,
        base: Option<Workspace>,
        mut workspace: Workspace,
        immediate: bool,
    ) -> Result<Workspace, StoreError> {
        workspace.id = id.to_string();
        let sanitized = {
            let state = self.state.read().await;
            sanitize_workspace(workspace, &state.workspaces, self.tokens.as_ref())
        };
        if let Some(base) = &base {
            self.react_before_change(base.clone(), &sanitized).await?;
        }

        let mut state = self.state.write().await;
        let committed = match (base, state.workspaces.get(id)) {
            (Some(base), Some(current)) if *current != base => {
                debug!(event = "workspace_concurrent_update_merged", workspace_id = %id);
                let merged = merge_edit(&base, &sanitized, current)?;
                sanitize_workspace(merged, &state.workspaces, self.tokens.as_ref())
            }
            (Some(_), None) => {
                warn!(event = "workspace_removed_during_update", workspace_id = %id);
                return Err(StoreError::WorkspaceNotFound(id.to_string()));
            }
            _ => sanitized,
        };
        state.workspaces.insert(id.to_string(), committed.clone());
        self.persist(&state, immediate)?;
        self.snapshot_tx.send_replace(state.snapshot());
        Ok(committed)
    }

    /// Runs the tag change hook for sub workspaces. The store lock is not held here
    /// because the hook restarts wikis, which writes back into the store.
    async fn react_before_change(
        &self,
        previous: Workspace,
        next: &Workspace,
    ) -> Result<(), StoreError> {
        let Some(tag) = next.tag_name.as_deref().filter(|tag| !tag.is_empty()) else {
            return Ok(());
        };
        if !previous.is_sub_wiki || previous.tag_name.as_deref() == Some(tag) {
            return Ok(());
        }
        let main_wiki_path = match previous.main_wiki_to_link.clone() {
            Some(path) if !path.is_empty() => path,
            _ => self
                .get_main_workspace(&previous)
                .await
                .map(|main| main.wiki_folder_location)
                .ok_or_else(|| StoreError::MissingMainWikiPath {
                    id: previous.id.clone(),
                })?,
        };
        let Some(hook) = self.change_hook.get().and_then(Weak::upgrade) else {
            debug!(event = "workspace_tag_change_without_hook", workspace_id = %next.id);
            return Ok(());
        };
        info!(
            event = "workspace_tag_change",
            workspace_id = %next.id,
            old_tag = %previous.tag_name.as_deref().unwrap_or(""),
            new_tag = %tag
        );
        let id = next.id.clone();
        hook.before_tag_change(TagChange {
            previous,
            next: next.clone(),
            main_wiki_path,
        })
        .await
        .map_err(|err| StoreError::Hook {
            id,
            message: err.to_string(),
        })
    }

    fn persist(&self, state: &StoreState, immediate: bool) -> Result<(), StoreError> {
        let value = serde_json::to_value(&state.workspaces)?;
        self.settings.set_setting(WORKSPACES_SETTING_KEY, value)?;
        if immediate {
            self.settings.flush()?;
        }
        Ok(())
    }
}

/// Applies the fields `edited` changed relative to `base` onto `current`.
fn merge_edit(
    base: &Workspace,
    edited: &Workspace,
    current: &Workspace,
) -> Result<Workspace, StoreError> {
    let base = serde_json::to_value(base)?;
    let edited = serde_json::to_value(edited)?;
    let mut merged = serde_json::to_value(current)?;
    if let (Value::Object(base), Value::Object(edited), Value::Object(target)) =
        (&base, edited, &mut merged)
    {
        for (key, value) in edited {
            if base.get(&key) != Some(&value) {
                target.insert(key, value);
            }
        }
    }
    Ok(serde_json::from_value(merged)?)
}
