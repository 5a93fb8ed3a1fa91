use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub const INTERNAL_URL_SCHEME: &str = "wikidesk";
pub const DEFAULT_WIKI_PORT: u16 = 5212;
pub const DEFAULT_SUB_WIKI_FOLDER_NAME: &str = "subwiki";

/// Home url every workspace falls back to when its stored url predates the
/// internal scheme.
pub fn default_home_url(workspace_id: &str) -> String {
    format!("{INTERNAL_URL_SCHEME}://{workspace_id}")
}

pub fn uses_internal_scheme(url: &str) -> bool {
    url.starts_with(INTERNAL_URL_SCHEME)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageService {
    #[default]
    Github,
    Gitlab,
    Local,
}

impl StorageService {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageService::Github => "github",
            StorageService::Gitlab => "gitlab",
            StorageService::Local => "local",
        }
    }
}

impl fmt::Display for StorageService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StorageService {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "github" => Ok(StorageService::Github),
            "gitlab" => Ok(StorageService::Gitlab),
            "local" => Ok(StorageService::Local),
            other => Err(format!("Unknown storage service: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct HttpsConfig {
    pub enabled: bool,
    pub tls_key: Option<String>,
    pub tls_cert: Option<String>,
}

/// Persisted workspace record, stored under the `workspaces` settings key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Workspace {
    pub id: String,
    pub name: String,
    pub order: i64,
    pub active: bool,

    pub is_sub_wiki: bool,
    #[serde(rename = "mainWikiID")]
    pub main_wiki_id: Option<String>,
    pub wiki_folder_location: String,
    pub tag_name: Option<String>,
    pub main_wiki_to_link: Option<String>,
    pub sub_wiki_folder_name: String,

    pub port: u16,
    pub https: HttpsConfig,
    pub token_auth: bool,
    pub auth_token: Option<String>,
    pub read_only_mode: bool,
    pub excluded_plugins: Vec<String>,
    #[serde(rename = "enableHTTPAPI")]
    pub enable_http_api: bool,
    pub home_url: String,
    pub last_url: Option<String>,
    pub user_name: String,
    pub root_tiddler: Option<String>,
    pub storage_service: StorageService,

    pub hibernated: bool,
    pub hibernate_when_unused: bool,
    pub sync_on_startup: bool,
    pub sync_on_interval: bool,
    pub backup_on_interval: bool,
    pub disable_audio: bool,
    pub disable_notifications: bool,
    pub transparent_background: bool,

    #[serde(rename = "lastNodeJSArgv")]
    pub last_node_js_argv: Vec<String>,
    pub picture_path: Option<String>,
}

impl Default for Workspace {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            order: 0,
            active: false,
            is_sub_wiki: false,
            main_wiki_id: None,
            wiki_folder_location: String::new(),
            tag_name: None,
            main_wiki_to_link: None,
            sub_wiki_folder_name: DEFAULT_SUB_WIKI_FOLDER_NAME.to_string(),
            port: DEFAULT_WIKI_PORT,
            https: HttpsConfig::default(),
            token_auth: false,
            auth_token: None,
            read_only_mode: false,
            excluded_plugins: Vec::new(),
            enable_http_api: false,
            home_url: String::new(),
            last_url: None,
            user_name: String::new(),
            root_tiddler: None,
            storage_service: StorageService::Github,
            hibernated: false,
            hibernate_when_unused: false,
            sync_on_startup: true,
            sync_on_interval: false,
            backup_on_interval: true,
            disable_audio: false,
            disable_notifications: false,
            transparent_background: false,
            last_node_js_argv: Vec::new(),
            picture_path: None,
        }
    }
}

impl Workspace {
    pub fn is_main_wiki(&self) -> bool {
        !self.is_sub_wiki
    }

    pub fn display_name(&self) -> &str {
        if self.name.trim().is_empty() {
            &self.id
        } else {
            &self.name
        }
    }

    /// Folder name of this wiki on disk, used as the link name under the main wiki.
    pub fn folder_name(&self) -> Option<&str> {
        std::path::Path::new(&self.wiki_folder_location)
            .file_name()
            .and_then(|name| name.to_str())
    }
}

/// Stable display and iteration order: ascending `order`, ties broken by id.
pub fn workspace_sorter(a: &Workspace, b: &Workspace) -> Ordering {
    a.order.cmp(&b.order).then_with(|| a.id.cmp(&b.id))
}

/// User supplied values for a new workspace; everything else is defaulted by the store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct NewWorkspaceConfig {
    pub name: String,
    pub is_sub_wiki: bool,
    #[serde(rename = "mainWikiID")]
    pub main_wiki_id: Option<String>,
    pub main_wiki_to_link: Option<String>,
    pub wiki_folder_location: String,
    pub tag_name: Option<String>,
    pub port: Option<u16>,
    pub https: HttpsConfig,
    pub token_auth: bool,
    pub read_only_mode: bool,
    pub storage_service: StorageService,
    pub user_name: String,
    pub root_tiddler: Option<String>,
    pub backup_on_interval: Option<bool>,
    pub picture_path: Option<String>,
}

/// Runtime-only state of a workspace. Never persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceMetadata {
    #[serde(default)]
    pub is_loading: bool,
    #[serde(default)]
    pub did_fail_load_error_message: Option<String>,
    #[serde(default)]
    pub badge_count: u32,
    #[serde(default, flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl WorkspaceMetadata {
    /// Shallow merge: fields present in the patch replace ours, the rest is kept.
    pub fn merged(&self, patch: &MetadataPatch) -> Self {
        let mut next = self.clone();
        if let Some(is_loading) = patch.is_loading {
            next.is_loading = is_loading;
        }
        if let Some(message) = &patch.did_fail_load_error_message {
            next.did_fail_load_error_message = message.clone();
        }
        if let Some(count) = patch.badge_count {
            next.badge_count = count;
        }
        for (key, value) in &patch.extra {
            next.extra.insert(key.clone(), value.clone());
        }
        next
    }

    pub fn did_fail_load(&self) -> bool {
        self.did_fail_load_error_message
            .as_deref()
            .is_some_and(|message| !message.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct MetadataPatch {
    pub is_loading: Option<bool>,
    pub did_fail_load_error_message: Option<Option<String>>,
    pub badge_count: Option<u32>,
    pub extra: BTreeMap<String, Value>,
}

impl MetadataPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_loading(mut self, value: bool) -> Self {
        self.is_loading = Some(value);
        self
    }

    pub fn failed(mut self, message: impl Into<String>) -> Self {
        self.did_fail_load_error_message = Some(Some(message.into()));
        self
    }

    pub fn clear_error(mut self) -> Self {
        self.did_fail_load_error_message = Some(None);
        self
    }

    pub fn badge_count(mut self, count: u32) -> Self {
        self.badge_count = Some(count);
        self
    }

    pub fn flag(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkspaceWithMetadata {
    #[serde(flatten)]
    pub workspace: Workspace,
    pub metadata: WorkspaceMetadata,
}

/// Materialized join of persisted configuration and runtime metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct WorkspacesSnapshot {
    pub workspaces: BTreeMap<String, WorkspaceWithMetadata>,
}

impl WorkspacesSnapshot {
    pub fn get(&self, id: &str) -> Option<&WorkspaceWithMetadata> {
        self.workspaces.get(id)
    }

    pub fn len(&self) -> usize {
        self.workspaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workspaces.is_empty()
    }

    pub fn sorted(&self) -> Vec<&WorkspaceWithMetadata> {
        let mut list: Vec<_> = self.workspaces.values().collect();
        list.sort_by(|a, b| workspace_sorter(&a.workspace, &b.workspace));
        list
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workspace_reads_legacy_camel_case_record() {
        let raw = r#"{
            "id": "w1",
            "name": "Notes",
            "order": 3,
            "isSubWiki": true,
            "mainWikiToLink": "/wikis/main",
            "wikiFolderLocation": "/wikis/sub",
            "tagName": "private\n",
            "enableHTTPAPI": true,
            "lastNodeJSArgv": ["--listen"],
            "unknownLegacyField": 1
        }"#;
        let workspace: Workspace = serde_json::from_str(raw).expect("parse workspace");
        assert_eq!(workspace.order, 3);
        assert!(workspace.is_sub_wiki);
        assert_eq!(workspace.main_wiki_id, None);
        assert!(workspace.enable_http_api);
        assert_eq!(workspace.port, DEFAULT_WIKI_PORT);
        assert!(workspace.backup_on_interval);
        assert_eq!(workspace.last_node_js_argv, vec!["--listen".to_string()]);
        assert_eq!(workspace.folder_name(), Some("sub"));
    }

    #[test]
    fn sorter_orders_by_order_then_id() {
        let mut list = vec![
            Workspace {
                id: "c".into(),
                order: 2,
                ..Workspace::default()
            },
            Workspace {
                id: "b".into(),
                order: 1,
                ..Workspace::default()
            },
            Workspace {
                id: "a".into(),
                order: 2,
                ..Workspace::default()
            },
        ];
        list.sort_by(workspace_sorter);
        let ids: Vec<_> = list.iter().map(|w| w.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
    }

    #[test]
    fn metadata_merge_keeps_untouched_fields() {
        let base = WorkspaceMetadata::default();
        let first = base.merged(&MetadataPatch::new().is_loading(true));
        let second = first.merged(&MetadataPatch::new().failed("boom").flag("pinned", true));
        assert!(second.is_loading);
        assert_eq!(second.did_fail_load_error_message.as_deref(), Some("boom"));
        assert_eq!(second.extra.get("pinned"), Some(&Value::Bool(true)));
        assert!(second.did_fail_load());

        let cleared = second.merged(&MetadataPatch::new().clear_error());
        assert!(!cleared.did_fail_load());
        assert!(cleared.is_loading);
    }
}
