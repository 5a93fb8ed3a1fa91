pub mod model;
pub mod operations;
pub mod unit_ipc;

pub use model::{
    default_home_url, uses_internal_scheme, workspace_sorter, HttpsConfig, MetadataPatch,
    NewWorkspaceConfig, StorageService, Workspace, WorkspaceMetadata, WorkspaceWithMetadata,
    WorkspacesSnapshot, DEFAULT_SUB_WIKI_FOLDER_NAME, DEFAULT_WIKI_PORT, INTERNAL_URL_SCHEME,
};
pub use operations::{
    BrowserOperation, ChangedTiddler, ChangedTiddlers, IpcRoute, IpcRouteResponse,
    OperationError, ServerOperation, TiddlerFileMetadata, TypedOperation, WikiChannel,
    WikiOperation,
};

/// Fresh opaque workspace id.
pub fn new_workspace_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Folder under a main wiki's tiddlers folder that holds the links to its sub wikis.
pub const SUB_WIKI_LINK_FOLDER: &str = "subwiki";
pub const TIDDLERS_PATH: &str = "tiddlers";
