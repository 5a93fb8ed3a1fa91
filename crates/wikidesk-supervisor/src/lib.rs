pub mod collaborators;
pub mod config;
pub mod error;
pub mod folders;
pub mod launcher;
pub mod linker;
pub mod plugin_content;
pub mod router;
pub mod service;
pub mod startup;
pub mod supervisor;
pub mod unit;
pub mod wiki_log;

pub use collaborators::{
    AuthProvider, GitService, GitUserInfo, IntervalSync, NoGit, NoIntervalSync, StaticAuth,
    ViewHost,
};
pub use config::SupervisorConfig;
pub use error::WikiError;
pub use folders::WikiFolders;
pub use launcher::{LaunchedUnit, ProcessLauncher, UnitLauncher, UnitProcess, UnitReader, UnitWriter};
pub use linker::{link_wiki, sub_wiki_link_path, unlink_wiki};
pub use plugin_content::{
    get_sub_wiki_plugin_content, update_sub_wiki_plugin_content, SubWikiRoute,
};
pub use router::CommandRouter;
pub use service::{Collaborators, WikiService};
pub use startup::StartupOrchestrator;
pub use supervisor::{WikiErrorLogs, WikiSupervisor};
pub use unit::{UnitEvent, UnitHandle};
