mod config;
mod view;

use anyhow::{Context, Result};
use config::DaemonConfig;
use std::{
    fs::OpenOptions,
    io::{self, Write},
    path::Path,
    sync::{Arc, Mutex},
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};
use view::HeadlessViews;
use wikidesk_core::MetadataPatch;
use wikidesk_store::{JsonSettingsFile, RandomTokenIssuer, WorkspaceStore};
use wikidesk_supervisor::{
    Collaborators, NoGit, NoIntervalSync, ProcessLauncher, StaticAuth, WikiService,
};

const LOG_FILE_NAME: &str = "wikidesk-daemon.log";

#[tokio::main]
async fn main() {
    let config = match DaemonConfig::load() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("config_error: {err:#}");
            std::process::exit(2);
        }
    };
    let _log_guard = init_logging(&config);
    if let Err(err) = run(config).await {
        error!(event = "daemon_error", error = %format!("{err:#}"));
        std::process::exit(1);
    }
}

async fn run(config: DaemonConfig) -> Result<()> {
    let settings = Arc::new(
        JsonSettingsFile::open(&config.settings_path)
            .with_context(|| format!("open settings {}", config.settings_path.display()))?,
    );
    let store = Arc::new(
        WorkspaceStore::load(settings.clone(), Arc::new(RandomTokenIssuer))
            .context("load workspaces")?,
    );
    let launcher = Arc::new(ProcessLauncher::new(&config.engine).args(config.engine_args.clone()));
    let views = Arc::new(HeadlessViews::new());
    let service = WikiService::new(
        config.supervisor.clone(),
        store.clone(),
        launcher,
        Collaborators {
            views: views.clone(),
            sync: Arc::new(NoIntervalSync),
            auth: Arc::new(StaticAuth::new(config.user_name.clone())),
            git: Arc::new(NoGit),
        },
    );
    views.attach(&service);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let flusher = settings
        .clone()
        .spawn_deferred_flush(config.flush_interval, shutdown_rx);

    info!(
        event = "daemon_start",
        settings = %config.settings_path.display(),
        engine = %config.engine.display(),
        workspaces = store.count_workspaces().await
    );
    start_workspaces(&service).await;

    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(event = "ctrl_c_listen_failed", error = %err);
    }
    info!(event = "daemon_stopping");
    service.shutdown().await;
    let _ = shutdown_tx.send(true);
    if let Err(err) = flusher.await {
        warn!(event = "settings_flush_task_failed", error = %err);
    }
    info!(event = "daemon_stopped");
    Ok(())
}

/// Initial pass over the stored workspaces. The start locks taken by main wikis
/// are released once every workspace had its turn.
async fn start_workspaces(service: &Arc<WikiService>) {
    for workspace in service.store().get_workspaces_as_list().await {
        if workspace.hibernated {
            info!(event = "workspace_hibernated", workspace_id = %workspace.id);
            continue;
        }
        let checked = if workspace.is_main_wiki() {
            service.folders().check_wiki_exist(&workspace, true).await
        } else {
            Ok(())
        };
        let result = match checked {
            Ok(()) => service.startup().wiki_startup(&workspace).await,
            Err(err) => Err(err),
        };
        if let Err(err) = result {
            warn!(
                event = "workspace_start_failed",
                workspace_id = %workspace.id,
                error = %err
            );
            service
                .store()
                .update_metadata(
                    &workspace.id,
                    MetadataPatch::new().failed(err.to_string()).is_loading(false),
                )
                .await;
            continue;
        }
        service
            .store()
            .update_metadata(&workspace.id, MetadataPatch::new().is_loading(false))
            .await;
    }
    service.startup().set_all_start_locks_off().await;
}

fn init_logging(config: &DaemonConfig) -> Option<LogGuard> {
    let level = if config.debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("WIKIDESK_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let writer = match open_log_file(&config.log_dir) {
        Ok(log_guard) => log_guard,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            LogGuard { file: None }
        }
    };
    let file = writer.file.clone();
    let make_writer = BoxMakeWriter::new(move || MultiWriter::new(file.clone()));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(writer)
}

struct LogGuard {
    file: Option<Arc<Mutex<std::fs::File>>>,
}

struct MultiWriter {
    stdout: io::Stdout,
    file: Option<Arc<Mutex<std::fs::File>>>,
}

impl MultiWriter {
    fn new(file: Option<Arc<Mutex<std::fs::File>>>) -> Self {
        Self {
            stdout: io::stdout(),
            file,
        }
    }
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.stdout.write_all(buf);
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.write_all(buf);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = self.stdout.flush();
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
        Ok(())
    }
}

fn open_log_file(log_dir: &Path) -> io::Result<LogGuard> {
    if log_dir.as_os_str().is_empty() {
        return Ok(LogGuard { file: None });
    }
    if std::fs::create_dir_all(log_dir).is_err() {
        return Ok(LogGuard { file: None });
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join(LOG_FILE_NAME))?;
    Ok(LogGuard {
        file: Some(Arc::new(Mutex::new(file))),
    })
}
