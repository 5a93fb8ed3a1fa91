#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::task::JoinHandle;
use wikidesk_core::unit_ipc::{
    decode_frame, encode_frame, BootMessage, ControlAction, HostFrame, StartConfig, UnitCall,
    UnitFrame, DEFAULT_MAX_FRAME_BYTES,
};
use wikidesk_core::{
    ChangedTiddler, IpcRoute, MetadataPatch, NewWorkspaceConfig, WikiOperation, Workspace,
};
use wikidesk_store::{MemorySettings, RandomTokenIssuer, WorkspaceStore};
use wikidesk_supervisor::{
    Collaborators, IntervalSync, LaunchedUnit, NoGit, StaticAuth, SupervisorConfig, UnitLauncher,
    UnitProcess, UnitReader, ViewHost, WikiError, WikiService,
};

/// How the scripted engine behaves once it receives its start configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Script {
    Booted,
    AddressInUse,
    Error,
    Fatal,
    NeverReady,
    ExitAfterBoot,
    /// Boots but never answers `before_exit`.
    BootedDeafOnExit,
    /// Boots after writing bytes that are not UTF-8 to stdout and stderr.
    NoisyBooted,
}

#[derive(Default)]
struct LaunchLog {
    labels: Vec<String>,
    starts: Vec<StartConfig>,
    calls: Vec<(String, UnitCall)>,
}

/// A launcher whose units are tasks speaking NDJSON over in-memory pipes.
pub struct ScriptedLauncher {
    scripts: Mutex<VecDeque<Script>>,
    fallback: Script,
    log: Arc<Mutex<LaunchLog>>,
    live: Arc<AtomicUsize>,
}

impl ScriptedLauncher {
    pub fn new(scripts: &[Script], fallback: Script) -> Self {
        Self {
            scripts: Mutex::new(scripts.iter().copied().collect()),
            fallback,
            log: Arc::new(Mutex::new(LaunchLog::default())),
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn launches(&self) -> Vec<String> {
        self.log.lock().expect("log").labels.clone()
    }

    pub fn starts(&self) -> Vec<StartConfig> {
        self.log.lock().expect("log").starts.clone()
    }

    pub fn calls(&self) -> Vec<(String, UnitCall)> {
        self.log.lock().expect("log").calls.clone()
    }

    /// Units whose engine task is still running.
    pub fn live_units(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UnitLauncher for ScriptedLauncher {
    async fn launch(&self, label: &str) -> Result<LaunchedUnit, WikiError> {
        let script = self
            .scripts
            .lock()
            .expect("scripts")
            .pop_front()
            .unwrap_or(self.fallback);
        self.log.lock().expect("log").labels.push(label.to_string());
        let (host_out, engine_in) = tokio::io::duplex(64 * 1024);
        let (engine_out, host_in) = tokio::io::duplex(64 * 1024);
        let (engine_err, host_err) = if script == Script::NoisyBooted {
            let (engine_err, host_err) = tokio::io::duplex(4 * 1024);
            (Some(engine_err), Some(host_err))
        } else {
            (None, None)
        };
        self.live.fetch_add(1, Ordering::SeqCst);
        let live = self.live.clone();
        let log = self.log.clone();
        let label = label.to_string();
        let task = tokio::spawn(async move {
            let _live = LiveGuard(live);
            run_engine(label, script, engine_in, engine_out, engine_err, log).await;
        });
        Ok(LaunchedUnit {
            frames_in: Box::new(host_in),
            frames_out: Box::new(host_out),
            stderr: host_err.map(|stderr| Box::new(stderr) as UnitReader),
            process: Box::new(ScriptedProcess { task: Some(task) }),
        })
    }
}

/// Counts a running engine; dropped when the engine task ends or is aborted.
struct LiveGuard(Arc<AtomicUsize>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct ScriptedProcess {
    task: Option<JoinHandle<()>>,
}

#[async_trait]
impl UnitProcess for ScriptedProcess {
    async fn terminate(&mut self) -> Result<(), WikiError> {
        if let Some(task) = &self.task {
            task.abort();
        }
        Ok(())
    }

    async fn wait(&mut self) -> Option<i32> {
        let task = self.task.as_mut()?;
        let result = task.await;
        self.task = None;
        match result {
            Ok(()) => Some(0),
            Err(_) => Some(137),
        }
    }
}

async fn send(writer: &mut DuplexStream, frame: &UnitFrame) {
    let bytes = encode_frame(frame, DEFAULT_MAX_FRAME_BYTES).expect("encode frame");
    let _ = writer.write_all(&bytes).await;
    let _ = writer.flush().await;
}

async fn boot(writer: &mut DuplexStream, action: ControlAction, message: Option<&str>) {
    send(
        writer,
        &UnitFrame::Boot {
            message: BootMessage::control(action, message),
        },
    )
    .await;
}

async fn run_engine(
    label: String,
    script: Script,
    engine_in: DuplexStream,
    mut out: DuplexStream,
    mut err: Option<DuplexStream>,
    log: Arc<Mutex<LaunchLog>>,
) {
    if script != Script::NeverReady {
        send(&mut out, &UnitFrame::Ready).await;
    }
    if script == Script::NoisyBooted {
        let _ = out.write_all(b"\xff\xfe plugin noise\n").await;
        if let Some(err) = err.as_mut() {
            let _ = err.write_all(b"\xff\xfe warning\nsecond warning\n").await;
        }
    }
    let mut lines = BufReader::new(engine_in).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let frame: HostFrame = decode_frame(line.as_bytes(), DEFAULT_MAX_FRAME_BYTES).expect("host frame");
        match frame {
            HostFrame::Start { config } => {
                let port = config.port;
                log.lock().expect("log").starts.push(config);
                boot(&mut out, ControlAction::Start, None).await;
                match script {
                    Script::Booted
                    | Script::ExitAfterBoot
                    | Script::BootedDeafOnExit
                    | Script::NoisyBooted => {
                        send(
                            &mut out,
                            &UnitFrame::Boot {
                                message: BootMessage::Stdout {
                                    message: format!("Serving on http://127.0.0.1:{port}"),
                                },
                            },
                        )
                        .await;
                        send(
                            &mut out,
                            &UnitFrame::Boot {
                                message: BootMessage::Control {
                                    action: ControlAction::Listening,
                                    message: None,
                                    argv: Some(vec!["--listen".to_string(), format!("port={port}")]),
                                    code: None,
                                },
                            },
                        )
                        .await;
                        let mut fields = serde_json::Map::new();
                        fields.insert("tiddlers".to_string(), json!(42));
                        send(&mut out, &UnitFrame::Log { fields }).await;
                        boot(&mut out, ControlAction::Booted, None).await;
                        if script == Script::ExitAfterBoot {
                            tokio::time::sleep(Duration::from_millis(300)).await;
                            return;
                        }
                    }
                    Script::AddressInUse => {
                        send(
                            &mut out,
                            &UnitFrame::Boot {
                                message: BootMessage::Control {
                                    action: ControlAction::Error,
                                    message: Some(format!(
                                        "listen EADDRINUSE: address already in use 127.0.0.1:{port}"
                                    )),
                                    argv: None,
                                    code: Some("EADDRINUSE".to_string()),
                                },
                            },
                        )
                        .await;
                    }
                    Script::Error => {
                        boot(&mut out, ControlAction::Error, Some("plugin failed to load")).await;
                    }
                    Script::Fatal => {
                        send(
                            &mut out,
                            &UnitFrame::Fatal {
                                message: "engine crashed".to_string(),
                            },
                        )
                        .await;
                    }
                    Script::NeverReady => {}
                }
            }
            HostFrame::Call { request_id, call } => {
                log.lock()
                    .expect("log")
                    .calls
                    .push((label.clone(), call.clone()));
                if script == Script::BootedDeafOnExit && call == UnitCall::BeforeExit {
                    continue;
                }
                let reply = reply_for(&call);
                let subscribe = call == UnitCall::SubscribeChanges;
                let frame = match reply {
                    Ok(ok) => UnitFrame::Reply {
                        request_id,
                        ok: Some(ok),
                        error: None,
                    },
                    Err(error) => UnitFrame::Reply {
                        request_id,
                        ok: None,
                        error: Some(error),
                    },
                };
                send(&mut out, &frame).await;
                if subscribe {
                    let mut changed = wikidesk_core::ChangedTiddlers::new();
                    changed.insert(
                        "Index".to_string(),
                        ChangedTiddler {
                            modified: true,
                            deleted: false,
                        },
                    );
                    send(&mut out, &UnitFrame::Changes { changed }).await;
                }
            }
        }
    }
}

fn reply_for(call: &UnitCall) -> Result<Value, String> {
    match call {
        UnitCall::Route { route } => match route {
            IpcRoute::GetStatus => Ok(json!({
                "statusCode": 200,
                "headers": {"content-type": "application/json"},
                "data": {"username": "tester", "anonymous": false}
            })),
            IpcRoute::GetTiddler { title } if title == "Missing" => Ok(json!({"statusCode": 404})),
            _ => Ok(json!({"statusCode": 200})),
        },
        UnitCall::Operation { operation } => match operation {
            WikiOperation::AddTiddler(_) | WikiOperation::SetTiddlerText(_) => Ok(Value::Null),
            WikiOperation::GetTiddlerText(op) => Ok(json!(format!("text of {}", op.title))),
            WikiOperation::RunFilter(_) => Ok(json!(["Index", "Journal"])),
            WikiOperation::GetTiddlersAsJson(_) => Ok(json!("[]")),
            other => Err(format!("{} is not handled by the engine", other.channel())),
        },
        UnitCall::TiddlerFileMetadata { title } => {
            Ok(json!({"filepath": format!("/wikis/main/tiddlers/{title}.tid"), "hasMetaFile": false}))
        }
        UnitCall::SubscribeChanges
        | UnitCall::BeforeExit
        | UnitCall::ExtractWikiHtml { .. }
        | UnitCall::PacketHtmlFromWikiFolder { .. } => Ok(Value::Null),
    }
}

/// View host that is always loaded and records what it is asked to do.
#[derive(Default)]
pub struct RecordingViews {
    pub sent: Mutex<Vec<(String, WikiOperation)>>,
    pub restarts: Mutex<Vec<String>>,
}

#[async_trait]
impl ViewHost for RecordingViews {
    async fn wait_view_loaded(&self, _workspace_id: &str) -> Result<(), WikiError> {
        Ok(())
    }

    async fn send_to_view(
        &self,
        workspace_id: &str,
        operation: WikiOperation,
    ) -> Result<Value, WikiError> {
        self.sent
            .lock()
            .expect("sent")
            .push((workspace_id.to_string(), operation));
        Ok(Value::Null)
    }

    async fn restart_workspace_view(&self, workspace_id: &str) -> Result<(), WikiError> {
        self.restarts
            .lock()
            .expect("restarts")
            .push(workspace_id.to_string());
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingSync {
    pub started: Mutex<Vec<String>>,
    pub stopped: Mutex<Vec<String>>,
}

#[async_trait]
impl IntervalSync for RecordingSync {
    async fn start_interval_sync_if_needed(&self, workspace: &Workspace) {
        self.started
            .lock()
            .expect("started")
            .push(workspace.id.clone());
    }

    async fn stop_interval_sync(&self, workspace_id: &str) {
        self.stopped
            .lock()
            .expect("stopped")
            .push(workspace_id.to_string());
    }
}

pub struct Harness {
    pub service: Arc<WikiService>,
    pub store: Arc<WorkspaceStore>,
    pub launcher: Arc<ScriptedLauncher>,
    pub views: Arc<RecordingViews>,
    pub sync: Arc<RecordingSync>,
    pub dir: tempfile::TempDir,
}

pub fn harness(scripts: &[Script], fallback: Script) -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(
        WorkspaceStore::load(Arc::new(MemorySettings::new()), Arc::new(RandomTokenIssuer))
            .expect("load store"),
    );
    let launcher = Arc::new(ScriptedLauncher::new(scripts, fallback));
    let views = Arc::new(RecordingViews::default());
    let sync = Arc::new(RecordingSync::default());
    let config = SupervisorConfig {
        spawn_timeout: Duration::from_millis(300),
        boot_settle: Duration::from_millis(10),
        before_exit_timeout: Duration::from_millis(200),
        log_dir: Some(dir.path().join("logs")),
        ..SupervisorConfig::default()
    };
    let service = WikiService::new(
        config,
        store.clone(),
        launcher.clone(),
        Collaborators {
            views: views.clone(),
            sync: sync.clone(),
            auth: Arc::new(StaticAuth::new(Some("app-user".to_string()))),
            git: Arc::new(NoGit),
        },
    );
    Harness {
        service,
        store,
        launcher,
        views,
        sync,
        dir,
    }
}

impl Harness {
    pub async fn main_workspace(&self, name: &str) -> Workspace {
        self.store
            .create(NewWorkspaceConfig {
                name: name.to_string(),
                wiki_folder_location: self.dir.path().join(name).to_string_lossy().to_string(),
                ..NewWorkspaceConfig::default()
            })
            .await
            .expect("create main workspace")
    }

    pub async fn sub_workspace(&self, name: &str, main: &Workspace, tag: &str) -> Workspace {
        self.store
            .create(NewWorkspaceConfig {
                name: name.to_string(),
                is_sub_wiki: true,
                main_wiki_id: Some(main.id.clone()),
                main_wiki_to_link: Some(main.wiki_folder_location.clone()),
                wiki_folder_location: self.dir.path().join(name).to_string_lossy().to_string(),
                tag_name: Some(tag.to_string()),
                ..NewWorkspaceConfig::default()
            })
            .await
            .expect("create sub workspace")
    }

    pub async fn clear_loading(&self, id: &str) {
        self.store
            .update_metadata(id, MetadataPatch::new().is_loading(false))
            .await;
    }
}

/// Polls `check` until it holds or a second has passed.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
