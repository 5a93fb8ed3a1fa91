use crate::WikiError;
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tracing::{debug, info};

pub type UnitReader = Box<dyn AsyncRead + Send + Unpin>;
pub type UnitWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// The OS-level side of a unit: something that can be killed and waited on.
#[async_trait]
pub trait UnitProcess: Send {
    async fn terminate(&mut self) -> Result<(), WikiError>;
    /// Resolves when the unit exits, with its exit code when it has one.
    async fn wait(&mut self) -> Option<i32>;
}

/// Pipes and process of a freshly launched unit. Frames flow over `frames_in` and
/// `frames_out`; `stderr` carries free-form engine output.
pub struct LaunchedUnit {
    pub frames_in: UnitReader,
    pub frames_out: UnitWriter,
    pub stderr: Option<UnitReader>,
    pub process: Box<dyn UnitProcess>,
}

#[async_trait]
pub trait UnitLauncher: Send + Sync {
    async fn launch(&self, label: &str) -> Result<LaunchedUnit, WikiError>;
}

/// Launches the content engine as a child process speaking NDJSON over stdio.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<String>,
    env: Vec<(String, String)>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

#[async_trait]
impl UnitLauncher for ProcessLauncher {
    async fn launch(&self, label: &str) -> Result<LaunchedUnit, WikiError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .env("WIKIDESK_UNIT_LABEL", label)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &self.env {
            command.env(key, value);
        }
        let mut child = command.spawn().map_err(|err| WikiError::Spawn {
            label: label.to_string(),
            message: format!("{}: {err}", self.program.display()),
        })?;
        let missing_pipe = |pipe: &str| WikiError::Spawn {
            label: label.to_string(),
            message: format!("child {pipe} was not piped"),
        };
        let frames_out = child.stdin.take().ok_or_else(|| missing_pipe("stdin"))?;
        let frames_in = child.stdout.take().ok_or_else(|| missing_pipe("stdout"))?;
        let stderr = child.stderr.take();
        info!(
            event = "unit_process_spawned",
            label = %label,
            program = %self.program.display(),
            pid = child.id().unwrap_or_default()
        );
        Ok(LaunchedUnit {
            frames_in: Box::new(frames_in),
            frames_out: Box::new(frames_out),
            stderr: stderr.map(|stderr| Box::new(stderr) as UnitReader),
            process: Box::new(ChildProcess {
                label: label.to_string(),
                child,
            }),
        })
    }
}

struct ChildProcess {
    label: String,
    child: Child,
}

#[async_trait]
impl UnitProcess for ChildProcess {
    async fn terminate(&mut self) -> Result<(), WikiError> {
        debug!(event = "unit_process_kill", label = %self.label);
        self.child.kill().await.map_err(|err| WikiError::Terminate {
            label: self.label.clone(),
            message: err.to_string(),
        })
    }

    async fn wait(&mut self) -> Option<i32> {
        match self.child.wait().await {
            Ok(status) => status.code(),
            Err(_) => None,
        }
    }
}
