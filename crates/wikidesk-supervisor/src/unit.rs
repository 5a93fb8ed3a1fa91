use crate::launcher::{LaunchedUnit, UnitLauncher, UnitReader, UnitWriter};
use crate::WikiError;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tracing::{debug, info, warn};
use wikidesk_core::unit_ipc::{
    decode_frame, encode_frame, BootMessage, HostFrame, StartConfig, UnitCall, UnitFrame,
    DEFAULT_MAX_FRAME_BYTES,
};
use wikidesk_core::{ChangedTiddlers, IpcRoute, IpcRouteResponse, TiddlerFileMetadata, TypedOperation};

const OUTGOING_CAPACITY: usize = 64;
const EVENT_CAPACITY: usize = 256;
const CHANGES_CAPACITY: usize = 64;

/// Everything a unit reports outside of request replies.
#[derive(Debug, Clone, PartialEq)]
pub enum UnitEvent {
    /// Boot-sequence message: control actions plus engine stdout and stderr.
    Boot(BootMessage),
    /// Fatal error raised inside the unit.
    Fatal(String),
    /// Lifecycle log payload.
    Log(Map<String, Value>),
    /// The unit exited. Sent once, after every other event.
    Terminated { exit_code: Option<i32> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ExitState {
    Running,
    Exited {
        exit_code: Option<i32>,
        kill_error: Option<String>,
    },
}

type ReplySender = oneshot::Sender<Result<Value, String>>;
type PendingReplies = Arc<Mutex<HashMap<u64, ReplySender>>>;

/// Live handle to one execution unit.
///
/// Calls are multiplexed over the unit's frame pipe by request id. Calls from one
/// caller are written in issue order; replies may come back in any order.
pub struct UnitHandle {
    label: String,
    next_request_id: AtomicU64,
    pending: PendingReplies,
    outgoing: mpsc::Sender<Vec<u8>>,
    changes: broadcast::Sender<ChangedTiddlers>,
    changes_subscribed: AtomicBool,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
    exit_rx: watch::Receiver<ExitState>,
}

impl std::fmt::Debug for UnitHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitHandle")
            .field("label", &self.label)
            .field("exited", &self.has_exited())
            .finish()
    }
}

impl UnitHandle {
    /// Launches a unit and waits, bounded by `spawn_timeout`, for its init handshake.
    pub async fn spawn(
        launcher: &dyn UnitLauncher,
        label: &str,
        spawn_timeout: Duration,
    ) -> Result<(Arc<UnitHandle>, mpsc::Receiver<UnitEvent>), WikiError> {
        let launched = launcher.launch(label).await?;
        let (handle, events, ready_rx) = Self::attach(label, launched);

        match tokio::time::timeout(spawn_timeout, ready_rx).await {
            Ok(Ok(())) => {
                debug!(event = "unit_ready", label = %label);
                Ok((handle, events))
            }
            Ok(Err(_)) => {
                let _ = handle.terminate().await;
                Err(WikiError::Spawn {
                    label: label.to_string(),
                    message: "unit exited before its init handshake".to_string(),
                })
            }
            Err(_) => {
                warn!(
                    event = "unit_spawn_timeout",
                    label = %label,
                    timeout_ms = spawn_timeout.as_millis() as u64
                );
                let _ = handle.terminate().await;
                Err(WikiError::SpawnTimeout {
                    label: label.to_string(),
                    timeout_ms: spawn_timeout.as_millis() as u64,
                })
            }
        }
    }

    fn attach(
        label: &str,
        launched: LaunchedUnit,
    ) -> (Arc<UnitHandle>, mpsc::Receiver<UnitEvent>, oneshot::Receiver<()>) {
        let LaunchedUnit {
            frames_in,
            frames_out,
            stderr,
            mut process,
        } = launched;
        let (outgoing_tx, outgoing_rx) = mpsc::channel(OUTGOING_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CAPACITY);
        let (changes_tx, _) = broadcast::channel(CHANGES_CAPACITY);
        let (ready_tx, ready_rx) = oneshot::channel();
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let (exit_tx, exit_rx) = watch::channel(ExitState::Running);
        let pending: PendingReplies = Arc::new(Mutex::new(HashMap::new()));

        tokio::spawn(write_frames(label.to_string(), frames_out, outgoing_rx));
        let reader_task = tokio::spawn(read_frames(
            label.to_string(),
            frames_in,
            ready_tx,
            event_tx.clone(),
            pending.clone(),
            changes_tx.clone(),
        ));
        let stderr_task = stderr.map(|stderr| tokio::spawn(forward_stderr(stderr, event_tx.clone())));

        let process_label = label.to_string();
        let process_pending = pending.clone();
        tokio::spawn(async move {
            let mut kill_error = None;
            let exit_code = tokio::select! {
                _ = kill_rx => {
                    if let Err(err) = process.terminate().await {
                        warn!(event = "unit_kill_failed", label = %process_label, error = %err);
                        kill_error = Some(err.to_string());
                    }
                    process.wait().await
                }
                code = process.wait() => code,
            };
            let _ = reader_task.await;
            if let Some(task) = stderr_task {
                let _ = task.await;
            }
            info!(
                event = "unit_exited",
                label = %process_label,
                exit_code = exit_code.unwrap_or(-1)
            );
            // Calls check the exit state after registering, so it must be set
            // before the pending replies are drained.
            exit_tx.send_replace(ExitState::Exited {
                exit_code,
                kill_error,
            });
            for (_, reply) in process_pending.lock().await.drain() {
                let _ = reply.send(Err("execution unit exited".to_string()));
            }
            let _ = event_tx.send(UnitEvent::Terminated { exit_code }).await;
        });

        let handle = Arc::new(UnitHandle {
            label: label.to_string(),
            next_request_id: AtomicU64::new(1),
            pending,
            outgoing: outgoing_tx,
            changes: changes_tx,
            changes_subscribed: AtomicBool::new(false),
            kill_tx: Mutex::new(Some(kill_tx)),
            exit_rx,
        });
        (handle, event_rx, ready_rx)
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn has_exited(&self) -> bool {
        matches!(*self.exit_rx.borrow(), ExitState::Exited { .. })
    }

    /// Hands the start configuration to the unit, which then emits its boot sequence.
    pub async fn start(&self, config: StartConfig) -> Result<(), WikiError> {
        let bytes = encode_frame(&HostFrame::Start { config }, DEFAULT_MAX_FRAME_BYTES)?;
        self.outgoing.send(bytes).await.map_err(|_| self.closed())
    }

    pub async fn call(&self, call: UnitCall) -> Result<Value, WikiError> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let call_label = call.label();
        let bytes = encode_frame(&HostFrame::Call { request_id, call }, DEFAULT_MAX_FRAME_BYTES)
            .map_err(|err| {
                warn!(event = "unit_frame_encode_failed", label = %self.label, call = call_label, error = %err);
                WikiError::Frame(err)
            })?;
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id, reply_tx);
        if self.has_exited() {
            self.pending.lock().await.remove(&request_id);
            return Err(self.closed());
        }
        if self.outgoing.send(bytes).await.is_err() {
            self.pending.lock().await.remove(&request_id);
            return Err(self.closed());
        }
        match reply_rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(message)) => Err(WikiError::Request {
                label: self.label.clone(),
                call: call_label.to_string(),
                message,
            }),
            Err(_) => Err(self.closed()),
        }
    }

    pub async fn call_typed<T: DeserializeOwned>(&self, call: UnitCall) -> Result<T, WikiError> {
        let call_label = call.label();
        let value = self.call(call).await?;
        serde_json::from_value(value).map_err(|err| WikiError::Decode {
            label: self.label.clone(),
            call: call_label.to_string(),
            message: err.to_string(),
        })
    }

    /// Runs a wiki operation through the unit's generic operation entry point.
    pub async fn operation<O: TypedOperation>(&self, operation: O) -> Result<O::Output, WikiError> {
        self.call_typed(UnitCall::Operation {
            operation: operation.into(),
        })
        .await
    }

    pub async fn route(&self, route: IpcRoute) -> Result<IpcRouteResponse, WikiError> {
        self.call_typed(UnitCall::Route { route }).await
    }

    pub async fn tiddler_file_metadata(
        &self,
        title: &str,
    ) -> Result<Option<TiddlerFileMetadata>, WikiError> {
        self.call_typed(UnitCall::TiddlerFileMetadata {
            title: title.to_string(),
        })
        .await
    }

    /// New receiver of the unit's change notifications. The unit is asked to publish
    /// them on the first subscription.
    pub async fn subscribe_changes(
        &self,
    ) -> Result<broadcast::Receiver<ChangedTiddlers>, WikiError> {
        let receiver = self.changes.subscribe();
        if !self.changes_subscribed.swap(true, Ordering::AcqRel) {
            if let Err(err) = self.call(UnitCall::SubscribeChanges).await {
                self.changes_subscribed.store(false, Ordering::Release);
                return Err(err);
            }
        }
        Ok(receiver)
    }

    pub async fn before_exit(&self) -> Result<(), WikiError> {
        self.call(UnitCall::BeforeExit).await.map(|_| ())
    }

    /// Kills the unit and waits until it has exited.
    pub async fn terminate(&self) -> Result<(), WikiError> {
        if let Some(kill_tx) = self.kill_tx.lock().await.take() {
            let _ = kill_tx.send(());
        }
        let mut exit_rx = self.exit_rx.clone();
        let state = exit_rx
            .wait_for(|state| matches!(state, ExitState::Exited { .. }))
            .await
            .map(|state| state.clone())
            .map_err(|_| self.closed())?;
        match state {
            ExitState::Exited {
                kill_error: Some(message),
                ..
            } => Err(WikiError::Terminate {
                label: self.label.clone(),
                message,
            }),
            _ => Ok(()),
        }
    }

    fn closed(&self) -> WikiError {
        WikiError::UnitClosed {
            label: self.label.clone(),
        }
    }
}

async fn write_frames(label: String, mut writer: UnitWriter, mut rx: mpsc::Receiver<Vec<u8>>) {
    while let Some(bytes) = rx.recv().await {
        if let Err(err) = writer.write_all(&bytes).await {
            debug!(event = "unit_frame_write_failed", label = %label, error = %err);
            break;
        }
        if writer.flush().await.is_err() {
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_frames(
    label: String,
    reader: UnitReader,
    ready_tx: oneshot::Sender<()>,
    events: mpsc::Sender<UnitEvent>,
    pending: PendingReplies,
    changes: broadcast::Sender<ChangedTiddlers>,
) {
    let mut ready_tx = Some(ready_tx);
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        let line = match read_line_lossy(&mut reader, &mut buf).await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                warn!(event = "unit_frame_read_failed", label = %label, error = %err);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let frame = match decode_frame::<UnitFrame>(line.as_bytes(), DEFAULT_MAX_FRAME_BYTES) {
            Ok(frame) => frame,
            Err(err) => {
                debug!(event = "unit_plain_output", label = %label, error = %err);
                let _ = events
                    .send(UnitEvent::Boot(BootMessage::Stdout { message: line }))
                    .await;
                continue;
            }
        };
        match frame {
            UnitFrame::Ready => {
                if let Some(ready_tx) = ready_tx.take() {
                    let _ = ready_tx.send(());
                }
            }
            UnitFrame::Boot { message } => {
                let _ = events.send(UnitEvent::Boot(message)).await;
            }
            UnitFrame::Reply {
                request_id,
                ok,
                error,
            } => {
                let Some(reply_tx) = pending.lock().await.remove(&request_id) else {
                    warn!(event = "unit_reply_unknown_request", label = %label, request_id);
                    continue;
                };
                let reply = match error {
                    Some(message) => Err(message),
                    None => Ok(ok.unwrap_or(Value::Null)),
                };
                let _ = reply_tx.send(reply);
            }
            UnitFrame::Changes { changed } => {
                let _ = changes.send(changed);
            }
            UnitFrame::Fatal { message } => {
                let _ = events.send(UnitEvent::Fatal(message)).await;
            }
            UnitFrame::Log { fields } => {
                let _ = events.send(UnitEvent::Log(fields)).await;
            }
        }
    }
}

async fn forward_stderr(stderr: UnitReader, events: mpsc::Sender<UnitEvent>) {
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();
    while let Ok(Some(line)) = read_line_lossy(&mut reader, &mut buf).await {
        let _ = events
            .send(UnitEvent::Boot(BootMessage::Stderr { message: line }))
            .await;
    }
}

/// Next newline-terminated line. Engine output is not guaranteed to be UTF-8, so
/// invalid bytes are replaced instead of failing the read.
async fn read_line_lossy<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    buf: &mut Vec<u8>,
) -> std::io::Result<Option<String>> {
    buf.clear();
    if reader.read_until(b'\n', buf).await? == 0 {
        return Ok(None);
    }
    let mut line = buf.as_slice();
    if line.ends_with(b"\n") {
        line = &line[..line.len() - 1];
    }
    if line.ends_with(b"\r") {
        line = &line[..line.len() - 1];
    }
    Ok(Some(String::from_utf8_lossy(line).into_owned()))
}
