use crate::model::HttpsConfig;
use crate::operations::{ChangedTiddlers, IpcRoute, WikiOperation};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;
pub const ADDRESS_IN_USE_CODE: &str = "EADDRINUSE";

/// Immutable configuration handed to an execution unit before it boots its engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StartConfig {
    pub home_path: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub https: HttpsConfig,
    #[serde(default)]
    pub token_auth: bool,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default)]
    pub read_only_mode: bool,
    #[serde(default)]
    pub excluded_plugins: Vec<String>,
    #[serde(default)]
    pub root_tiddler: Option<String>,
    #[serde(default, rename = "enableHTTPAPI")]
    pub enable_http_api: bool,
    #[serde(default)]
    pub user_name: String,
    #[serde(default)]
    pub is_dev: bool,
    #[serde(default)]
    pub open_debugger: bool,
    #[serde(default)]
    pub package_folder: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ControlAction {
    Start,
    Listening,
    Booted,
    Error,
}

/// One entry of the unit's boot sequence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BootMessage {
    Control {
        action: ControlAction,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        argv: Option<Vec<String>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
    Stdout {
        message: String,
    },
    Stderr {
        message: String,
    },
}

impl BootMessage {
    pub fn control(action: ControlAction, message: Option<&str>) -> Self {
        BootMessage::Control {
            action,
            message: message.map(str::to_string),
            argv: None,
            code: None,
        }
    }
}

/// True when a boot error means the configured port is already bound.
pub fn is_address_in_use(code: Option<&str>, message: &str) -> bool {
    code == Some(ADDRESS_IN_USE_CODE) || message.contains(ADDRESS_IN_USE_CODE)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UnitCall {
    Route {
        route: IpcRoute,
    },
    Operation {
        operation: WikiOperation,
    },
    TiddlerFileMetadata {
        title: String,
    },
    SubscribeChanges,
    BeforeExit,
    ExtractWikiHtml {
        html_path: String,
        save_folder: String,
        #[serde(default)]
        package_folder: Option<String>,
    },
    PacketHtmlFromWikiFolder {
        wiki_folder: String,
        html_path: String,
        #[serde(default)]
        package_folder: Option<String>,
    },
}

impl UnitCall {
    pub fn label(&self) -> &'static str {
        match self {
            UnitCall::Route { route } => route.name(),
            UnitCall::Operation { .. } => "operation",
            UnitCall::TiddlerFileMetadata { .. } => "tiddler_file_metadata",
            UnitCall::SubscribeChanges => "subscribe_changes",
            UnitCall::BeforeExit => "before_exit",
            UnitCall::ExtractWikiHtml { .. } => "extract_wiki_html",
            UnitCall::PacketHtmlFromWikiFolder { .. } => "packet_html_from_wiki_folder",
        }
    }
}

/// Frames written by the supervisor to a unit's stdin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum HostFrame {
    Start { config: StartConfig },
    Call { request_id: u64, call: UnitCall },
}

/// Frames read by the supervisor from a unit's stdout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum UnitFrame {
    Ready,
    Boot {
        message: BootMessage,
    },
    Reply {
        request_id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ok: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Changes {
        changed: ChangedTiddlers,
    },
    Fatal {
        message: String,
    },
    Log {
        fields: Map<String, Value>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
}

pub fn encode_frame<T: Serialize>(
    value: &T,
    max_frame_bytes: usize,
) -> Result<Vec<u8>, FrameError> {
    let mut encoded =
        serde_json::to_vec(value).map_err(|err| FrameError::Encode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    encoded.push(b'\n');
    Ok(encoded)
}

pub fn decode_frame<T: DeserializeOwned>(
    bytes: &[u8],
    max_frame_bytes: usize,
) -> Result<T, FrameError> {
    let mut raw = bytes;
    if raw.ends_with(b"\n") {
        raw = &raw[..raw.len() - 1];
    }
    if raw.ends_with(b"\r") {
        raw = &raw[..raw.len() - 1];
    }
    if raw.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: raw.len(),
            max: max_frame_bytes,
        });
    }
    serde_json::from_slice(raw).map_err(|err| FrameError::Decode(err.to_string()))
}
