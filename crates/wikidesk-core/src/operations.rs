use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Names of every workspace-scoped wiki operation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum WikiChannel {
    AddTiddler,
    GetTiddlerText,
    RunFilter,
    GetTiddlersAsJson,
    SetTiddlerText,
    SetState,
    SyncProgress,
    GeneralNotification,
    OpenTiddler,
    SendActionMessage,
    PrintTiddler,
}

impl WikiChannel {
    pub const ALL: [WikiChannel; 11] = [
        WikiChannel::AddTiddler,
        WikiChannel::GetTiddlerText,
        WikiChannel::RunFilter,
        WikiChannel::GetTiddlersAsJson,
        WikiChannel::SetTiddlerText,
        WikiChannel::SetState,
        WikiChannel::SyncProgress,
        WikiChannel::GeneralNotification,
        WikiChannel::OpenTiddler,
        WikiChannel::SendActionMessage,
        WikiChannel::PrintTiddler,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WikiChannel::AddTiddler => "addTiddler",
            WikiChannel::GetTiddlerText => "getTiddlerText",
            WikiChannel::RunFilter => "runFilter",
            WikiChannel::GetTiddlersAsJson => "getTiddlersAsJson",
            WikiChannel::SetTiddlerText => "setTiddlerText",
            WikiChannel::SetState => "setState",
            WikiChannel::SyncProgress => "syncProgress",
            WikiChannel::GeneralNotification => "generalNotification",
            WikiChannel::OpenTiddler => "openTiddler",
            WikiChannel::SendActionMessage => "sendActionMessage",
            WikiChannel::PrintTiddler => "printTiddler",
        }
    }

    /// Headless operations the execution unit can run without an attached view.
    pub fn runs_in_server(&self) -> bool {
        matches!(
            self,
            WikiChannel::AddTiddler
                | WikiChannel::GetTiddlerText
                | WikiChannel::RunFilter
                | WikiChannel::GetTiddlersAsJson
                | WikiChannel::SetTiddlerText
        )
    }
}

impl fmt::Display for WikiChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WikiChannel {
    type Err = OperationError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        WikiChannel::ALL
            .into_iter()
            .find(|channel| channel.as_str() == input.trim())
            .ok_or_else(|| OperationError::UnknownOperation(input.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OperationError {
    #[error("{0} gets no useful handler")]
    UnknownOperation(String),
    #[error("{operation} can not run in the execution unit, it needs a live view")]
    NotServerBound { operation: WikiChannel },
    #[error("{value} is not a good argument array for {operation}: {reason}")]
    BadArguments {
        operation: WikiChannel,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AddTiddler {
    pub title: String,
    pub text: String,
    #[serde(default)]
    pub extra_meta: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GetTiddlerText {
    pub title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunFilter {
    pub filter: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GetTiddlersAsJson {
    pub filter: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SetTiddlerText {
    pub title: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SetState {
    pub state_key: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncProgress {
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GeneralNotification {
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OpenTiddler {
    pub title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SendActionMessage {
    pub action_message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct PrintTiddler {
    #[serde(default)]
    pub title: Option<String>,
}

/// Closed dispatch table for every wiki operation, one variant per channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "channel", content = "args", rename_all = "camelCase")]
pub enum WikiOperation {
    AddTiddler(AddTiddler),
    GetTiddlerText(GetTiddlerText),
    RunFilter(RunFilter),
    GetTiddlersAsJson(GetTiddlersAsJson),
    SetTiddlerText(SetTiddlerText),
    SetState(SetState),
    SyncProgress(SyncProgress),
    GeneralNotification(GeneralNotification),
    OpenTiddler(OpenTiddler),
    SendActionMessage(SendActionMessage),
    PrintTiddler(PrintTiddler),
}

impl WikiOperation {
    pub fn channel(&self) -> WikiChannel {
        match self {
            WikiOperation::AddTiddler(_) => WikiChannel::AddTiddler,
            WikiOperation::GetTiddlerText(_) => WikiChannel::GetTiddlerText,
            WikiOperation::RunFilter(_) => WikiChannel::RunFilter,
            WikiOperation::GetTiddlersAsJson(_) => WikiChannel::GetTiddlersAsJson,
            WikiOperation::SetTiddlerText(_) => WikiChannel::SetTiddlerText,
            WikiOperation::SetState(_) => WikiChannel::SetState,
            WikiOperation::SyncProgress(_) => WikiChannel::SyncProgress,
            WikiOperation::GeneralNotification(_) => WikiChannel::GeneralNotification,
            WikiOperation::OpenTiddler(_) => WikiChannel::OpenTiddler,
            WikiOperation::SendActionMessage(_) => WikiChannel::SendActionMessage,
            WikiOperation::PrintTiddler(_) => WikiChannel::PrintTiddler,
        }
    }

    /// Builds an operation from a channel name and a positional argument array.
    pub fn from_positional(name: &str, args: &Value) -> Result<Self, OperationError> {
        let operation: WikiChannel = name.parse()?;
        let Some(args) = args.as_array() else {
            return Err(OperationError::BadArguments {
                operation,
                value: args.to_string(),
                reason: "expected an ordered argument list".to_string(),
            });
        };
        let positional = Positional { operation, args };
        let parsed = match operation {
            WikiChannel::AddTiddler => WikiOperation::AddTiddler(AddTiddler {
                title: positional.string(0)?,
                text: positional.string(1)?,
                extra_meta: positional.object(2)?,
            }),
            WikiChannel::GetTiddlerText => WikiOperation::GetTiddlerText(GetTiddlerText {
                title: positional.string(0)?,
            }),
            WikiChannel::RunFilter => WikiOperation::RunFilter(RunFilter {
                filter: positional.string(0)?,
            }),
            WikiChannel::GetTiddlersAsJson => {
                WikiOperation::GetTiddlersAsJson(GetTiddlersAsJson {
                    filter: positional.string(0)?,
                })
            }
            WikiChannel::SetTiddlerText => WikiOperation::SetTiddlerText(SetTiddlerText {
                title: positional.string(0)?,
                value: positional.string(1)?,
            }),
            WikiChannel::SetState => WikiOperation::SetState(SetState {
                state_key: positional.string(0)?,
                content: positional.string(1)?,
            }),
            WikiChannel::SyncProgress => WikiOperation::SyncProgress(SyncProgress {
                message: positional.string(0)?,
            }),
            WikiChannel::GeneralNotification => {
                WikiOperation::GeneralNotification(GeneralNotification {
                    message: positional.string(0)?,
                })
            }
            WikiChannel::OpenTiddler => WikiOperation::OpenTiddler(OpenTiddler {
                title: positional.string(0)?.replace('\n', ""),
            }),
            WikiChannel::SendActionMessage => {
                WikiOperation::SendActionMessage(SendActionMessage {
                    action_message: positional.string(0)?,
                })
            }
            WikiChannel::PrintTiddler => WikiOperation::PrintTiddler(PrintTiddler {
                title: positional.optional_string(0)?,
            }),
        };
        Ok(parsed)
    }
}

struct Positional<'a> {
    operation: WikiChannel,
    args: &'a [Value],
}

impl Positional<'_> {
    fn bad(&self, reason: String) -> OperationError {
        OperationError::BadArguments {
            operation: self.operation,
            value: Value::Array(self.args.to_vec()).to_string(),
            reason,
        }
    }

    fn string(&self, index: usize) -> Result<String, OperationError> {
        match self.args.get(index) {
            Some(Value::String(value)) => Ok(value.clone()),
            Some(other) => Err(self.bad(format!("argument {index} must be a string, got {other}"))),
            None => Err(self.bad(format!("missing argument {index}"))),
        }
    }

    fn optional_string(&self, index: usize) -> Result<Option<String>, OperationError> {
        match self.args.get(index) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(value)) if value.is_empty() => Ok(None),
            Some(Value::String(value)) => Ok(Some(value.clone())),
            Some(other) => Err(self.bad(format!("argument {index} must be a string, got {other}"))),
        }
    }

    /// Accepts an object or a JSON-encoded object string, defaulting to `{}`.
    fn object(&self, index: usize) -> Result<Map<String, Value>, OperationError> {
        match self.args.get(index) {
            None | Some(Value::Null) => Ok(Map::new()),
            Some(Value::Object(map)) => Ok(map.clone()),
            Some(Value::String(encoded)) => match serde_json::from_str::<Value>(encoded) {
                Ok(Value::Object(map)) => Ok(map),
                Ok(other) => Err(self.bad(format!("argument {index} must encode an object, got {other}"))),
                Err(err) => Err(self.bad(format!("argument {index} is not valid json: {err}"))),
            },
            Some(other) => Err(self.bad(format!("argument {index} must be an object, got {other}"))),
        }
    }
}

/// An operation whose response type is known at compile time.
pub trait TypedOperation: Into<WikiOperation> + Send + 'static {
    type Output: DeserializeOwned + Send + 'static;
}

/// Operations the execution unit runs headlessly.
pub trait ServerOperation: TypedOperation {}

/// Operations that need a live view attached to the workspace.
pub trait BrowserOperation: TypedOperation {}

macro_rules! typed_operation {
    ($name:ident => $output:ty, server) => {
        typed_operation!($name => $output);
        impl ServerOperation for $name {}
    };
    ($name:ident => $output:ty) => {
        impl From<$name> for WikiOperation {
            fn from(value: $name) -> Self {
                WikiOperation::$name(value)
            }
        }

        impl TypedOperation for $name {
            type Output = $output;
        }

        impl BrowserOperation for $name {}
    };
}

typed_operation!(AddTiddler => (), server);
typed_operation!(GetTiddlerText => Option<String>, server);
typed_operation!(RunFilter => Vec<String>, server);
typed_operation!(GetTiddlersAsJson => String, server);
typed_operation!(SetTiddlerText => (), server);
typed_operation!(SetState => ());
typed_operation!(SyncProgress => ());
typed_operation!(GeneralNotification => ());
typed_operation!(OpenTiddler => ());
typed_operation!(SendActionMessage => ());
typed_operation!(PrintTiddler => ());

/// Routes of the unit's in-process HTTP-style server, reachable over the command channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "route", rename_all = "camelCase")]
pub enum IpcRoute {
    GetStatus,
    #[serde(rename = "getTiddlersJSON", rename_all = "camelCase")]
    GetTiddlersJson {
        filter: String,
        #[serde(default)]
        exclude_fields: Vec<String>,
    },
    GetTiddler {
        title: String,
    },
    GetTiddlerHtml {
        title: String,
    },
    #[serde(rename_all = "camelCase")]
    PutTiddler {
        title: String,
        #[serde(default)]
        user_name: Option<String>,
        fields: Map<String, Value>,
    },
    DeleteTiddler {
        title: String,
    },
    GetFavicon,
    #[serde(rename_all = "camelCase")]
    GetIndex {
        #[serde(default)]
        root_tiddler: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    GetFile {
        file_path: String,
    },
}

impl IpcRoute {
    pub fn name(&self) -> &'static str {
        match self {
            IpcRoute::GetStatus => "getStatus",
            IpcRoute::GetTiddlersJson { .. } => "getTiddlersJSON",
            IpcRoute::GetTiddler { .. } => "getTiddler",
            IpcRoute::GetTiddlerHtml { .. } => "getTiddlerHtml",
            IpcRoute::PutTiddler { .. } => "putTiddler",
            IpcRoute::DeleteTiddler { .. } => "deleteTiddler",
            IpcRoute::GetFavicon => "getFavicon",
            IpcRoute::GetIndex { .. } => "getIndex",
            IpcRoute::GetFile { .. } => "getFile",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IpcRouteResponse {
    pub status_code: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ChangedTiddler {
    #[serde(default)]
    pub modified: bool,
    #[serde(default)]
    pub deleted: bool,
}

pub type ChangedTiddlers = BTreeMap<String, ChangedTiddler>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TiddlerFileMetadata {
    #[serde(default)]
    pub filepath: Option<String>,
    #[serde(default, flatten)]
    pub extra: Map<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn positional_args_build_typed_operation() {
        let op = WikiOperation::from_positional(
            "addTiddler",
            &json!(["$:/config/Server/AllowAllExternalFilters", "yes", "{\"type\":\"text/plain\"}"]),
        )
        .expect("parse addTiddler");
        let WikiOperation::AddTiddler(add) = op else {
            panic!("expected addTiddler");
        };
        assert_eq!(add.text, "yes");
        assert_eq!(add.extra_meta.get("type"), Some(&json!("text/plain")));
    }

    #[test]
    fn unknown_operation_name_is_rejected() {
        let err = WikiOperation::from_positional("launchRockets", &json!([])).unwrap_err();
        assert_eq!(err, OperationError::UnknownOperation("launchRockets".to_string()));
        assert_eq!(err.to_string(), "launchRockets gets no useful handler");
    }

    #[test]
    fn non_array_arguments_are_rejected() {
        let err = WikiOperation::from_positional("openTiddler", &json!({"title": "x"})).unwrap_err();
        assert!(matches!(
            err,
            OperationError::BadArguments {
                operation: WikiChannel::OpenTiddler,
                ..
            }
        ));
    }

    #[test]
    fn open_tiddler_strips_newlines() {
        let op = WikiOperation::from_positional("openTiddler", &json!(["Tag\n"])).expect("parse");
        assert_eq!(
            op,
            WikiOperation::OpenTiddler(OpenTiddler {
                title: "Tag".to_string()
            })
        );
    }

    #[test]
    fn operation_wire_form_is_channel_tagged() {
        let op: WikiOperation = RunFilter {
            filter: "[tag[Journal]]".to_string(),
        }
        .into();
        let encoded = serde_json::to_value(&op).expect("encode");
        assert_eq!(
            encoded,
            json!({"channel": "runFilter", "args": {"filter": "[tag[Journal]]"}})
        );
        assert!(op.channel().runs_in_server());
        assert!(!WikiChannel::OpenTiddler.runs_in_server());
    }

    #[test]
    fn route_names_match_wire_tags() {
        let route = IpcRoute::GetTiddlersJson {
            filter: "[all[]]".to_string(),
            exclude_fields: vec!["text".to_string()],
        };
        let encoded = serde_json::to_value(&route).expect("encode");
        assert_eq!(encoded["route"], json!(route.name()));
        assert_eq!(encoded["excludeFields"], json!(["text"]));
    }
}
