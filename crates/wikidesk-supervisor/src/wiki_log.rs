use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};
use std::borrow::Cow;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

pub const MAX_LOG_VALUE_CHARS: usize = 200;
const TRUNCATED_MARKER: &str = "... (truncated)";

/// File name of a workspace's wiki log inside the log directory.
pub fn wiki_log_file_name(workspace_id: &str, wiki_name: &str) -> String {
    let name: String = wiki_name
        .chars()
        .map(|ch| {
            if ch.is_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    format!("wiki-{name}-{workspace_id}.log")
}

pub fn truncate_log_value(value: &str) -> Cow<'_, str> {
    match value.char_indices().nth(MAX_LOG_VALUE_CHARS) {
        Some((cut, _)) => Cow::Owned(format!("{}{TRUNCATED_MARKER}", &value[..cut])),
        None => Cow::Borrowed(value),
    }
}

/// Renders a unit log payload as `key=value` pairs with long strings truncated.
pub fn format_log_fields(fields: &Map<String, Value>) -> String {
    fields
        .iter()
        .map(|(key, value)| match value {
            Value::String(text) => format!("{key}={}", truncate_log_value(text)),
            other => format!("{key}={}", truncate_log_value(&other.to_string())),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Append-only log sink for one workspace's unit.
#[derive(Debug)]
pub struct WikiLog {
    path: Option<PathBuf>,
    file: Option<File>,
}

impl WikiLog {
    pub fn open(log_dir: Option<&Path>, workspace_id: &str, wiki_name: &str) -> Self {
        let Some(dir) = log_dir else {
            return Self::disabled();
        };
        if let Err(err) = std::fs::create_dir_all(dir) {
            warn!(event = "wiki_log_dir_failed", dir = %dir.display(), error = %err);
            return Self::disabled();
        }
        let path = dir.join(wiki_log_file_name(workspace_id, wiki_name));
        match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => Self {
                path: Some(path),
                file: Some(file),
            },
            Err(err) => {
                warn!(event = "wiki_log_open_failed", path = %path.display(), error = %err);
                Self::disabled()
            }
        }
    }

    pub fn disabled() -> Self {
        Self {
            path: None,
            file: None,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn line(&mut self, level: &str, message: &str) {
        let Some(file) = self.file.as_mut() else {
            return;
        };
        let ts = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let _ = writeln!(file, "{ts} [{level}] {message}");
    }

    pub fn fields(&mut self, level: &str, fields: &Map<String, Value>) {
        let rendered = format_log_fields(fields);
        self.line(level, &rendered);
    }
}
