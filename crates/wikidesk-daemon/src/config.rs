use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use wikidesk_supervisor::SupervisorConfig;

const APP_DIR: &str = "wikidesk";
const DEFAULT_ENGINE: &str = "wikidesk-engine";
const DEFAULT_FLUSH_INTERVAL_MS: u64 = 500;

#[derive(Parser, Debug, Default)]
#[command(name = "wikidesk-daemon")]
pub struct Args {
    /// TOML config file. Defaults to `<config dir>/wikidesk/config.toml`.
    #[arg(long)]
    pub config: Option<PathBuf>,
    #[arg(long)]
    pub settings: Option<PathBuf>,
    #[arg(long)]
    pub log_dir: Option<PathBuf>,
    #[arg(long, default_value_t = false)]
    pub debug: bool,
    /// Program that runs one wiki engine unit over stdio.
    #[arg(long)]
    pub engine: Option<PathBuf>,
}

/// Contents of the optional TOML config file.
#[derive(Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct FileConfig {
    pub settings: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    pub engine: Option<PathBuf>,
    pub engine_args: Vec<String>,
    pub package_folder: Option<PathBuf>,
    pub template_folder: Option<PathBuf>,
    pub user_name: Option<String>,
    pub spawn_timeout_secs: Option<u64>,
    pub flush_interval_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub settings_path: PathBuf,
    pub log_dir: PathBuf,
    pub debug: bool,
    pub engine: PathBuf,
    pub engine_args: Vec<String>,
    pub user_name: Option<String>,
    pub flush_interval: Duration,
    pub supervisor: SupervisorConfig,
}

impl DaemonConfig {
    /// Parses the command line and resolves it against the environment, the
    /// config file and the platform directories.
    pub fn load() -> Result<Self> {
        let args = Args::parse();
        let config_path = args
            .config
            .clone()
            .or_else(|| dirs::config_dir().map(|dir| dir.join(APP_DIR).join("config.toml")));
        let file = match config_path {
            Some(path) => read_file_config(&path)?,
            None => FileConfig::default(),
        };
        let data_dir = dirs::data_dir().map(|dir| dir.join(APP_DIR));
        Ok(Self::resolve(args, &env_value, file, data_dir))
    }

    /// Each value resolves as flag, then environment, then file, then default.
    pub fn resolve(
        args: Args,
        env: &dyn Fn(&str) -> Option<String>,
        file: FileConfig,
        data_dir: Option<PathBuf>,
    ) -> Self {
        let data_dir = data_dir.unwrap_or_else(|| PathBuf::from("."));
        let settings_path = args
            .settings
            .or_else(|| env("WIKIDESK_SETTINGS").map(PathBuf::from))
            .or(file.settings)
            .unwrap_or_else(|| data_dir.join("settings.json"));
        let log_dir = args
            .log_dir
            .or_else(|| env("WIKIDESK_LOG_DIR").map(PathBuf::from))
            .or(file.log_dir)
            .unwrap_or_else(|| data_dir.join("logs"));
        let engine = args
            .engine
            .or_else(|| env("WIKIDESK_ENGINE").map(PathBuf::from))
            .or(file.engine)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_ENGINE));
        let debug = args.debug || env("WIKIDESK_DEBUG").is_some_and(|value| is_true(&value));

        let mut supervisor = SupervisorConfig {
            open_debugger: env("DEBUG_WORKER").is_some_and(|value| is_true(&value)),
            package_folder: file.package_folder,
            template_folder: file.template_folder,
            log_dir: Some(log_dir.clone()),
            ..SupervisorConfig::default()
        };
        if let Some(secs) = file.spawn_timeout_secs {
            supervisor.spawn_timeout = Duration::from_secs(secs);
        }

        Self {
            settings_path,
            log_dir,
            debug,
            engine,
            engine_args: file.engine_args,
            user_name: file.user_name.filter(|name| !name.trim().is_empty()),
            flush_interval: Duration::from_millis(
                file.flush_interval_ms.unwrap_or(DEFAULT_FLUSH_INTERVAL_MS),
            ),
            supervisor,
        }
    }
}

/// A missing file means defaults. A file that does not parse is an error.
pub fn read_file_config(path: &Path) -> Result<FileConfig> {
    if !path.exists() {
        return Ok(FileConfig::default());
    }
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("read config {}", path.display()))?;
    toml::from_str(&contents).with_context(|| format!("parse config {}", path.display()))
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

pub fn is_true(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn flag_beats_env_beats_file() {
        let args = Args {
            settings: Some(PathBuf::from("/flag/settings.json")),
            ..Args::default()
        };
        let env = env_of(&[
            ("WIKIDESK_SETTINGS", "/env/settings.json"),
            ("WIKIDESK_LOG_DIR", "/env/logs"),
        ]);
        let file = FileConfig {
            settings: Some(PathBuf::from("/file/settings.json")),
            log_dir: Some(PathBuf::from("/file/logs")),
            engine: Some(PathBuf::from("/file/engine")),
            ..FileConfig::default()
        };
        let config = DaemonConfig::resolve(args, &env, file, Some(PathBuf::from("/data")));
        assert_eq!(config.settings_path, PathBuf::from("/flag/settings.json"));
        assert_eq!(config.log_dir, PathBuf::from("/env/logs"));
        assert_eq!(config.engine, PathBuf::from("/file/engine"));
        assert_eq!(config.supervisor.log_dir, Some(PathBuf::from("/env/logs")));
    }

    #[test]
    fn defaults_live_under_the_data_dir() {
        let config = DaemonConfig::resolve(
            Args::default(),
            &env_of(&[]),
            FileConfig::default(),
            Some(PathBuf::from("/data/wikidesk")),
        );
        assert_eq!(
            config.settings_path,
            PathBuf::from("/data/wikidesk/settings.json")
        );
        assert_eq!(config.log_dir, PathBuf::from("/data/wikidesk/logs"));
        assert_eq!(config.engine, PathBuf::from(DEFAULT_ENGINE));
        assert!(!config.debug);
        assert!(!config.supervisor.open_debugger);
        assert_eq!(
            config.flush_interval,
            Duration::from_millis(DEFAULT_FLUSH_INTERVAL_MS)
        );
    }

    #[test]
    fn debug_worker_sets_debugger_flag() {
        let config = DaemonConfig::resolve(
            Args::default(),
            &env_of(&[("DEBUG_WORKER", "true"), ("WIKIDESK_DEBUG", "0")]),
            FileConfig::default(),
            None,
        );
        assert!(config.supervisor.open_debugger);
        assert!(!config.debug);
    }

    #[test]
    fn file_config_reads_toml() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "engine = \"/opt/engine\"\nengine_args = [\"--stdio\"]\nspawn_timeout_secs = 5\nuser_name = \"  \"\n",
        )
        .expect("write");
        let file = read_file_config(&path).expect("parse");
        assert_eq!(file.engine_args, vec!["--stdio".to_string()]);
        let config = DaemonConfig::resolve(Args::default(), &env_of(&[]), file, None);
        assert_eq!(config.engine, PathBuf::from("/opt/engine"));
        assert_eq!(config.supervisor.spawn_timeout, Duration::from_secs(5));
        assert_eq!(config.user_name, None);

        let missing = read_file_config(&dir.path().join("absent.toml")).expect("missing");
        assert_eq!(missing, FileConfig::default());

        std::fs::write(&path, "engine = [").expect("write");
        assert!(read_file_config(&path).is_err());
    }
}
