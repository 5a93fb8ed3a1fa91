use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_SPAWN_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_BOOT_SETTLE: Duration = Duration::from_millis(100);
pub const DEFAULT_BEFORE_EXIT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_WIKI_HOST: &str = "127.0.0.1";

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Bound on the unit's init handshake.
    pub spawn_timeout: Duration,
    /// Delay between the `booted` control message and resolving the start.
    pub boot_settle: Duration,
    /// Bound on the unit's pre-exit hook when stopping.
    pub before_exit_timeout: Duration,
    pub host: String,
    pub is_dev: bool,
    pub open_debugger: bool,
    pub package_folder: Option<PathBuf>,
    pub template_folder: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            spawn_timeout: DEFAULT_SPAWN_TIMEOUT,
            boot_settle: DEFAULT_BOOT_SETTLE,
            before_exit_timeout: DEFAULT_BEFORE_EXIT_TIMEOUT,
            host: DEFAULT_WIKI_HOST.to_string(),
            is_dev: cfg!(debug_assertions),
            open_debugger: false,
            package_folder: None,
            template_folder: None,
            log_dir: None,
        }
    }
}

impl SupervisorConfig {
    pub fn package_folder_string(&self) -> Option<String> {
        self.package_folder
            .as_ref()
            .map(|path| path.to_string_lossy().to_string())
    }
}
