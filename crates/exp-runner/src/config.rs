use std::path::PathBuf;

pub const DEFAULT_SCHEDULER: &str = "sbatch";
pub const DEFAULT_INTERPRETER: &str = "python3";
pub const DEFAULT_SCRIPT_EXTENSION: &str = "py";
pub const DEFAULT_MEM_PER_UNIT_GB: u32 = 16;
pub const DEFAULT_MAX_ALLOCATION_ATTEMPTS: u32 = 5;

/// Tool-level settings that stay fixed across runs.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Tracking root holding the `experiment_<NNN>` slots.
    pub log_dir: PathBuf,
    /// Batch submission binary used in scheduled mode.
    pub scheduler: String,
    /// Program that runs the snapshot in local mode.
    pub interpreter: String,
    /// Required script extension, without the dot.
    pub script_extension: String,
    pub max_allocation_attempts: u32,
}

impl TrackerConfig {
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            log_dir: log_dir.into(),
            ..Self::default()
        }
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
            scheduler: DEFAULT_SCHEDULER.to_string(),
            interpreter: DEFAULT_INTERPRETER.to_string(),
            script_extension: DEFAULT_SCRIPT_EXTENSION.to_string(),
            max_allocation_attempts: DEFAULT_MAX_ALLOCATION_ATTEMPTS,
        }
    }
}

/// `log_dir` next to the running executable, falling back to the cwd.
pub fn default_log_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|p| p.to_path_buf()))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("log_dir")
}
