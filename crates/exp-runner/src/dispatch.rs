use crate::config::TrackerConfig;
use crate::error::{Result, TrackerError};
use crate::record::RunLogger;
use crate::slot::RunId;
use serde::Serialize;
use std::ffi::OsStr;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{error, info};

pub const ENV_LOG_DIR: &str = "LOG_DIR";
pub const ENV_LOG_FILE: &str = "LOG_FILE";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    Local,
    Scheduled,
}

impl DispatchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchMode::Local => "local",
            DispatchMode::Scheduled => "scheduled",
        }
    }
}

impl fmt::Display for DispatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Resources {
    pub gpus: u32,
    pub mem_per_unit_gb: u32,
}

impl Resources {
    pub fn validate(&self) -> Result<()> {
        if self.mem_per_unit_gb == 0 {
            return Err(TrackerError::Validation(
                "memory per unit must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn memory_flag_value(&self) -> String {
        format!("{}G", self.mem_per_unit_gb)
    }
}

/// Everything dispatch needs to know about one allocated run.
#[derive(Debug, Clone)]
pub struct DispatchRequest<'a> {
    pub run_id: RunId,
    pub run_dir: &'a Path,
    pub record_path: &'a Path,
    pub target: &'a Path,
    pub resources: Resources,
    pub mode: DispatchMode,
    pub passthrough: &'a [String],
}

impl DispatchRequest<'_> {
    pub fn scheduler_output_path(&self) -> PathBuf {
        self.run_dir.join(format!("slurm_{}.out", self.run_id))
    }

    fn log_env(&self) -> [(&'static str, &Path); 2] {
        [(ENV_LOG_DIR, self.run_dir), (ENV_LOG_FILE, self.record_path)]
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatchOutcome {
    pub mode: DispatchMode,
    pub argv: Vec<String>,
    pub exit_code: Option<i32>,
    pub scheduler_job_id: Option<u64>,
}

/// `<interpreter> <target> <passthrough...>` with the two log variables
/// layered over the inherited environment.
pub fn build_local_command(interpreter: &str, request: &DispatchRequest<'_>) -> Command {
    let mut cmd = Command::new(interpreter);
    cmd.arg(request.target);
    cmd.args(request.passthrough);
    for (key, value) in request.log_env() {
        cmd.env(key, value);
    }
    cmd
}

pub fn build_scheduler_command(scheduler: &str, request: &DispatchRequest<'_>) -> Command {
    let mut cmd = Command::new(scheduler);
    cmd.arg(format!("--job-name={}", request.run_id.slot_name()));
    cmd.arg(format!(
        "--output={}",
        request.scheduler_output_path().display()
    ));
    cmd.arg(format!("--gres=gpu:{}", request.resources.gpus));
    cmd.arg(format!(
        "--mem-per-cpu={}",
        request.resources.memory_flag_value()
    ));
    // sbatch splits --export on commas, so the log paths travel through the
    // submitting process environment and `ALL` carries them into the job.
    cmd.arg("--export=ALL");
    cmd.arg(request.target);
    cmd.args(request.passthrough);
    for (key, value) in request.log_env() {
        cmd.env(key, value);
    }
    cmd
}

pub fn command_argv(cmd: &Command) -> Vec<String> {
    std::iter::once(cmd.get_program())
        .chain(cmd.get_args())
        .map(|s: &OsStr| s.to_string_lossy().into_owned())
        .collect()
}

/// Parses the `Submitted batch job <id>` acknowledgement.
fn parse_job_id(stdout: &str) -> Option<u64> {
    stdout
        .lines()
        .find_map(|line| line.trim().strip_prefix("Submitted batch job"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|id| id.parse().ok())
}

fn exit_description(code: Option<i32>) -> String {
    code.map(|c| format!("exit code {}", c))
        .unwrap_or_else(|| "terminated by signal".to_string())
}

fn fail(logger: &mut RunLogger, message: String) -> TrackerError {
    error!(%message, "dispatch failed");
    let _ = logger.error(&message);
    TrackerError::Dispatch(message)
}

pub fn dispatch(
    config: &TrackerConfig,
    request: &DispatchRequest<'_>,
    logger: &mut RunLogger,
) -> Result<DispatchOutcome> {
    match request.mode {
        DispatchMode::Local => dispatch_local(config, request, logger),
        DispatchMode::Scheduled => dispatch_scheduled(config, request, logger),
    }
}

fn dispatch_local(
    config: &TrackerConfig,
    request: &DispatchRequest<'_>,
    logger: &mut RunLogger,
) -> Result<DispatchOutcome> {
    let mut cmd = build_local_command(&config.interpreter, request);
    let argv = command_argv(&cmd);
    logger.info(&format!("dispatching locally: {}", argv.join(" ")))?;
    logger.flush()?;
    info!(run_id = %request.run_id, argv = ?argv, "launching local process");

    let status = match cmd.status() {
        Ok(status) => status,
        Err(e) => return Err(fail(logger, format!("failed to launch {}: {}", argv[0], e))),
    };
    if !status.success() {
        return Err(fail(
            logger,
            format!("local run exited with {}", exit_description(status.code())),
        ));
    }
    logger.info("local run finished with exit code 0")?;
    Ok(DispatchOutcome {
        mode: DispatchMode::Local,
        argv,
        exit_code: status.code(),
        scheduler_job_id: None,
    })
}

fn dispatch_scheduled(
    config: &TrackerConfig,
    request: &DispatchRequest<'_>,
    logger: &mut RunLogger,
) -> Result<DispatchOutcome> {
    let mut cmd = build_scheduler_command(&config.scheduler, request);
    cmd.stdin(Stdio::null());
    let argv = command_argv(&cmd);
    logger.info(&format!("submitting to scheduler: {}", argv.join(" ")))?;
    logger.flush()?;
    info!(run_id = %request.run_id, argv = ?argv, "submitting scheduler job");

    let output = match cmd.output() {
        Ok(output) => output,
        Err(e) => return Err(fail(logger, format!("failed to launch {}: {}", argv[0], e))),
    };
    let stdout = String::from_utf8_lossy(&output.stdout);
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let reason = stderr
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("no stderr output")
            .trim()
            .to_string();
        return Err(fail(
            logger,
            format!(
                "scheduler rejected submission ({}): {}",
                exit_description(output.status.code()),
                reason
            ),
        ));
    }
    let job_id = parse_job_id(&stdout);
    match job_id {
        Some(id) => logger.info(&format!("scheduler accepted job {}", id))?,
        None => logger.warn(&format!(
            "scheduler accepted submission without a job id: {}",
            stdout.trim()
        ))?,
    }
    Ok(DispatchOutcome {
        mode: DispatchMode::Scheduled,
        argv,
        exit_code: output.status.code(),
        scheduler_job_id: job_id,
    })
}
