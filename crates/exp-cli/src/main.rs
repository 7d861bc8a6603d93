use anyhow::{Context, Result};
use clap::{Arg, Command, CommandFactory, Parser};
use exp_runner::config::{
    default_log_dir, DEFAULT_INTERPRETER, DEFAULT_MAX_ALLOCATION_ATTEMPTS, DEFAULT_MEM_PER_UNIT_GB,
    DEFAULT_SCHEDULER, DEFAULT_SCRIPT_EXTENSION,
};
use exp_runner::{DispatchMode, Resources, RunRequest, RunResult, TrackerConfig, TrackerError};
use serde_json::{json, Value};
use std::ffi::OsString;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "exp",
    version,
    about = "Run experiment scripts locally or with Slurm, log the experimental setup",
    after_help = "Arguments exp does not recognize, and everything after `--`, are passed to the script in their original order."
)]
struct Cli {
    /// Experiment file which will be run
    #[arg(required_unless_present = "list")]
    file: Option<PathBuf>,
    /// Message describing details of the experiment
    #[arg(required_unless_present = "list")]
    message: Option<String>,
    /// Location of the top-level experiment log directory
    #[arg(long = "log-dir", visible_alias = "log_dir", env = "EXP_LOG_DIR")]
    log_dir: Option<PathBuf>,
    /// Number of GPUs to allocate for the experiment
    #[arg(short = 'G', long, default_value_t = 0)]
    gpus: u32,
    /// Memory per allocated unit, in GB
    #[arg(short = 'm', long = "mem", default_value_t = DEFAULT_MEM_PER_UNIT_GB)]
    mem: u32,
    /// Run the snapshot as a local process instead of submitting it
    #[arg(long)]
    local: bool,
    #[arg(long, env = "EXP_SCHEDULER", default_value = DEFAULT_SCHEDULER)]
    scheduler: String,
    #[arg(long, env = "EXP_INTERPRETER", default_value = DEFAULT_INTERPRETER)]
    interpreter: String,
    /// Required script extension
    #[arg(long, default_value = DEFAULT_SCRIPT_EXTENSION, hide = true)]
    extension: String,
    /// List existing run slots and exit
    #[arg(long)]
    list: bool,
    #[arg(long)]
    json: bool,
    /// Filled from the arguments left over by `split_known_args`.
    #[arg(skip)]
    passthrough: Vec<String>,
}

impl Cli {
    fn parse_known_from<I, T>(args: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString>,
    {
        let mut cmd = Cli::command();
        cmd.build();
        let (known, passthrough) =
            split_known_args(&cmd, args.into_iter().map(Into::into).collect());
        let mut cli = Cli::try_parse_from(known)?;
        cli.passthrough = passthrough;
        Ok(cli)
    }

    fn tracker_config(&self) -> TrackerConfig {
        TrackerConfig {
            log_dir: self.log_dir.clone().unwrap_or_else(default_log_dir),
            scheduler: self.scheduler.clone(),
            interpreter: self.interpreter.clone(),
            script_extension: self.extension.clone(),
            max_allocation_attempts: DEFAULT_MAX_ALLOCATION_ATTEMPTS,
        }
    }

    fn mode(&self) -> DispatchMode {
        if self.local {
            DispatchMode::Local
        } else {
            DispatchMode::Scheduled
        }
    }
}

/// Splits argv into what `exp` parses and what the script receives, like
/// argparse's `parse_known_args`: tracker flags are picked out wherever they
/// appear, the first bare words fill `file` and `message`, and the rest keep
/// their order. `--` hands everything after it to the script.
fn split_known_args(cmd: &Command, args: Vec<OsString>) -> (Vec<OsString>, Vec<String>) {
    let positional_slots = cmd.get_positionals().count();
    let mut positionals = 0;
    let mut known = Vec::new();
    let mut passthrough = Vec::new();
    let mut iter = args.into_iter();
    known.extend(iter.next());

    while let Some(arg) = iter.next() {
        let token = arg.to_string_lossy().into_owned();
        if token == "--" {
            passthrough.extend(iter.by_ref().map(|a| a.to_string_lossy().into_owned()));
            break;
        }
        match known_flag(cmd, &token) {
            Some(flag) => {
                let needs_next = flag.get_action().takes_values() && !has_inline_value(&token);
                known.push(arg);
                if needs_next {
                    known.extend(iter.next());
                }
            }
            None if !token.starts_with('-') || token == "-" => {
                if positionals < positional_slots {
                    positionals += 1;
                    known.push(arg);
                } else {
                    passthrough.push(token);
                }
            }
            None => passthrough.push(token),
        }
    }
    (known, passthrough)
}

fn known_flag<'a>(cmd: &'a Command, token: &str) -> Option<&'a Arg> {
    if let Some(long) = token.strip_prefix("--") {
        let name = long.split_once('=').map_or(long, |(name, _)| name);
        cmd.get_arguments().find(|a| {
            a.get_long_and_visible_aliases()
                .is_some_and(|names| names.contains(&name))
        })
    } else {
        let short = token.strip_prefix('-')?.chars().next()?;
        cmd.get_arguments().find(|a| {
            a.get_short_and_visible_aliases()
                .is_some_and(|shorts| shorts.contains(&short))
        })
    }
}

/// `--mem=32` and `-G2` carry their value in the same token.
fn has_inline_value(token: &str) -> bool {
    match token.strip_prefix("--") {
        Some(long) => long.contains('='),
        None => token.chars().count() > 2,
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse_known_from(std::env::args_os()).unwrap_or_else(|e| e.exit());
    let json_mode = cli.json;
    match run_command(cli) {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                let code = err
                    .downcast_ref::<TrackerError>()
                    .map(|e| e.code())
                    .unwrap_or("command_failed");
                emit_json(&json_error(code, format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn run_command(cli: Cli) -> Result<Option<Value>> {
    let config = cli.tracker_config();
    if cli.list {
        let runs = exp_runner::list_runs(&config.log_dir)?;
        if cli.json {
            return Ok(Some(json!({
                "ok": true,
                "command": "list",
                "log_dir": config.log_dir.display().to_string(),
                "runs": runs
                    .iter()
                    .map(|(id, dir)| json!({ "run_id": id.to_string(), "run_dir": dir.display().to_string() }))
                    .collect::<Vec<_>>(),
            })));
        }
        for (id, dir) in runs {
            println!("{}: {}", id, dir.display());
        }
        return Ok(None);
    }

    let mode = cli.mode();
    let (Some(file), Some(message)) = (cli.file, cli.message) else {
        anyhow::bail!("file and message are required");
    };
    let request = RunRequest {
        script: file,
        message,
        resources: Resources {
            gpus: cli.gpus,
            mem_per_unit_gb: cli.mem,
        },
        mode,
        passthrough: cli.passthrough,
    };
    let result = exp_runner::start_run(&request, &config).with_context(|| {
        format!(
            "experiment run for {} failed",
            request.script.display()
        )
    })?;

    if cli.json {
        return Ok(Some(json!({
            "ok": true,
            "command": "run",
            "run": run_result_to_json(&result),
        })));
    }
    print_run_result(&result);
    Ok(None)
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn run_result_to_json(result: &RunResult) -> Value {
    json!({
        "run_id": result.run_id.to_string(),
        "run_dir": result.run_dir.display().to_string(),
        "record": result.record_path.display().to_string(),
        "message_file": result.message_path.display().to_string(),
        "snapshot": result.snapshot,
        "dispatch": result.dispatch,
    })
}

fn print_run_result(result: &RunResult) {
    println!("run_id: {}", result.run_id);
    println!("run_dir: {}", result.run_dir.display());
    println!("snapshot: {}", result.snapshot.path.display());
    println!("record: {}", result.record_path.display());
    println!("mode: {}", result.dispatch.mode);
    if let Some(job_id) = result.dispatch.scheduler_job_id {
        println!("scheduler_job_id: {}", job_id);
    }
    if let Some(code) = result.dispatch.exit_code {
        println!("exit_code: {}", code);
    }
}
