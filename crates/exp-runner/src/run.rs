use crate::config::TrackerConfig;
use crate::dispatch::{dispatch, DispatchMode, DispatchOutcome, DispatchRequest, Resources};
use crate::error::{Result, TrackerError};
use crate::record::{write_message, write_run_record, RunLogger, RunRecord, MESSAGE_FILE};
use crate::slot::{allocate_run_slot, ensure_dir, parse_slot_id, RunId};
use crate::snapshot::{snapshot_script, validate_script, Snapshot};
use chrono::Utc;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub script: PathBuf,
    pub message: String,
    pub resources: Resources,
    pub mode: DispatchMode,
    pub passthrough: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStage {
    Allocating,
    DirectoryCreated,
    Snapshotted,
    Dispatched,
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunStage::Allocating => "allocating",
            RunStage::DirectoryCreated => "directory_created",
            RunStage::Snapshotted => "snapshotted",
            RunStage::Dispatched => "dispatched",
        })
    }
}

#[derive(Debug, Clone)]
pub struct RunResult {
    pub run_id: RunId,
    pub run_dir: PathBuf,
    pub record_path: PathBuf,
    pub message_path: PathBuf,
    pub snapshot: Snapshot,
    pub dispatch: DispatchOutcome,
}

/// Absolute form of `path` with symlinks left in place, so names derived
/// from it are the ones the operator typed.
fn absolute(path: &Path) -> Result<PathBuf> {
    std::path::absolute(path)
        .map_err(|e| TrackerError::io(format!("failed to resolve {}", path.display()), e))
}

fn canonical(path: &Path) -> Result<PathBuf> {
    path.canonicalize()
        .map_err(|e| TrackerError::io(format!("failed to resolve {}", path.display()), e))
}

/// Everything that can be rejected without touching the tracking root.
pub fn validate_request(request: &RunRequest, config: &TrackerConfig) -> Result<()> {
    validate_script(&request.script, &config.script_extension)?;
    request.resources.validate()
}

/// Allocate, create, record, snapshot, dispatch. Every failure is terminal;
/// whatever was already written to the slot stays there.
pub fn start_run(request: &RunRequest, config: &TrackerConfig) -> Result<RunResult> {
    validate_request(request, config)?;
    let script = absolute(&request.script)?;

    let mut stage = RunStage::Allocating;
    info!(%stage, root = %config.log_dir.display(), "allocating run slot");
    ensure_dir(&config.log_dir)?;
    let root = canonical(&config.log_dir)?;
    let (run_id, run_dir) = allocate_run_slot(&root, config.max_allocation_attempts)?;

    stage = RunStage::DirectoryCreated;
    info!(%stage, %run_id, dir = %run_dir.display(), "run slot created");
    let mut logger = RunLogger::open(&run_dir)?;
    let outcome = record_and_dispatch(request, config, &script, run_id, &run_dir, &mut logger);
    if let Err(err) = &outcome {
        if !matches!(err, TrackerError::Dispatch(_)) {
            // Dispatch failures are already in the record.
            let _ = logger.error(&err.to_string());
        }
    }
    let (snapshot, dispatch) = outcome?;
    let message_path = run_dir.join(MESSAGE_FILE);
    Ok(RunResult {
        run_id,
        record_path: logger.path().to_path_buf(),
        run_dir,
        message_path,
        snapshot,
        dispatch,
    })
}

fn record_and_dispatch(
    request: &RunRequest,
    config: &TrackerConfig,
    script: &Path,
    run_id: RunId,
    run_dir: &Path,
    logger: &mut RunLogger,
) -> Result<(Snapshot, DispatchOutcome)> {
    let record = RunRecord {
        run_id: run_id.to_string(),
        file: script.display().to_string(),
        message: request.message.clone(),
        log_dir: config.log_dir.display().to_string(),
        gpus: request.resources.gpus,
        mem_per_unit_gb: request.resources.mem_per_unit_gb,
        mode: request.mode.to_string(),
        passthrough: request.passthrough.clone(),
        created_at: Utc::now().to_rfc3339(),
    };
    write_run_record(logger, &record)?;
    write_message(run_dir, &request.message)?;

    let snapshot = snapshot_script(script, run_dir, run_id, logger)?;
    let stage = RunStage::Snapshotted;
    info!(%stage, %run_id, snapshot = %snapshot.path.display(), "script snapshotted");

    let record_path = logger.path().to_path_buf();
    let dispatch_request = DispatchRequest {
        run_id,
        run_dir,
        record_path: &record_path,
        target: &snapshot.path,
        resources: request.resources,
        mode: request.mode,
        passthrough: &request.passthrough,
    };
    let outcome = dispatch(config, &dispatch_request, logger)?;
    let stage = RunStage::Dispatched;
    info!(%stage, %run_id, mode = %outcome.mode, job_id = ?outcome.scheduler_job_id, "run dispatched");
    Ok((snapshot, outcome))
}

/// Lists the run slots currently present under `root`, oldest first.
pub fn list_runs(root: &Path) -> Result<Vec<(RunId, PathBuf)>> {
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(TrackerError::io(
                format!("failed to list {}", root.display()),
                e,
            ))
        }
    };
    let mut runs = Vec::new();
    for entry in entries {
        let entry =
            entry.map_err(|e| TrackerError::io(format!("failed to list {}", root.display()), e))?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let id = entry
            .file_name()
            .to_str()
            .and_then(parse_slot_id);
        if let Some(id) = id {
            runs.push((id, path));
        }
    }
    runs.sort_by_key(|(id, _)| *id);
    Ok(runs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, body).expect("script");
        path
    }

    fn request(script: PathBuf, message: &str, mode: DispatchMode) -> RunRequest {
        RunRequest {
            script,
            message: message.to_string(),
            resources: Resources {
                gpus: 0,
                mem_per_unit_gb: crate::config::DEFAULT_MEM_PER_UNIT_GB,
            },
            mode,
            passthrough: Vec::new(),
        }
    }

    #[test]
    fn missing_script_aborts_before_any_directory_exists() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path().join("log_dir");
        let cfg = TrackerConfig::new(&root);
        let req = request(tmp.path().join("absent.py"), "m", DispatchMode::Local);

        let err = start_run(&req, &cfg).expect_err("must fail");
        assert!(matches!(err, TrackerError::Validation(_)), "{}", err);
        assert!(!root.exists());
    }

    #[test]
    fn zero_memory_aborts_before_any_directory_exists() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path().join("log_dir");
        let cfg = TrackerConfig::new(&root);
        let script = write_script(tmp.path(), "train.py", "print(1)\n");
        let mut req = request(script, "m", DispatchMode::Local);
        req.resources.mem_per_unit_gb = 0;

        let err = start_run(&req, &cfg).expect_err("must fail");
        assert!(err.to_string().contains("memory"), "{}", err);
        assert!(!root.exists());
    }

    #[test]
    fn list_runs_returns_only_slot_directories_in_order() {
        let tmp = tempfile::tempdir().expect("tempdir");
        for name in ["experiment_010", "experiment_002", "experiment_x"] {
            fs::create_dir(tmp.path().join(name)).expect("dir");
        }
        fs::write(tmp.path().join("experiment_005"), b"file, not a slot").expect("file");
        let ids: Vec<u32> = list_runs(tmp.path())
            .expect("list")
            .into_iter()
            .map(|(id, _)| id.get())
            .collect();
        assert_eq!(ids, vec![2, 10]);
        assert!(list_runs(&tmp.path().join("missing")).expect("list").is_empty());
    }

    #[cfg(unix)]
    mod end_to_end {
        use super::*;

        fn sh_config(root: &Path) -> TrackerConfig {
            TrackerConfig {
                interpreter: "sh".to_string(),
                script_extension: "sh".to_string(),
                ..TrackerConfig::new(root)
            }
        }

        #[test]
        fn local_run_materializes_slot_and_dispatches_snapshot() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let root = tmp.path().join("log_dir");
            let script = write_script(
                tmp.path(),
                "envdump.sh",
                "echo \"$0|$LOG_DIR|$LOG_FILE\" > \"$LOG_DIR/env.txt\"\necho 'INFO: from script' >> \"$LOG_FILE\"\n",
            );
            let cfg = sh_config(&root);
            let result =
                start_run(&request(script, "baseline run", DispatchMode::Local), &cfg).expect("run");

            let root = root.canonicalize().expect("root");
            assert_eq!(result.run_id.get(), 1);
            assert_eq!(result.run_dir, root.join("experiment_001"));
            assert_eq!(result.snapshot.path, result.run_dir.join("envdump_001.sh"));
            assert!(result.record_path.is_file());
            assert_eq!(
                fs::read_to_string(&result.message_path).expect("message"),
                "baseline run\n"
            );

            let env = fs::read_to_string(result.run_dir.join("env.txt")).expect("env");
            let parts: Vec<&str> = env.trim_end().split('|').collect();
            assert_eq!(parts[0], result.snapshot.path.to_string_lossy());
            assert_eq!(parts[1], result.run_dir.to_string_lossy());
            assert_eq!(parts[2], result.record_path.to_string_lossy());

            let record = fs::read_to_string(&result.record_path).expect("record");
            assert!(record.contains("LOGGING CONFIGURATION"), "{}", record);
            assert!(record.contains("\"message\": \"baseline run\""), "{}", record);
            assert!(record.contains("INFO: from script"), "{}", record);
        }

        #[test]
        fn sequential_runs_get_consecutive_slots() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let root = tmp.path().join("log_dir");
            let script = write_script(tmp.path(), "noop.sh", "true\n");
            let cfg = sh_config(&root);

            let first = start_run(&request(script.clone(), "a", DispatchMode::Local), &cfg)
                .expect("first");
            let second =
                start_run(&request(script, "b", DispatchMode::Local), &cfg).expect("second");
            assert_eq!(first.run_id.get(), 1);
            assert_eq!(second.run_id.get(), 2);
            assert!(second.run_dir.ends_with("experiment_002"));
            assert!(second.snapshot.path.ends_with("noop_002.sh"));
        }

        #[test]
        fn failed_dispatch_leaves_slot_as_trace_and_next_run_moves_on() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let root = tmp.path().join("log_dir");
            let script = write_script(tmp.path(), "boom.sh", "exit 2\n");
            let cfg = sh_config(&root);

            let err = start_run(&request(script.clone(), "x", DispatchMode::Local), &cfg)
                .expect_err("dispatch fails");
            assert!(matches!(err, TrackerError::Dispatch(_)), "{}", err);
            let slot = root.join("experiment_001");
            assert!(slot.join("boom_001.sh").is_file());
            assert!(slot.join("message.txt").is_file());

            fs::write(&script, "true\n").expect("fix script");
            let next = start_run(&request(script, "y", DispatchMode::Local), &cfg).expect("retry");
            assert_eq!(next.run_id.get(), 2);
            assert_eq!(
                fs::read_to_string(slot.join("boom_001.sh")).expect("old snapshot"),
                "exit 2\n"
            );
        }

        #[test]
        fn symlinked_script_is_snapshotted_under_the_link_name() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let root = tmp.path().join("log_dir");
            let target = write_script(tmp.path(), "model_v3.sh", "echo v3\n");
            let link = tmp.path().join("train.sh");
            std::os::unix::fs::symlink(&target, &link).expect("symlink");
            let cfg = sh_config(&root);

            let result =
                start_run(&request(link.clone(), "via link", DispatchMode::Local), &cfg).expect("run");
            assert_eq!(result.snapshot.path, result.run_dir.join("train_001.sh"));
            assert!(!result.run_dir.join("model_v3_001.sh").exists());
            assert_eq!(
                fs::read_to_string(&result.snapshot.path).expect("snapshot"),
                "echo v3\n"
            );
            assert!(!fs::symlink_metadata(&result.snapshot.path)
                .expect("meta")
                .file_type()
                .is_symlink());
            let record = fs::read_to_string(&result.record_path).expect("record");
            assert!(record.contains(&format!("\"file\": \"{}\"", link.display())), "{}", record);
        }

        #[test]
        fn passthrough_arguments_reach_the_script_in_order() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let root = tmp.path().join("log_dir");
            let script = write_script(
                tmp.path(),
                "args.sh",
                "printf '%s\\n' \"$@\" > \"$LOG_DIR/args.txt\"\n",
            );
            let cfg = sh_config(&root);
            let mut req = request(script, "args", DispatchMode::Local);
            req.passthrough = vec!["--lr".into(), "0.1".into(), "--tag".into(), "a b".into()];

            let result = start_run(&req, &cfg).expect("run");
            let args = fs::read_to_string(result.run_dir.join("args.txt")).expect("args");
            assert_eq!(args.lines().collect::<Vec<_>>(), vec!["--lr", "0.1", "--tag", "a b"]);
        }
    }
}
