use crate::error::{Result, TrackerError};
use crate::record::RunLogger;
use crate::slot::RunId;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub path: PathBuf,
    pub bytes: u64,
    pub sha256: String,
}

/// Checks the script before anything is created on disk.
pub fn validate_script(path: &Path, extension: &str) -> Result<()> {
    let meta = fs::metadata(path).map_err(|_| {
        TrackerError::Validation(format!("script not found: {}", path.display()))
    })?;
    if !meta.is_file() {
        return Err(TrackerError::Validation(format!(
            "script is not a regular file: {}",
            path.display()
        )));
    }
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext == extension => Ok(()),
        found => Err(TrackerError::Validation(format!(
            "script {} must have extension .{} (found: {})",
            path.display(),
            extension,
            found.map(|e| format!(".{}", e)).unwrap_or_else(|| "none".to_string())
        ))),
    }
}

/// `train.py` + run 7 -> `train_007.py`.
pub fn snapshot_file_name(source: &Path, id: RunId) -> Result<String> {
    let stem = source
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            TrackerError::Validation(format!("script has no usable name: {}", source.display()))
        })?;
    Ok(match source.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{}_{}.{}", stem, id, ext),
        None => format!("{}_{}", stem, id),
    })
}

pub fn snapshot_script(
    source: &Path,
    run_dir: &Path,
    id: RunId,
    logger: &mut RunLogger,
) -> Result<Snapshot> {
    let target = run_dir.join(snapshot_file_name(source, id)?);
    let bytes = fs::read(source)
        .map_err(|e| TrackerError::io(format!("failed to read {}", source.display()), e))?;
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&target)
        .map_err(|e| TrackerError::io(format!("failed to create {}", target.display()), e))?;
    file.write_all(&bytes)
        .and_then(|_| file.sync_all())
        .map_err(|e| TrackerError::io(format!("failed to write {}", target.display()), e))?;
    // Keep the source's mode bits so a `+x` script stays executable for sbatch.
    fs::metadata(source)
        .and_then(|meta| fs::set_permissions(&target, meta.permissions()))
        .map_err(|e| {
            TrackerError::io(
                format!("failed to copy permissions onto {}", target.display()),
                e,
            )
        })?;

    let snapshot = Snapshot {
        path: target,
        bytes: bytes.len() as u64,
        sha256: hex::encode(Sha256::digest(&bytes)),
    };
    logger.info(&format!(
        "snapshot {} -> {} ({} bytes, sha256:{})",
        source.display(),
        snapshot.path.display(),
        snapshot.bytes,
        snapshot.sha256
    ))?;
    Ok(snapshot)
}
