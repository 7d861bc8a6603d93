use crate::error::{Result, TrackerError};
use serde::Serialize;
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const SLOT_PREFIX: &str = "experiment_";

/// Positive run identifier, rendered zero-padded to at least three digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct RunId(u32);

impl RunId {
    pub const FIRST: RunId = RunId(1);

    pub fn new(value: u32) -> Option<Self> {
        if value == 0 {
            None
        } else {
            Some(RunId(value))
        }
    }

    pub fn get(self) -> u32 {
        self.0
    }

    pub fn slot_name(self) -> String {
        format!("{}{}", SLOT_PREFIX, self)
    }

    fn next(self) -> Result<RunId> {
        self.0
            .checked_add(1)
            .map(RunId)
            .ok_or_else(|| TrackerError::Validation("identifier space exhausted".to_string()))
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03}", self.0)
    }
}

pub(crate) fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .map_err(|e| TrackerError::io(format!("failed to create {}", path.display()), e))
}

/// Parses `experiment_<digits>`; anything else (including overflow) is not a slot.
fn parse_slot_name(name: &str) -> Option<u32> {
    let digits = name.strip_prefix(SLOT_PREFIX)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse::<u32>().ok()
}

pub(crate) fn parse_slot_id(name: &str) -> Option<RunId> {
    parse_slot_name(name).and_then(RunId::new)
}

pub fn next_run_id(root: &Path) -> Result<RunId> {
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(RunId::FIRST),
        Err(e) => {
            return Err(TrackerError::io(
                format!("failed to list {}", root.display()),
                e,
            ))
        }
    };
    let mut max_seen: Option<u32> = None;
    for entry in entries {
        let entry =
            entry.map_err(|e| TrackerError::io(format!("failed to list {}", root.display()), e))?;
        let name = entry.file_name();
        let Some(id) = name.to_str().and_then(parse_slot_name) else {
            continue;
        };
        max_seen = Some(max_seen.map_or(id, |m| m.max(id)));
    }
    match max_seen {
        // experiment_000 parses to zero; the next slot is still 1.
        Some(max) => RunId(max).next(),
        None => Ok(RunId::FIRST),
    }
}

/// Creates `<root>/experiment_<NNN>`. The root is created on demand; the
/// slot itself is created exclusively and never merged into.
pub fn create_run_slot(root: &Path, id: RunId) -> Result<PathBuf> {
    ensure_dir(root)?;
    let slot = root.join(id.slot_name());
    match fs::create_dir(&slot) {
        Ok(()) => Ok(slot),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(TrackerError::AlreadyExists(slot)),
        Err(e) => Err(TrackerError::io(
            format!("failed to create run slot {}", slot.display()),
            e,
        )),
    }
}

/// Scan-then-create with a bounded rescan on collision. The scan result is
/// only a hint; `create_run_slot` decides who owns an identifier.
pub fn allocate_run_slot(root: &Path, max_attempts: u32) -> Result<(RunId, PathBuf)> {
    allocate_with_scan(root, max_attempts, next_run_id)
}

fn allocate_with_scan<F>(root: &Path, max_attempts: u32, mut scan: F) -> Result<(RunId, PathBuf)>
where
    F: FnMut(&Path) -> Result<RunId>,
{
    if max_attempts == 0 {
        return Err(TrackerError::Validation(
            "max_allocation_attempts must be at least 1".to_string(),
        ));
    }
    let mut attempt = 0;
    loop {
        attempt += 1;
        let id = scan(root)?;
        match create_run_slot(root, id) {
            Ok(dir) => {
                debug!(run_id = %id, attempt, dir = %dir.display(), "run slot created");
                return Ok((id, dir));
            }
            Err(TrackerError::AlreadyExists(dir)) if attempt < max_attempts => {
                warn!(
                    run_id = %id,
                    attempt,
                    dir = %dir.display(),
                    "run slot taken by a concurrent invocation, rescanning"
                );
            }
            Err(e) => return Err(e),
        }
    }
}
