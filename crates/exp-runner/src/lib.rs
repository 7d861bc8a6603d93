//! Run-identity allocation and dispatch for experiment scripts.
//!
//! A run gets the next free `experiment_<NNN>` slot under the tracking root,
//! a snapshot of its script, a record of how it was invoked, and is then
//! handed to a local interpreter or a batch scheduler with `LOG_DIR` and
//! `LOG_FILE` pointing back into the slot.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod record;
pub mod run;
pub mod slot;
pub mod snapshot;

pub use config::TrackerConfig;
pub use dispatch::{DispatchMode, DispatchOutcome, Resources, ENV_LOG_DIR, ENV_LOG_FILE};
pub use error::{Result, TrackerError};
pub use record::{RunLogger, MESSAGE_FILE, RECORD_FILE};
pub use run::{list_runs, start_run, validate_request, RunRequest, RunResult, RunStage};
pub use slot::{allocate_run_slot, create_run_slot, next_run_id, RunId, SLOT_PREFIX};
pub use snapshot::Snapshot;
