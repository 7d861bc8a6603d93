use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("run slot already exists: {}", .0.display())]
    AlreadyExists(PathBuf),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("dispatch failed: {0}")]
    Dispatch(String),
}

impl TrackerError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        TrackerError::Io {
            context: context.into(),
            source,
        }
    }

    /// Stable machine-readable code, used by the CLI's JSON error payload.
    pub fn code(&self) -> &'static str {
        match self {
            TrackerError::Validation(_) => "validation_error",
            TrackerError::AlreadyExists(_) => "already_exists",
            TrackerError::Io { .. } => "io_failure",
            TrackerError::Dispatch(_) => "dispatch_failure",
        }
    }
}

pub type Result<T> = std::result::Result<T, TrackerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_distinct_per_variant() {
        let errs = [
            TrackerError::Validation("x".into()),
            TrackerError::AlreadyExists(PathBuf::from("/tmp/experiment_001")),
            TrackerError::io("copy", std::io::Error::other("boom")),
            TrackerError::Dispatch("exit 1".into()),
        ];
        let codes: Vec<&str> = errs.iter().map(|e| e.code()).collect();
        assert_eq!(
            codes,
            vec![
                "validation_error",
                "already_exists",
                "io_failure",
                "dispatch_failure"
            ]
        );
    }

    #[test]
    fn io_error_message_keeps_context() {
        let err = TrackerError::io("failed to copy script", std::io::Error::other("disk full"));
        let msg = err.to_string();
        assert!(msg.contains("failed to copy script"), "{}", msg);
        assert!(msg.contains("disk full"), "{}", msg);
    }
}
