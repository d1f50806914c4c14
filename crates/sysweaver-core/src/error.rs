//! Error types for sysweaver-core

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum JailError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("path not found: {what} at {}", path.display())]
    PathNotFound { what: &'static str, path: PathBuf },

    #[error("mount error: {0}")]
    Mount(String),

    #[error("launch error: {0}")]
    Launch(String),

    #[error("jail is not running")]
    NotRunning,

    #[error("jail is already running")]
    AlreadyRunning,

    #[error("{program} exited with status {exit_code}")]
    Execution {
        program: String,
        exit_code: i32,
        output: Vec<u8>,
    },

    #[error("system requirement not met: {0}")]
    Requirement(String),

    /// The template tree was writable from inside the jail.
    #[error("critical invariant violation: {0}")]
    CriticalInvariantViolation(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("nix error: {0}")]
    Nix(#[from] nix::Error),
}

impl JailError {
    /// True for failures that must abort a build and must not be retried.
    #[must_use]
    pub const fn is_critical(&self) -> bool {
        matches!(self, Self::CriticalInvariantViolation(_))
    }

    /// Output captured before a command failed, if any.
    #[must_use]
    pub fn output(&self) -> Option<&[u8]> {
        match self {
            Self::Execution { output, .. } => Some(output),
            _ => None,
        }
    }
}
