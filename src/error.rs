use std::path::PathBuf;

use thiserror::Error;

use crate::instance::PinAddress;

// Error type enum
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Two pins, or a pin and a child, share an ID inside one chip.
    DuplicateId(u32),
    /// A sub-chip names a chip the library cannot resolve.
    UnresolvedChip(String),
    /// A path of child IDs does not lead to an instance.
    UnresolvedPath(Vec<u32>),
    UnresolvedPin(PinAddress),
    WidthMismatch { expected: usize, found: usize },
    InvalidWidth(usize),
    /// A chip that contains itself, directly or through other chips.
    RecursiveChip(String),
    Config(Option<PathBuf>),
    Io,
    Parse,
    Other,
}

/// SimError should be used when generating an error anywhere in the engine.
/// The message is what gets shown to users, the kind is what callers match
/// on when deciding a fallback.
#[derive(Clone, Debug, Error)]
#[error("{msg}")]
pub struct SimError {
    pub msg: String,
    pub kind: ErrorKind,
}

impl SimError {
    pub fn new(kind: ErrorKind, msg: impl Into<String>) -> SimError {
        SimError {
            msg: msg.into(),
            kind,
        }
    }

    pub fn width_mismatch(expected: usize, found: usize) -> SimError {
        SimError::new(
            ErrorKind::WidthMismatch { expected, found },
            format!("Inconsistent width: expected {} bits, found {}.", expected, found),
        )
    }

    pub fn unresolved_path(path: &[u32]) -> SimError {
        SimError::new(
            ErrorKind::UnresolvedPath(path.to_vec()),
            format!("No chip instance at path {:?}.", path),
        )
    }
}

impl From<String> for SimError {
    fn from(e: String) -> Self {
        SimError {
            msg: e,
            kind: ErrorKind::Other,
        }
    }
}

impl From<std::io::Error> for SimError {
    fn from(e: std::io::Error) -> Self {
        SimError {
            msg: e.to_string(),
            kind: ErrorKind::Io,
        }
    }
}

impl From<serde_json::Error> for SimError {
    fn from(e: serde_json::Error) -> Self {
        SimError {
            msg: format!("Unable to parse chip description: {}", e),
            kind: ErrorKind::Parse,
        }
    }
}

pub type Result<T> = std::result::Result<T, SimError>;
