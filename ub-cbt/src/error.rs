//! Failure kinds internal to the CBT engine. Every one of these, at the
//! `CbtEngine` boundary, collapses into `BackupError::Snapshot` — a
//! `SnapshotError` disables CBT for the affected volume — this finer
//! taxonomy only matters for deciding *how* to log and which bitmap
//! sector to name, not for the caller's recovery branch.

use std::fmt;

#[derive(Debug)]
pub enum CbtError {
    Io(String),
    TooShort,
    ChecksumMismatch,
    CorruptMagic { sector: usize },
    Driver(String),
}

impl fmt::Display for CbtError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CbtError::Io(msg) => write!(f, "i/o error: {msg}"),
            CbtError::TooShort => write!(f, "cbt bitmap file too short to contain its header"),
            CbtError::ChecksumMismatch => write!(f, "cbt bitmap md5 prefix does not match contents"),
            CbtError::CorruptMagic { sector } => {
                write!(f, "cbt bitmap sector {sector} has a corrupted magic")
            }
            CbtError::Driver(msg) => write!(f, "cbt driver error: {msg}"),
        }
    }
}

impl std::error::Error for CbtError {}

impl From<std::io::Error> for CbtError {
    fn from(err: std::io::Error) -> Self {
        CbtError::Io(err.to_string())
    }
}

impl From<anyhow::Error> for CbtError {
    fn from(err: anyhow::Error) -> Self {
        CbtError::Io(err.to_string())
    }
}
