//! Error taxonomy. Kinds, not type names: each variant is a recovery
//! *class*, matching how the state machine (C7) and the scheduler (C8)
//! branch on failures rather than on the originating component.

use std::fmt;

/// One error kind from the taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    /// Peer silent, reset, or framing violation. Recovered locally by
    /// reconnect-with-backoff; surfaced as backup failure only after 5
    /// attempts.
    #[error("transport error: {0}")]
    Transport(String),

    /// Chunk hash disagrees with the expected digest.
    #[error("hash mismatch for chunk {chunk_idx}")]
    HashMismatch { chunk_idx: i64 },

    /// Snapshot create/release failed. Non-retryable for this run.
    #[error("snapshot error: {0}")]
    Snapshot(String),

    /// On-disk index failed its integrity check. Fatal for the run.
    #[error("index corrupted: {0}")]
    Index(String),

    /// Backup rejected by window, rate limit, or permission. Not an
    /// operator-visible error; logged at INFO.
    #[error("policy rejected backup: {0}")]
    Policy(String),

    /// Read error on the client source, forwarded from the client side.
    #[error("disk read error on share {share}: {message}")]
    Disk { share: String, message: String },

    /// Peer reported it is using the requested resource; caller should
    /// retry after a cooldown. Not a failure by itself.
    #[error("resource in use, retry later")]
    InUse,
}

impl BackupError {
    /// Kind tag used for the per-backup log line and for alert-script
    /// reporting counts.
    pub fn kind(&self) -> ErrorKind {
        match self {
            BackupError::Transport(_) => ErrorKind::Transport,
            BackupError::HashMismatch { .. } => ErrorKind::HashMismatch,
            BackupError::Snapshot(_) => ErrorKind::Snapshot,
            BackupError::Index(_) => ErrorKind::Index,
            BackupError::Policy(_) => ErrorKind::Policy,
            BackupError::Disk { .. } => ErrorKind::Disk,
            BackupError::InUse => ErrorKind::InUse,
        }
    }

    /// Whether this error, if unrecovered, should count towards
    /// `has_early_error` / exponential backoff.
    pub fn is_fatal_for_run(&self) -> bool {
        !matches!(self, BackupError::InUse | BackupError::Policy(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Transport,
    HashMismatch,
    Snapshot,
    Index,
    Policy,
    Disk,
    InUse,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Transport => "TransportError",
            ErrorKind::HashMismatch => "HashMismatch",
            ErrorKind::Snapshot => "SnapshotError",
            ErrorKind::Index => "IndexError",
            ErrorKind::Policy => "PolicyError",
            ErrorKind::Disk => "DiskError",
            ErrorKind::InUse => "InUse",
        };
        f.write_str(s)
    }
}

/// Mirrors `log::Level` but is serializable, so it can round-trip through
/// the per-backup log file without pulling a serde feature into `log`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<log::Level> for LogLevel {
    fn from(level: log::Level) -> Self {
        match level {
            log::Level::Error => LogLevel::Error,
            log::Level::Warn => LogLevel::Warn,
            log::Level::Info => LogLevel::Info,
            log::Level::Debug => LogLevel::Debug,
            log::Level::Trace => LogLevel::Trace,
        }
    }
}

/// A single diagnostic line attached to a backup run: level,
/// unix-second timestamp, message.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct LogLine {
    pub level: LogLevel,
    pub unix_ts: i64,
    pub message: String,
}

impl LogLine {
    pub fn new(level: impl Into<LogLevel>, unix_ts: i64, message: impl Into<String>) -> Self {
        Self {
            level: level.into(),
            unix_ts,
            message: message.into(),
        }
    }
}
