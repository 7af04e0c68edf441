//! The platform snapshot capability (VSS / dm-era / dattobd) is out of
//! scope here and treated as an abstract capability; this trait is the
//! seam the manager drives it through.

use ub_api_types::{BackupError, SsetId};

pub struct CreatedSnapshot {
    pub ssetid: SsetId,
    pub target: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Done,
    /// The driver still has something open against this snapshot (e.g.
    /// a metadata transfer). Not a failure — retry later.
    InUse,
}

pub trait SnapshotDriver: Send + Sync {
    /// `volume` is whatever `SCDirs.orig_target` resolves to; mountpoint
    /// resolution is the driver's own concern, not the manager's.
    fn create(&self, volume: &str) -> Result<CreatedSnapshot, BackupError>;
    fn delete(&self, ssetid: SsetId) -> Result<DeleteOutcome, BackupError>;
}
