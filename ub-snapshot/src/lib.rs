//! Snapshot/Shadow-Copy Manager (C5): reference-counted snapshots
//! shared across concurrent backups of the same volume.

pub mod driver;
pub mod manager;
pub mod types;

pub use driver::{CreatedSnapshot, DeleteOutcome, SnapshotDriver};
pub use manager::{SnapshotManager, DEFAULT_SHADOWCOPY_TIMEOUT_SECS, DEFAULT_STARTNEW_TIMEOUT_SECS};
pub use types::{SCDirId, SCDirs, SCRef, SCRefId};
