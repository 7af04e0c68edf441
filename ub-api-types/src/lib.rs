//! Shared data model and error taxonomy for the UrBackup server
//! engine. Kept dependency-light and serde-friendly so every other `ub-*`
//! crate and the orchestration binary can share one definition of "what a
//! client, a backup run, or a file entry is" without cyclic crate deps.

pub mod backup_run;
pub mod client;
pub mod error;
pub mod file_entry;
pub mod identity;
pub mod protocol;

pub use backup_run::{BackupKind, BackupRun};
pub use client::{Capability, Client, ProtocolVersions};
pub use error::BackupError;
pub use file_entry::FileEntry;
pub use identity::{Identity, NewIdentity, SessionIdentity};

/// Backup-group identifier. `0` is the default group, `1` is continuous,
/// `>=2` are user-defined. Part of every dedup key so groups never share
/// storage across each other.
pub type TGroup = u32;

pub const TGROUP_DEFAULT: TGroup = 0;
pub const TGROUP_CONTINUOUS: TGroup = 1;

/// Opaque, stable-across-renames client identifier (`Client.uid`).
pub type ClientUid = [u8; 16];

/// 128-bit shadow-copy set identifier (`SCRef.ssetid`).
pub type SsetId = u128;
