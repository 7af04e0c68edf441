//! Data model for the snapshot manager: `SCRef` (an active shadow
//! copy) and `SCDirs` (a scheduled directory mounted inside one).
//! Modelled as two index arenas rather than cyclic `SCDirs <-> SCRef`
//! pointers, so release is O(1) and no back-reference can dangle.

use std::collections::HashSet;

use ub_api_types::protocol::CbtType;
use ub_api_types::SsetId;

/// Index into a `SnapshotManager`'s `SCRef` arena. Stable for the
/// lifetime of the snapshot; reused once the slot is freed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SCRefId(pub usize);

/// Index into a `SnapshotManager`'s `SCDirs` arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SCDirId(pub usize);

/// An active shadow copy. `start_tokens` is the set of backup-session
/// tokens currently relying on it; the snapshot is a release candidate
/// once that set is empty.
#[derive(Debug, Clone)]
pub struct SCRef {
    pub ssetid: SsetId,
    pub volpath: String,
    pub target: String,
    pub starttime: i64,
    pub start_tokens: HashSet<String>,
    pub for_imagebackup: bool,
    pub cbt: bool,
    pub cbt_file: Option<String>,
    pub cbt_type: CbtType,
}

/// A named mountpoint inside a snapshot. `scref` borrows into the
/// manager's `SCRef` arena by index; invariant: if `running` then
/// `scref.is_some()`.
#[derive(Debug, Clone)]
pub struct SCDirs {
    pub dir: String,
    pub orig_target: String,
    pub target: String,
    pub running: bool,
    pub fileserv: bool,
    pub scref: Option<SCRefId>,
}

impl SCDirs {
    pub fn new(dir: impl Into<String>, orig_target: impl Into<String>, fileserv: bool) -> Self {
        let orig_target = orig_target.into();
        Self {
            dir: dir.into(),
            target: orig_target.clone(),
            orig_target,
            running: false,
            fileserv,
            scref: None,
        }
    }
}
