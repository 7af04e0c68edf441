//! C5 Snapshot/Shadow-Copy Manager: reference-counted snapshots
//! shared across concurrent backups of the same volume, released on a
//! timeout and swept by `cleanup_saved_shadowcopies`, run at every
//! operation — modelled here as an explicit call at the top of `start`,
//! `release`, and its own public entry point, rather than a background
//! timer.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;

use log::{debug, warn};
use ub_api_types::protocol::CbtType;
use ub_api_types::{BackupError, SsetId};

use crate::driver::{DeleteOutcome, SnapshotDriver};
use crate::types::{SCDirId, SCDirs, SCRef, SCRefId};

/// `shadowcopy_startnew_timeout` default: an existing snapshot
/// held only by this server's own tokens is considered stale after this
/// long, and `allow_restart` lets the caller force a fresh one.
pub const DEFAULT_STARTNEW_TIMEOUT_SECS: i64 = 55 * 60;

/// `shadowcopy_timeout` default: a snapshot with
/// no active tokens older than this is swept unconditionally.
pub const DEFAULT_SHADOWCOPY_TIMEOUT_SECS: i64 = 7 * 24 * 60 * 60;

struct State {
    screfs: Vec<Option<SCRef>>,
    scdirs: Vec<Option<SCDirs>>,
}

impl State {
    fn alloc_scref(&mut self, scref: SCRef) -> SCRefId {
        if let Some(idx) = self.screfs.iter().position(|s| s.is_none()) {
            self.screfs[idx] = Some(scref);
            SCRefId(idx)
        } else {
            self.screfs.push(Some(scref));
            SCRefId(self.screfs.len() - 1)
        }
    }

    fn scref(&self, id: SCRefId) -> Option<&SCRef> {
        self.screfs.get(id.0).and_then(|s| s.as_ref())
    }

    fn scref_mut(&mut self, id: SCRefId) -> Option<&mut SCRef> {
        self.screfs.get_mut(id.0).and_then(|s| s.as_mut())
    }

    fn scdir(&self, id: SCDirId) -> Option<&SCDirs> {
        self.scdirs.get(id.0).and_then(|s| s.as_ref())
    }

    fn scdir_mut(&mut self, id: SCDirId) -> Option<&mut SCDirs> {
        self.scdirs.get_mut(id.0).and_then(|s| s.as_mut())
    }

    /// Any scheduled directory still actively mounted inside `id`.
    fn has_any_live_refs(&self, id: SCRefId) -> bool {
        self.scdirs
            .iter()
            .any(|slot| matches!(slot, Some(d) if d.running && d.scref == Some(id)))
    }

    /// Frees the arena slot and nulls every `SCDirs.scref` pointing at
    /// it, so no handle is left dangling.
    fn remove_scref_and_detach(&mut self, id: SCRefId) {
        self.screfs[id.0] = None;
        for slot in self.scdirs.iter_mut().flatten() {
            if slot.scref == Some(id) {
                slot.scref = None;
                slot.running = false;
            }
        }
    }
}

pub struct SnapshotManager<D: SnapshotDriver> {
    driver: D,
    state: Mutex<State>,
    startnew_timeout_secs: i64,
    shadowcopy_timeout_secs: i64,
}

impl<D: SnapshotDriver> SnapshotManager<D> {
    pub fn new(driver: D) -> Self {
        Self::with_timeouts(
            driver,
            DEFAULT_STARTNEW_TIMEOUT_SECS,
            DEFAULT_SHADOWCOPY_TIMEOUT_SECS,
        )
    }

    pub fn with_timeouts(driver: D, startnew_timeout_secs: i64, shadowcopy_timeout_secs: i64) -> Self {
        Self {
            driver,
            state: Mutex::new(State { screfs: Vec::new(), scdirs: Vec::new() }),
            startnew_timeout_secs,
            shadowcopy_timeout_secs,
        }
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn register_scdir(&self, scdir: SCDirs) -> SCDirId {
        let mut state = self.state.lock().unwrap();
        state.scdirs.push(Some(scdir));
        SCDirId(state.scdirs.len() - 1)
    }

    pub fn scdir(&self, id: SCDirId) -> Option<SCDirs> {
        self.state.lock().unwrap().scdir(id).cloned()
    }

    pub fn scref(&self, id: SCRefId) -> Option<SCRef> {
        self.state.lock().unwrap().scref(id).cloned()
    }

    /// `start`: reuse a live snapshot over the same volume, or
    /// invoke the driver to create one, recording `token` as a user.
    pub fn start(
        &self,
        scdir_id: SCDirId,
        for_image: bool,
        allow_restart: bool,
        token: &str,
        now: i64,
    ) -> Result<SCRefId, BackupError> {
        let mut state = self.state.lock().unwrap();
        self.sweep(&mut state, now);

        let volpath = state
            .scdir(scdir_id)
            .ok_or_else(|| BackupError::Snapshot("unknown scheduled directory".into()))?
            .orig_target
            .clone();

        let existing = state.screfs.iter().enumerate().find_map(|(idx, slot)| {
            slot.as_ref()
                .filter(|r| r.volpath == volpath && r.for_imagebackup == for_image)
                .map(|_| SCRefId(idx))
        });

        if let Some(existing_id) = existing {
            let scref = state.scref(existing_id).unwrap();
            let stale = (now - scref.starttime) > self.startnew_timeout_secs;
            let ssetid = scref.ssetid;

            if stale && allow_restart {
                match self.driver.delete(ssetid) {
                    Ok(DeleteOutcome::Done) => {
                        state.remove_scref_and_detach(existing_id);
                        return self.create_and_attach(&mut state, scdir_id, volpath, for_image, token, now);
                    }
                    Ok(DeleteOutcome::InUse) => {
                        warn!("stale snapshot {ssetid} still in use, reusing instead of restarting");
                    }
                    Err(err) => {
                        warn!("failed to release stale snapshot {ssetid}: {err}");
                    }
                }
            }

            let scref = state.scref_mut(existing_id).unwrap();
            scref.start_tokens.insert(token.to_string());
            let target = scref.target.clone();
            let dir = state.scdir_mut(scdir_id).unwrap();
            dir.scref = Some(existing_id);
            dir.running = true;
            dir.target = target;
            return Ok(existing_id);
        }

        self.create_and_attach(&mut state, scdir_id, volpath, for_image, token, now)
    }

    fn create_and_attach(
        &self,
        state: &mut State,
        scdir_id: SCDirId,
        volpath: String,
        for_image: bool,
        token: &str,
        now: i64,
    ) -> Result<SCRefId, BackupError> {
        let created = self.driver.create(&volpath)?;
        let mut start_tokens = HashSet::new();
        start_tokens.insert(token.to_string());
        let scref = SCRef {
            ssetid: created.ssetid,
            volpath,
            target: created.target.clone(),
            starttime: now,
            start_tokens,
            for_imagebackup: for_image,
            cbt: false,
            cbt_file: None,
            cbt_type: CbtType::None,
        };
        let id = state.alloc_scref(scref);
        let dir = state
            .scdir_mut(scdir_id)
            .ok_or_else(|| BackupError::Snapshot("unknown scheduled directory".into()))?;
        dir.scref = Some(id);
        dir.running = true;
        dir.target = created.target;
        Ok(id)
    }

    /// `release`: detaches `scdir_id` from its snapshot. The
    /// snapshot itself is only torn down once no token and no other
    /// scheduled directory still needs it; `keep` skips the teardown
    /// even then (an archived run wants the snapshot to stick around).
    pub fn release(
        &self,
        scdir_id: SCDirId,
        token: &str,
        save_id: i64,
        keep: bool,
        now: i64,
    ) -> Result<(), BackupError> {
        let mut state = self.state.lock().unwrap();
        self.sweep(&mut state, now);

        let dir = state
            .scdir_mut(scdir_id)
            .ok_or_else(|| BackupError::Snapshot("unknown scheduled directory".into()))?;
        let Some(scref_id) = dir.scref.take() else {
            dir.running = false;
            return Ok(());
        };
        dir.running = false;

        if let Some(scref) = state.scref_mut(scref_id) {
            scref.start_tokens.remove(token);
        }
        debug!("release scdir {} (save_id={save_id}) from snapshot {:?}", scdir_id.0, scref_id);

        if keep {
            return Ok(());
        }

        self.maybe_delete(&mut state, scref_id)
    }

    fn maybe_delete(&self, state: &mut State, scref_id: SCRefId) -> Result<(), BackupError> {
        let Some(scref) = state.scref(scref_id) else {
            return Ok(());
        };
        if !scref.start_tokens.is_empty() || state.has_any_live_refs(scref_id) {
            return Ok(());
        }

        let ssetid = scref.ssetid;
        match self.driver.delete(ssetid)? {
            DeleteOutcome::Done => {
                state.remove_scref_and_detach(scref_id);
                Ok(())
            }
            DeleteOutcome::InUse => Err(BackupError::InUse),
        }
    }

    /// Drops any `SCRef` whose tokens are all gone
    /// and whose target directory no longer exists, or that has sat
    /// idle past `shadowcopy_timeout`, and retries the delete for any
    /// zero-token snapshot a previous `InUse` left dangling.
    pub fn cleanup_saved_shadowcopies(&self, now: i64) -> usize {
        let mut state = self.state.lock().unwrap();
        self.sweep(&mut state, now)
    }

    /// Unlike `maybe_delete`, candidates here are torn down even while
    /// tokens are still held: staleness and a vanished target both mean
    /// the snapshot is no longer trustworthy, not merely unused.
    fn sweep(&self, state: &mut State, now: i64) -> usize {
        let candidates: Vec<SCRefId> = state
            .screfs
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| {
                let r = slot.as_ref()?;
                let id = SCRefId(idx);
                let too_old = (now - r.starttime) > self.shadowcopy_timeout_secs;
                let orphaned = r.start_tokens.is_empty() && !state.has_any_live_refs(id);
                let target_gone = !Path::new(&r.target).exists();
                (too_old || orphaned || target_gone).then_some(id)
            })
            .collect();

        let mut removed = 0;
        for id in candidates {
            let Some(ssetid) = state.scref(id).map(|r| r.ssetid) else {
                continue;
            };
            if let Ok(DeleteOutcome::Done) = self.driver.delete(ssetid) {
                state.remove_scref_and_detach(id);
                removed += 1;
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex as StdMutex;

    struct CountingDriver {
        delete_calls: AtomicU32,
        delete_results: StdMutex<Vec<Result<DeleteOutcome, String>>>,
        next_id: AtomicU32,
    }

    impl CountingDriver {
        fn new(delete_results: Vec<Result<DeleteOutcome, String>>) -> Self {
            Self {
                delete_calls: AtomicU32::new(0),
                delete_results: StdMutex::new(delete_results),
                next_id: AtomicU32::new(1),
            }
        }
    }

    impl SnapshotDriver for CountingDriver {
        fn create(&self, _volume: &str) -> Result<crate::driver::CreatedSnapshot, BackupError> {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            // Real `target` paths are exercised by
            // `sweep_removes_snapshot_whose_target_directory_vanished`;
            // elsewhere the exact value doesn't matter, so point at
            // something that is guaranteed to exist.
            Ok(crate::driver::CreatedSnapshot { ssetid: id as SsetId, target: ".".to_string() })
        }

        fn delete(&self, _ssetid: SsetId) -> Result<DeleteOutcome, BackupError> {
            self.delete_calls.fetch_add(1, Ordering::SeqCst);
            let mut results = self.delete_results.lock().unwrap();
            if results.is_empty() {
                return Ok(DeleteOutcome::Done);
            }
            results.remove(0).map_err(BackupError::Snapshot)
        }
    }

    impl CountingDriver {
        fn delete_calls(&self) -> u32 {
            self.delete_calls.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn second_start_on_same_volume_reuses_snapshot() {
        let mgr = SnapshotManager::new(CountingDriver::new(vec![]));
        let a = mgr.register_scdir(SCDirs::new("jobs", "/vol/jobs", true));
        let b = mgr.register_scdir(SCDirs::new("jobs2", "/vol/jobs", true));

        let ref_a = mgr.start(a, false, false, "token-a", 1000).unwrap();
        let ref_b = mgr.start(b, false, false, "token-b", 1010).unwrap();
        assert_eq!(ref_a, ref_b);

        let scref = mgr.scref(ref_a).unwrap();
        assert_eq!(scref.start_tokens.len(), 2);
    }

    #[test]
    fn release_tears_down_once_last_token_and_scdir_are_gone() {
        let driver = CountingDriver::new(vec![]);
        let mgr = SnapshotManager::new(driver);
        let a = mgr.register_scdir(SCDirs::new("jobs", "/vol/jobs", true));
        let r = mgr.start(a, false, false, "token-a", 1000).unwrap();

        mgr.release(a, "token-a", 42, false, 1001).unwrap();
        assert!(mgr.scref(r).is_none());
    }

    #[test]
    fn release_retries_past_in_use_before_succeeding() {
        let driver = CountingDriver::new(vec![
            Ok(DeleteOutcome::InUse),
            Ok(DeleteOutcome::InUse),
            Ok(DeleteOutcome::Done),
        ]);
        let mgr = SnapshotManager::new(driver);
        let a = mgr.register_scdir(SCDirs::new("jobs", "/vol/jobs", true));
        let r = mgr.start(a, false, false, "token-a", 1000).unwrap();

        let first = mgr.release(a, "token-a", 1, false, 1001);
        assert!(matches!(first, Err(BackupError::InUse)));
        assert!(mgr.scref(r).is_some());

        let second = mgr.cleanup_saved_shadowcopies(1002);
        assert_eq!(second, 0);
        assert!(mgr.scref(r).is_some());

        let third = mgr.cleanup_saved_shadowcopies(1003);
        assert_eq!(third, 1);
        assert!(mgr.scref(r).is_none());
        assert_eq!(mgr.driver().delete_calls(), 3);
    }

    #[test]
    fn sweep_removes_snapshot_whose_target_directory_vanished() {
        let tmp = tempfile::tempdir().unwrap();
        let vanished = tmp.path().join("gone");
        std::fs::create_dir(&vanished).unwrap();

        struct FixedTargetDriver(String);
        impl SnapshotDriver for FixedTargetDriver {
            fn create(&self, _volume: &str) -> Result<crate::driver::CreatedSnapshot, BackupError> {
                Ok(crate::driver::CreatedSnapshot { ssetid: 1, target: self.0.clone() })
            }
            fn delete(&self, _ssetid: SsetId) -> Result<DeleteOutcome, BackupError> {
                Ok(DeleteOutcome::Done)
            }
        }

        let mgr = SnapshotManager::new(FixedTargetDriver(vanished.to_string_lossy().into_owned()));
        let a = mgr.register_scdir(SCDirs::new("jobs", "/vol/jobs", true));
        let r = mgr.start(a, false, false, "token-a", 1000).unwrap();

        std::fs::remove_dir(&vanished).unwrap();
        let removed = mgr.cleanup_saved_shadowcopies(1001);
        assert_eq!(removed, 1);
        assert!(mgr.scref(r).is_none());
    }

    #[test]
    fn stale_snapshot_is_restarted_when_allowed() {
        let mgr = SnapshotManager::with_timeouts(CountingDriver::new(vec![]), 60, DEFAULT_SHADOWCOPY_TIMEOUT_SECS);
        let a = mgr.register_scdir(SCDirs::new("jobs", "/vol/jobs", true));
        let first = mgr.start(a, false, false, "token-a", 1000).unwrap();

        // Same scdir asks again well past `startnew_timeout`; with
        // `allow_restart` the stale snapshot is torn down and replaced
        // rather than reused.
        let second = mgr.start(a, false, true, "token-a-2", 1000 + 120).unwrap();
        assert_ne!(first, second);
        assert!(mgr.scref(first).is_none());
        assert!(mgr.scref(second).is_some());
    }
}
