//! Archival: marks a `BackupRun` archived so ordinary retention skips
//! it, and expires that mark once `archive_timeout` has passed.
//! Grounded on `server_archive.cpp`'s `archiveTimeoutFileBackups`,
//! simplified to the time-based form only — its scheduled/window-based
//! `archiveBackups` loop is out of scope here.

use ub_api_types::BackupRun;

/// Marks `run` archived. `timeout_at`, when given, is a Unix-seconds
/// deadline after which `expire_timeouts` clears the mark again; `None`
/// archives indefinitely until a caller explicitly un-archives it.
pub fn archive(run: &mut BackupRun, timeout_at: Option<i64>) {
    run.archived = true;
    run.archive_timeout = timeout_at;
}

pub fn unarchive(run: &mut BackupRun) {
    run.archived = false;
    run.archive_timeout = None;
}

/// Clears the archived mark on any run whose `archive_timeout` has
/// passed `now`, mirroring `archiveTimeoutFileBackups`'s
/// `archived=1 AND archive_timeout<>0 AND archive_timeout<?` sweep.
/// Returns the backup ids that were unarchived.
pub fn expire_timeouts(runs: &mut [BackupRun], now: i64) -> Vec<i64> {
    let mut expired = Vec::new();
    for run in runs.iter_mut() {
        if run.archived {
            if let Some(timeout) = run.archive_timeout {
                if timeout != 0 && timeout < now {
                    run.archived = false;
                    run.archive_timeout = None;
                    expired.push(run.backupid);
                }
            }
        }
    }
    expired
}

/// Ordinary retention only ever considers non-archived runs; an
/// archived backup stays on disk until explicitly unarchived.
pub fn retention_candidates(runs: &[BackupRun]) -> Vec<&BackupRun> {
    runs.iter().filter(|r| !r.archived).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ub_api_types::BackupKind;

    fn run(backupid: i64) -> BackupRun {
        let mut r = BackupRun::new(backupid, 1, 0, BackupKind::FullFile, 1000);
        r.finish(1010);
        r
    }

    #[test]
    fn archived_run_is_excluded_from_retention_candidates() {
        let mut runs = vec![run(1), run(2)];
        archive(&mut runs[0], Some(5000));

        let candidates = retention_candidates(&runs);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].backupid, 2);
    }

    #[test]
    fn expire_timeouts_unarchives_only_past_deadline() {
        let mut runs = vec![run(1), run(2), run(3)];
        archive(&mut runs[0], Some(100));
        archive(&mut runs[1], Some(9999));
        archive(&mut runs[2], None);

        let expired = expire_timeouts(&mut runs, 500);

        assert_eq!(expired, vec![1]);
        assert!(!runs[0].archived);
        assert!(runs[1].archived);
        assert!(runs[2].archived);
    }

    #[test]
    fn unarchive_clears_timeout_too() {
        let mut r = run(1);
        archive(&mut r, Some(100));
        unarchive(&mut r);
        assert!(!r.archived);
        assert_eq!(r.archive_timeout, None);
    }
}
