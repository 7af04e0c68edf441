//! C7 Client Session / Backup State Machine:
//! `Offline -> Probing -> Authenticated -> Idle <-> Backup -> Completing -> Idle`.
//! Stop cancels from any state back to `Offline` with no uncommitted
//! state surviving. Names taken from `ServerDownloadThread.h`/
//! `server_ping.cpp`, following the pattern of keeping scheduling
//! decisions as small, independently testable pure functions
//! (`server/jobstate.rs`'s `compute_schedule` shape) around a thin
//! `Mutex<State>` wrapper.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use ub_api_types::client::Capability;
use ub_api_types::identity::Identity;
use ub_api_types::{BackupError, BackupKind, TGroup};
use ub_config::client_registry::{BackupWindow, Schedule};
use ub_config::settings::Tunables;

use crate::ping::PingTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Offline,
    Probing,
    Authenticated,
    Idle,
    Backup { kind: BackupKind, tgroup: TGroup },
    Completing,
}

impl SessionState {
    fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Offline, Probing)
                | (Probing, Authenticated)
                | (Probing, Offline)
                | (Authenticated, Idle)
                | (Idle, Backup { .. })
                | (Backup { .. }, Completing)
                | (Completing, Idle)
                // Stop cancels from anywhere back to Offline.
                | (_, Offline)
        )
    }
}

/// Last-successful-run timestamps per kind, used by `due_backup_kind`.
/// `None` means "never run", which is always due.
#[derive(Debug, Clone, Copy, Default)]
pub struct LastBackupTimes {
    pub full_file: Option<i64>,
    pub incr_file: Option<i64>,
    pub full_image: Option<i64>,
    pub incr_image: Option<i64>,
}

fn is_due(last: Option<i64>, now: i64, interval_secs: i64) -> bool {
    match last {
        None => true,
        Some(last) => now - last >= interval_secs,
    }
}

/// Picks the next backup kind to run, if any is due. A full
/// backup of a tier takes priority over that tier's incremental (it
/// resets the incremental baseline), and file backups are preferred
/// over image backups when both are due — file backups are cheaper and
/// the original status tags list them first (`sa_incr_file` before
/// `sa_incr_image`). Image backups are only offered when the client
/// reports `IMAGE_BACKUPS` capability.
pub fn due_backup_kind(
    now: i64,
    last: &LastBackupTimes,
    schedule: &Schedule,
    capabilities: Capability,
) -> Option<BackupKind> {
    if is_due(last.full_file, now, schedule.update_freq_full_file_secs) {
        return Some(BackupKind::FullFile);
    }
    if is_due(last.incr_file, now, schedule.update_freq_incr_file_secs) {
        return Some(BackupKind::IncrFile);
    }
    if !capabilities.contains(Capability::IMAGE_BACKUPS) {
        return None;
    }
    if is_due(last.full_image, now, schedule.update_freq_full_image_secs) {
        return Some(BackupKind::FullImage);
    }
    if is_due(last.incr_image, now, schedule.update_freq_incr_image_secs) {
        return Some(BackupKind::IncrImage);
    }
    None
}

/// Idle -> Backup admission check: schedule due-ness (via
/// `due_backup_kind`, done by the caller), backup window, and the three
/// rate limits in `Tunables`.
pub fn admission_check(
    tunables: &Tunables,
    window: &BackupWindow,
    weekday: u8,
    hour: u8,
    active_clients: u32,
    sim_backups: u32,
    running_jobs_for_client: u32,
) -> Result<(), BackupError> {
    if !window.allows(weekday, hour) {
        return Err(BackupError::Policy("outside backup window".into()));
    }
    if active_clients >= tunables.max_active_clients {
        return Err(BackupError::Policy("max_active_clients reached".into()));
    }
    if sim_backups >= tunables.max_sim_backups {
        return Err(BackupError::Policy("max_sim_backups reached".into()));
    }
    if running_jobs_for_client >= tunables.max_running_jobs_per_client {
        return Err(BackupError::Policy("max_running_jobs_per_client reached".into()));
    }
    Ok(())
}

/// Selects the client's own public key to verify against, preferring
/// ECDSA-409k1 when both sides support it: ECDSA verification is
/// cheaper, so it's the default once negotiated, with DSA kept as the
/// fallback for older clients.
pub fn select_verification_key<'a>(identity: &'a Identity, capabilities: Capability) -> &'a str {
    if capabilities.contains(Capability::ECDSA_409K1) {
        if let Some(ecdsa) = identity.pubkey_ecdsa409k1.as_deref() {
            return ecdsa;
        }
    }
    &identity.pubkey
}

/// Per-connection session. Owns the state machine and the ping-silence
/// detector; schedule/window policy and the rate-limit counts it checks
/// against live in the caller (the scheduler owns the cross-client
/// view this session can't have on its own).
pub struct ClientSession {
    client_id: i64,
    state: Mutex<SessionState>,
    ping: PingTracker,
    stop_requested: AtomicBool,
}

impl ClientSession {
    pub fn new(client_id: i64, now_ms: i64) -> Self {
        ClientSession {
            client_id,
            state: Mutex::new(SessionState::Offline),
            ping: PingTracker::new(now_ms),
            stop_requested: AtomicBool::new(false),
        }
    }

    pub fn client_id(&self) -> i64 {
        self.client_id
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap()
    }

    pub fn note_ping_ok(&self, now_ms: i64) {
        self.ping.note_ping_ok(now_ms);
    }

    pub fn has_timed_out(&self, now_ms: i64) -> bool {
        self.ping.is_timeout(now_ms)
    }

    fn transition(&self, next: SessionState) -> Result<(), BackupError> {
        let mut state = self.state.lock().unwrap();
        if !state.can_transition_to(next) {
            return Err(BackupError::Policy(format!("illegal session transition {:?} -> {:?}", *state, next)));
        }
        *state = next;
        Ok(())
    }

    pub fn begin_probing(&self) -> Result<(), BackupError> {
        self.transition(SessionState::Probing)
    }

    pub fn authenticate(&self) -> Result<(), BackupError> {
        self.transition(SessionState::Authenticated)
    }

    pub fn go_idle(&self) -> Result<(), BackupError> {
        self.transition(SessionState::Idle)
    }

    pub fn start_backup(&self, kind: BackupKind, tgroup: TGroup) -> Result<(), BackupError> {
        self.transition(SessionState::Backup { kind, tgroup })
    }

    pub fn complete_backup(&self) -> Result<(), BackupError> {
        self.transition(SessionState::Completing)?;
        self.transition(SessionState::Idle)
    }

    /// Cancels whatever is in flight and drops straight back to
    /// `Offline`: no uncommitted state survives. The caller is
    /// responsible for releasing any snapshot held by the backup this
    /// interrupts — that release happens before this is called, since
    /// it needs the `kind`/`tgroup` this transition is about to erase.
    pub fn stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        *self.state.lock().unwrap() = SessionState::Offline;
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn due_backup_kind_prefers_full_file_over_everything() {
        let schedule = Schedule::default();
        let last = LastBackupTimes::default();
        let kind = due_backup_kind(0, &last, &schedule, Capability::empty());
        assert_eq!(kind, Some(BackupKind::FullFile));
    }

    #[test]
    fn due_backup_kind_falls_back_to_incr_file_then_image() {
        let schedule = Schedule::default();
        let last = LastBackupTimes {
            full_file: Some(0),
            incr_file: Some(0),
            full_image: None,
            incr_image: None,
        };
        let now = schedule.update_freq_incr_file_secs; // incr file due, full file not yet
        assert_eq!(due_backup_kind(now, &last, &schedule, Capability::empty()), Some(BackupKind::IncrFile));

        let last_all_current = LastBackupTimes {
            full_file: Some(now),
            incr_file: Some(now),
            full_image: None,
            incr_image: None,
        };
        assert_eq!(due_backup_kind(now, &last_all_current, &schedule, Capability::IMAGE_BACKUPS), Some(BackupKind::FullImage));
    }

    #[test]
    fn due_backup_kind_skips_image_without_capability() {
        let schedule = Schedule::default();
        let now = schedule.update_freq_full_image_secs;
        // File tiers both current as of `now`, so only the image tiers
        // could possibly be due; without IMAGE_BACKUPS capability none
        // are offered.
        let last = LastBackupTimes {
            full_file: Some(now),
            incr_file: Some(now),
            full_image: None,
            incr_image: None,
        };
        assert_eq!(due_backup_kind(now, &last, &schedule, Capability::empty()), None);
    }

    #[test]
    fn admission_rejects_outside_window() {
        let tunables = Tunables::default();
        let mut window = BackupWindow::default();
        window.set(2, 3, false);
        let err = admission_check(&tunables, &window, 2, 3, 0, 0, 0).unwrap_err();
        assert!(matches!(err, BackupError::Policy(_)));
    }

    #[test]
    fn admission_rejects_over_rate_limits() {
        let mut tunables = Tunables::default();
        tunables.max_sim_backups = 1;
        let window = BackupWindow::default();
        let err = admission_check(&tunables, &window, 0, 0, 0, 1, 0).unwrap_err();
        assert!(matches!(err, BackupError::Policy(_)));
    }

    #[test]
    fn verification_key_prefers_ecdsa_when_negotiated() {
        let identity = Identity {
            token: "t".into(),
            fingerprint: "f".into(),
            pubkey: "dsa-key".into(),
            pubkey_ecdsa409k1: Some("ecdsa-key".into()),
        };
        assert_eq!(select_verification_key(&identity, Capability::ECDSA_409K1), "ecdsa-key");
        assert_eq!(select_verification_key(&identity, Capability::empty()), "dsa-key");
    }

    #[test]
    fn full_session_lifecycle() {
        let session = ClientSession::new(1, 0);
        session.begin_probing().unwrap();
        session.authenticate().unwrap();
        session.go_idle().unwrap();
        session.start_backup(BackupKind::IncrFile, 0).unwrap();
        assert_eq!(session.state(), SessionState::Backup { kind: BackupKind::IncrFile, tgroup: 0 });
        session.complete_backup().unwrap();
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn illegal_transition_is_rejected() {
        let session = ClientSession::new(1, 0);
        let err = session.authenticate().unwrap_err();
        assert!(matches!(err, BackupError::Policy(_)));
    }

    #[test]
    fn stop_cancels_from_any_state() {
        let session = ClientSession::new(1, 0);
        session.begin_probing().unwrap();
        session.authenticate().unwrap();
        session.go_idle().unwrap();
        session.start_backup(BackupKind::FullImage, 0).unwrap();

        session.stop();
        assert_eq!(session.state(), SessionState::Offline);
        assert!(session.stop_requested());
    }
}
