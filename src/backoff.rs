//! Exponential retry backoff: after a failed attempt to
//! start or run a backup of a given kind, the next attempt isn't
//! eligible until `2^min(count,6) * base_interval` has elapsed.

use std::collections::HashMap;
use std::sync::Mutex;

use ub_api_types::BackupKind;

const MAX_EXPONENT: u32 = 6;

#[derive(Debug, Clone, Copy, Default)]
struct Entry {
    count: u32,
    last_try: i64,
}

/// One tracker per server process, keyed by `(client_id, kind)` so a
/// client's incremental-file backoff doesn't throttle its image
/// backups and vice versa.
pub struct BackoffTracker {
    entries: Mutex<HashMap<(i64, BackupKind), Entry>>,
}

impl Default for BackoffTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl BackoffTracker {
    pub fn new() -> Self {
        BackoffTracker {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Records a failed attempt at `now`, growing the backoff exponent.
    pub fn record_failure(&self, client_id: i64, kind: BackupKind, now: i64) {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.entry((client_id, kind)).or_default();
        entry.count = entry.count.saturating_add(1);
        entry.last_try = now;
    }

    /// Clears the backoff entirely; the next attempt is eligible
    /// immediately.
    pub fn record_success(&self, client_id: i64, kind: BackupKind) {
        self.entries.lock().unwrap().remove(&(client_id, kind));
    }

    /// Whether a new attempt may start now, given `base_interval_secs`
    /// (normally the kind's schedule interval).
    pub fn is_eligible(&self, client_id: i64, kind: BackupKind, now: i64, base_interval_secs: i64) -> bool {
        let entries = self.entries.lock().unwrap();
        match entries.get(&(client_id, kind)) {
            None => true,
            Some(entry) => now >= next_eligible(entry.last_try, entry.count, base_interval_secs),
        }
    }
}

fn next_eligible(last_try: i64, count: u32, base_interval_secs: i64) -> i64 {
    let exponent = count.min(MAX_EXPONENT);
    last_try + (1i64 << exponent) * base_interval_secs
}
