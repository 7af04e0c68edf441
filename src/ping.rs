//! Keepalive ping (C7): the textual status line a running backup
//! writes to its client connection every `PING_INTERVAL_MS`, and the
//! silence detector that flips a session into timeout. Message formats
//! and the `*6` timeout multiplier are taken straight from
//! `server_ping.cpp`.

use std::sync::atomic::{AtomicI64, Ordering};

/// `ping_intervall` in the source: one keepalive every 10 seconds.
pub const PING_INTERVAL_MS: i64 = 10_000;

/// A session is timed out once it has gone this many ping intervals
/// without a successful ping (60 seconds of silence).
const MISSED_PING_TIMEOUT_MULTIPLIER: i64 = 6;

/// Plain percent-done ping: `"PING RUNNING -<pcdone>-#token=<token>"`.
pub fn format_ping(pcdone: i32, token: &str) -> String {
    format!("PING RUNNING -{pcdone}-#token={token}")
}

/// ETA-carrying ping variant, sent once the backup can estimate a
/// completion time. `eta_ms` between 0 and 60000 is clamped up to 61000
/// so a near-term ETA never displays as "less than a minute" only to
/// immediately disappear.
pub fn format_ping_eta(
    pc_done: i64,
    eta_ms: i64,
    status_id: i64,
    speed_bpms: f64,
    total_bytes: u64,
    done_bytes: u64,
    token: &str,
) -> String {
    let eta_ms = if (0..60_000).contains(&eta_ms) { 61_000 } else { eta_ms };
    format!(
        "2PING RUNNING pc_done={pc_done}&eta_ms={eta_ms}&status_id={status_id}&speed_bpms={speed_bpms}&total_bytes={total_bytes}&done_bytes={done_bytes}#token={token}"
    )
}

/// Tracks the last successful ping for one session and answers whether
/// it has gone silent long enough to count as a timeout.
pub struct PingTracker {
    last_ping_ok_ms: AtomicI64,
}

impl PingTracker {
    pub fn new(now_ms: i64) -> Self {
        PingTracker {
            last_ping_ok_ms: AtomicI64::new(now_ms),
        }
    }

    pub fn note_ping_ok(&self, now_ms: i64) {
        self.last_ping_ok_ms.store(now_ms, Ordering::SeqCst);
    }

    /// Three missed pings (more than 60s of silence) sets `has_timeout`.
    pub fn is_timeout(&self, now_ms: i64) -> bool {
        let last = self.last_ping_ok_ms.load(Ordering::SeqCst);
        now_ms - last > PING_INTERVAL_MS * MISSED_PING_TIMEOUT_MULTIPLIER
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_ping_format() {
        assert_eq!(format_ping(42, "abc"), "PING RUNNING -42-#token=abc");
    }

    #[test]
    fn eta_ping_clamps_near_term_eta() {
        let msg = format_ping_eta(50, 5_000, 7, 1.5, 1000, 500, "tok");
        assert!(msg.contains("eta_ms=61000"));
        assert!(msg.starts_with("2PING RUNNING pc_done=50"));
        assert!(msg.ends_with("#token=tok"));
    }

    #[test]
    fn eta_ping_passes_through_eta_outside_clamp_window() {
        let msg = format_ping_eta(50, 120_000, 7, 1.5, 1000, 500, "tok");
        assert!(msg.contains("eta_ms=120000"));
    }

    #[test]
    fn tracker_reports_timeout_after_silence() {
        let tracker = PingTracker::new(0);
        assert!(!tracker.is_timeout(59_000));
        assert!(tracker.is_timeout(61_000));

        tracker.note_ping_ok(61_000);
        assert!(!tracker.is_timeout(61_000 + 59_000));
    }
}
