//! Pending identity. Three tables: confirmed `identities`,
//! `session_identities` (time-bounded), `new_identities` (pending
//! approval). Persisted by `ub-config`; the shapes live here so
//! `ub-transfer` and the server's client-session state machine can share
//! them without depending on the config crate's storage details.

use serde::{Deserialize, Serialize};

/// `urbackup/server_idents.txt` line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub token: String,
    pub fingerprint: String,
    pub pubkey: String,
    pub pubkey_ecdsa409k1: Option<String>,
}

/// `session_idents.txt` line: adds `endpoint` and `secret_key`, max 1000
/// entries with oldest evicted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionIdentity {
    pub token: String,
    pub fingerprint: String,
    pub pubkey: String,
    pub pubkey_ecdsa409k1: Option<String>,
    pub endpoint: String,
    pub secret_key: Vec<u8>,
    /// Last time this session token was observed live, used for the
    /// `ident_online_timeout` (1h) invariant.
    pub onlinetime: i64,
}

pub const SESSION_IDENTITY_MAX_ENTRIES: usize = 1000;
pub const IDENT_ONLINE_TIMEOUT_SECS: i64 = 60 * 60;

impl SessionIdentity {
    /// A session identity whose `|onlinetime|` is older than
    /// `ident_online_timeout` (1 hour) is inactive and must not
    /// authorise a new session.
    pub fn is_active(&self, now: i64) -> bool {
        (now - self.onlinetime).abs() < IDENT_ONLINE_TIMEOUT_SECS
    }
}

/// A not-yet-approved identity claim, awaiting operator confirmation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewIdentity {
    pub token: String,
    pub fingerprint: String,
    pub pubkey: String,
    pub first_seen: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_identity_expires_after_online_timeout() {
        let ident = SessionIdentity {
            token: "t".into(),
            fingerprint: "f".into(),
            pubkey: "p".into(),
            pubkey_ecdsa409k1: None,
            endpoint: "10.0.0.1".into(),
            secret_key: vec![1, 2, 3],
            onlinetime: 1_000,
        };
        assert!(ident.is_active(1_000 + 3599));
        assert!(!ident.is_active(1_000 + 3601));
    }
}
