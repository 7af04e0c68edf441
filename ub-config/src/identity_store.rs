//! Identity persistence: confirmed identities and session
//! identities round-trip through flat line-oriented files
//! (`server_idents.txt` / `session_idents.txt`), the way `pbs-config`'s
//! `cached_config!` sections persist small append-mostly state
//! rather than a database table. Pending (`new_identities`)
//! claims stay in memory only — they vanish on restart until approved,
//! awaiting operator confirmation.

use anyhow::{Context, Error};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use ub_api_types::identity::{
    Identity, NewIdentity, SessionIdentity, SESSION_IDENTITY_MAX_ENTRIES,
};

struct State {
    identities: HashMap<String, Identity>,
    /// Insertion order preserved so eviction of the oldest session is
    /// O(1) amortised rather than a linear scan over `onlinetime`.
    session_order: Vec<String>,
    sessions: HashMap<String, SessionIdentity>,
    pending: HashMap<String, NewIdentity>,
}

pub struct IdentityStore {
    server_idents_path: PathBuf,
    session_idents_path: PathBuf,
    state: Mutex<State>,
}

impl IdentityStore {
    pub fn open(server_idents_path: &Path, session_idents_path: &Path) -> Result<Self, Error> {
        let identities = load_identities(server_idents_path)?;
        let (session_order, sessions) = load_sessions(session_idents_path)?;
        Ok(Self {
            server_idents_path: server_idents_path.to_path_buf(),
            session_idents_path: session_idents_path.to_path_buf(),
            state: Mutex::new(State {
                identities,
                session_order,
                sessions,
                pending: HashMap::new(),
            }),
        })
    }

    pub fn confirm_identity(&self, identity: Identity) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state.pending.remove(&identity.token);
        state.identities.insert(identity.token.clone(), identity);
        self.persist_identities_locked(&state)
    }

    pub fn find_identity(&self, token: &str) -> Option<Identity> {
        self.state.lock().unwrap().identities.get(token).cloned()
    }

    pub fn submit_new_identity(&self, claim: NewIdentity) {
        let mut state = self.state.lock().unwrap();
        state.pending.insert(claim.token.clone(), claim);
    }

    pub fn pending_identities(&self) -> Vec<NewIdentity> {
        self.state.lock().unwrap().pending.values().cloned().collect()
    }

    /// Inserts/refreshes a session identity, evicting the oldest entry if
    /// this would exceed `SESSION_IDENTITY_MAX_ENTRIES`.
    pub fn upsert_session(&self, session: SessionIdentity) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if !state.sessions.contains_key(&session.token) {
            state.session_order.push(session.token.clone());
        }
        state.sessions.insert(session.token.clone(), session);

        while state.sessions.len() > SESSION_IDENTITY_MAX_ENTRIES {
            if state.session_order.is_empty() {
                break;
            }
            let oldest = state.session_order.remove(0);
            state.sessions.remove(&oldest);
        }
        self.persist_sessions_locked(&state)
    }

    pub fn find_session(&self, token: &str) -> Option<SessionIdentity> {
        self.state.lock().unwrap().sessions.get(token).cloned()
    }

    /// Drops sessions whose `onlinetime` has fallen outside the
    /// `ident_online_timeout` window, returning how many were removed.
    pub fn evict_inactive_sessions(&self, now: i64) -> Result<usize, Error> {
        let mut state = self.state.lock().unwrap();
        let stale: Vec<String> = state
            .sessions
            .iter()
            .filter(|(_, s)| !s.is_active(now))
            .map(|(token, _)| token.clone())
            .collect();
        for token in &stale {
            state.sessions.remove(token);
            state.session_order.retain(|t| t != token);
        }
        if !stale.is_empty() {
            self.persist_sessions_locked(&state)?;
        }
        Ok(stale.len())
    }

    fn persist_identities_locked(&self, state: &State) -> Result<(), Error> {
        let mut out = String::new();
        for ident in state.identities.values() {
            out.push_str(&encode_identity(ident));
            out.push('\n');
        }
        ub_tools::fs::replace_file(&self.server_idents_path, out.as_bytes(), true)
            .context("persisting server_idents.txt")
    }

    fn persist_sessions_locked(&self, state: &State) -> Result<(), Error> {
        let mut out = String::new();
        for token in &state.session_order {
            if let Some(session) = state.sessions.get(token) {
                out.push_str(&encode_session(session));
                out.push('\n');
            }
        }
        ub_tools::fs::replace_file(&self.session_idents_path, out.as_bytes(), true)
            .context("persisting session_idents.txt")
    }
}

/// `token\tfingerprint\tpubkey\tpubkey_ecdsa409k1` (`-` for absent).
fn encode_identity(ident: &Identity) -> String {
    format!(
        "{}\t{}\t{}\t{}",
        ident.token,
        ident.fingerprint,
        ident.pubkey,
        ident.pubkey_ecdsa409k1.as_deref().unwrap_or("-"),
    )
}

fn decode_identity(line: &str) -> Option<Identity> {
    let mut parts = line.splitn(4, '\t');
    let token = parts.next()?.to_string();
    let fingerprint = parts.next()?.to_string();
    let pubkey = parts.next()?.to_string();
    let pubkey_ecdsa409k1 = match parts.next() {
        Some("-") | None => None,
        Some(other) => Some(other.to_string()),
    };
    Some(Identity {
        token,
        fingerprint,
        pubkey,
        pubkey_ecdsa409k1,
    })
}

/// Adds `endpoint`, hex-encoded `secret_key`, and `onlinetime` after the
/// identity fields.
fn encode_session(session: &SessionIdentity) -> String {
    format!(
        "{}\t{}\t{}\t{}\t{}\t{}\t{}",
        session.token,
        session.fingerprint,
        session.pubkey,
        session.pubkey_ecdsa409k1.as_deref().unwrap_or("-"),
        session.endpoint,
        hex::encode(&session.secret_key),
        session.onlinetime,
    )
}

fn decode_session(line: &str) -> Option<SessionIdentity> {
    let mut parts = line.splitn(7, '\t');
    let token = parts.next()?.to_string();
    let fingerprint = parts.next()?.to_string();
    let pubkey = parts.next()?.to_string();
    let pubkey_ecdsa409k1 = match parts.next() {
        Some("-") | None => None,
        Some(other) => Some(other.to_string()),
    };
    let endpoint = parts.next()?.to_string();
    let secret_key = hex::decode(parts.next()?).ok()?;
    let onlinetime = parts.next()?.parse().ok()?;
    Some(SessionIdentity {
        token,
        fingerprint,
        pubkey,
        pubkey_ecdsa409k1,
        endpoint,
        secret_key,
        onlinetime,
    })
}

fn load_identities(path: &Path) -> Result<HashMap<String, Identity>, Error> {
    let mut map = HashMap::new();
    let Ok(contents) = fs::read_to_string(path) else {
        return Ok(map);
    };
    for line in contents.lines().filter(|l| !l.is_empty()) {
        if let Some(ident) = decode_identity(line) {
            map.insert(ident.token.clone(), ident);
        }
    }
    Ok(map)
}

fn load_sessions(path: &Path) -> Result<(Vec<String>, HashMap<String, SessionIdentity>), Error> {
    let mut order = Vec::new();
    let mut map = HashMap::new();
    let Ok(contents) = fs::read_to_string(path) else {
        return Ok((order, map));
    };
    for line in contents.lines().filter(|l| !l.is_empty()) {
        if let Some(session) = decode_session(line) {
            order.push(session.token.clone());
            map.insert(session.token.clone(), session);
        }
    }
    Ok((order, map))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_session(token: &str, onlinetime: i64) -> SessionIdentity {
        SessionIdentity {
            token: token.to_string(),
            fingerprint: "fp".into(),
            pubkey: "pk".into(),
            pubkey_ecdsa409k1: None,
            endpoint: "10.0.0.1:1234".into(),
            secret_key: vec![1, 2, 3, 4],
            onlinetime,
        }
    }

    #[test]
    fn identities_persist_and_reload() {
        let dir = tempdir().unwrap();
        let server_path = dir.path().join("server_idents.txt");
        let session_path = dir.path().join("session_idents.txt");

        {
            let store = IdentityStore::open(&server_path, &session_path).unwrap();
            store
                .confirm_identity(Identity {
                    token: "tok-1".into(),
                    fingerprint: "aa:bb".into(),
                    pubkey: "pubkeydata".into(),
                    pubkey_ecdsa409k1: Some("ecdsa".into()),
                })
                .unwrap();
        }

        let reopened = IdentityStore::open(&server_path, &session_path).unwrap();
        let ident = reopened.find_identity("tok-1").unwrap();
        assert_eq!(ident.fingerprint, "aa:bb");
        assert_eq!(ident.pubkey_ecdsa409k1.as_deref(), Some("ecdsa"));
    }

    #[test]
    fn session_store_evicts_oldest_beyond_capacity() {
        let dir = tempdir().unwrap();
        let store = IdentityStore::open(
            &dir.path().join("server_idents.txt"),
            &dir.path().join("session_idents.txt"),
        )
        .unwrap();

        store.upsert_session(sample_session("first", 1)).unwrap();
        for i in 0..SESSION_IDENTITY_MAX_ENTRIES {
            store
                .upsert_session(sample_session(&format!("gen-{i}"), 2))
                .unwrap();
        }

        assert!(store.find_session("first").is_none());
        assert!(store.find_session("gen-0").is_some());
    }

    #[test]
    fn evict_inactive_sessions_removes_stale_entries() {
        let dir = tempdir().unwrap();
        let store = IdentityStore::open(
            &dir.path().join("server_idents.txt"),
            &dir.path().join("session_idents.txt"),
        )
        .unwrap();
        store.upsert_session(sample_session("stale", 0)).unwrap();
        store.upsert_session(sample_session("fresh", 10_000)).unwrap();

        let removed = store.evict_inactive_sessions(10_000).unwrap();
        assert_eq!(removed, 1);
        assert!(store.find_session("stale").is_none());
        assert!(store.find_session("fresh").is_some());
    }
}
