//! Client registry: identification, rename survival via `moved_clients`,
//! and the per-client schedule/backup-window used by C7's
//! Idle -> Backup transition.

use anyhow::{Context, Error};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use ub_api_types::client::{Capability, Client, ProtocolVersions};
use ub_api_types::ClientUid;

/// Weekly backup window: one bit per `(weekday, hour)` slot, `true`
/// meaning backups are allowed to start in that hour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackupWindow {
    bits: [bool; 7 * 24],
}

impl Default for BackupWindow {
    fn default() -> Self {
        // Open by default: a client with no configured window can always
        // be scheduled, matching the "missing config means permissive
        // default" convention of `pbs-config`'s cached getters.
        Self { bits: [true; 7 * 24] }
    }
}

impl BackupWindow {
    pub fn allows(&self, weekday: u8, hour: u8) -> bool {
        assert!(weekday < 7 && hour < 24);
        self.bits[weekday as usize * 24 + hour as usize]
    }

    pub fn set(&mut self, weekday: u8, hour: u8, allowed: bool) {
        assert!(weekday < 7 && hour < 24);
        self.bits[weekday as usize * 24 + hour as usize] = allowed;
    }

    pub fn to_bitstring(&self) -> String {
        self.bits.iter().map(|b| if *b { '1' } else { '0' }).collect()
    }

    pub fn from_bitstring(s: &str) -> Self {
        let mut window = BackupWindow { bits: [true; 7 * 24] };
        for (i, c) in s.chars().take(7 * 24).enumerate() {
            window.bits[i] = c == '1';
        }
        window
    }
}

/// Update-frequency schedule, one interval per `(kind, incr/full)`
/// combination, consulted for the per-client schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    pub update_freq_incr_file_secs: i64,
    pub update_freq_full_file_secs: i64,
    pub update_freq_incr_image_secs: i64,
    pub update_freq_full_image_secs: i64,
}

impl Default for Schedule {
    fn default() -> Self {
        Self {
            update_freq_incr_file_secs: 4 * 3600,
            update_freq_full_file_secs: 7 * 24 * 3600,
            update_freq_incr_image_secs: 24 * 3600,
            update_freq_full_image_secs: 30 * 24 * 3600,
        }
    }
}

pub struct ClientRegistry {
    conn: Mutex<Connection>,
}

impl ClientRegistry {
    pub fn open(path: &Path) -> Result<Self, Error> {
        let conn = Connection::open(path).with_context(|| format!("opening client db {path:?}"))?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, Error> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init_schema(conn: &Connection) -> Result<(), Error> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS clients (
                id INTEGER PRIMARY KEY,
                uid BLOB NOT NULL UNIQUE,
                name TEXT NOT NULL UNIQUE,
                group_id INTEGER NOT NULL DEFAULT 0,
                lastseen INTEGER NOT NULL DEFAULT 0,
                last_filebackup INTEGER,
                file_ok INTEGER NOT NULL DEFAULT 0,
                image_ok INTEGER NOT NULL DEFAULT 0,
                capabilities INTEGER NOT NULL DEFAULT 0,
                perm_uid TEXT
            );
            CREATE TABLE IF NOT EXISTS moved_clients (
                old_name TEXT NOT NULL,
                new_name TEXT NOT NULL,
                uid BLOB NOT NULL,
                moved_at INTEGER NOT NULL
            );",
        )?;
        Ok(())
    }

    /// Creates the client on first successful identification, or returns
    /// the existing row if `uid` is already known.
    pub fn get_or_create(&self, uid: ClientUid, name: &str, now: i64) -> Result<Client, Error> {
        let conn = self.conn.lock().unwrap();
        if let Some(client) = Self::find_by_uid_locked(&conn, uid)? {
            return Ok(client);
        }

        conn.execute(
            "INSERT INTO clients (uid, name, lastseen) VALUES (?1, ?2, ?3)",
            params![&uid[..], name, now],
        )?;
        let id = conn.last_insert_rowid();
        Ok(Client::new(id, uid, name.to_string(), 0))
    }

    fn find_by_uid_locked(conn: &Connection, uid: ClientUid) -> Result<Option<Client>, Error> {
        conn.query_row(
            "SELECT id, uid, name, group_id, lastseen, last_filebackup, file_ok, image_ok, capabilities, perm_uid
             FROM clients WHERE uid = ?1",
            params![&uid[..]],
            Self::row_to_client,
        )
        .optional()
        .map_err(Into::into)
    }

    fn row_to_client(row: &rusqlite::Row) -> rusqlite::Result<Client> {
        let uid_blob: Vec<u8> = row.get(1)?;
        let mut uid = [0u8; 16];
        uid[..uid_blob.len().min(16)].copy_from_slice(&uid_blob[..uid_blob.len().min(16)]);
        let caps: i64 = row.get(8)?;
        Ok(Client {
            id: row.get(0)?,
            uid,
            name: row.get(2)?,
            group_id: row.get(3)?,
            lastseen: row.get(4)?,
            last_filebackup: row.get(5)?,
            last_image_backup: Default::default(),
            file_ok: row.get::<_, i64>(6)? != 0,
            image_ok: row.get::<_, i64>(7)? != 0,
            capabilities: Capability(caps as u32),
            protocol_versions: ProtocolVersions::default(),
            perm_uid: row.get(9)?,
        })
    }

    pub fn find_by_name(&self, name: &str) -> Result<Option<Client>, Error> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, uid, name, group_id, lastseen, last_filebackup, file_ok, image_ok, capabilities, perm_uid
             FROM clients WHERE name = ?1",
            params![name],
            Self::row_to_client,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn update_lastseen(&self, client_id: i64, now: i64) -> Result<(), Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE clients SET lastseen = ?1 WHERE id = ?2",
            params![now, client_id],
        )?;
        Ok(())
    }

    /// Renames a client in place, recording the old name in
    /// `moved_clients` so operations referencing the stale name (e.g. an
    /// in-flight admin lookup) can still resolve it: identity survives
    /// a rename via the `moved_clients` table.
    pub fn rename_client(&self, uid: ClientUid, new_name: &str, now: i64) -> Result<(), Error> {
        let conn = self.conn.lock().unwrap();
        let old_name: Option<String> = conn
            .query_row(
                "SELECT name FROM clients WHERE uid = ?1",
                params![&uid[..]],
                |row| row.get(0),
            )
            .optional()?;

        let Some(old_name) = old_name else {
            return Err(anyhow::anyhow!("rename_client: unknown uid"));
        };
        if old_name == new_name {
            return Ok(());
        }

        conn.execute(
            "UPDATE clients SET name = ?1 WHERE uid = ?2",
            params![new_name, &uid[..]],
        )?;
        conn.execute(
            "INSERT INTO moved_clients (old_name, new_name, uid, moved_at) VALUES (?1, ?2, ?3, ?4)",
            params![old_name, new_name, &uid[..], now],
        )?;
        Ok(())
    }

    /// Resolves a possibly-stale client name through the `moved_clients`
    /// chain to the live current name.
    pub fn resolve_current_name(&self, name: &str) -> Result<String, Error> {
        let conn = self.conn.lock().unwrap();
        let mut current = name.to_string();
        // Bounded traversal: a rename chain longer than this is a config
        // bug, not something to loop on forever.
        for _ in 0..64 {
            let next: Option<String> = conn
                .query_row(
                    "SELECT new_name FROM moved_clients WHERE old_name = ?1 ORDER BY moved_at DESC LIMIT 1",
                    params![current],
                    |row| row.get(0),
                )
                .optional()?;
            match next {
                Some(n) if n != current => current = n,
                _ => break,
            }
        }
        Ok(current)
    }
}
