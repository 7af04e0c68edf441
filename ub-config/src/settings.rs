//! `backup_server_settings.db`: process-wide tunables, persisted as a
//! flat key/value table in SQLite. Grounded on `pbs-config`'s
//! typed-accessor-over-cache shape, adapted from its own section-file
//! config layer to a SQLite-backed settings table.

use anyhow::{Context, Error};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Mutex;

/// One process-wide settings snapshot. Cheap to clone; `Settings::load`
/// re-reads the DB, matching `ConfigVersionCache`'s "reload on demand,
/// cache in between" pattern without needing a generation counter for
/// this simpler, single-writer use case.
#[derive(Debug, Clone, PartialEq)]
pub struct Tunables {
    pub shadowcopy_timeout_secs: i64,
    pub shadowcopy_startnew_timeout_secs: i64,
    pub max_file_buffer_size_bytes: u64,
    pub file_buffer_commit_interval_secs: i64,
    pub update_stats_cachesize_bytes: u64,
    pub max_sim_backups: u32,
    pub max_active_clients: u32,
    pub max_running_jobs_per_client: u32,
    pub client_hash_threads: u32,
    pub max_queue_size: usize,
    pub chunkhash_size: usize,
    pub sector_size: usize,
    pub verify_using_client_hashes: bool,
    pub save_incomplete_file: bool,
    pub allow_restart: bool,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            shadowcopy_timeout_secs: 7 * 24 * 3600,
            shadowcopy_startnew_timeout_secs: 55 * 60,
            max_file_buffer_size_bytes: 4 * 1024 * 1024,
            file_buffer_commit_interval_secs: 120,
            update_stats_cachesize_bytes: 200 * 1024 * 1024,
            max_sim_backups: 10,
            max_active_clients: 10000,
            max_running_jobs_per_client: 1,
            client_hash_threads: 1,
            max_queue_size: 500,
            chunkhash_size: 32,
            sector_size: 4096,
            verify_using_client_hashes: false,
            save_incomplete_file: true,
            allow_restart: true,
        }
    }
}

pub struct Settings {
    conn: Mutex<Connection>,
}

impl Settings {
    pub fn open(path: &Path) -> Result<Self, Error> {
        let conn = Connection::open(path)
            .with_context(|| format!("opening settings db {path:?}"))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, Error> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn set_raw(&self, key: &str, value: &str) -> Result<(), Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    fn get_raw(&self, key: &str) -> Result<Option<String>, Error> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT value FROM settings WHERE key = ?1")?;
        let mut rows = stmt.query(params![key])?;
        if let Some(row) = rows.next()? {
            Ok(Some(row.get(0)?))
        } else {
            Ok(None)
        }
    }

    /// Loads the full tunable set, falling back field-by-field to
    /// `Tunables::default()` for anything not yet persisted.
    pub fn load(&self) -> Result<Tunables, Error> {
        let defaults = Tunables::default();
        Ok(Tunables {
            shadowcopy_timeout_secs: self.get_i64("shadowcopy_timeout_secs", defaults.shadowcopy_timeout_secs)?,
            shadowcopy_startnew_timeout_secs: self
                .get_i64("shadowcopy_startnew_timeout_secs", defaults.shadowcopy_startnew_timeout_secs)?,
            max_file_buffer_size_bytes: self
                .get_u64("max_file_buffer_size_bytes", defaults.max_file_buffer_size_bytes)?,
            file_buffer_commit_interval_secs: self.get_i64(
                "file_buffer_commit_interval_secs",
                defaults.file_buffer_commit_interval_secs,
            )?,
            update_stats_cachesize_bytes: self
                .get_u64("update_stats_cachesize_bytes", defaults.update_stats_cachesize_bytes)?,
            max_sim_backups: self.get_u32("max_sim_backups", defaults.max_sim_backups)?,
            max_active_clients: self.get_u32("max_active_clients", defaults.max_active_clients)?,
            max_running_jobs_per_client: self
                .get_u32("max_running_jobs_per_client", defaults.max_running_jobs_per_client)?,
            client_hash_threads: self.get_u32("client_hash_threads", defaults.client_hash_threads)?,
            max_queue_size: self.get_u32("max_queue_size", defaults.max_queue_size as u32)? as usize,
            chunkhash_size: self.get_u32("chunkhash_size", defaults.chunkhash_size as u32)? as usize,
            sector_size: self.get_u32("sector_size", defaults.sector_size as u32)? as usize,
            verify_using_client_hashes: self
                .get_bool("verify_using_client_hashes", defaults.verify_using_client_hashes)?,
            save_incomplete_file: self.get_bool("save_incomplete_file", defaults.save_incomplete_file)?,
            allow_restart: self.get_bool("allow_restart", defaults.allow_restart)?,
        })
    }

    pub fn store(&self, tunables: &Tunables) -> Result<(), Error> {
        self.set_raw("shadowcopy_timeout_secs", &tunables.shadowcopy_timeout_secs.to_string())?;
        self.set_raw(
            "shadowcopy_startnew_timeout_secs",
            &tunables.shadowcopy_startnew_timeout_secs.to_string(),
        )?;
        self.set_raw(
            "max_file_buffer_size_bytes",
            &tunables.max_file_buffer_size_bytes.to_string(),
        )?;
        self.set_raw(
            "file_buffer_commit_interval_secs",
            &tunables.file_buffer_commit_interval_secs.to_string(),
        )?;
        self.set_raw(
            "update_stats_cachesize_bytes",
            &tunables.update_stats_cachesize_bytes.to_string(),
        )?;
        self.set_raw("max_sim_backups", &tunables.max_sim_backups.to_string())?;
        self.set_raw("max_active_clients", &tunables.max_active_clients.to_string())?;
        self.set_raw(
            "max_running_jobs_per_client",
            &tunables.max_running_jobs_per_client.to_string(),
        )?;
        self.set_raw("client_hash_threads", &tunables.client_hash_threads.to_string())?;
        self.set_raw("max_queue_size", &tunables.max_queue_size.to_string())?;
        self.set_raw("chunkhash_size", &tunables.chunkhash_size.to_string())?;
        self.set_raw("sector_size", &tunables.sector_size.to_string())?;
        self.set_raw(
            "verify_using_client_hashes",
            &tunables.verify_using_client_hashes.to_string(),
        )?;
        self.set_raw("save_incomplete_file", &tunables.save_incomplete_file.to_string())?;
        self.set_raw("allow_restart", &tunables.allow_restart.to_string())?;
        Ok(())
    }

    fn get_i64(&self, key: &str, default: i64) -> Result<i64, Error> {
        Ok(match self.get_raw(key)? {
            Some(v) => v.parse()?,
            None => default,
        })
    }

    fn get_u64(&self, key: &str, default: u64) -> Result<u64, Error> {
        Ok(match self.get_raw(key)? {
            Some(v) => v.parse()?,
            None => default,
        })
    }

    fn get_u32(&self, key: &str, default: u32) -> Result<u32, Error> {
        Ok(match self.get_raw(key)? {
            Some(v) => v.parse()?,
            None => default,
        })
    }

    fn get_bool(&self, key: &str, default: bool) -> Result<bool, Error> {
        Ok(match self.get_raw(key)? {
            Some(v) => v.parse()?,
            None => default,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_falls_back_to_defaults() {
        let settings = Settings::open_in_memory().unwrap();
        let tunables = settings.load().unwrap();
        assert_eq!(tunables, Tunables::default());
    }

    #[test]
    fn store_then_load_roundtrips() {
        let settings = Settings::open_in_memory().unwrap();
        let mut tunables = Tunables::default();
        tunables.max_sim_backups = 42;
        tunables.save_incomplete_file = false;
        settings.store(&tunables).unwrap();
        assert_eq!(settings.load().unwrap(), tunables);
    }
}
