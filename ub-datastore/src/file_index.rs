//! File Index (C2): durable `(shahash, size, clientid, tgroup) ->
//! hardlink-master` map with an insertion-order chain per key, backed by
//! SQLite. `pbs-datastore` keeps its own chunk index as a flat
//! directory tree rather than a database; this map calls for lookup by
//! a composite key with ordered chains, which a small `rusqlite` table
//! fits more directly.

use anyhow::{Context, Error};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use ub_api_types::file_entry::{FileEntry, IndexKey};
use ub_api_types::TGroup;

pub struct FileIndex {
    conn: Mutex<Connection>,
    /// Bytes buffered since the last commit; batches writes per the
    /// `max_file_buffer_size` / `file_buffer_commit_interval` policy.
    pending_bytes: Mutex<(u64, Instant)>,
    max_buffer_bytes: u64,
    commit_interval: Duration,
}

impl FileIndex {
    pub fn open(path: &Path, max_buffer_bytes: u64, commit_interval_secs: i64) -> Result<Self, Error> {
        let conn = Connection::open(path).with_context(|| format!("opening file index {path:?}"))?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            pending_bytes: Mutex::new((0, Instant::now())),
            max_buffer_bytes,
            commit_interval: Duration::from_secs(commit_interval_secs.max(0) as u64),
        })
    }

    pub fn open_in_memory() -> Result<Self, Error> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            pending_bytes: Mutex::new((0, Instant::now())),
            max_buffer_bytes: 4 * 1024 * 1024,
            commit_interval: Duration::from_secs(120),
        })
    }

    fn init_schema(conn: &Connection) -> Result<(), Error> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS file_entries (
                id INTEGER PRIMARY KEY,
                backupid INTEGER NOT NULL,
                path TEXT NOT NULL,
                hashpath TEXT NOT NULL,
                shahash BLOB NOT NULL,
                size INTEGER NOT NULL,
                rsize INTEGER NOT NULL,
                clientid INTEGER NOT NULL,
                tgroup INTEGER NOT NULL,
                incremental INTEGER NOT NULL,
                next_entry INTEGER NOT NULL DEFAULT 0,
                prev_entry INTEGER NOT NULL DEFAULT 0,
                pointed_to INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS files_dedup_key
                ON file_entries (shahash, size, clientid, tgroup);
            CREATE INDEX IF NOT EXISTS files_backupid
                ON file_entries (backupid);",
        )?;
        Ok(())
    }

    /// Idempotent insert: if `entry.key()` already has a chain,
    /// the new row is appended to the tail; otherwise it becomes the
    /// chain's sole entry and its master (`pointed_to = 1`).
    pub fn insert(&self, mut entry: FileEntry) -> Result<FileEntry, Error> {
        let conn = self.conn.lock().unwrap();
        let key = entry.key();

        let tail_id: Option<i64> = conn
            .query_row(
                "SELECT id FROM file_entries
                 WHERE shahash = ?1 AND size = ?2 AND clientid = ?3 AND tgroup = ?4 AND next_entry = 0",
                params![&key.shahash, key.size as i64, key.clientid, key.tgroup],
                |row| row.get(0),
            )
            .optional()?;

        match tail_id {
            Some(tail) => {
                entry.prev_entry = tail;
                entry.next_entry = 0;
                entry.pointed_to = false;
            }
            None => {
                entry.prev_entry = 0;
                entry.next_entry = 0;
                entry.pointed_to = true;
            }
        }

        conn.execute(
            "INSERT INTO file_entries
                (backupid, path, hashpath, shahash, size, rsize, clientid, tgroup, incremental,
                 next_entry, prev_entry, pointed_to)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                entry.backupid,
                entry.path,
                entry.hashpath,
                &entry.shahash,
                entry.size as i64,
                entry.rsize,
                entry.clientid,
                entry.tgroup,
                entry.incremental,
                entry.next_entry,
                entry.prev_entry,
                entry.pointed_to as i64,
            ],
        )?;
        entry.id = conn.last_insert_rowid();

        if let Some(tail) = tail_id {
            conn.execute(
                "UPDATE file_entries SET next_entry = ?1 WHERE id = ?2",
                params![entry.id, tail],
            )?;
        }

        drop(conn);
        self.note_write(entry.size)?;
        Ok(entry)
    }

    pub fn find_master(&self, key: &IndexKey) -> Result<Option<FileEntry>, Error> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, backupid, path, hashpath, shahash, size, rsize, clientid, tgroup,
                    incremental, next_entry, prev_entry, pointed_to
             FROM file_entries
             WHERE shahash = ?1 AND size = ?2 AND clientid = ?3 AND tgroup = ?4 AND pointed_to = 1",
            params![&key.shahash, key.size as i64, key.clientid, key.tgroup],
            Self::row_to_entry,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn get(&self, id: i64) -> Result<Option<FileEntry>, Error> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, backupid, path, hashpath, shahash, size, rsize, clientid, tgroup,
                    incremental, next_entry, prev_entry, pointed_to
             FROM file_entries WHERE id = ?1",
            params![id],
            Self::row_to_entry,
        )
        .optional()
        .map_err(Into::into)
    }

    /// Removes `entry` from its chain: its neighbours are
    /// re-linked, and if it was the master, `next_entry` (or none)
    /// becomes the new master. The caller is responsible for the
    /// matching physical unlink in the CAS within the same logical
    /// operation.
    pub fn evict(&self, entry_id: i64) -> Result<(), Error> {
        let conn = self.conn.lock().unwrap();
        let Some(entry) = conn
            .query_row(
                "SELECT id, backupid, path, hashpath, shahash, size, rsize, clientid, tgroup,
                        incremental, next_entry, prev_entry, pointed_to
                 FROM file_entries WHERE id = ?1",
                params![entry_id],
                Self::row_to_entry,
            )
            .optional()?
        else {
            return Ok(());
        };

        if entry.prev_entry != 0 {
            conn.execute(
                "UPDATE file_entries SET next_entry = ?1 WHERE id = ?2",
                params![entry.next_entry, entry.prev_entry],
            )?;
        }
        if entry.next_entry != 0 {
            conn.execute(
                "UPDATE file_entries SET prev_entry = ?1 WHERE id = ?2",
                params![entry.prev_entry, entry.next_entry],
            )?;
            if entry.pointed_to {
                conn.execute(
                    "UPDATE file_entries SET pointed_to = 1 WHERE id = ?1",
                    params![entry.next_entry],
                )?;
            }
        }

        conn.execute("DELETE FROM file_entries WHERE id = ?1", params![entry_id])?;
        Ok(())
    }

    pub fn count_for_group(&self, tgroup: TGroup) -> Result<i64, Error> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT COUNT(*) FROM file_entries WHERE tgroup = ?1",
            params![tgroup],
            |row| row.get(0),
        )
        .map_err(Into::into)
    }

    /// Tracks whether the write-buffer threshold (`max_file_buffer_size`
    /// or `file_buffer_commit_interval`) has been crossed. SQLite
    /// autocommits each statement here, so this is bookkeeping for
    /// callers batching many inserts inside an explicit transaction;
    /// colocated with the index rather than the pipeline since it's the
    /// index's own documented flush policy.
    fn note_write(&self, size: u64) -> Result<(), Error> {
        let mut guard = self.pending_bytes.lock().unwrap();
        guard.0 += size;
        if guard.0 >= self.max_buffer_bytes || guard.1.elapsed() >= self.commit_interval {
            guard.0 = 0;
            guard.1 = Instant::now();
        }
        Ok(())
    }

    fn row_to_entry(row: &rusqlite::Row) -> rusqlite::Result<FileEntry> {
        let size: i64 = row.get(5)?;
        Ok(FileEntry {
            id: row.get(0)?,
            backupid: row.get(1)?,
            path: row.get(2)?,
            hashpath: row.get(3)?,
            shahash: row.get(4)?,
            size: size as u64,
            rsize: row.get(6)?,
            clientid: row.get(7)?,
            tgroup: row.get(8)?,
            incremental: row.get(9)?,
            next_entry: row.get(10)?,
            prev_entry: row.get(11)?,
            pointed_to: row.get::<_, i64>(12)? != 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(backupid: i64, shahash: &[u8], size: u64, clientid: i64, tgroup: TGroup) -> FileEntry {
        FileEntry {
            id: 0,
            backupid,
            path: format!("/backups/c{clientid}/{backupid}/f"),
            hashpath: format!("/backups/c{clientid}/{backupid}/f.hash"),
            shahash: shahash.to_vec(),
            size,
            rsize: size as i64,
            clientid,
            tgroup,
            incremental: false,
            next_entry: 0,
            prev_entry: 0,
            pointed_to: false,
        }
    }

    #[test]
    fn first_insert_becomes_master() {
        let idx = FileIndex::open_in_memory().unwrap();
        let e = idx.insert(entry(1, b"H1", 4096, 10, 0)).unwrap();
        assert!(e.pointed_to);

        let master = idx
            .find_master(&IndexKey {
                shahash: b"H1".to_vec(),
                size: 4096,
                clientid: 10,
                tgroup: 0,
            })
            .unwrap()
            .unwrap();
        assert_eq!(master.id, e.id);
    }

    #[test]
    fn second_insert_appends_to_tail_without_becoming_master() {
        let idx = FileIndex::open_in_memory().unwrap();
        let first = idx.insert(entry(1, b"H1", 4096, 10, 0)).unwrap();
        let second = idx.insert(entry(2, b"H1", 4096, 10, 0)).unwrap();

        assert!(!second.pointed_to);
        assert_eq!(second.prev_entry, first.id);

        let first_reloaded = idx.get(first.id).unwrap().unwrap();
        assert_eq!(first_reloaded.next_entry, second.id);
    }

    #[test]
    fn evicting_master_promotes_next_entry() {
        let idx = FileIndex::open_in_memory().unwrap();
        let first = idx.insert(entry(1, b"H1", 4096, 10, 0)).unwrap();
        let second = idx.insert(entry(2, b"H1", 4096, 10, 0)).unwrap();

        idx.evict(first.id).unwrap();

        let master = idx
            .find_master(&IndexKey {
                shahash: b"H1".to_vec(),
                size: 4096,
                clientid: 10,
                tgroup: 0,
            })
            .unwrap()
            .unwrap();
        assert_eq!(master.id, second.id);
        assert_eq!(master.prev_entry, 0);
    }
}
