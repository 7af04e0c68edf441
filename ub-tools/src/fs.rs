//! Atomic filesystem helpers, grounded on
//! `pbs-datastore::chunk_store::ChunkStore::insert_chunk`'s
//! write-to-temp-then-rename approach and the `<name>.new -> <name>`
//! link-journal convention it uses for hardlinked chunks.

use anyhow::{Context, Error};
use std::fs::{self, File};
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::Path;

/// Writes `data` to a `.new` sibling of `path` then renames it into
/// place, fsyncing the directory when `fsync` is requested. SQLite
/// write transactions aside, CAS writes rely on atomic rename rather
/// than a lock.
pub fn replace_file(path: &Path, data: &[u8], fsync: bool) -> Result<(), Error> {
    let tmp_path = tmp_sibling(path);
    {
        let mut f = File::create(&tmp_path)
            .with_context(|| format!("creating temp file {tmp_path:?}"))?;
        f.write_all(data)?;
        f.sync_all()?;
    }
    fs::rename(&tmp_path, path)
        .with_context(|| format!("renaming {tmp_path:?} -> {path:?}"))?;

    if fsync {
        if let Some(parent) = path.parent() {
            let dir = File::open(parent)?;
            nix::unistd::fsync(dir.as_raw_fd())?;
        }
    }
    Ok(())
}

fn tmp_sibling(path: &Path) -> std::path::PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".new");
    path.with_file_name(name)
}

/// Updates only the access time of `path` to now, used by C1's
/// hardlink-reuse path to keep GC-style atime bookkeeping honest even
/// though this engine has no GC of its own (mirrors
/// `ChunkStore::cond_touch_path`).
pub fn touch_atime(path: &Path) -> Result<(), Error> {
    const UTIME_NOW: i64 = (1 << 30) - 1;
    const UTIME_OMIT: i64 = (1 << 30) - 2;

    let times: [libc::timespec; 2] = [
        libc::timespec {
            tv_sec: 0,
            tv_nsec: UTIME_NOW,
        },
        libc::timespec {
            tv_sec: 0,
            tv_nsec: UTIME_OMIT,
        },
    ];

    use nix::NixPath;
    let res = path.with_nix_path(|cstr| unsafe {
        let rc = libc::utimensat(-1, cstr.as_ptr(), &times[0], libc::AT_SYMLINK_NOFOLLOW);
        nix::errno::Errno::result(rc)
    })?;
    res.with_context(|| format!("updating atime of {path:?}"))?;
    Ok(())
}

/// Hole-punches `len` bytes at `offset` in `path`, falling back to
/// writing zero bytes when the filesystem doesn't support
/// `fallocate(FALLOC_FL_PUNCH_HOLE)`. Used for CBT zeroing and sparse
/// extent materialisation.
pub fn punch_hole_or_zero(file: &File, offset: u64, len: u64) -> Result<(), Error> {
    let fd = file.as_raw_fd();
    let rc = unsafe {
        libc::fallocate(
            fd,
            libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
            offset as libc::off_t,
            len as libc::off_t,
        )
    };
    if rc == 0 {
        return Ok(());
    }

    // Fall back: overwrite with zeroes (e.g. filesystem doesn't support
    // hole punching).
    let zeroes = vec![0u8; len as usize];
    nix::sys::uio::pwrite(fd, &zeroes, offset as i64)
        .with_context(|| "zero-filling fallback for punch_hole")?;
    Ok(())
}

/// Creates every ancestor directory of `path` (not `path` itself),
/// matching the `create_path` helper used before placing a
/// file into the CAS tree.
pub fn create_parent_dirs(path: &Path) -> Result<(), Error> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating directory tree {parent:?}"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn replace_file_is_atomic_and_visible() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data");
        replace_file(&path, b"hello", false).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"hello");
        replace_file(&path, b"world!", false).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"world!");
        assert!(!dir.path().join("data.new").exists());
    }

    #[test]
    fn create_parent_dirs_builds_tree() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("a/b/c/file");
        create_parent_dirs(&nested).unwrap();
        assert!(dir.path().join("a/b/c").is_dir());
    }
}
