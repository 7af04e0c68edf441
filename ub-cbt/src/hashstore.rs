//! HashStore files: `hdat_img_<vol>.dat` (`[shadow_id:u32][sha256:32]*N`)
//! and `hdat_file_<vol>.dat` (`[u16 len][chunkhash:chunkhash_size]*N`).
//! Zeroing here is the CBT bitmap's whole reason to exist: a set bit
//! means "the block at this slot is stale, don't trust it for dedup
//! until it's rehashed."

use std::fs::File;
use std::os::unix::io::AsRawFd;

use ub_tools::fs::punch_hole_or_zero;

use crate::bitmap::CbtBitmap;
use crate::error::CbtError;

const IMG_HEADER_LEN: u64 = 4;
const IMG_SLOT_LEN: u64 = 32;

pub fn file_entry_len(chunkhash_size: usize) -> u64 {
    2 + chunkhash_size as u64
}

/// Zeroes (or hole-punches) the 32-byte SHA-256 slot for every block the
/// image backup's merged bitmap reports changed, then stamps the
/// current `shadow_id` at offset 0 during finish, image case.
pub fn zero_image_slots(file: &File, shadow_id: u32, changed: &CbtBitmap) -> Result<(), CbtError> {
    for block in changed.iter_set_blocks() {
        let offset = IMG_HEADER_LEN + block * IMG_SLOT_LEN;
        punch_hole_or_zero(file, offset, IMG_SLOT_LEN)?;
    }
    nix::sys::uio::pwrite(file.as_raw_fd(), &shadow_id.to_le_bytes(), 0i64)
        .map_err(|err| CbtError::Io(err.to_string()))?;
    Ok(())
}

/// Zeroes the chunkhash slot for every changed block in the file
/// backup's hash-data file, plus the preceding slot for blocks that
/// transitioned from unset to set relative to `primary` (the kernel's
/// own bitmap before merging in the shadow-copy and cross-consumer
/// bitmaps) — over-zeros by one to handle unaligned writes.
pub fn zero_file_slots(
    file: &File,
    chunkhash_size: usize,
    primary: &CbtBitmap,
    merged: &CbtBitmap,
) -> Result<(), CbtError> {
    let entry_len = file_entry_len(chunkhash_size);
    for block in merged.iter_set_blocks() {
        punch_hole_or_zero(file, block * entry_len, entry_len)?;

        if !primary.is_set(block) && block > 0 {
            punch_hole_or_zero(file, (block - 1) * entry_len, entry_len)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use std::io::{Read, Seek, SeekFrom};
    use ub_api_types::protocol::CBT_BLOCK_SIZE;

    fn scratch_file(len: u64) -> (tempfile::TempDir, File) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hdat.dat");
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        file.set_len(len).unwrap();
        (dir, file)
    }

    #[test]
    fn zero_image_slots_writes_shadow_id_and_zeroes_changed_slot() {
        let (_dir, mut file) = scratch_file(IMG_HEADER_LEN + 4 * IMG_SLOT_LEN);
        {
            use std::io::Write;
            file.seek(SeekFrom::Start(IMG_HEADER_LEN + IMG_SLOT_LEN)).unwrap();
            file.write_all(&[0xaa; IMG_SLOT_LEN as usize]).unwrap();
        }

        let mut bm = CbtBitmap::zeroed(4 * CBT_BLOCK_SIZE);
        bm.set(1);
        zero_image_slots(&file, 7, &bm).unwrap();

        let mut buf = vec![0u8; (IMG_HEADER_LEN + 4 * IMG_SLOT_LEN) as usize];
        file.seek(SeekFrom::Start(0)).unwrap();
        let mut f = &file;
        f.read_exact(&mut buf).unwrap();

        assert_eq!(&buf[0..4], &7u32.to_le_bytes());
        let slot1 = &buf[(IMG_HEADER_LEN + IMG_SLOT_LEN) as usize..(IMG_HEADER_LEN + 2 * IMG_SLOT_LEN) as usize];
        assert!(slot1.iter().all(|&b| b == 0));
    }

    #[test]
    fn zero_file_slots_also_zeroes_preceding_slot_on_transition() {
        let chunkhash_size = 32;
        let entry_len = file_entry_len(chunkhash_size);
        let (_dir, mut file) = scratch_file(entry_len * 4);
        {
            use std::io::Write;
            file.seek(SeekFrom::Start(0)).unwrap();
            file.write_all(&vec![0xaa; (entry_len * 4) as usize]).unwrap();
        }

        let primary = CbtBitmap::zeroed(4 * CBT_BLOCK_SIZE);
        let mut merged = primary.clone();
        merged.set(2);

        zero_file_slots(&file, chunkhash_size, &primary, &merged).unwrap();

        let mut buf = vec![0u8; (entry_len * 4) as usize];
        file.seek(SeekFrom::Start(0)).unwrap();
        let mut f = &file;
        f.read_exact(&mut buf).unwrap();

        let slot1 = &buf[entry_len as usize..(2 * entry_len) as usize];
        let slot2 = &buf[(2 * entry_len) as usize..(3 * entry_len) as usize];
        assert!(slot1.iter().all(|&b| b == 0), "preceding slot must be zeroed on transition");
        assert!(slot2.iter().all(|&b| b == 0), "the block's own slot must be zeroed");
    }
}
