//! The per-volume prepare/finish protocol and the `disableCbt`
//! failure path that any step of it falls back to.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use ub_api_types::BackupError;
use ub_tools::fs::create_parent_dirs;

use crate::bitmap::CbtBitmap;
use crate::driver::CbtDriver;
use crate::error::CbtError;
use crate::hashstore::{zero_file_slots, zero_image_slots};

pub struct CbtEngine<D: CbtDriver> {
    driver: D,
    base_dir: PathBuf,
    sector_size: usize,
    chunkhash_size: usize,
}

impl<D: CbtDriver> CbtEngine<D> {
    pub fn new(driver: D, base_dir: impl Into<PathBuf>, sector_size: usize, chunkhash_size: usize) -> Self {
        CbtEngine {
            driver,
            base_dir: base_dir.into(),
            sector_size,
            chunkhash_size,
        }
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Resets tracking for `volume` before the snapshot is taken.
    pub fn prepare(&self, volume: &str) -> Result<(), BackupError> {
        self.driver.reset_start(volume).map_err(to_backup_error)
    }

    /// Image case: merges the kernel, shadow-copy, and
    /// cross-consumer bitmaps, zeroes every changed slot in
    /// `hdat_img_<vol>.dat`, stamps `shadow_id`, and finishes tracking.
    /// Any failure disables CBT for `volume` before the error is
    /// surfaced.
    pub fn finish_image(&self, volume: &str, volume_size: u64, shadow_id: u32) -> Result<CbtBitmap, BackupError> {
        self.finish_image_inner(volume, volume_size, shadow_id)
            .map_err(|err| self.fail(volume, err))
    }

    /// File case: same merge, then zeroes every changed
    /// (and newly-transitioned) slot in `hdat_file_<vol>.dat`.
    pub fn finish_file(&self, volume: &str, volume_size: u64) -> Result<CbtBitmap, BackupError> {
        self.finish_file_inner(volume, volume_size)
            .map_err(|err| self.fail(volume, err))
    }

    /// Renames both hash-data files to a random sibling
    /// name and deletes them, then reengages tracking. Best-effort —
    /// logged, not propagated, since this runs from an error path that
    /// already has its own error to report.
    pub fn disable_cbt(&self, volume: &str) {
        for path in [self.hdat_img_path(volume), self.hdat_file_path(volume)] {
            if let Err(err) = rename_then_delete(&path) {
                log::warn!("disableCbt: failed to remove {path:?}: {err}");
            }
        }
        if let Err(err) = self.driver.mark_all(volume) {
            log::warn!("disableCbt: failed to reengage driver for {volume}: {err}");
        }
    }

    fn fail(&self, volume: &str, err: CbtError) -> BackupError {
        log::warn!("cbt finish failed for {volume}, disabling cbt: {err}");
        self.disable_cbt(volume);
        to_backup_error(err)
    }

    fn finish_image_inner(&self, volume: &str, volume_size: u64, shadow_id: u32) -> Result<CbtBitmap, CbtError> {
        let (_primary, merged) = self.read_and_merge_bitmaps(volume, volume_size)?;

        let path = self.hdat_img_path(volume);
        create_parent_dirs(&path)?;
        let file = OpenOptions::new().create(true).read(true).write(true).open(&path)?;
        zero_image_slots(&file, shadow_id, &merged)?;
        file.sync_all()?;

        self.driver.reset_finish(volume)?;
        Ok(merged)
    }

    fn finish_file_inner(&self, volume: &str, volume_size: u64) -> Result<CbtBitmap, CbtError> {
        let (primary, merged) = self.read_and_merge_bitmaps(volume, volume_size)?;

        let path = self.hdat_file_path(volume);
        create_parent_dirs(&path)?;
        let file = OpenOptions::new().create(true).read(true).write(true).open(&path)?;
        zero_file_slots(&file, self.chunkhash_size, &primary, &merged)?;
        file.sync_all()?;

        self.driver.reset_finish(volume)?;
        Ok(merged)
    }

    /// Returns `(kernel bitmap, kernel ∪ shadow-copy ∪ cross-consumer)`.
    /// The caller needs both: the merged set drives zeroing, the
    /// unmerged kernel bitmap is the baseline `zero_file_slots` diffs
    /// against to find 0→1 transitions.
    fn read_and_merge_bitmaps(&self, volume: &str, volume_size: u64) -> Result<(CbtBitmap, CbtBitmap), CbtError> {
        let primary = CbtBitmap::decode(&self.driver.retrieve_bitmap(volume)?, self.sector_size)?;
        let shadow = CbtBitmap::decode(&self.driver.apply_bitmap(volume)?, self.sector_size)?;
        let other = self.read_hdat_other(volume, volume_size)?;

        let mut merged = primary.clone();
        merged.merge(&shadow);
        merged.merge(&other);
        Ok((primary, merged))
    }

    fn read_hdat_other(&self, volume: &str, volume_size: u64) -> Result<CbtBitmap, CbtError> {
        let path = self.hdat_other_path(volume);
        match std::fs::read(&path) {
            Ok(data) => CbtBitmap::decode(&data, self.sector_size),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(CbtBitmap::zeroed(volume_size)),
            Err(err) => Err(err.into()),
        }
    }

    fn hdat_img_path(&self, volume: &str) -> PathBuf {
        self.base_dir.join(format!("hdat_img_{}.dat", sanitize_volume_name(volume)))
    }

    fn hdat_file_path(&self, volume: &str) -> PathBuf {
        self.base_dir.join(format!("hdat_file_{}.dat", sanitize_volume_name(volume)))
    }

    fn hdat_other_path(&self, volume: &str) -> PathBuf {
        self.base_dir.join(format!("hdat_other_{}.cbt", sanitize_volume_name(volume)))
    }
}

fn to_backup_error(err: CbtError) -> BackupError {
    BackupError::Snapshot(err.to_string())
}

/// Mirrors `ub-datastore`'s `fix_filename_for_os`, restricted to the
/// handful of characters a volume identifier (drive letter, `/dev/...`
/// path, mountpoint) can contain.
fn sanitize_volume_name(volume: &str) -> String {
    volume
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn rename_then_delete(path: &Path) -> Result<(), CbtError> {
    if !path.exists() {
        return Ok(());
    }
    let mut tmp_name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    tmp_name.push(format!(".disabled-{:x}", rand::random::<u64>()));
    let tmp_path = path.with_file_name(tmp_name);

    std::fs::rename(path, &tmp_path)?;
    std::fs::remove_file(&tmp_path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use ub_api_types::protocol::{CBT_BLOCK_SIZE, CBT_SECTOR_MAGIC};

    struct FakeDriver {
        sector_size: usize,
        kernel: CbtBitmap,
        shadow: CbtBitmap,
        reset_finish_calls: Mutex<u32>,
        mark_all_calls: Mutex<u32>,
        fail_retrieve: bool,
    }

    impl FakeDriver {
        fn new(volume_size: u64, sector_size: usize) -> Self {
            FakeDriver {
                sector_size,
                kernel: CbtBitmap::zeroed(volume_size),
                shadow: CbtBitmap::zeroed(volume_size),
                reset_finish_calls: Mutex::new(0),
                mark_all_calls: Mutex::new(0),
                fail_retrieve: false,
            }
        }
    }

    impl CbtDriver for FakeDriver {
        fn cbt_type(&self) -> ub_api_types::protocol::CbtType {
            ub_api_types::protocol::CbtType::Datto
        }

        fn reset_start(&self, _volume: &str) -> Result<(), CbtError> {
            Ok(())
        }

        fn retrieve_bitmap(&self, _volume: &str) -> Result<Vec<u8>, CbtError> {
            if self.fail_retrieve {
                let mut garbage = self.kernel.encode(self.sector_size);
                garbage[16] ^= 0xff;
                return Ok(garbage);
            }
            Ok(self.kernel.encode(self.sector_size))
        }

        fn apply_bitmap(&self, _volume: &str) -> Result<Vec<u8>, CbtError> {
            Ok(self.shadow.encode(self.sector_size))
        }

        fn reset_finish(&self, _volume: &str) -> Result<(), CbtError> {
            *self.reset_finish_calls.lock().unwrap() += 1;
            Ok(())
        }

        fn mark_all(&self, _volume: &str) -> Result<(), CbtError> {
            *self.mark_all_calls.lock().unwrap() += 1;
            Ok(())
        }
    }

    #[test]
    fn finish_image_zeroes_changed_slots_and_writes_shadow_id() {
        let dir = tempfile::tempdir().unwrap();
        let volume_size = 4 * CBT_BLOCK_SIZE;
        let mut driver = FakeDriver::new(volume_size, 4096);
        driver.kernel.set(2);
        let engine = CbtEngine::new(driver, dir.path(), 4096, 32);

        let merged = engine.finish_image("C", volume_size, 42).unwrap();
        assert!(merged.is_set(2));

        let data = std::fs::read(dir.path().join("hdat_img_C.dat")).unwrap();
        assert_eq!(&data[0..4], &42u32.to_le_bytes());
        assert_eq!(*engine.driver().reset_finish_calls.lock().unwrap(), 1);
    }

    #[test]
    fn finish_file_over_zeroes_preceding_slot_on_transition() {
        let dir = tempfile::tempdir().unwrap();
        let volume_size = 4 * CBT_BLOCK_SIZE;
        let mut driver = FakeDriver::new(volume_size, 4096);
        // Unset in the kernel's own bitmap but set by the shadow copy's
        // self-reported bitmap: a 0->1 transition once merged, which
        // should over-zero the preceding slot too.
        driver.shadow.set(2);
        let engine = CbtEngine::new(driver, dir.path(), 4096, 32);

        let path = engine.hdat_file_path("C");
        create_parent_dirs(&path).unwrap();
        let entry_len = crate::hashstore::file_entry_len(32);
        std::fs::write(&path, vec![0xaa; (entry_len * 4) as usize]).unwrap();

        engine.finish_file("C", volume_size).unwrap();

        let data = std::fs::read(&path).unwrap();
        let slot1 = &data[entry_len as usize..(2 * entry_len) as usize];
        let slot2 = &data[(2 * entry_len) as usize..(3 * entry_len) as usize];
        assert!(slot1.iter().all(|&b| b == 0));
        assert!(slot2.iter().all(|&b| b == 0));
    }

    #[test]
    fn corrupted_bitmap_disables_cbt_and_returns_snapshot_error() {
        let dir = tempfile::tempdir().unwrap();
        let volume_size = 4 * CBT_BLOCK_SIZE;
        let mut driver = FakeDriver::new(volume_size, 4096);
        driver.fail_retrieve = true;
        let engine = CbtEngine::new(driver, dir.path(), 4096, 32);

        // Seed both hash-data files so disableCbt has something to remove.
        std::fs::write(engine.hdat_img_path("C"), b"stale").unwrap();
        std::fs::write(engine.hdat_file_path("C"), b"stale").unwrap();

        let err = engine.finish_image("C", volume_size, 1).unwrap_err();
        assert!(matches!(err, BackupError::Snapshot(_)));
        assert!(!engine.hdat_img_path("C").exists());
        assert!(!engine.hdat_file_path("C").exists());
        assert_eq!(*engine.driver().mark_all_calls.lock().unwrap(), 1);
    }

    #[test]
    fn sanitize_volume_name_strips_path_separators() {
        assert_eq!(sanitize_volume_name("/dev/sda1"), "_dev_sda1");
    }

    // Keep the magic constant's length in this module's expectations
    // honest if the shared constant ever changes shape.
    #[test]
    fn sector_magic_is_thirteen_bytes() {
        assert_eq!(CBT_SECTOR_MAGIC.len(), 13);
    }
}
