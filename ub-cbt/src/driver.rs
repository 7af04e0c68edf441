//! `CbtDriver`: the platform ioctl surface, abstracted. Real
//! backends (Windows `IOCTL_URBCT_*`, Linux datto, Linux dm-era)
//! are out of this tree's scope, same as `SnapshotDriver` in
//! `ub-snapshot`; what lives here is the seam the CBT engine drives.

use ub_api_types::protocol::CbtType;

use crate::error::CbtError;

pub trait CbtDriver: Send + Sync {
    fn cbt_type(&self) -> CbtType;

    /// Acquires the cross-process `cbt_mutex` and resets the kernel's
    /// change bitmap for `volume` so tracking starts fresh for this run.
    fn reset_start(&self, volume: &str) -> Result<(), CbtError>;

    /// Reads the kernel's raw bitmap bytes (sectored, magic-prefixed,
    /// undecoded) for `volume`.
    fn retrieve_bitmap(&self, volume: &str) -> Result<Vec<u8>, CbtError>;

    /// Reads the bitmap the shadow copy captured of its own changes
    /// while it was being created (`IOCTL_URBCT_APPLY_BITMAP`).
    fn apply_bitmap(&self, volume: &str) -> Result<Vec<u8>, CbtError>;

    /// Releases the cross-process mutex and lets the kernel resume
    /// normal tracking.
    fn reset_finish(&self, volume: &str) -> Result<(), CbtError>;

    /// Reengages tracking from scratch: the next bitmap for `volume`
    /// should report every block as changed. Used by `disableCbt`.
    fn mark_all(&self, volume: &str) -> Result<(), CbtError>;
}
