//! Content-Addressed Store (C1), File Index (C2), and Hash Pipeline (C3)
//! — the storage core every backup run feeds into.

pub mod archive;
pub mod cas;
pub mod file_index;
pub mod hash_pipeline;

pub use archive::{archive as archive_run, expire_timeouts, retention_candidates, unarchive};
pub use cas::{ContentStore, PlaceResult};
pub use file_index::FileIndex;
pub use hash_pipeline::{HashMethod, HashPipeline, PrepareResult};
