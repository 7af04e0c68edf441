//! `FileEntry` — one file observed in the CAS index, plus the
//! doubly-linked chain that orders entries sharing a `(shahash, size,
//! clientid, tgroup)` key by insertion order.

use crate::TGroup;
use serde::{Deserialize, Serialize};

/// The dedup key: exactly one `FileEntry` per chain has `pointed_to = true`
/// and holds the physical data; every other entry in the chain is a
/// hardlink of it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexKey {
    pub shahash: Vec<u8>,
    pub size: u64,
    pub clientid: i64,
    pub tgroup: TGroup,
}

impl IndexKey {
    pub fn new(shahash: impl Into<Vec<u8>>, size: u64, clientid: i64, tgroup: TGroup) -> Self {
        Self {
            shahash: shahash.into(),
            size,
            clientid,
            tgroup,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    pub id: i64,
    pub backupid: i64,
    pub path: String,
    pub hashpath: String,
    pub shahash: Vec<u8>,
    pub size: u64,
    /// On-disk delta relative to `size` (negative for reflink/hardlink
    /// reuse where no new bytes were written).
    pub rsize: i64,
    pub clientid: i64,
    pub tgroup: TGroup,
    pub incremental: bool,
    pub next_entry: i64,
    pub prev_entry: i64,
    pub pointed_to: bool,
}

impl FileEntry {
    pub fn key(&self) -> IndexKey {
        IndexKey::new(self.shahash.clone(), self.size, self.clientid, self.tgroup)
    }
}
