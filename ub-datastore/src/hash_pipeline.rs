//! Hash Pipeline (C3): prepare (chunk + hash) then commit
//! (dedup + place) stages connected by the caller, with a per-fingerprint
//! mutex enforcing "at-most-one concurrent build" so two files racing on
//! the same `(sha, size)` don't both write a fresh copy — the second one
//! to reach `commit` finds the first's result already indexed and links
//! to it. Grounded on `pbs-datastore`'s chunk-then-insert shape
//! (`chunk_store.rs`), adapted to fixed-size chunks and the two hash
//! methods a backup run can request.

use anyhow::Error;
use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use std::sync::{Arc, Mutex};
use ub_api_types::protocol::CHUNK_SIZE;
use ub_api_types::TGroup;
use ub_tools::crypto::{adler32, sha256_bytes, sha512_reader};

use crate::cas::{ContentStore, PlaceResult};
use crate::file_index::FileIndex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashMethod {
    /// Default for new file backups: content-defined chunk hashes
    /// folded into a Merkle tree root.
    TreeHash,
    /// Scripts/metadata: one SHA-512 over the whole stream, no sparse
    /// handling needed since these are never sparse.
    Sha512NoSparse,
}

#[derive(Debug, Clone, Copy)]
pub struct ChunkDigest {
    pub adler32: u32,
    pub sha256: [u8; 32],
}

pub struct PrepareResult {
    pub digest: Vec<u8>,
    pub size: u64,
    pub chunk_digests: Vec<ChunkDigest>,
}

/// Runs the prepare stage over `reader`. Sparse-hole skipping is
/// the caller's responsibility (extent iteration happens above this
/// layer, where the real file descriptor is available); this function
/// operates purely on the byte stream it's handed.
pub fn prepare(reader: &mut dyn Read, method: HashMethod) -> Result<PrepareResult, Error> {
    match method {
        HashMethod::Sha512NoSparse => {
            let (digest, size) = sha512_reader(reader)?;
            Ok(PrepareResult {
                digest: digest.to_vec(),
                size,
                chunk_digests: Vec::new(),
            })
        }
        HashMethod::TreeHash => prepare_tree_hash(reader),
    }
}

/// Splits the stream into fixed `CHUNK_SIZE` chunks at offsets
/// `idx*CHUNK_SIZE`, matching `ub_transfer::engine::ChunkSource::chunk_bytes`
/// exactly so a hash committed here for chunk `idx` still covers the same
/// bytes the transfer engine reads at that `idx` during a later chunked or
/// patch-mode fetch.
fn prepare_tree_hash(reader: &mut dyn Read) -> Result<PrepareResult, Error> {
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut chunk_digests = Vec::new();
    let mut total_size: u64 = 0;

    loop {
        let mut filled = 0;
        while filled < buf.len() {
            let n = reader.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            break;
        }
        chunk_digests.push(digest_chunk(&buf[..filled]));
        total_size += filled as u64;
        if filled < buf.len() {
            break;
        }
    }

    let root = merkle_root(&chunk_digests);
    Ok(PrepareResult {
        digest: root.to_vec(),
        size: total_size,
        chunk_digests,
    })
}

fn digest_chunk(chunk: &[u8]) -> ChunkDigest {
    ChunkDigest {
        adler32: adler32(chunk),
        sha256: sha256_bytes(chunk),
    }
}

/// Folds per-chunk SHA-256 digests into a binary Merkle tree root. An
/// odd one out at any level carries forward unchanged rather than being
/// duplicated, so the root for N=1 is just that chunk's own hash.
fn merkle_root(chunks: &[ChunkDigest]) -> [u8; 32] {
    if chunks.is_empty() {
        return sha256_bytes(&[]);
    }
    let mut level: Vec<[u8; 32]> = chunks.iter().map(|c| c.sha256).collect();
    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        let mut it = level.chunks(2);
        for pair in &mut it {
            if pair.len() == 2 {
                let mut buf = Vec::with_capacity(64);
                buf.extend_from_slice(&pair[0]);
                buf.extend_from_slice(&pair[1]);
                next.push(sha256_bytes(&buf));
            } else {
                next.push(pair[0]);
            }
        }
        level = next;
    }
    level[0]
}

/// Encodes the chunk-hash sidecar written next to a fresh CAS entry:
/// `[adler32:u32 LE][sha256:32]` per chunk.
pub fn encode_chunk_sidecar(chunks: &[ChunkDigest]) -> Vec<u8> {
    let mut out = Vec::with_capacity(chunks.len() * 36);
    for c in chunks {
        out.extend_from_slice(&c.adler32.to_le_bytes());
        out.extend_from_slice(&c.sha256);
    }
    out
}

type PendingKey = (Vec<u8>, u64, i64, TGroup);

pub struct HashPipeline {
    store: ContentStore,
    index: FileIndex,
    pending: Mutex<HashMap<PendingKey, Arc<Mutex<()>>>>,
}

impl HashPipeline {
    pub fn new(store: ContentStore, index: FileIndex) -> Self {
        Self {
            store,
            index,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn index(&self) -> &FileIndex {
        &self.index
    }

    pub fn store(&self) -> &ContentStore {
        &self.store
    }

    fn lock_for(&self, key: &PendingKey) -> Arc<Mutex<()>> {
        let mut pending = self.pending.lock().unwrap();
        pending.entry(key.clone()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    /// Commit stage: looks up the dedup key, places the bytes
    /// (linked/reflinked/fresh), inserts into the index, and writes the
    /// chunk-hash sidecar on a fresh placement.
    #[allow(clippy::too_many_arguments)]
    pub fn commit(
        &self,
        data: &[u8],
        rel_path: &Path,
        prepare: &PrepareResult,
        client: i64,
        tgroup: TGroup,
        backupid: i64,
        incremental: bool,
    ) -> Result<(ub_api_types::file_entry::FileEntry, PlaceResult), Error> {
        let key: PendingKey = (prepare.digest.clone(), prepare.size, client, tgroup);
        let fingerprint_lock = self.lock_for(&key);
        let _guard = fingerprint_lock.lock().unwrap();

        let sidecar = encode_chunk_sidecar(&prepare.chunk_digests);
        let result = self.store.place(
            &self.index,
            data,
            rel_path,
            &prepare.digest,
            prepare.size,
            client,
            tgroup,
            backupid,
            incremental,
            if sidecar.is_empty() { None } else { Some(&sidecar) },
        );

        let mut pending = self.pending.lock().unwrap();
        if Arc::strong_count(&fingerprint_lock) == 2 {
            pending.remove(&key);
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn tree_hash_single_chunk_matches_chunk_sha() {
        let data = b"small file that fits in one chunk";
        let mut cursor = std::io::Cursor::new(data.to_vec());
        let result = prepare(&mut cursor, HashMethod::TreeHash).unwrap();
        assert_eq!(result.chunk_digests.len(), 1);
        assert_eq!(result.digest, result.chunk_digests[0].sha256.to_vec());
        assert_eq!(result.size, data.len() as u64);
    }

    #[test]
    fn sha512_no_sparse_hashes_whole_stream() {
        let data = b"script contents";
        let mut cursor = std::io::Cursor::new(data.to_vec());
        let result = prepare(&mut cursor, HashMethod::Sha512NoSparse).unwrap();
        assert_eq!(result.size, data.len() as u64);
        assert_eq!(result.digest.len(), 64);
    }

    #[test]
    fn racing_commits_on_same_fingerprint_dedupe_to_one_fresh_write() {
        let dir = tempdir().unwrap();
        let store = ContentStore::open(dir.path().join("bf"), dir.path().join("hashes")).unwrap();
        let index = FileIndex::open_in_memory().unwrap();
        let pipeline = HashPipeline::new(store, index);

        let data = b"same content twice";
        let mut cursor = std::io::Cursor::new(data.to_vec());
        let prep = prepare(&mut cursor, HashMethod::TreeHash).unwrap();

        let (e1, r1) = pipeline
            .commit(data, Path::new("A/ts/f"), &prep, 1, 0, 1, false)
            .unwrap();
        let (e2, r2) = pipeline
            .commit(data, Path::new("B/ts/f"), &prep, 1, 0, 2, false)
            .unwrap();

        assert_eq!(r1, PlaceResult::Fresh);
        assert_eq!(r2, PlaceResult::Linked);
        assert_ne!(e1.id, e2.id);
    }
}
