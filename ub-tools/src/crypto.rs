//! The symmetric crypto primitives treated as a `Crypto` capability.
//! Hashing is exercised directly by C1/C3/C4, so we give it a concrete,
//! swappable implementation here rather than a bare trait with no
//! default.

use anyhow::Error;
use openssl::sha::{Sha256, Sha512};
use std::io::Read;

/// SHA-256 digest of a readable stream, grounded on
/// `pbs-tools::sha::sha256` (same openssl-backed approach, generalized
/// over any `Read` instead of requiring a `File`).
pub fn sha256_reader(r: &mut dyn Read) -> Result<([u8; 32], u64), Error> {
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 256 * 1024];
    let mut size: u64 = 0;

    loop {
        let count = match r.read(&mut buffer) {
            Ok(0) => break,
            Ok(count) => count,
            Err(ref err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        size += count as u64;
        hasher.update(&buffer[..count]);
    }

    Ok((hasher.finish(), size))
}

pub fn sha256_bytes(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finish()
}

/// Full-content SHA-512, used for the `SHA512_NO_SPARSE` hash method
/// in the prepare stage: scripts, metadata.
pub fn sha512_reader(r: &mut dyn Read) -> Result<([u8; 64], u64), Error> {
    let mut hasher = Sha512::new();
    let mut buffer = [0u8; 256 * 1024];
    let mut size: u64 = 0;

    loop {
        let count = match r.read(&mut buffer) {
            Ok(0) => break,
            Ok(count) => count,
            Err(ref err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        size += count as u64;
        hasher.update(&buffer[..count]);
    }

    Ok((hasher.finish(), size))
}

/// Adler-32 of one chunk, used as the cheap first-pass check in the
/// chunked transfer protocol before falling back to the
/// accompanying SHA-256.
pub fn adler32(data: &[u8]) -> u32 {
    adler::adler32_slice(data)
}

/// MD5 of the CBT bitmap payload: a 16-byte MD5 prefix protects the
/// on-disk file. MD5 appears nowhere else in this workspace; it is
/// not used for anything security-sensitive here, only as the format's
/// own corruption check.
pub fn md5_bytes(data: &[u8]) -> [u8; 16] {
    let digest = openssl::hash::hash(openssl::hash::MessageDigest::md5(), data)
        .expect("md5 digest is always the expected length");
    let mut out = [0u8; 16];
    out.copy_from_slice(&digest);
    out
}
