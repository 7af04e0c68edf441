//! The CBT bitmap: a per-volume bit-per-block map, stored as
//! sectors that each open with the 13-byte `~urbackupcbt!` magic, the
//! whole file prefixed by a 16-byte MD5 covering the sector bytes.

use ub_api_types::protocol::{CBT_BLOCK_SIZE, CBT_SECTOR_MAGIC};
use ub_tools::crypto::md5_bytes;

use crate::error::CbtError;

const MD5_PREFIX_LEN: usize = 16;

/// In-memory bitmap: one bit per `CBT_BLOCK_SIZE` block, independent of
/// the on-disk sector framing (`encode`/`decode` handle that).
#[derive(Debug, Clone)]
pub struct CbtBitmap {
    bits: Vec<u8>,
}

impl CbtBitmap {
    /// Number of payload bytes a bitmap covering `volume_size` bytes
    /// must hold: `ceil(volume_size / 512 KiB / 8)`.
    pub fn required_payload_len(volume_size: u64) -> usize {
        let blocks = volume_size.div_ceil(CBT_BLOCK_SIZE);
        blocks.div_ceil(8) as usize
    }

    pub fn zeroed(volume_size: u64) -> Self {
        CbtBitmap {
            bits: vec![0u8; Self::required_payload_len(volume_size)],
        }
    }

    pub fn is_set(&self, block_index: u64) -> bool {
        let byte_idx = (block_index / 8) as usize;
        let Some(byte) = self.bits.get(byte_idx) else {
            return false;
        };
        (byte >> (block_index % 8)) & 1 != 0
    }

    /// Sets a bit, growing the backing vector if `block_index` falls
    /// beyond what this bitmap currently tracks (merging bitmaps from
    /// different consumers can disagree on volume size).
    pub fn set(&mut self, block_index: u64) {
        let byte_idx = (block_index / 8) as usize;
        if byte_idx >= self.bits.len() {
            self.bits.resize(byte_idx + 1, 0);
        }
        self.bits[byte_idx] |= 1 << (block_index % 8);
    }

    /// Bitwise-ORs `other` into `self`, growing `self` if `other` covers
    /// more blocks.
    pub fn merge(&mut self, other: &CbtBitmap) {
        if other.bits.len() > self.bits.len() {
            self.bits.resize(other.bits.len(), 0);
        }
        for (byte, other_byte) in self.bits.iter_mut().zip(other.bits.iter()) {
            *byte |= other_byte;
        }
    }

    pub fn iter_set_blocks(&self) -> impl Iterator<Item = u64> + '_ {
        self.bits.iter().enumerate().flat_map(|(byte_idx, byte)| {
            (0..8u64).filter_map(move |bit| {
                if (byte >> bit) & 1 != 0 {
                    Some(byte_idx as u64 * 8 + bit)
                } else {
                    None
                }
            })
        })
    }

    /// Encodes this bitmap as the on-disk format: `[md5:16][sector]*`,
    /// each sector `[magic:13][payload]` padded to `sector_size`.
    pub fn encode(&self, sector_size: usize) -> Vec<u8> {
        let payload_per_sector = sector_size - CBT_SECTOR_MAGIC.len();
        let sector_count = self.bits.len().div_ceil(payload_per_sector).max(1);

        let mut sectors = Vec::with_capacity(sector_count * sector_size);
        for i in 0..sector_count {
            sectors.extend_from_slice(CBT_SECTOR_MAGIC);
            let start = i * payload_per_sector;
            let end = (start + payload_per_sector).min(self.bits.len());
            let have = end.saturating_sub(start);
            if have > 0 {
                sectors.extend_from_slice(&self.bits[start..end]);
            }
            sectors.resize(sectors.len() + (payload_per_sector - have), 0);
        }

        let digest = md5_bytes(&sectors);
        let mut out = Vec::with_capacity(MD5_PREFIX_LEN + sectors.len());
        out.extend_from_slice(&digest);
        out.extend_from_slice(&sectors);
        out
    }

    /// Decodes the on-disk format, verifying the MD5 prefix and every
    /// sector's magic. Any corruption drives the caller straight to
    /// `disableCbt`.
    pub fn decode(data: &[u8], sector_size: usize) -> Result<Self, CbtError> {
        if data.len() < MD5_PREFIX_LEN {
            return Err(CbtError::TooShort);
        }
        let (prefix, sectors) = data.split_at(MD5_PREFIX_LEN);
        if sectors.is_empty() || sectors.len() % sector_size != 0 {
            return Err(CbtError::TooShort);
        }

        // Magic check first: it names the corrupted sector directly,
        // which is more useful than the checksum's all-or-nothing
        // verdict, and it catches the common case (one flipped byte)
        // before paying for the md5 pass.
        let magic_len = CBT_SECTOR_MAGIC.len();
        let mut bits = Vec::with_capacity(sectors.len() - (sectors.len() / sector_size) * magic_len);
        for (sector_idx, chunk) in sectors.chunks(sector_size).enumerate() {
            let (magic, payload) = chunk.split_at(magic_len);
            if magic != CBT_SECTOR_MAGIC.as_slice() {
                return Err(CbtError::CorruptMagic { sector: sector_idx });
            }
            bits.extend_from_slice(payload);
        }

        if md5_bytes(sectors).as_slice() != prefix {
            return Err(CbtError::ChecksumMismatch);
        }

        Ok(CbtBitmap { bits })
    }
}
