//! Wire-level constants shared between `ub-transfer` (C4) and the server
//! state machine (C7): the framed control protocol header, the chunked
//! transfer error codes, and CBT driver type tags.

/// Every control-protocol message is a 4-byte little-endian length prefix
/// followed by the payload.
pub const FRAME_HEADER_LEN: usize = 4;

/// Chunk size used throughout the chunked transfer engine.
pub const CHUNK_SIZE: usize = 512 * 1024;

/// Peer-silence timeout for one chunked-transfer connection.
pub const TRANSFER_READ_TIMEOUT_SECS: u64 = 60;

/// Maximum retries for a single chunk before the error is surfaced
/// upward (`HASH` recovery, retry policy).
pub const MAX_CHUNK_RETRIES: u32 = 5;

/// Single-byte error code that follows every chunked-transfer response
/// header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransferErrorCode {
    Success = 0,
    Hash = 1,
    Timeout = 2,
    BaseDirLost = 3,
    FileDoesntExist = 4,
    ConnLost = 5,
    SocketError = 6,
    ErrorCodes = 7,
}

impl TransferErrorCode {
    pub fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            0 => Self::Success,
            1 => Self::Hash,
            2 => Self::Timeout,
            3 => Self::BaseDirLost,
            4 => Self::FileDoesntExist,
            5 => Self::ConnLost,
            6 => Self::SocketError,
            7 => Self::ErrorCodes,
            _ => return None,
        })
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Whether the engine should retry the chunk/connection itself
    /// before surfacing a failure.
    pub fn is_locally_recoverable(self) -> bool {
        matches!(
            self,
            Self::Hash | Self::Timeout | Self::ConnLost | Self::SocketError
        )
    }
}

/// CBT backend driver type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum CbtType {
    None,
    Datto,
    Era,
    Windows,
}

/// 13-byte sector magic prepended to every CBT bitmap sector.
pub const CBT_SECTOR_MAGIC: &[u8; 13] = b"~urbackupcbt!";

/// Block size used by the CBT bitmap.
pub const CBT_BLOCK_SIZE: u64 = 512 * 1024;
