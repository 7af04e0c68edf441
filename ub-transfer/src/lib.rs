//! Chunked transfer engine (C4) and its framed control-protocol
//! codec: the length-prefixed envelope (`framing`), the tagged
//! binary messages that ride inside it (`wire`), and the full/patch
//! fetch state machines that drive them over one connection (`engine`).

pub mod engine;
pub mod framing;
pub mod wire;

pub use engine::{
    full_fetch_provider, full_fetch_requester, patch_fetch_provider, patch_fetch_requester,
    ChunkSource, SliceSource, TransferOutcome,
};
pub use framing::{read_frame, write_frame, MAX_FRAME_LEN};
pub use wire::{
    read_chunk_ack, read_chunk_announce, read_chunk_result, read_done, read_file_header,
    read_get_file, read_sparse_extents, write_chunk_announce, write_chunk_continue,
    write_chunk_result, write_done, write_file_header, write_get_file, write_retry_chunk,
    write_sparse_extents, ChunkAck, ChunkAnnounce, ChunkResult, FileHeader, GetFileRequest,
};
