//! Chunked transfer messages: one `GET FILE` request, one
//! `FileHeader` response, a `ChunkAnnounce`/`ChunkResult` exchange per
//! chunk, and a closing `Done`. Every response carries the single-byte
//! error code that follows every response header.

use anyhow::{bail, Error};
use std::io::{Read, Write};
use ub_api_types::protocol::TransferErrorCode;

use crate::framing::{read_frame, write_frame};

const TAG_GET_FILE: u8 = 1;
const TAG_FILE_HEADER: u8 = 2;
const TAG_CHUNK_ANNOUNCE: u8 = 3;
const TAG_CHUNK_UNCHANGED: u8 = 4;
const TAG_CHUNK_DATA: u8 = 5;
const TAG_SPARSE_EXTENTS: u8 = 6;
const TAG_DONE: u8 = 7;
const TAG_RETRY_CHUNK: u8 = 8;
const TAG_CONTINUE: u8 = 9;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetFileRequest {
    pub name: String,
    pub offset: u64,
    pub with_metadata: Option<u64>,
}

pub fn write_get_file(writer: &mut impl Write, req: &GetFileRequest) -> Result<(), Error> {
    let mut body = Vec::new();
    body.push(TAG_GET_FILE);
    body.extend_from_slice(&req.offset.to_le_bytes());
    body.extend_from_slice(&req.with_metadata.unwrap_or(0).to_le_bytes());
    body.push(req.with_metadata.is_some() as u8);
    let name_bytes = req.name.as_bytes();
    body.extend_from_slice(&(name_bytes.len() as u32).to_le_bytes());
    body.extend_from_slice(name_bytes);
    write_frame(writer, &body)
}

pub fn read_get_file(reader: &mut impl Read) -> Result<GetFileRequest, Error> {
    let body = read_frame(reader)?;
    let mut pos = 0;
    expect_tag(&body, &mut pos, TAG_GET_FILE)?;
    let offset = take_u64(&body, &mut pos)?;
    let with_metadata_raw = take_u64(&body, &mut pos)?;
    let has_metadata = take_u8(&body, &mut pos)? != 0;
    let name_len = take_u32(&body, &mut pos)? as usize;
    let name = take_string(&body, &mut pos, name_len)?;
    Ok(GetFileRequest {
        name,
        offset,
        with_metadata: has_metadata.then_some(with_metadata_raw),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub error: TransferErrorCode,
    pub filesize: i64,
    pub num_chunks: i64,
}

pub fn write_file_header(writer: &mut impl Write, header: FileHeader) -> Result<(), Error> {
    let mut body = Vec::with_capacity(18);
    body.push(TAG_FILE_HEADER);
    body.push(header.error.as_byte());
    body.extend_from_slice(&header.filesize.to_le_bytes());
    body.extend_from_slice(&header.num_chunks.to_le_bytes());
    write_frame(writer, &body)
}

pub fn read_file_header(reader: &mut impl Read) -> Result<FileHeader, Error> {
    let body = read_frame(reader)?;
    let mut pos = 0;
    expect_tag(&body, &mut pos, TAG_FILE_HEADER)?;
    let error = take_error(&body, &mut pos)?;
    let filesize = take_i64(&body, &mut pos)?;
    let num_chunks = take_i64(&body, &mut pos)?;
    Ok(FileHeader {
        error,
        filesize,
        num_chunks,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkAnnounce {
    pub idx: i64,
    pub adler: u32,
    pub sha256: [u8; 32],
}

pub fn write_chunk_announce(writer: &mut impl Write, announce: &ChunkAnnounce) -> Result<(), Error> {
    let mut body = Vec::with_capacity(1 + 8 + 4 + 32);
    body.push(TAG_CHUNK_ANNOUNCE);
    body.extend_from_slice(&announce.idx.to_le_bytes());
    body.extend_from_slice(&announce.adler.to_le_bytes());
    body.extend_from_slice(&announce.sha256);
    write_frame(writer, &body)
}

pub fn read_chunk_announce(reader: &mut impl Read) -> Result<ChunkAnnounce, Error> {
    let body = read_frame(reader)?;
    let mut pos = 0;
    expect_tag(&body, &mut pos, TAG_CHUNK_ANNOUNCE)?;
    let idx = take_i64(&body, &mut pos)?;
    let adler = take_u32(&body, &mut pos)?;
    let sha256 = take_bytes32(&body, &mut pos)?;
    Ok(ChunkAnnounce { idx, adler, sha256 })
}

/// The provider's reply to a `ChunkAnnounce`, or a proactive push when
/// no prior announcement applies (a non-patch full fetch). `sha256`
/// lets the receiver verify bytes against the provider's own digest
/// before committing them, independent of whatever baseline hash drove
/// the announce (`HASH` recovery).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkResult {
    Unchanged { idx: i64 },
    Data {
        idx: i64,
        error: TransferErrorCode,
        sha256: [u8; 32],
        bytes: Vec<u8>,
    },
}

pub fn write_chunk_result(writer: &mut impl Write, result: &ChunkResult) -> Result<(), Error> {
    match result {
        ChunkResult::Unchanged { idx } => {
            let mut body = Vec::with_capacity(9);
            body.push(TAG_CHUNK_UNCHANGED);
            body.extend_from_slice(&idx.to_le_bytes());
            write_frame(writer, &body)
        }
        ChunkResult::Data { idx, error, sha256, bytes } => {
            let mut body = Vec::with_capacity(42 + bytes.len());
            body.push(TAG_CHUNK_DATA);
            body.extend_from_slice(&idx.to_le_bytes());
            body.push(error.as_byte());
            body.extend_from_slice(sha256);
            body.extend_from_slice(bytes);
            write_frame(writer, &body)
        }
    }
}

pub fn read_chunk_result(reader: &mut impl Read) -> Result<ChunkResult, Error> {
    let body = read_frame(reader)?;
    let mut pos = 0;
    let tag = take_u8(&body, &mut pos)?;
    match tag {
        TAG_CHUNK_UNCHANGED => {
            let idx = take_i64(&body, &mut pos)?;
            Ok(ChunkResult::Unchanged { idx })
        }
        TAG_CHUNK_DATA => {
            let idx = take_i64(&body, &mut pos)?;
            let error = take_error(&body, &mut pos)?;
            let sha256 = take_bytes32(&body, &mut pos)?;
            let bytes = body[pos..].to_vec();
            Ok(ChunkResult::Data { idx, error, sha256, bytes })
        }
        other => bail!("unexpected chunk result tag {other}"),
    }
}

/// Sent by the receiver when a delivered chunk fails its hash check, to
/// ask the provider for a fresh read of the same index (`HASH`
/// recovery, up to `MAX_CHUNK_RETRIES`).
pub fn write_retry_chunk(writer: &mut impl Write, idx: i64) -> Result<(), Error> {
    let mut body = Vec::with_capacity(9);
    body.push(TAG_RETRY_CHUNK);
    body.extend_from_slice(&idx.to_le_bytes());
    write_frame(writer, &body)
}

pub fn read_retry_chunk(reader: &mut impl Read) -> Result<i64, Error> {
    let body = read_frame(reader)?;
    let mut pos = 0;
    expect_tag(&body, &mut pos, TAG_RETRY_CHUNK)?;
    take_i64(&body, &mut pos)
}

/// Per-chunk acknowledgement the receiver sends after a chunk verifies
/// successfully, telling the provider to advance to the next index.
/// Explicit rather than implied by silence, so the exchange stays a
/// strict request/response pair with no ambiguous read timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkAck {
    Continue,
    Retry { idx: i64 },
}

pub fn write_chunk_continue(writer: &mut impl Write) -> Result<(), Error> {
    write_frame(writer, &[TAG_CONTINUE])
}

pub fn read_chunk_ack(reader: &mut impl Read) -> Result<ChunkAck, Error> {
    let body = read_frame(reader)?;
    let mut pos = 0;
    let tag = take_u8(&body, &mut pos)?;
    match tag {
        TAG_CONTINUE => Ok(ChunkAck::Continue),
        TAG_RETRY_CHUNK => {
            let idx = take_i64(&body, &mut pos)?;
            Ok(ChunkAck::Retry { idx })
        }
        other => bail!("unexpected chunk ack tag {other}"),
    }
}

pub fn write_sparse_extents(writer: &mut impl Write, extents: &[(u64, u64)]) -> Result<(), Error> {
    let mut body = Vec::with_capacity(1 + 4 + extents.len() * 16);
    body.push(TAG_SPARSE_EXTENTS);
    body.extend_from_slice(&(extents.len() as u32).to_le_bytes());
    for (offset, size) in extents {
        body.extend_from_slice(&offset.to_le_bytes());
        body.extend_from_slice(&size.to_le_bytes());
    }
    write_frame(writer, &body)
}

pub fn read_sparse_extents(reader: &mut impl Read) -> Result<Vec<(u64, u64)>, Error> {
    let body = read_frame(reader)?;
    let mut pos = 0;
    expect_tag(&body, &mut pos, TAG_SPARSE_EXTENTS)?;
    let count = take_u32(&body, &mut pos)? as usize;
    let mut extents = Vec::with_capacity(count);
    for _ in 0..count {
        let offset = take_u64(&body, &mut pos)?;
        let size = take_u64(&body, &mut pos)?;
        extents.push((offset, size));
    }
    Ok(extents)
}

pub fn write_done(writer: &mut impl Write) -> Result<(), Error> {
    write_frame(writer, &[TAG_DONE])
}

pub fn read_done(reader: &mut impl Read) -> Result<(), Error> {
    let body = read_frame(reader)?;
    let mut pos = 0;
    expect_tag(&body, &mut pos, TAG_DONE)
}

fn expect_tag(body: &[u8], pos: &mut usize, tag: u8) -> Result<(), Error> {
    let got = take_u8(body, pos)?;
    if got != tag {
        bail!("expected message tag {tag}, got {got}");
    }
    Ok(())
}

fn take_u8(body: &[u8], pos: &mut usize) -> Result<u8, Error> {
    let b = *body.get(*pos).ok_or_else(|| anyhow::anyhow!("short message"))?;
    *pos += 1;
    Ok(b)
}

fn take_u32(body: &[u8], pos: &mut usize) -> Result<u32, Error> {
    let bytes: [u8; 4] = body
        .get(*pos..*pos + 4)
        .ok_or_else(|| anyhow::anyhow!("short message"))?
        .try_into()?;
    *pos += 4;
    Ok(u32::from_le_bytes(bytes))
}

fn take_u64(body: &[u8], pos: &mut usize) -> Result<u64, Error> {
    let bytes: [u8; 8] = body
        .get(*pos..*pos + 8)
        .ok_or_else(|| anyhow::anyhow!("short message"))?
        .try_into()?;
    *pos += 8;
    Ok(u64::from_le_bytes(bytes))
}

fn take_i64(body: &[u8], pos: &mut usize) -> Result<i64, Error> {
    take_u64(body, pos).map(|v| v as i64)
}

fn take_bytes32(body: &[u8], pos: &mut usize) -> Result<[u8; 32], Error> {
    let bytes: [u8; 32] = body
        .get(*pos..*pos + 32)
        .ok_or_else(|| anyhow::anyhow!("short message"))?
        .try_into()?;
    *pos += 32;
    Ok(bytes)
}

fn take_error(body: &[u8], pos: &mut usize) -> Result<TransferErrorCode, Error> {
    let b = take_u8(body, pos)?;
    TransferErrorCode::from_byte(b).ok_or_else(|| anyhow::anyhow!("unknown error code {b}"))
}

fn take_string(body: &[u8], pos: &mut usize, len: usize) -> Result<String, Error> {
    let bytes = body
        .get(*pos..*pos + len)
        .ok_or_else(|| anyhow::anyhow!("short message"))?;
    *pos += len;
    Ok(String::from_utf8(bytes.to_vec())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn get_file_roundtrips_with_and_without_metadata() {
        let req = GetFileRequest {
            name: "docs/report.pdf".to_string(),
            offset: 4096,
            with_metadata: Some(7),
        };
        let mut buf = Vec::new();
        write_get_file(&mut buf, &req).unwrap();
        let decoded = read_get_file(&mut Cursor::new(buf)).unwrap();
        assert_eq!(decoded, req);

        let req_no_meta = GetFileRequest {
            name: "plain".to_string(),
            offset: 0,
            with_metadata: None,
        };
        let mut buf = Vec::new();
        write_get_file(&mut buf, &req_no_meta).unwrap();
        let decoded = read_get_file(&mut Cursor::new(buf)).unwrap();
        assert_eq!(decoded, req_no_meta);
    }

    #[test]
    fn chunk_result_variants_roundtrip() {
        let mut buf = Vec::new();
        write_chunk_result(&mut buf, &ChunkResult::Unchanged { idx: 3 }).unwrap();
        assert_eq!(
            read_chunk_result(&mut Cursor::new(buf)).unwrap(),
            ChunkResult::Unchanged { idx: 3 }
        );

        let data_result = ChunkResult::Data {
            idx: 4,
            error: TransferErrorCode::Success,
            sha256: [7u8; 32],
            bytes: vec![1, 2, 3, 4],
        };
        let mut buf = Vec::new();
        write_chunk_result(&mut buf, &data_result).unwrap();
        assert_eq!(read_chunk_result(&mut Cursor::new(buf)).unwrap(), data_result);
    }

    #[test]
    fn sparse_extents_roundtrip() {
        let extents = vec![(0, 4096), (8192, 1024)];
        let mut buf = Vec::new();
        write_sparse_extents(&mut buf, &extents).unwrap();
        let decoded = read_sparse_extents(&mut Cursor::new(buf)).unwrap();
        assert_eq!(decoded, extents);
    }
}
