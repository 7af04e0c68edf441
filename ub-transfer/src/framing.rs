//! The control-protocol's wire envelope: a 4-byte little-endian
//! length prefix followed by the payload. Grounded on
//! client/server exchanges being one length-prefixed message per
//! logical step (`pbs-client/src/backup_writer.rs`'s `H2Client`
//! request/response pairing), simplified to plain `Read`/`Write` since
//! this crate's transport is a thread-per-connection TCP stream rather
//! than HTTP/2.

use anyhow::{bail, Error};
use std::io::{Read, Write};
use ub_api_types::protocol::FRAME_HEADER_LEN;

/// No single control message legitimately approaches this size — the
/// largest payload is one 512 KiB chunk plus a small header. Anything
/// beyond is a protocol violation, not a large-but-valid message.
pub const MAX_FRAME_LEN: u32 = 2 * 1024 * 1024;

pub fn write_frame(writer: &mut impl Write, payload: &[u8]) -> Result<(), Error> {
    if payload.len() as u64 > MAX_FRAME_LEN as u64 {
        bail!("frame payload too large: {} bytes", payload.len());
    }
    let len = payload.len() as u32;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(payload)?;
    writer.flush()?;
    Ok(())
}

pub fn read_frame(reader: &mut impl Read) -> Result<Vec<u8>, Error> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    reader.read_exact(&mut header)?;
    let len = u32::from_le_bytes(header);
    if len > MAX_FRAME_LEN {
        bail!("frame length {len} exceeds maximum {MAX_FRAME_LEN}");
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload)?;
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn frame_roundtrips() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"hello frame").unwrap();

        let mut cursor = Cursor::new(buf);
        let payload = read_frame(&mut cursor).unwrap();
        assert_eq!(payload, b"hello frame");
    }

    #[test]
    fn oversized_frame_is_rejected_on_read() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(MAX_FRAME_LEN + 1).to_le_bytes());
        let mut cursor = Cursor::new(buf);
        assert!(read_frame(&mut cursor).is_err());
    }
}
