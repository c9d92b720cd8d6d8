//! Record framing for the WAL and snapshot files.
//!
//! Every file starts with a five byte header (`TRIB` + format version).
//! Records follow it, each framed as:
//!
//! ```text
//! [version: u8][length: u32 LE][payload: JSON][crc32(payload): u32 LE]
//! ```
//!
//! A record cut short by a crash decodes as `UnexpectedEof`; a record whose
//! bytes are all present but do not check out decodes as `InvalidData`.

use std::io::{Error as IoError, ErrorKind, Read, Result as IoResult, Write};

use crc32fast::Hasher;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Current record format version.
pub const FORMAT_VERSION: u8 = 1;

/// File magic.
pub const MAGIC: [u8; 4] = *b"TRIB";

/// Header length in bytes.
pub const HEADER_LEN: u64 = 5;

/// Largest payload accepted on decode.
const MAX_PAYLOAD: usize = 64 * 1024 * 1024;

fn invalid(message: String) -> IoError {
    IoError::new(ErrorKind::InvalidData, message)
}

fn checksum(payload: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(payload);
    hasher.finalize()
}

/// Frames `value` as one record.
pub fn encode<T: Serialize>(value: &T) -> IoResult<Vec<u8>> {
    let payload = serde_json::to_vec(value).map_err(|e| invalid(format!("encode failed: {e}")))?;
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|&n| n as usize <= MAX_PAYLOAD)
        .ok_or_else(|| invalid(format!("record of {} bytes is too large", payload.len())))?;

    let mut out = Vec::with_capacity(payload.len() + 9);
    out.push(FORMAT_VERSION);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&payload);
    out.extend_from_slice(&checksum(&payload).to_le_bytes());
    Ok(out)
}

/// Reads one record and returns it with its framed length in bytes.
pub fn decode<T: DeserializeOwned>(reader: &mut impl Read) -> IoResult<(T, u64)> {
    let mut head = [0u8; 5];
    reader.read_exact(&mut head)?;
    if head[0] != FORMAT_VERSION {
        return Err(invalid(format!(
            "unsupported record version {} (expected {FORMAT_VERSION})",
            head[0]
        )));
    }
    let len = u32::from_le_bytes([head[1], head[2], head[3], head[4]]) as usize;
    if len > MAX_PAYLOAD {
        return Err(invalid(format!("record length {len} exceeds maximum {MAX_PAYLOAD}")));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    let mut crc = [0u8; 4];
    reader.read_exact(&mut crc)?;
    let stored = u32::from_le_bytes(crc);
    let computed = checksum(&payload);
    if stored != computed {
        return Err(invalid(format!(
            "checksum mismatch: stored {stored:08x}, computed {computed:08x}"
        )));
    }

    let value = serde_json::from_slice(&payload).map_err(|e| invalid(format!("decode failed: {e}")))?;
    Ok((value, len as u64 + 9))
}

pub fn write_header(writer: &mut impl Write) -> IoResult<()> {
    writer.write_all(&MAGIC)?;
    writer.write_all(&[FORMAT_VERSION])
}

/// Validates the file header and returns its format version.
pub fn read_header(reader: &mut impl Read) -> IoResult<u8> {
    let mut header = [0u8; 5];
    reader.read_exact(&mut header)?;
    if header[..4] != MAGIC {
        return Err(invalid(format!("not a tributary file (magic {:?})", &header[..4])));
    }
    if header[4] != FORMAT_VERSION {
        return Err(invalid(format!("unsupported file version {}", header[4])));
    }
    Ok(header[4])
}
