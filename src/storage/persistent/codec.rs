//! Framed record codec for the journal.
//!
//! Every record is:
//! ```text
//! [version: 1 byte][length: 4 bytes LE][data: N bytes JSON][crc32: 4 bytes LE]
//! ```
//! JSON keeps the existing serde attributes authoritative; the CRC catches torn
//! or flipped bytes.

use std::io::{Error as IoError, ErrorKind, Read, Result as IoResult, Write};

use crc32fast::Hasher;
use serde::{de::DeserializeOwned, Serialize};

/// Current codec version.
pub const CODEC_VERSION: u8 = 1;

/// Magic bytes identifying KyroMem journal files.
pub const MAGIC: [u8; 4] = *b"KMEM";

/// Header length in bytes (magic + version).
pub const HEADER_LEN: u64 = 5;

/// Largest record accepted on decode.
const MAX_ENTRY_SIZE: usize = 256 * 1024 * 1024;

/// Serializes a value to a checksummed frame.
pub fn encode<T: Serialize>(value: &T) -> IoResult<Vec<u8>> {
    let data = serde_json::to_vec(value)
        .map_err(|e| IoError::new(ErrorKind::InvalidData, format!("serialization failed: {e}")))?;

    let len = u32::try_from(data.len())
        .map_err(|_| IoError::new(ErrorKind::InvalidData, "record larger than 4 GiB"))?;

    let mut hasher = Hasher::new();
    hasher.update(&data);
    let crc = hasher.finalize();

    let mut out = Vec::with_capacity(1 + 4 + data.len() + 4);
    out.push(CODEC_VERSION);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&data);
    out.extend_from_slice(&crc.to_le_bytes());
    Ok(out)
}

/// Reads one frame, verifying version, size bound and checksum.
///
/// A frame cut short by a crash surfaces as `ErrorKind::UnexpectedEof`.
pub fn decode<T: DeserializeOwned>(reader: &mut impl Read) -> IoResult<T> {
    let mut version = [0u8; 1];
    reader.read_exact(&mut version)?;
    if version[0] != CODEC_VERSION {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!("unsupported codec version: {} (expected {CODEC_VERSION})", version[0]),
        ));
    }

    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_ENTRY_SIZE {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!("entry size {len} exceeds maximum {MAX_ENTRY_SIZE}"),
        ));
    }

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data)?;

    let mut crc_bytes = [0u8; 4];
    reader.read_exact(&mut crc_bytes)?;
    let stored_crc = u32::from_le_bytes(crc_bytes);

    let mut hasher = Hasher::new();
    hasher.update(&data);
    let computed_crc = hasher.finalize();
    if stored_crc != computed_crc {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!("CRC mismatch: stored={stored_crc:08x}, computed={computed_crc:08x}"),
        ));
    }

    serde_json::from_slice(&data)
        .map_err(|e| IoError::new(ErrorKind::InvalidData, format!("deserialization failed: {e}")))
}

/// Write the file header (magic + version).
pub fn write_header(writer: &mut impl Write) -> IoResult<()> {
    writer.write_all(&MAGIC)?;
    writer.write_all(&[CODEC_VERSION])?;
    Ok(())
}

/// Read and validate the file header.
pub fn read_header(reader: &mut impl Read) -> IoResult<u8> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if magic != MAGIC {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!("invalid magic bytes: expected {MAGIC:?}, got {magic:?}"),
        ));
    }

    let mut version = [0u8; 1];
    reader.read_exact(&mut version)?;
    Ok(version[0])
}
