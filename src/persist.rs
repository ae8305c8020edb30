//! Framed on-disk format for cached indexes
//!
//! File format:
//! - Magic bytes: "PLG1" (4 bytes)
//! - Version: u32 (4 bytes, big endian)
//! - Length: u64 (8 bytes, big endian) - length of serialized payload
//! - Data: serialized payload (msgpack)
//! - CRC32: u32 (4 bytes) - checksum of length + data
//!
//! Physical storage is the caller's concern; this only guarantees that a
//! payload read back is the payload that was written.

use serde::{de::DeserializeOwned, Serialize};
use std::path::Path;

use crate::{Error, Result};

const MAGIC: &[u8; 4] = b"PLG1";
const VERSION: u32 = 1;
const HEADER_LEN: usize = 4 + 4 + 8;

/// Serialize `value` into a framed byte buffer.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let data = rmp_serde::to_vec(value)?;

    let mut buffer = Vec::with_capacity(HEADER_LEN + data.len() + 4);
    buffer.extend_from_slice(MAGIC);
    buffer.extend_from_slice(&VERSION.to_be_bytes());
    buffer.extend_from_slice(&(data.len() as u64).to_be_bytes());
    buffer.extend_from_slice(&data);

    let crc = crc32fast::hash(&buffer[8..]);
    buffer.extend_from_slice(&crc.to_be_bytes());
    Ok(buffer)
}

/// Verify and deserialize a framed byte buffer.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    if bytes.len() < HEADER_LEN + 4 {
        return Err(Error::corrupted("truncated file"));
    }
    if &bytes[0..4] != MAGIC {
        return Err(Error::corrupted("bad magic bytes"));
    }
    let version = u32::from_be_bytes(read_array(&bytes[4..8])?);
    if version != VERSION {
        return Err(Error::corrupted(format!("unsupported version: {}", version)));
    }
    let len = u64::from_be_bytes(read_array(&bytes[8..16])?) as usize;
    if bytes.len() != HEADER_LEN + len + 4 {
        return Err(Error::corrupted(format!(
            "length mismatch: header claims {} payload bytes, file has {}",
            len,
            bytes.len().saturating_sub(HEADER_LEN + 4)
        )));
    }

    let payload_end = HEADER_LEN + len;
    let expected = u32::from_be_bytes(read_array(&bytes[payload_end..])?);
    let actual = crc32fast::hash(&bytes[8..payload_end]);
    if expected != actual {
        return Err(Error::corrupted(format!(
            "CRC mismatch: expected {:08x}, got {:08x}",
            expected, actual
        )));
    }

    rmp_serde::from_slice(&bytes[HEADER_LEN..payload_end])
        .map_err(|e| Error::corrupted(format!("payload does not decode: {}", e)))
}

pub fn write_file<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let bytes = encode(value)?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, &bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Read a framed file; `Ok(None)` when the file does not exist.
pub fn read_file<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match std::fs::read(path) {
        Ok(bytes) => decode(&bytes).map(Some),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn read_array<const N: usize>(bytes: &[u8]) -> Result<[u8; N]> {
    bytes
        .try_into()
        .map_err(|_| Error::corrupted("short header field"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_flipped_payload_byte() {
        let mut bytes = encode(&vec![1.0f32, 2.0, 3.0]).unwrap();
        let mid = HEADER_LEN + 2;
        bytes[mid] ^= 0xff;
        let err = decode::<Vec<f32>>(&bytes).unwrap_err();
        assert!(matches!(err, Error::CorruptedIndex(_)));
    }

    #[test]
    fn detects_truncation_and_bad_magic() {
        let bytes = encode(&"hello".to_string()).unwrap();
        assert!(decode::<String>(&bytes[..bytes.len() - 1]).is_err());

        let mut wrong = bytes.clone();
        wrong[0] = b'X';
        assert!(decode::<String>(&wrong).is_err());

        assert_eq!(decode::<String>(&bytes).unwrap(), "hello");
    }

    #[test]
    fn missing_file_reads_as_none() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("absent.bin");
        assert!(read_file::<Vec<u8>>(&path).unwrap().is_none());

        write_file(&path, &vec![7u8, 8]).unwrap();
        assert_eq!(read_file::<Vec<u8>>(&path).unwrap(), Some(vec![7u8, 8]));
    }
}
