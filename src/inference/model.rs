//! GGUF header validation
//!
//! Checked before a model file is handed to llama.cpp so a wrong or truncated
//! file fails with a readable error instead of inside the engine.

use std::fs::File;
use std::io::{BufReader, ErrorKind, Read};
use std::path::Path;
use thiserror::Error;

/// GGUF magic bytes (little-endian: "GGUF")
pub const GGUF_MAGIC: u32 = 0x46554747;

/// Oldest and newest header versions llama.cpp reads
const SUPPORTED_VERSIONS: std::ops::RangeInclusive<u32> = 2..=3;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Failed to open file: {0}")]
    FileOpen(#[from] std::io::Error),

    #[error("Invalid GGUF file: magic bytes mismatch (expected 0x{:08X}, got 0x{:08X})", GGUF_MAGIC, .0)]
    InvalidMagic(u32),

    #[error("Unsupported GGUF version: {0}")]
    UnsupportedVersion(u32),

    #[error("File too small to be valid GGUF")]
    FileTooSmall,
}

/// Fixed-size GGUF header fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GgufHeader {
    pub version: u32,
    pub tensor_count: u64,
    pub metadata_kv_count: u64,
}

/// Validate the GGUF header of the file at `path`.
pub fn validate_gguf<P: AsRef<Path>>(path: P) -> Result<GgufHeader, ModelError> {
    let file = File::open(path)?;
    read_header(BufReader::new(file))
}

/// Read and check magic, version, tensor count and metadata count.
pub fn read_header<R: Read>(mut reader: R) -> Result<GgufHeader, ModelError> {
    // magic(4) + version(4) + tensor_count(8) + metadata_kv_count(8)
    let mut header = [0u8; 24];
    reader.read_exact(&mut header).map_err(|e| match e.kind() {
        ErrorKind::UnexpectedEof => ModelError::FileTooSmall,
        _ => ModelError::FileOpen(e),
    })?;

    let word = |at: usize| u32::from_le_bytes([header[at], header[at + 1], header[at + 2], header[at + 3]]);
    let dword = |at: usize| {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&header[at..at + 8]);
        u64::from_le_bytes(bytes)
    };

    let magic = word(0);
    if magic != GGUF_MAGIC {
        return Err(ModelError::InvalidMagic(magic));
    }

    let version = word(4);
    if !SUPPORTED_VERSIONS.contains(&version) {
        return Err(ModelError::UnsupportedVersion(version));
    }

    Ok(GgufHeader {
        version,
        tensor_count: dword(8),
        metadata_kv_count: dword(16),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};

    fn header(magic: u32, version: u32) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend(magic.to_le_bytes());
        bytes.extend(version.to_le_bytes());
        bytes.extend(10u64.to_le_bytes());
        bytes.extend(5u64.to_le_bytes());
        bytes
    }

    #[test]
    fn test_valid_header() {
        let parsed = read_header(Cursor::new(header(GGUF_MAGIC, 3))).unwrap();
        assert_eq!(
            parsed,
            GgufHeader {
                version: 3,
                tensor_count: 10,
                metadata_kv_count: 5,
            }
        );
    }

    #[test]
    fn test_invalid_magic() {
        let result = read_header(Cursor::new(header(0xDEADBEEF, 3)));
        assert!(matches!(result, Err(ModelError::InvalidMagic(0xDEADBEEF))));
    }

    #[test]
    fn test_unsupported_version() {
        let result = read_header(Cursor::new(header(GGUF_MAGIC, 1)));
        assert!(matches!(result, Err(ModelError::UnsupportedVersion(1))));
    }

    #[test]
    fn test_truncated_header() {
        let result = read_header(Cursor::new(GGUF_MAGIC.to_le_bytes().to_vec()));
        assert!(matches!(result, Err(ModelError::FileTooSmall)));

        // counts cut short after a valid magic and version
        let mut bytes = header(GGUF_MAGIC, 3);
        bytes.truncate(20);
        let result = read_header(Cursor::new(bytes));
        assert!(matches!(result, Err(ModelError::FileTooSmall)));
    }

    #[test]
    fn test_validate_file_on_disk() {
        let mut file = tempfile::Builder::new().suffix(".gguf").tempfile().unwrap();
        file.write_all(&header(GGUF_MAGIC, 2)).unwrap();
        file.flush().unwrap();
        assert_eq!(validate_gguf(file.path()).unwrap().version, 2);

        let missing = file.path().with_extension("absent");
        assert!(matches!(validate_gguf(missing), Err(ModelError::FileOpen(_))));
    }
}
