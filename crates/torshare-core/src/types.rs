//! Core data types for Torshare

use crate::{Error, Result, MAX_CHUNK_SIZE};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Number of chunks needed to cover `filesize` bytes
pub fn total_chunks(filesize: u64, chunk_size: u32) -> u64 {
    filesize.div_ceil(chunk_size as u64)
}

/// Metadata describing one file transfer session.
///
/// Immutable once built: `chunk_size` and `total_chunks` are fixed for the
/// lifetime of a session and identical on both ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    filename: String,
    filesize: u64,
    chunk_size: u32,
    total_chunks: u64,
    checksum: String,
    encrypted: bool,
}

impl FileMetadata {
    /// Build metadata, validating the filename and chunk size
    pub fn new(
        filename: impl Into<String>,
        filesize: u64,
        chunk_size: u32,
        checksum: impl Into<String>,
        encrypted: bool,
    ) -> Result<Self> {
        let filename = filename.into();
        validate_filename(&filename)?;

        if chunk_size == 0 {
            return Err(Error::InvalidMetadata("chunk_size must be positive".to_string()));
        }
        if chunk_size > MAX_CHUNK_SIZE {
            return Err(Error::InvalidMetadata(format!(
                "chunk_size {} exceeds maximum {}",
                chunk_size, MAX_CHUNK_SIZE
            )));
        }

        let checksum = checksum.into();
        if checksum.len() != 64 || !checksum.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::InvalidMetadata(format!(
                "checksum is not a hex SHA-256 digest: {:?}",
                checksum
            )));
        }

        Ok(Self {
            total_chunks: total_chunks(filesize, chunk_size),
            filename,
            filesize,
            chunk_size,
            checksum: checksum.to_ascii_lowercase(),
            encrypted,
        })
    }

    /// Basename of the file (no path separators)
    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// File size in bytes
    pub fn filesize(&self) -> u64 {
        self.filesize
    }

    /// Chunk size in bytes
    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// `ceil(filesize / chunk_size)`
    pub fn total_chunks(&self) -> u64 {
        self.total_chunks
    }

    /// Hex SHA-256 of the bytes being transferred
    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    /// Whether the transferred bytes are an encrypted container
    pub fn encrypted(&self) -> bool {
        self.encrypted
    }

    /// Expected length of chunk `index`, or `None` if out of range
    pub fn chunk_len(&self, index: u64) -> Option<u32> {
        if index >= self.total_chunks {
            return None;
        }
        let offset = index * self.chunk_size as u64;
        Some((self.filesize - offset).min(self.chunk_size as u64) as u32)
    }

    /// Envelope describing chunk `index`
    pub fn envelope(&self, index: u64) -> Option<ChunkEnvelope> {
        let size = self.chunk_len(index)?;
        Some(ChunkEnvelope {
            index,
            size,
            is_final: index + 1 == self.total_chunks,
        })
    }
}

/// Header preceding each chunk payload on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkEnvelope {
    /// Index of the chunk (0-based)
    pub index: u64,
    /// Payload length in bytes
    pub size: u32,
    /// True for the last chunk of the file
    #[serde(rename = "final")]
    pub is_final: bool,
}

/// Reject anything that is not a bare file name
pub fn validate_filename(filename: &str) -> Result<()> {
    if filename.is_empty() {
        return Err(Error::InvalidMetadata("empty filename".to_string()));
    }
    if filename == "." || filename == ".." || filename == crate::chunk::STAGING_DIR {
        return Err(Error::InvalidMetadata(format!("invalid filename: {}", filename)));
    }
    if filename.contains(['/', '\\', '\0']) {
        return Err(Error::InvalidMetadata(format!(
            "filename must not contain path separators: {}",
            filename
        )));
    }
    // Windows drive prefix
    if filename.len() >= 2 && filename.as_bytes()[1] == b':' {
        return Err(Error::InvalidMetadata(format!(
            "drive prefix not allowed: {}",
            filename
        )));
    }
    Ok(())
}

/// Basename of `path` as a UTF-8 string
pub fn file_name_of(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| Error::InvalidMetadata(format!("no usable file name in {}", path.display())))
}

/// Format a byte count for humans (`1.50 MB`)
pub fn format_size(size: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = size as f64;
    for unit in UNITS {
        if value < 1024.0 {
            return format!("{:.2} {}", value, unit);
        }
        value /= 1024.0;
    }
    format!("{:.2} PB", value)
}
