//! Chunk-addressed file I/O
//!
//! Incoming files are written positionally into a staging file
//! (`.torshare-staging/<name>.part` next to the destination). Every
//! successful write appends `"<index> <size>"` to an inventory sidecar
//! (`<name>.part.chunks` in the same directory), which is what
//! [`ChunkStore::missing_chunks`] inspects. [`ChunkStore::reassemble`] moves
//! a complete staging file into its final place.

use crate::{crypto, types, Error, FileMetadata, Result};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Chunk reader/writer for one chunk size
#[derive(Debug, Clone, Copy)]
pub struct ChunkStore {
    chunk_size: u32,
}

impl ChunkStore {
    /// Create a chunk store; `chunk_size` must be positive
    pub fn new(chunk_size: u32) -> Result<Self> {
        if chunk_size == 0 {
            return Err(Error::InvalidMetadata("chunk_size must be positive".to_string()));
        }
        Ok(Self { chunk_size })
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// Compute metadata for a file, or `None` if it does not exist
    pub fn metadata(&self, path: &Path, encrypted: bool) -> Result<Option<FileMetadata>> {
        let fs_meta = match std::fs::metadata(path) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if !fs_meta.is_file() {
            return Err(Error::InvalidMetadata(format!("{} is not a file", path.display())));
        }

        let filename = types::file_name_of(path)?;
        let checksum = crypto::checksum(path)?;

        let metadata = FileMetadata::new(filename, fs_meta.len(), self.chunk_size, checksum, encrypted)?;
        tracing::debug!(
            "Metadata for {}: {} bytes, {} chunks",
            metadata.filename(),
            metadata.filesize(),
            metadata.total_chunks()
        );
        Ok(Some(metadata))
    }

    /// Read chunk `index`; the final chunk may be short
    pub fn read_chunk(&self, path: &Path, index: u64) -> Result<Vec<u8>> {
        let chunk_io = |e: std::io::Error| Error::ChunkIo {
            index,
            reason: e.to_string(),
        };

        let mut file = File::open(path).map_err(chunk_io)?;
        file.seek(SeekFrom::Start(self.offset(index)))
            .map_err(chunk_io)?;

        let mut data = Vec::with_capacity(self.chunk_size as usize);
        file.take(self.chunk_size as u64)
            .read_to_end(&mut data)
            .map_err(chunk_io)?;
        Ok(data)
    }

    /// Start a fresh staging file, discarding any previous content and inventory
    pub fn begin(&self, staging: &Path) -> Result<()> {
        if let Some(parent) = staging.parent() {
            std::fs::create_dir_all(parent)?;
        }
        File::create(staging)?;
        File::create(inventory_path(staging))?;
        Ok(())
    }

    /// Write `data` at `index * chunk_size` and record it in the inventory.
    ///
    /// Positioned writes make the result independent of arrival order.
    pub fn write_chunk(&self, staging: &Path, index: u64, data: &[u8]) -> Result<()> {
        if data.len() > self.chunk_size as usize {
            return Err(Error::ChunkIo {
                index,
                reason: format!("{} bytes exceeds chunk size {}", data.len(), self.chunk_size),
            });
        }

        let chunk_io = |e: std::io::Error| Error::ChunkIo {
            index,
            reason: e.to_string(),
        };

        if let Some(parent) = staging.parent() {
            std::fs::create_dir_all(parent).map_err(chunk_io)?;
        }

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(staging)
            .map_err(chunk_io)?;
        file.seek(SeekFrom::Start(self.offset(index)))
            .map_err(chunk_io)?;
        file.write_all(data).map_err(chunk_io)?;
        file.flush().map_err(chunk_io)?;

        let mut inventory = OpenOptions::new()
            .append(true)
            .create(true)
            .open(inventory_path(staging))
            .map_err(chunk_io)?;
        writeln!(inventory, "{} {}", index, data.len()).map_err(chunk_io)?;

        tracing::trace!("Wrote chunk {} ({} bytes) to {}", index, data.len(), staging.display());
        Ok(())
    }

    /// Indices in `0..total_chunks` that are absent or have the wrong size
    pub fn missing_chunks(&self, staging: &Path, total_chunks: u64) -> Result<Vec<u64>> {
        let recorded = read_inventory(staging)?;
        let file_len = match std::fs::metadata(staging) {
            Ok(m) => m.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };

        let missing = (0..total_chunks)
            .filter(|&index| {
                let Some(&size) = recorded.get(&index) else {
                    return true;
                };
                let is_last = index + 1 == total_chunks;
                let size_ok = if is_last {
                    size > 0 && size <= self.chunk_size as u64
                } else {
                    size == self.chunk_size as u64
                };
                !size_ok || file_len < self.offset(index) + size
            })
            .collect();

        Ok(missing)
    }

    /// Move a complete staging file to `output`, removing its inventory.
    ///
    /// Fails with the first missing index if any chunk is absent.
    pub fn reassemble(&self, staging: &Path, output: &Path, total_chunks: u64) -> Result<()> {
        if !staging.exists() {
            return Err(Error::NotFound(staging.display().to_string()));
        }
        if let Some(&index) = self.missing_chunks(staging, total_chunks)?.first() {
            return Err(Error::ChunkIo {
                index,
                reason: "missing chunk".to_string(),
            });
        }

        let file_len = std::fs::metadata(staging)?.len();
        let expected_len = match total_chunks {
            0 => 0,
            n => {
                let recorded = read_inventory(staging)?;
                self.offset(n - 1) + recorded.get(&(n - 1)).copied().unwrap_or(0)
            }
        };
        if file_len != expected_len {
            // Stale bytes past the last chunk
            OpenOptions::new().write(true).open(staging)?.set_len(expected_len)?;
        }

        std::fs::rename(staging, output)?;
        remove_if_exists(&inventory_path(staging))?;
        tracing::debug!("Reassembled {} ({} chunks)", output.display(), total_chunks);
        Ok(())
    }

    /// Delete a staging file and its inventory
    pub fn discard(&self, staging: &Path) -> Result<()> {
        remove_if_exists(staging)?;
        remove_if_exists(&inventory_path(staging))
    }

    fn offset(&self, index: u64) -> u64 {
        index * self.chunk_size as u64
    }
}

/// Directory beside received files that holds in-progress staging files.
///
/// Received filenames are bare basenames and may not equal this name, so no
/// transfer can land inside it.
pub const STAGING_DIR: &str = ".torshare-staging";

/// Staging path used while `dest` is being received
pub fn staging_path(dest: &Path) -> PathBuf {
    let mut name = dest
        .file_name()
        .map(|n| n.to_owned())
        .unwrap_or_default();
    name.push(".part");
    dest.parent()
        .unwrap_or_else(|| Path::new(""))
        .join(STAGING_DIR)
        .join(name)
}

/// Inventory sidecar for a staging file
pub fn inventory_path(staging: &Path) -> PathBuf {
    with_suffix(staging, ".chunks")
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Last recorded size per chunk index
fn read_inventory(staging: &Path) -> Result<HashMap<u64, u64>> {
    let file = match File::open(inventory_path(staging)) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(e) => return Err(e.into()),
    };

    let mut recorded = HashMap::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        let mut parts = line.split_whitespace();
        match (
            parts.next().and_then(|s| s.parse::<u64>().ok()),
            parts.next().and_then(|s| s.parse::<u64>().ok()),
        ) {
            (Some(index), Some(size)) => {
                recorded.insert(index, size);
            }
            _ => tracing::warn!("Ignoring malformed inventory line: {:?}", line),
        }
    }
    Ok(recorded)
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
