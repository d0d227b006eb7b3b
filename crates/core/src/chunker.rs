//! Content-defined chunking using FastCDC
//!
//! Chunk boundaries depend on content, so an insertion near the start of a
//! file shifts at most a chunk or two instead of every subsequent one.

use std::path::Path;

use fastcdc::v2020::{FastCDC, Normalization, StreamCDC};

use crate::hash::ContentHash;

/// Configuration for content-defined chunking
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ChunkConfig {
    /// Minimum chunk size in bytes
    pub min_size: u32,
    /// Average (expected) chunk size in bytes
    pub avg_size: u32,
    /// Maximum chunk size in bytes
    pub max_size: u32,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            min_size: 1024 * 1024,
            avg_size: 4 * 1024 * 1024,
            max_size: 8 * 1024 * 1024,
        }
    }
}

impl ChunkConfig {
    /// Small chunk sizes for tests and tiny workloads
    #[must_use]
    pub fn small() -> Self {
        Self {
            min_size: 64,
            avg_size: 256,
            max_size: 1024,
        }
    }
}

/// A content-defined chunk: location plus plaintext identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ChunkRef {
    /// Byte offset in the source file
    pub offset: u64,
    /// Length of this chunk in bytes
    pub length: u32,
    /// SHA-256 of the plaintext chunk
    pub hash: ContentHash,
}

/// Chunk an in-memory buffer.
#[must_use]
pub fn chunk_bytes(data: &[u8], config: &ChunkConfig) -> Vec<ChunkRef> {
    FastCDC::with_level(
        data,
        config.min_size,
        config.avg_size,
        config.max_size,
        Normalization::Level1,
    )
    .map(|entry| {
        let chunk_data = &data[entry.offset..entry.offset + entry.length];
        ChunkRef {
            offset: entry.offset as u64,
            length: entry.length as u32,
            hash: ContentHash::from_bytes(chunk_data),
        }
    })
    .collect()
}

/// Chunk a file without holding more than one chunk in memory.
///
/// Returns the chunk list and the whole-file content hash, both computed in
/// a single streaming pass.
///
/// # Errors
/// Returns an error if the file cannot be read
pub fn chunk_file(path: &Path, config: &ChunkConfig) -> std::io::Result<(Vec<ChunkRef>, ContentHash)> {
    use sha2::{Digest, Sha256};

    let file = std::fs::File::open(path)?;
    let mut chunks = Vec::new();
    let mut file_hasher = Sha256::new();

    for result in StreamCDC::with_level(
        file,
        config.min_size,
        config.avg_size,
        config.max_size,
        Normalization::Level1,
    ) {
        let chunk = result.map_err(std::io::Error::other)?;
        file_hasher.update(&chunk.data);
        chunks.push(ChunkRef {
            offset: chunk.offset,
            length: chunk.length as u32,
            hash: ContentHash::from_bytes(&chunk.data),
        });
    }

    let mut raw = [0u8; 32];
    raw.copy_from_slice(&file_hasher.finalize());
    Ok((chunks, ContentHash::from_raw(raw)))
}

/// Visit each chunk of a file with its plaintext bytes, one chunk in memory
/// at a time.
///
/// # Errors
/// Returns an error if the file cannot be read or the visitor fails
pub fn for_each_chunk<E, F>(path: &Path, config: &ChunkConfig, mut visit: F) -> Result<(), E>
where
    E: From<std::io::Error>,
    F: FnMut(ChunkRef, &[u8]) -> Result<(), E>,
{
    let file = std::fs::File::open(path)?;

    for result in StreamCDC::with_level(
        file,
        config.min_size,
        config.avg_size,
        config.max_size,
        Normalization::Level1,
    ) {
        let chunk = result.map_err(std::io::Error::other)?;
        let chunk_ref = ChunkRef {
            offset: chunk.offset,
            length: chunk.length as u32,
            hash: ContentHash::from_bytes(&chunk.data),
        };
        visit(chunk_ref, &chunk.data)?;
    }

    Ok(())
}
