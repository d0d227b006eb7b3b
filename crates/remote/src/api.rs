//! Remote API contract
//!
//! The engine only ever sees opaque ciphertext blobs and path-level metadata
//! through this trait. Swapping the HTTP implementation for the in-process
//! one lets the whole pipeline run inside a test.

use serde::{Deserialize, Serialize};

use esync_core::hash::ContentHash;

/// File metadata as the server reports it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMeta {
    pub path: String,
    /// Monotone version counter, incremented by the server on each change
    pub version: u64,
    pub size: u64,
    /// Modification time in seconds since the epoch, as reported at commit
    pub mtime: f64,
    /// Whole-file plaintext hash
    pub content_hash: ContentHash,
    /// Ordered plaintext chunk hashes
    pub chunk_hashes: Vec<ContentHash>,
    /// Set when the file is soft-deleted
    #[serde(default)]
    pub deleted_at: Option<String>,
}

/// Body of the metadata commit (create or update)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitRequest {
    pub path: String,
    pub size: u64,
    pub mtime: f64,
    pub content_hash: ContentHash,
    pub chunk_hashes: Vec<ContentHash>,
    /// Version the client believes current; drives optimistic concurrency
    #[serde(default)]
    pub parent_version: Option<u64>,
}

/// Kind of entry in the server change log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

/// One entry from `GET /changes`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEntry {
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    pub path: String,
    #[serde(default)]
    pub version: Option<u64>,
}

/// A page of changes plus the cursor to resume from
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangesPage {
    pub changes: Vec<ChangeEntry>,
    pub cursor: String,
}

/// Error from the remote API, already classified
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("authentication rejected")]
    Auth,
    #[error("not found")]
    NotFound,
    #[error("gone (soft-deleted)")]
    Gone,
    #[error("version conflict: server at version {current_version}")]
    Conflict {
        current_version: u64,
        content_hash: ContentHash,
    },
    #[error("server error: http {0}")]
    Server(u16),
    #[error("network: {0}")]
    Network(String),
    #[error("protocol: {0}")]
    Protocol(String),
}

impl ApiError {
    /// Whether the retry policy should attempt this failure again
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Server(_))
    }

    /// Whether this looks like the server being unreachable (indefinite
    /// wait-for-network rather than counted retries)
    #[must_use]
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::Network(_))
    }
}

/// The remote metadata/blob server, as consumed by the engine
pub trait RemoteApi: Send + Sync {
    /// Cheap reachability probe
    fn health_check(&self) -> bool;

    /// `GET /files/{path}`
    fn get_file(&self, path: &str) -> Result<FileMeta, ApiError>;

    /// `GET /files`
    fn list_files(&self) -> Result<Vec<FileMeta>, ApiError>;

    /// `POST /files`
    fn create_file(&self, req: &CommitRequest) -> Result<FileMeta, ApiError>;

    /// `PUT /files/{path}`; `Conflict` on version mismatch, `Gone` when the
    /// file was soft-deleted
    fn update_file(&self, req: &CommitRequest) -> Result<FileMeta, ApiError>;

    /// `DELETE /files/{path}` (soft delete)
    fn delete_file(&self, path: &str) -> Result<(), ApiError>;

    /// `GET /changes?since={cursor}`
    fn changes_since(&self, cursor: Option<&str>) -> Result<ChangesPage, ApiError>;

    /// `HEAD /chunks/{hash}`
    fn chunk_exists(&self, hash: &ContentHash) -> Result<bool, ApiError>;

    /// `POST /chunks/{hash}` with the raw `nonce || ciphertext || tag` payload
    fn upload_chunk(&self, hash: &ContentHash, payload: &[u8]) -> Result<(), ApiError>;

    /// `GET /chunks/{hash}`
    fn download_chunk(&self, hash: &ContentHash) -> Result<Vec<u8>, ApiError>;
}
