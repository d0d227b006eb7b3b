//! Error taxonomy shared by the sync engine
//!
//! Workers convert low-level failures into these kinds before returning, so
//! the coordinator can decide retry vs park vs surface without inspecting
//! transport-specific errors.

/// Classified sync failure
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Not initialized, not registered, invalid configuration
    #[error("configuration: {0}")]
    Config(String),

    /// Server rejected our credentials
    #[error("authentication: {0}")]
    Auth(String),

    /// Connect refused, timeout, 5xx; retried while the agent goes OFFLINE
    #[error("network: {0}")]
    Network(String),

    /// Optimistic-concurrency commit rejection (handed to conflict handling)
    #[error("version conflict on {path}: server at version {server_version}")]
    VersionConflict { path: String, server_version: u64 },

    /// Hash mismatch after decrypt, or final content hash mismatch
    #[error("integrity: {0}")]
    Integrity(String),

    /// Permission denied, disk full, file locked
    #[error("local i/o: {0}")]
    LocalIo(String),

    /// Unreadable local store or keystore
    #[error("state corruption: {0}")]
    StateCorruption(String),

    /// Cooperative cancellation; never surfaced to the user as an error
    #[error("cancelled")]
    Cancelled,
}

impl SyncError {
    /// Whether the retry policy should attempt this failure again
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::LocalIo(_))
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        Self::LocalIo(err.to_string())
    }
}

impl From<crate::crypto::CryptoError> for SyncError {
    fn from(err: crate::crypto::CryptoError) -> Self {
        Self::Integrity(err.to_string())
    }
}
