//! esync-core: Core primitives for the esync client
//!
//! Provides path normalization, content hashing, content-defined chunking,
//! chunk encryption, configuration, and the keystore.

pub mod chunker;
pub mod config;
pub mod crypto;
pub mod error;
pub mod hash;
pub mod keystore;
pub mod path;

pub use chunker::{chunk_bytes, chunk_file, ChunkConfig, ChunkRef};
pub use config::AgentConfig;
pub use error::SyncError;
pub use hash::ContentHash;
pub use keystore::Keystore;
pub use path::RelativePath;
