//! esync-remote: Remote sync API layer
//!
//! Defines the narrow contract the sync engine consumes ([`RemoteApi`]),
//! the production HTTP implementation, and an in-process implementation
//! used by tests.

pub mod api;
pub mod http;
pub mod local;

pub use api::{
    ApiError, ChangeEntry, ChangeKind, ChangesPage, CommitRequest, FileMeta, RemoteApi,
};
pub use http::HttpRemote;
pub use local::LocalRemote;
