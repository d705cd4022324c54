//! chainstate-storage — persistent backends for ChainState.
//!
//! Backends:
//! - [`sqlite`] — SQLite via `sqlx`: state store and job store in one file
//! - [`fs`] — content-addressed checkpoint blobs on the local filesystem
//!
//! In-memory implementations of every trait live in `chainstate-core`.

pub mod fs;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use fs::FsContentStore;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStorage;
