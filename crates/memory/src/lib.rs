//! Agent memory: markdown files → chunked → embedded → hybrid search in SQLite.

pub mod chunker;
pub mod config;
pub mod embedder;
pub mod embeddings;
#[cfg(feature = "local-embeddings")]
pub mod embeddings_local;
pub mod embeddings_openai;
pub mod error;
pub mod manager;
pub mod paths;
pub mod registry;
pub mod schema;
pub mod search;
pub mod store;
pub mod store_sqlite;
pub mod sync;
pub mod tokens;
pub mod tools;
pub mod trigger;
#[cfg(feature = "file-watcher")]
pub mod watcher;

#[cfg(test)]
pub(crate) mod test_support;

pub use {
    config::{EmbeddingProviderKind, MemorySettings},
    error::{MemoryError, Result},
    manager::{ManagerState, MemoryManager, MemoryStatus, WriteMode},
    registry::MemoryRegistry,
    search::{Degradation, SearchHit, SearchMode, SearchOptions, SearchResponse},
    sync::{SyncOptions, SyncReport},
};

/// Milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as i64)
}
