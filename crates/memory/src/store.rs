/// Storage abstraction for indexed sources, chunks, and the embedding cache.
use std::collections::HashMap;

use {async_trait::async_trait, serde::Serialize};

use crate::{
    error::Result,
    schema::{ChunkRow, FileRow},
};

/// Optional backends detected once when a store is opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    /// FTS5 keyword index is usable.
    pub keyword: bool,
    /// sqlite-vec is loaded and can rank vectors in the engine.
    pub native_vector: bool,
}

/// A chunk matched by one of the retrieval paths, with the path's raw score.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub id: String,
    pub source_path: String,
    pub start_line: i64,
    pub end_line: i64,
    pub text: String,
    /// Keyword path: FTS5 `bm25()` (lower is better).
    /// Vector path: cosine similarity in [-1, 1].
    pub raw_score: f64,
}

/// Rows loaded by a bounded brute-force vector scan.
#[derive(Debug, Clone, Default)]
pub struct ScanBatch {
    pub rows: Vec<ChunkRow>,
    /// Rows that matched the scan filter before the bound was applied.
    pub total_candidates: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreCounts {
    pub files: usize,
    pub chunks: usize,
    pub embedded_chunks: usize,
    pub cached_embeddings: usize,
}

#[async_trait]
pub trait MemoryStore: Send + Sync {
    fn capabilities(&self) -> Capabilities;

    // ---- files ----
    async fn get_file(&self, path: &str) -> Result<Option<FileRow>>;
    async fn list_files(&self) -> Result<Vec<FileRow>>;

    /// Atomically replace every chunk of `file.path` with `chunks` and
    /// record `file`. Readers see either the old or the new set.
    async fn replace_source(&self, file: &FileRow, chunks: &[ChunkRow]) -> Result<()>;

    /// Remove a source, its chunks and their keyword index rows.
    async fn delete_source(&self, path: &str) -> Result<()>;

    // ---- chunks ----
    async fn list_chunks(&self, offset: usize, limit: usize) -> Result<Vec<ChunkRow>>;
    async fn get_chunk(&self, id: &str) -> Result<Option<ChunkRow>>;

    /// Chunks of `path` lacking an embedding from `model_id`.
    async fn count_pending_embeddings(&self, path: &str, model_id: &str) -> Result<usize>;

    // ---- embedding cache ----
    async fn get_cached_embeddings(
        &self,
        model_id: &str,
        hashes: &[String],
    ) -> Result<HashMap<String, Vec<f32>>>;

    async fn put_cached_embeddings(&self, model_id: &str, entries: &[(String, Vec<f32>)])
    -> Result<()>;

    async fn count_cached_embeddings(&self) -> Result<usize>;

    /// Evict the oldest cache rows, keeping at most `keep` entries.
    async fn evict_embedding_cache(&self, keep: usize) -> Result<usize>;

    // ---- search ----

    /// Keyword search over the FTS5 index. Requires `capabilities().keyword`.
    async fn keyword_search(&self, query: &str, limit: usize) -> Result<Vec<Candidate>>;

    /// In-engine vector ranking. Requires `capabilities().native_vector`.
    /// Only chunks embedded by `model_id` with `query.len()` dimensions are ranked.
    async fn vector_search(
        &self,
        query: &[f32],
        model_id: &str,
        limit: usize,
    ) -> Result<Vec<Candidate>>;

    /// Load at most `limit` embedded chunks with matching model and dims,
    /// most recently updated first.
    async fn scan_embeddings(&self, model_id: &str, dims: usize, limit: usize) -> Result<ScanBatch>;

    /// Embedded chunks that cannot be compared with a `dims`-sized vector from `model_id`.
    async fn count_stale_embeddings(&self, model_id: &str, dims: usize) -> Result<usize>;

    // ---- meta ----
    async fn get_meta(&self, key: &str) -> Result<Option<String>>;
    async fn set_meta(&self, key: &str, value: &str) -> Result<()>;

    async fn counts(&self) -> Result<StoreCounts>;

    /// Close the underlying connections. Further calls fail.
    async fn close(&self);
}
