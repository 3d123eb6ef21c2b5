/// SQLite implementation of [`MemoryStore`] on sqlx.
use std::{collections::HashMap, path::Path, str::FromStr, time::Duration};

use {
    async_trait::async_trait,
    sqlx::{
        SqlitePool,
        sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
    },
    tracing::{debug, info, warn},
};

use crate::{
    error::Result,
    now_ms,
    schema::{self, ChunkRecord, ChunkRow, FileRow, encode_embedding},
    store::{Candidate, Capabilities, MemoryStore, ScanBatch, StoreCounts},
};

/// Builds a `SELECT` over every chunk column at compile time.
macro_rules! select_chunks {
    ($rest:literal) => {
        concat!(
            "SELECT id, source_path, content_hash, start_line, end_line, text, token_count, ",
            "embedding, model_id, updated_at FROM chunks ",
            $rest
        )
    };
}

/// SQLite allows 999 bound parameters per statement on older builds.
const CACHE_LOOKUP_BATCH: usize = 500;

pub struct SqliteMemoryStore {
    pool: SqlitePool,
    capabilities: Capabilities,
}

#[derive(sqlx::FromRow)]
struct CandidateRecord {
    id: String,
    source_path: String,
    start_line: i64,
    end_line: i64,
    text: String,
    raw: f64,
}

impl From<CandidateRecord> for Candidate {
    fn from(r: CandidateRecord) -> Self {
        Self {
            id: r.id,
            source_path: r.source_path,
            start_line: r.start_line,
            end_line: r.end_line,
            text: r.text,
            raw_score: r.raw,
        }
    }
}

impl SqliteMemoryStore {
    /// Open (or create) the database at `path`, run migrations and probe
    /// optional capabilities. Optional backends that fail to initialise are
    /// recorded as unavailable rather than failing the open.
    pub async fn open(path: &Path, vector_extension: Option<&Path>) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));
        let pool_options = SqlitePoolOptions::new().max_connections(4);

        let (pool, extension_loaded) = match vector_extension {
            Some(ext) => {
                let with_ext = options
                    .clone()
                    .extension(ext.to_string_lossy().into_owned());
                match pool_options.clone().connect_with(with_ext).await {
                    Ok(pool) => (pool, true),
                    Err(e) => {
                        warn!(
                            extension = %ext.display(),
                            error = %e,
                            "failed to load vector extension, vector search will use bounded scan"
                        );
                        (pool_options.connect_with(options).await?, false)
                    },
                }
            },
            None => (pool_options.connect_with(options).await?, false),
        };

        debug!(path = %path.display(), "opened memory store");
        Self::init(pool, extension_loaded).await
    }

    /// Private in-memory database on a single connection.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Self::init(pool, false).await
    }

    async fn init(pool: SqlitePool, extension_loaded: bool) -> Result<Self> {
        schema::run_migrations(&pool).await?;

        let keyword = match schema::create_keyword_index(&pool).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "FTS5 unavailable, keyword search disabled");
                false
            },
        };

        let native_vector = extension_loaded
            && match sqlx::query_scalar::<_, String>("SELECT vec_version()")
                .fetch_one(&pool)
                .await
            {
                Ok(version) => {
                    debug!(version = %version, "sqlite-vec loaded");
                    true
                },
                Err(e) => {
                    warn!(error = %e, "vector extension loaded but vec_version() failed");
                    false
                },
            };

        let capabilities = Capabilities {
            keyword,
            native_vector,
        };
        info!(
            keyword = capabilities.keyword,
            native_vector = capabilities.native_vector,
            "memory store ready"
        );
        Ok(Self { pool, capabilities })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Quote each alphanumeric term for FTS5 and OR them together.
pub fn build_fts_query(raw: &str) -> Option<String> {
    let terms: Vec<String> = raw
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{t}\""))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}

#[async_trait]
impl MemoryStore for SqliteMemoryStore {
    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    async fn get_file(&self, path: &str) -> Result<Option<FileRow>> {
        Ok(sqlx::query_as::<_, FileRow>("SELECT * FROM files WHERE path = ?")
            .bind(path)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn list_files(&self) -> Result<Vec<FileRow>> {
        Ok(
            sqlx::query_as::<_, FileRow>("SELECT * FROM files ORDER BY path ASC")
                .fetch_all(&self.pool)
                .await?,
        )
    }

    async fn replace_source(&self, file: &FileRow, chunks: &[ChunkRow]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM chunks WHERE source_path = ?")
            .bind(&file.path)
            .execute(&mut *tx)
            .await?;
        if self.capabilities.keyword {
            sqlx::query("DELETE FROM chunks_fts WHERE source_path = ?")
                .bind(&file.path)
                .execute(&mut *tx)
                .await?;
        }

        for chunk in chunks {
            sqlx::query(
                r#"INSERT INTO chunks
                   (id, source_path, content_hash, start_line, end_line, text, token_count,
                    embedding, embedding_dims, model_id, updated_at)
                   VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
            )
            .bind(&chunk.id)
            .bind(&chunk.source_path)
            .bind(&chunk.content_hash)
            .bind(chunk.start_line)
            .bind(chunk.end_line)
            .bind(&chunk.text)
            .bind(chunk.token_count)
            .bind(chunk.embedding.as_deref().map(encode_embedding))
            .bind(chunk.embedding_dims())
            .bind(&chunk.model_id)
            .bind(chunk.updated_at)
            .execute(&mut *tx)
            .await?;

            if self.capabilities.keyword {
                sqlx::query("INSERT INTO chunks_fts (text, id, source_path) VALUES (?, ?, ?)")
                    .bind(&chunk.text)
                    .bind(&chunk.id)
                    .bind(&chunk.source_path)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        sqlx::query(
            r#"INSERT INTO files (path, hash, mtime, size, chunk_count, indexed_at)
               VALUES (?, ?, ?, ?, ?, ?)
               ON CONFLICT(path) DO UPDATE SET
                 hash = excluded.hash,
                 mtime = excluded.mtime,
                 size = excluded.size,
                 chunk_count = excluded.chunk_count,
                 indexed_at = excluded.indexed_at"#,
        )
        .bind(&file.path)
        .bind(&file.hash)
        .bind(file.mtime)
        .bind(file.size)
        .bind(file.chunk_count)
        .bind(file.indexed_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn delete_source(&self, path: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chunks WHERE source_path = ?")
            .bind(path)
            .execute(&mut *tx)
            .await?;
        if self.capabilities.keyword {
            sqlx::query("DELETE FROM chunks_fts WHERE source_path = ?")
                .bind(path)
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query("DELETE FROM files WHERE path = ?")
            .bind(path)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn list_chunks(&self, offset: usize, limit: usize) -> Result<Vec<ChunkRow>> {
        let rows = sqlx::query_as::<_, ChunkRecord>(select_chunks!(
            "ORDER BY source_path ASC, start_line ASC, id ASC LIMIT ? OFFSET ?"
        ))
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn get_chunk(&self, id: &str) -> Result<Option<ChunkRow>> {
        let row = sqlx::query_as::<_, ChunkRecord>(select_chunks!("WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Into::into))
    }

    async fn count_pending_embeddings(&self, path: &str, model_id: &str) -> Result<usize> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM chunks WHERE source_path = ? AND (embedding IS NULL OR model_id != ?)",
        )
        .bind(path)
        .bind(model_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count as usize)
    }

    async fn get_cached_embeddings(
        &self,
        model_id: &str,
        hashes: &[String],
    ) -> Result<HashMap<String, Vec<f32>>> {
        let mut found = HashMap::new();
        for batch in hashes.chunks(CACHE_LOOKUP_BATCH) {
            let placeholders = vec!["?"; batch.len()].join(", ");
            let sql = format!(
                "SELECT content_hash, embedding FROM embedding_cache \
                 WHERE model_id = ? AND content_hash IN ({placeholders})"
            );
            let mut query = sqlx::query_as::<_, (String, Vec<u8>)>(&sql).bind(model_id);
            for hash in batch {
                query = query.bind(hash);
            }
            for (hash, blob) in query.fetch_all(&self.pool).await? {
                found.insert(hash, schema::decode_embedding(&blob));
            }
        }
        Ok(found)
    }

    async fn put_cached_embeddings(
        &self,
        model_id: &str,
        entries: &[(String, Vec<f32>)],
    ) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let now = now_ms();
        let mut tx = self.pool.begin().await?;
        for (hash, embedding) in entries {
            sqlx::query(
                r#"INSERT OR IGNORE INTO embedding_cache
                   (content_hash, model_id, embedding, dims, created_at)
                   VALUES (?, ?, ?, ?, ?)"#,
            )
            .bind(hash)
            .bind(model_id)
            .bind(encode_embedding(embedding))
            .bind(embedding.len() as i64)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn count_cached_embeddings(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM embedding_cache")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }

    async fn evict_embedding_cache(&self, keep: usize) -> Result<usize> {
        let total = self.count_cached_embeddings().await?;
        if total <= keep {
            return Ok(0);
        }
        let excess = (total - keep) as i64;
        let result = sqlx::query(
            r#"DELETE FROM embedding_cache WHERE rowid IN (
                 SELECT rowid FROM embedding_cache ORDER BY created_at ASC, rowid ASC LIMIT ?
               )"#,
        )
        .bind(excess)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn keyword_search(&self, query: &str, limit: usize) -> Result<Vec<Candidate>> {
        if !self.capabilities.keyword {
            return Err(crate::error::MemoryError::capability(
                "keyword index",
                "FTS5 is not available in this SQLite build",
            ));
        }
        let Some(fts_query) = build_fts_query(query) else {
            return Ok(Vec::new());
        };
        let rows = sqlx::query_as::<_, CandidateRecord>(
            r#"SELECT c.id, c.source_path, c.start_line, c.end_line, c.text,
                      bm25(chunks_fts) AS raw
               FROM chunks_fts
               JOIN chunks c ON c.id = chunks_fts.id
               WHERE chunks_fts MATCH ?
               ORDER BY raw ASC, c.id ASC
               LIMIT ?"#,
        )
        .bind(&fts_query)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn vector_search(
        &self,
        query: &[f32],
        model_id: &str,
        limit: usize,
    ) -> Result<Vec<Candidate>> {
        if !self.capabilities.native_vector {
            return Err(crate::error::MemoryError::capability(
                "vector index",
                "sqlite-vec is not loaded",
            ));
        }
        let rows = sqlx::query_as::<_, CandidateRecord>(
            r#"SELECT id, source_path, start_line, end_line, text,
                      1.0 - vec_distance_cosine(embedding, ?) AS raw
               FROM chunks
               WHERE embedding IS NOT NULL AND embedding_dims = ? AND model_id = ?
               ORDER BY raw DESC, id ASC
               LIMIT ?"#,
        )
        .bind(encode_embedding(query))
        .bind(query.len() as i64)
        .bind(model_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn scan_embeddings(&self, model_id: &str, dims: usize, limit: usize) -> Result<ScanBatch> {
        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM chunks WHERE embedding IS NOT NULL AND embedding_dims = ? AND model_id = ?",
        )
        .bind(dims as i64)
        .bind(model_id)
        .fetch_one(&self.pool)
        .await?;

        let rows = sqlx::query_as::<_, ChunkRecord>(select_chunks!(
            "WHERE embedding IS NOT NULL AND embedding_dims = ? AND model_id = ? \
             ORDER BY updated_at DESC, id ASC LIMIT ?"
        ))
        .bind(dims as i64)
        .bind(model_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(ScanBatch {
            rows: rows.into_iter().map(Into::into).collect(),
            total_candidates: total as usize,
        })
    }

    async fn count_stale_embeddings(&self, model_id: &str, dims: usize) -> Result<usize> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM chunks WHERE embedding IS NOT NULL AND (embedding_dims != ? OR model_id != ?)",
        )
        .bind(dims as i64)
        .bind(model_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count as usize)
    }

    async fn get_meta(&self, key: &str) -> Result<Option<String>> {
        Ok(sqlx::query_scalar("SELECT value FROM meta WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO meta (key, value) VALUES (?, ?) ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn counts(&self) -> Result<StoreCounts> {
        let (files, chunks, embedded, cached): (i64, i64, i64, i64) = sqlx::query_as(
            r#"SELECT
                 (SELECT COUNT(*) FROM files),
                 (SELECT COUNT(*) FROM chunks),
                 (SELECT COUNT(*) FROM chunks WHERE embedding IS NOT NULL),
                 (SELECT COUNT(*) FROM embedding_cache)"#,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(StoreCounts {
            files: files as usize,
            chunks: chunks as usize,
            embedded_chunks: embedded as usize,
            cached_embeddings: cached as usize,
        })
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
