/// SQLite schema: a closed set of tables and column migrations, each mapped
/// to a fixed statement. Nothing here is ever built from caller input.
use {sqlx::SqlitePool, tracing::debug};

use crate::error::Result;

/// Every table the store knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Meta,
    Files,
    Chunks,
    EmbeddingCache,
    /// FTS5 mirror of `chunks.text`; optional.
    ChunksFts,
}

impl Table {
    /// Tables created unconditionally, in dependency order.
    pub const REQUIRED: [Table; 4] = [Table::Meta, Table::Files, Table::Chunks, Table::EmbeddingCache];

    pub fn name(self) -> &'static str {
        match self {
            Self::Meta => "meta",
            Self::Files => "files",
            Self::Chunks => "chunks",
            Self::EmbeddingCache => "embedding_cache",
            Self::ChunksFts => "chunks_fts",
        }
    }

    fn create_statement(self) -> &'static str {
        match self {
            Self::Meta => {
                "CREATE TABLE IF NOT EXISTS meta (
                    key   TEXT PRIMARY KEY,
                    value TEXT NOT NULL
                )"
            },
            Self::Files => {
                "CREATE TABLE IF NOT EXISTS files (
                    path        TEXT PRIMARY KEY,
                    hash        TEXT NOT NULL,
                    mtime       INTEGER NOT NULL,
                    size        INTEGER NOT NULL,
                    chunk_count INTEGER NOT NULL DEFAULT 0,
                    indexed_at  INTEGER NOT NULL
                )"
            },
            Self::Chunks => {
                "CREATE TABLE IF NOT EXISTS chunks (
                    id             TEXT PRIMARY KEY,
                    source_path    TEXT NOT NULL,
                    content_hash   TEXT NOT NULL,
                    start_line     INTEGER NOT NULL DEFAULT 0,
                    end_line       INTEGER NOT NULL DEFAULT 0,
                    text           TEXT NOT NULL,
                    token_count    INTEGER NOT NULL,
                    embedding      BLOB,
                    embedding_dims INTEGER,
                    model_id       TEXT NOT NULL DEFAULT '',
                    updated_at     INTEGER NOT NULL
                )"
            },
            Self::EmbeddingCache => {
                "CREATE TABLE IF NOT EXISTS embedding_cache (
                    content_hash TEXT NOT NULL,
                    model_id     TEXT NOT NULL,
                    embedding    BLOB NOT NULL,
                    dims         INTEGER NOT NULL,
                    created_at   INTEGER NOT NULL,
                    PRIMARY KEY (content_hash, model_id)
                )"
            },
            Self::ChunksFts => {
                "CREATE VIRTUAL TABLE IF NOT EXISTS chunks_fts USING fts5(
                    text,
                    id UNINDEXED,
                    source_path UNINDEXED
                )"
            },
        }
    }
}

/// A column added after a table's first release.
struct ColumnMigration {
    table: Table,
    column: &'static str,
    statement: &'static str,
}

const COLUMN_MIGRATIONS: &[ColumnMigration] = &[
    ColumnMigration {
        table: Table::Chunks,
        column: "start_line",
        statement: "ALTER TABLE chunks ADD COLUMN start_line INTEGER NOT NULL DEFAULT 0",
    },
    ColumnMigration {
        table: Table::Chunks,
        column: "end_line",
        statement: "ALTER TABLE chunks ADD COLUMN end_line INTEGER NOT NULL DEFAULT 0",
    },
    ColumnMigration {
        table: Table::Files,
        column: "chunk_count",
        statement: "ALTER TABLE files ADD COLUMN chunk_count INTEGER NOT NULL DEFAULT 0",
    },
];

const INDEX_STATEMENTS: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_chunks_source_path ON chunks(source_path)",
    "CREATE INDEX IF NOT EXISTS idx_chunks_dims_model ON chunks(embedding_dims, model_id)",
    "CREATE INDEX IF NOT EXISTS idx_chunks_updated_at ON chunks(updated_at)",
    "CREATE INDEX IF NOT EXISTS idx_embedding_cache_created_at ON embedding_cache(created_at)",
];

pub async fn table_exists(pool: &SqlitePool, table: Table) -> Result<bool> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?")
            .bind(table.name())
            .fetch_one(pool)
            .await?;
    Ok(count > 0)
}

async fn column_exists(pool: &SqlitePool, table: Table, column: &str) -> Result<bool> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pragma_table_info(?) WHERE name = ?")
        .bind(table.name())
        .bind(column)
        .fetch_one(pool)
        .await?;
    Ok(count > 0)
}

/// Create missing tables, columns and indexes. Safe to run on every open.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    for table in Table::REQUIRED {
        if !table_exists(pool, table).await? {
            sqlx::query(table.create_statement()).execute(pool).await?;
            debug!(table = table.name(), "created table");
        }
    }
    for migration in COLUMN_MIGRATIONS {
        if !column_exists(pool, migration.table, migration.column).await? {
            sqlx::query(migration.statement).execute(pool).await?;
            debug!(
                table = migration.table.name(),
                column = migration.column,
                "added column"
            );
        }
    }
    for statement in INDEX_STATEMENTS {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

/// Try to create the FTS5 keyword index. Returns the error instead of
/// propagating so the caller can record the capability as missing.
pub async fn create_keyword_index(pool: &SqlitePool) -> std::result::Result<(), sqlx::Error> {
    sqlx::query(Table::ChunksFts.create_statement())
        .execute(pool)
        .await
        .map(|_| ())
}

// ── Rows ────────────────────────────────────────────────────────────────────

/// Per-source bookkeeping used for incremental sync.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct FileRow {
    /// Workspace-relative path with `/` separators.
    pub path: String,
    /// SHA-256 of the full file content at index time.
    pub hash: String,
    pub mtime: i64,
    pub size: i64,
    pub chunk_count: i64,
    pub indexed_at: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChunkRow {
    pub id: String,
    pub source_path: String,
    pub content_hash: String,
    pub start_line: i64,
    pub end_line: i64,
    pub text: String,
    pub token_count: i64,
    pub embedding: Option<Vec<f32>>,
    pub model_id: String,
    pub updated_at: i64,
}

impl ChunkRow {
    pub fn embedding_dims(&self) -> Option<i64> {
        self.embedding.as_ref().map(|v| v.len() as i64)
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct ChunkRecord {
    id: String,
    source_path: String,
    content_hash: String,
    start_line: i64,
    end_line: i64,
    text: String,
    token_count: i64,
    embedding: Option<Vec<u8>>,
    model_id: String,
    updated_at: i64,
}

impl From<ChunkRecord> for ChunkRow {
    fn from(r: ChunkRecord) -> Self {
        Self {
            id: r.id,
            source_path: r.source_path,
            content_hash: r.content_hash,
            start_line: r.start_line,
            end_line: r.end_line,
            text: r.text,
            token_count: r.token_count,
            embedding: r.embedding.as_deref().map(decode_embedding),
            model_id: r.model_id,
            updated_at: r.updated_at,
        }
    }
}

/// Little-endian f32 blob, the layout sqlite-vec reads natively.
pub fn encode_embedding(v: &[f32]) -> Vec<u8> {
    v.iter().flat_map(|f| f.to_le_bytes()).collect()
}

pub fn decode_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}
