//! Error taxonomy for the memory index.

use std::{path::PathBuf, sync::Arc};

use thiserror::Error;

pub type Result<T, E = MemoryError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum MemoryError {
    /// Settings failed to parse or validate. Raised before any store is opened.
    #[error("invalid memory settings: {0}")]
    Config(String),

    /// An optional backend (keyword index, vector index, embedding provider)
    /// is not usable for the requested operation.
    #[error("{capability} unavailable: {reason}")]
    CapabilityUnavailable {
        capability: &'static str,
        reason: String,
    },

    /// The embedding provider failed after exhausting retries.
    #[error("embedding provider error: {0}")]
    EmbeddingProvider(String),

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    /// A path resolved (after following symlinks) outside the workspace root.
    #[error("path {} resolves outside workspace root {}", path.display(), root.display())]
    PathSecurity { path: PathBuf, root: PathBuf },

    /// A write target that is not a markdown file under the workspace.
    #[error("invalid memory path {}: {reason}", path.display())]
    InvalidPath { path: PathBuf, reason: &'static str },

    #[error("memory manager is closed")]
    Closed,

    #[error("not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("background task failed: {0}")]
    Task(String),

    /// Error of a sync run shared between several callers.
    #[error(transparent)]
    Shared(Arc<MemoryError>),
}

impl MemoryError {
    pub fn capability(capability: &'static str, reason: impl Into<String>) -> Self {
        Self::CapabilityUnavailable {
            capability,
            reason: reason.into(),
        }
    }

    /// Short machine-readable name of the error kind, used in sync reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::CapabilityUnavailable { .. } => "capability_unavailable",
            Self::EmbeddingProvider(_) => "embedding_provider",
            Self::Store(_) => "store",
            Self::PathSecurity { .. } => "path_security",
            Self::InvalidPath { .. } => "invalid_path",
            Self::Closed => "closed",
            Self::NotFound(_) => "not_found",
            Self::Io(_) => "io",
            Self::Task(_) => "task",
            Self::Shared(inner) => inner.kind(),
        }
    }
}
