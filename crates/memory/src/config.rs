use std::path::{Path, PathBuf};

use {
    serde::{Deserialize, Serialize},
    serde_json::{Map, Value},
    sha2::{Digest, Sha256},
};

use crate::error::{MemoryError, Result};

/// Which embedding backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProviderKind {
    /// Try local, then remote, then run keyword-only.
    #[default]
    Auto,
    Local,
    #[serde(alias = "remote")]
    OpenAi,
    #[serde(rename = "none", alias = "disabled")]
    Disabled,
}

impl EmbeddingProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Local => "local",
            Self::OpenAi => "openai",
            Self::Disabled => "none",
        }
    }
}

/// Settings for one memory manager.
///
/// Build from loose JSON with [`MemorySettings::from_value`], which accepts
/// camelCase or snake_case keys and numbers written as strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MemorySettings {
    pub embedding_provider: EmbeddingProviderKind,
    /// Embedding model; provider default when `None`.
    pub model_name: Option<String>,
    /// Base URL of an OpenAI-compatible embeddings API.
    pub base_url: Option<String>,
    /// API key for the remote provider. Falls back to `OPENAI_API_KEY`.
    pub api_key: Option<String>,
    /// Path to a local GGUF model file (requires the `local-embeddings` feature).
    pub local_model_path: Option<PathBuf>,
    /// Target chunk size in estimated tokens.
    pub chunk_size_tokens: usize,
    /// Overlap carried between consecutive chunks, in estimated tokens.
    pub chunk_overlap_tokens: usize,
    /// Token budget of one embedding request.
    pub batch_max_tokens: usize,
    /// Characters per token used by every budget estimate.
    pub chars_per_token_estimate: f32,
    /// Weight of the vector score in hybrid ranking (0.0–1.0).
    pub hybrid_weight: f32,
    /// Each retrieval path fetches `k * candidate_multiplier` candidates.
    pub candidate_multiplier: usize,
    /// Merged results scoring below this are dropped.
    pub min_score: f32,
    pub watch_enabled: bool,
    pub watch_debounce_ms: u64,
    /// Upper bound on rows loaded by the brute-force vector scan.
    pub max_fallback_scan_chunks: usize,
    pub registry_capacity: usize,
    /// SQLite database file. Defaults to `~/.recall/memory/<agent>.sqlite`.
    pub store_path: Option<PathBuf>,
    /// Additional files or directories to index (must resolve inside the workspace).
    pub extra_paths: Vec<PathBuf>,
    /// sqlite-vec loadable extension enabling native vector ranking.
    pub vector_extension: Option<PathBuf>,
    /// Keep at most this many embedding cache rows (oldest evicted first).
    pub cache_max_entries: Option<usize>,
    pub embed_retry_attempts: u32,
    pub embed_retry_backoff_ms: u64,
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            embedding_provider: EmbeddingProviderKind::Auto,
            model_name: None,
            base_url: None,
            api_key: None,
            local_model_path: None,
            chunk_size_tokens: 400,
            chunk_overlap_tokens: 80,
            batch_max_tokens: 8000,
            chars_per_token_estimate: crate::tokens::DEFAULT_CHARS_PER_TOKEN,
            hybrid_weight: 0.7,
            candidate_multiplier: 4,
            min_score: 0.0,
            watch_enabled: true,
            watch_debounce_ms: 1500,
            max_fallback_scan_chunks: 5000,
            registry_capacity: 8,
            store_path: None,
            extra_paths: Vec::new(),
            vector_extension: None,
            cache_max_entries: None,
            embed_retry_attempts: 3,
            embed_retry_backoff_ms: 500,
        }
    }
}

const NUMERIC_KEYS: &[&str] = &[
    "chunk_size_tokens",
    "chunk_overlap_tokens",
    "batch_max_tokens",
    "chars_per_token_estimate",
    "hybrid_weight",
    "candidate_multiplier",
    "min_score",
    "watch_debounce_ms",
    "max_fallback_scan_chunks",
    "registry_capacity",
    "cache_max_entries",
    "embed_retry_attempts",
    "embed_retry_backoff_ms",
];

const BOOL_KEYS: &[&str] = &["watch_enabled"];

impl MemorySettings {
    /// Canonicalize, deserialize and validate a loose settings object.
    pub fn from_value(value: &Value) -> Result<Self> {
        let canonical = canonicalize_value(value)?;
        let settings: Self = serde_json::from_value(canonical)
            .map_err(|e| MemoryError::Config(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        fn unit_interval(name: &str, v: f32) -> Result<()> {
            if !v.is_finite() || !(0.0..=1.0).contains(&v) {
                return Err(MemoryError::Config(format!(
                    "{name} must be within [0, 1], got {v}"
                )));
            }
            Ok(())
        }
        fn positive(name: &str, v: usize) -> Result<()> {
            if v == 0 {
                return Err(MemoryError::Config(format!("{name} must be at least 1")));
            }
            Ok(())
        }

        unit_interval("hybrid_weight", self.hybrid_weight)?;
        unit_interval("min_score", self.min_score)?;
        if !self.chars_per_token_estimate.is_finite() || self.chars_per_token_estimate < 1.0 {
            return Err(MemoryError::Config(format!(
                "chars_per_token_estimate must be >= 1, got {}",
                self.chars_per_token_estimate
            )));
        }
        positive("chunk_size_tokens", self.chunk_size_tokens)?;
        positive("batch_max_tokens", self.batch_max_tokens)?;
        positive("candidate_multiplier", self.candidate_multiplier)?;
        positive("max_fallback_scan_chunks", self.max_fallback_scan_chunks)?;
        positive("registry_capacity", self.registry_capacity)?;
        positive("embed_retry_attempts", self.embed_retry_attempts as usize)?;
        if self.chunk_overlap_tokens >= self.chunk_size_tokens {
            return Err(MemoryError::Config(format!(
                "chunk_overlap_tokens ({}) must be smaller than chunk_size_tokens ({})",
                self.chunk_overlap_tokens, self.chunk_size_tokens
            )));
        }
        if self.model_name.as_deref().is_some_and(str::is_empty) {
            return Err(MemoryError::Config("model_name must not be empty".into()));
        }
        Ok(())
    }

    /// Stable hash of the semantic content of these settings.
    pub fn signature(&self) -> String {
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&canonical);
        format!("{:x}", hasher.finalize())
    }

    pub fn token_estimator(&self) -> crate::tokens::TokenEstimator {
        crate::tokens::TokenEstimator::new(self.chars_per_token_estimate)
    }

    /// Database location for `agent_id`, honouring `store_path`.
    pub fn resolve_store_path(&self, agent_id: &str) -> PathBuf {
        if let Some(path) = &self.store_path {
            return path.clone();
        }
        let file = format!("{}.sqlite", sanitize_file_stem(agent_id));
        data_dir().join("memory").join(file)
    }
}

fn data_dir() -> PathBuf {
    directories::BaseDirs::new()
        .map(|d| d.home_dir().join(".recall"))
        .unwrap_or_else(|| Path::new(".recall").to_path_buf())
}

fn sanitize_file_stem(raw: &str) -> String {
    let stem: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if stem.is_empty() {
        "default".into()
    } else {
        stem
    }
}

/// Normalize a loose settings object: snake_case keys, trimmed strings,
/// lowercase provider names, numbers and booleans written as strings
/// converted to their JSON types, integral floats collapsed to integers.
pub fn canonicalize_value(value: &Value) -> Result<Value> {
    let map = match value {
        Value::Null => return Ok(Value::Object(Map::new())),
        Value::Object(map) => map,
        other => {
            return Err(MemoryError::Config(format!(
                "settings must be an object, got {other}"
            )));
        },
    };

    let mut out = Map::new();
    for (key, value) in map {
        let key = to_snake_case(key.trim());
        let value = canonical_field(&key, value);
        if out.insert(key.clone(), value).is_some() {
            return Err(MemoryError::Config(format!("duplicate setting `{key}`")));
        }
    }
    Ok(Value::Object(out))
}

fn canonical_field(key: &str, value: &Value) -> Value {
    let value = trim_strings(value);
    if key == "embedding_provider"
        && let Value::String(s) = &value
    {
        return Value::String(s.to_ascii_lowercase());
    }
    if NUMERIC_KEYS.contains(&key) {
        let number = match &value {
            Value::String(s) => s.parse::<f64>().ok(),
            Value::Number(n) => n.as_f64(),
            _ => None,
        };
        if let Some(n) = number {
            if n.fract() == 0.0 && n >= 0.0 && n < u64::MAX as f64 {
                return Value::from(n as u64);
            }
            if let Some(num) = serde_json::Number::from_f64(n) {
                return Value::Number(num);
            }
        }
    }
    if BOOL_KEYS.contains(&key)
        && let Value::String(s) = &value
    {
        match s.to_ascii_lowercase().as_str() {
            "true" | "yes" | "on" | "1" => return Value::Bool(true),
            "false" | "no" | "off" | "0" => return Value::Bool(false),
            _ => {},
        }
    }
    value
}

fn trim_strings(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(s.trim().to_string()),
        Value::Array(items) => Value::Array(items.iter().map(trim_strings).collect()),
        other => other.clone(),
    }
}

fn to_snake_case(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    for (i, ch) in key.chars().enumerate() {
        if ch == '-' {
            out.push('_');
        } else if ch.is_ascii_uppercase() {
            if i > 0 && !out.ends_with('_') {
                out.push('_');
            }
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}
