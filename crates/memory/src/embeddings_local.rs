/// Offline embeddings from a GGUF model via llama.cpp.
use std::{
    num::NonZeroU32,
    path::{Path, PathBuf},
    sync::{Arc, OnceLock},
};

use {
    async_trait::async_trait,
    llama_cpp_2::{
        context::params::LlamaContextParams,
        llama_backend::LlamaBackend,
        llama_batch::LlamaBatch,
        model::{AddBos, LlamaModel, params::LlamaModelParams},
    },
    sha2::{Digest, Sha256},
    tracing::info,
};

use crate::embeddings::EmbeddingProvider;

const DEFAULT_MODEL_FILE: &str = "embeddinggemma-300M-Q8_0.gguf";
const CONTEXT_TOKENS: u32 = 2048;

/// llama.cpp may only be initialised once per process.
static BACKEND: OnceLock<Result<LlamaBackend, String>> = OnceLock::new();

fn backend() -> anyhow::Result<&'static LlamaBackend> {
    BACKEND
        .get_or_init(|| LlamaBackend::init().map_err(|e| e.to_string()))
        .as_ref()
        .map_err(|e| anyhow::anyhow!("llama.cpp backend init failed: {e}"))
}

/// `~/.recall/models/embeddinggemma-300M-Q8_0.gguf`.
pub fn default_model_path() -> PathBuf {
    directories::BaseDirs::new()
        .map(|d| d.home_dir().join(".recall"))
        .unwrap_or_else(|| PathBuf::from(".recall"))
        .join("models")
        .join(DEFAULT_MODEL_FILE)
}

pub struct LocalEmbeddingProvider {
    model: Arc<LlamaModel>,
    model_name: String,
    dims: usize,
    provider_key: String,
}

impl LocalEmbeddingProvider {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let backend = backend()?;
        let model = LlamaModel::load_from_file(backend, path, &LlamaModelParams::default())?;
        let dims = model.n_embd().max(0) as usize;
        let model_name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "local".into());

        let mut hasher = Sha256::new();
        hasher.update(b"local:");
        hasher.update(path.to_string_lossy().as_bytes());
        let provider_key = format!("{:x}", hasher.finalize())[..16].to_string();

        info!(path = %path.display(), dims, "loaded local embedding model");
        Ok(Self {
            model: Arc::new(model),
            model_name,
            dims,
            provider_key,
        })
    }
}

fn embed_blocking(model: &LlamaModel, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
    let backend = backend()?;
    let params = LlamaContextParams::default()
        .with_n_ctx(NonZeroU32::new(CONTEXT_TOKENS))
        .with_embeddings(true);
    let mut ctx = model.new_context(backend, params)?;

    let mut out = Vec::with_capacity(texts.len());
    for text in texts {
        let mut tokens = model.str_to_token(text, AddBos::Always)?;
        tokens.truncate(CONTEXT_TOKENS as usize);
        let mut batch = LlamaBatch::new(CONTEXT_TOKENS as usize, 1);
        batch.add_sequence(&tokens, 0, false)?;
        ctx.clear_kv_cache();
        ctx.decode(&mut batch)?;
        out.push(normalize(ctx.embeddings_seq_ith(0)?));
    }
    Ok(out)
}

fn normalize(v: &[f32]) -> Vec<f32> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        v.iter().map(|x| x / norm).collect()
    } else {
        v.to_vec()
    }
}

#[async_trait]
impl EmbeddingProvider for LocalEmbeddingProvider {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        self.embed_batch(&[text.to_string()])
            .await?
            .pop()
            .ok_or_else(|| anyhow::anyhow!("empty local embedding result"))
    }

    async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        let model = Arc::clone(&self.model);
        let texts = texts.to_vec();
        tokio::task::spawn_blocking(move || embed_blocking(&model, &texts)).await?
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    fn provider_key(&self) -> &str {
        &self.provider_key
    }
}
