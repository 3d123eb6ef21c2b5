/// Provider-agnostic embedding trait and provider chain resolution.
use std::sync::Arc;

use {async_trait::async_trait, tracing::{debug, info, warn}};

use crate::{
    config::{EmbeddingProviderKind, MemorySettings},
    embeddings_openai::OpenAiEmbeddingProvider,
    error::{MemoryError, Result},
};

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Generate an embedding for a single text.
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>>;

    /// Generate embeddings for a batch of texts, one vector per input in order.
    /// Default implementation calls `embed` sequentially.
    async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        let mut results = Vec::with_capacity(texts.len());
        for text in texts {
            results.push(self.embed(text).await?);
        }
        Ok(results)
    }

    /// The model name used by this provider (e.g. "text-embedding-3-small").
    fn model_name(&self) -> &str;

    /// The dimensionality of the embeddings produced, or 0 if not known up front.
    fn dimensions(&self) -> usize;

    /// A stable key identifying this provider configuration for cache discrimination.
    fn provider_key(&self) -> &str;
}

/// Outcome of resolving the provider chain for one manager.
#[derive(Clone)]
pub struct ResolvedProvider {
    /// Which link of the chain was selected; `Disabled` means keyword-only.
    pub kind: EmbeddingProviderKind,
    pub provider: Option<Arc<dyn EmbeddingProvider>>,
}

impl std::fmt::Debug for ResolvedProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedProvider")
            .field("kind", &self.kind)
            .field("model", &self.provider.as_ref().map(|p| p.model_name().to_string()))
            .finish()
    }
}

impl ResolvedProvider {
    pub fn disabled() -> Self {
        Self {
            kind: EmbeddingProviderKind::Disabled,
            provider: None,
        }
    }

    pub fn new(kind: EmbeddingProviderKind, provider: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            kind,
            provider: Some(provider),
        }
    }
}

/// Resolve the embedding provider for `settings`.
///
/// `auto` walks local → remote → disabled; explicitly requested providers
/// that cannot be constructed are a configuration error.
pub fn resolve_provider(settings: &MemorySettings) -> Result<ResolvedProvider> {
    match settings.embedding_provider {
        EmbeddingProviderKind::Disabled => Ok(ResolvedProvider::disabled()),
        EmbeddingProviderKind::Local => match local_provider(settings)? {
            Some(p) => Ok(ResolvedProvider::new(EmbeddingProviderKind::Local, p)),
            None => Err(MemoryError::Config(
                "local embeddings requested but no local model is available".into(),
            )),
        },
        EmbeddingProviderKind::OpenAi => match remote_provider(settings) {
            Some(p) => Ok(ResolvedProvider::new(EmbeddingProviderKind::OpenAi, p)),
            None => Err(MemoryError::Config(
                "openai embeddings requested but no API key is configured".into(),
            )),
        },
        EmbeddingProviderKind::Auto => {
            match local_provider(settings) {
                Ok(Some(p)) => {
                    info!(model = p.model_name(), "using local embedding provider");
                    return Ok(ResolvedProvider::new(EmbeddingProviderKind::Local, p));
                },
                Ok(None) => debug!("no local embedding model, trying remote"),
                Err(e) => warn!(error = %e, "local embedding provider failed, trying remote"),
            }
            if let Some(p) = remote_provider(settings) {
                info!(model = p.model_name(), "using remote embedding provider");
                return Ok(ResolvedProvider::new(EmbeddingProviderKind::OpenAi, p));
            }
            warn!("no embedding provider available, memory search is keyword-only");
            Ok(ResolvedProvider::disabled())
        },
    }
}

fn remote_provider(settings: &MemorySettings) -> Option<Arc<dyn EmbeddingProvider>> {
    let api_key = settings
        .api_key
        .clone()
        .filter(|k| !k.is_empty())
        .or_else(|| std::env::var("OPENAI_API_KEY").ok().filter(|k| !k.is_empty()))?;
    let mut provider = OpenAiEmbeddingProvider::new(api_key);
    if let Some(url) = &settings.base_url {
        provider = provider.with_base_url(url.clone());
    }
    if let Some(model) = &settings.model_name {
        let dims = crate::embeddings_openai::known_dimensions(model);
        provider = provider.with_model(model.clone(), dims);
    }
    Some(Arc::new(provider))
}

#[cfg(feature = "local-embeddings")]
fn local_provider(settings: &MemorySettings) -> Result<Option<Arc<dyn EmbeddingProvider>>> {
    let path = settings
        .local_model_path
        .clone()
        .unwrap_or_else(crate::embeddings_local::default_model_path);
    if !path.exists() {
        return Ok(None);
    }
    let provider = crate::embeddings_local::LocalEmbeddingProvider::load(&path)
        .map_err(|e| MemoryError::EmbeddingProvider(e.to_string()))?;
    Ok(Some(Arc::new(provider)))
}

#[cfg(not(feature = "local-embeddings"))]
fn local_provider(settings: &MemorySettings) -> Result<Option<Arc<dyn EmbeddingProvider>>> {
    if settings.local_model_path.is_some() {
        debug!("local_model_path set but the local-embeddings feature is not compiled in");
    }
    Ok(None)
}
