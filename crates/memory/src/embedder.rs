/// Turns chunk texts into vectors: cache first, then token-bounded provider
/// batches with retry.
use std::{collections::HashSet, sync::Arc, time::Duration};

use tracing::{debug, warn};

use crate::{
    config::{EmbeddingProviderKind, MemorySettings},
    embeddings::{EmbeddingProvider, ResolvedProvider},
    error::{MemoryError, Result},
    store::MemoryStore,
    tokens::TokenEstimator,
};

const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Exponential backoff: `base`, `2 * base`, `4 * base`, ... capped at 30s.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(factor).min(MAX_BACKOFF)
    }
}

/// Result of embedding a set of chunk texts.
#[derive(Debug, Default)]
pub struct EmbedOutcome {
    /// One entry per input, `None` when no vector could be produced.
    pub vectors: Vec<Option<Vec<f32>>>,
    /// Provider batches sent (retries not counted).
    pub requests: usize,
    pub cache_hits: usize,
    /// One message per batch that exhausted its retries or came back with
    /// empty vectors.
    pub failures: Vec<String>,
}

impl EmbedOutcome {
    pub fn embedded(&self) -> usize {
        self.vectors.iter().filter(|v| v.is_some()).count()
    }
}

pub struct Embedder {
    provider: Option<Arc<dyn EmbeddingProvider>>,
    kind: EmbeddingProviderKind,
    model_id: String,
    estimator: TokenEstimator,
    batch_max_tokens: usize,
    retry: RetryPolicy,
}

impl std::fmt::Debug for Embedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Embedder")
            .field("kind", &self.kind)
            .field("model_id", &self.model_id)
            .finish()
    }
}

impl Embedder {
    pub fn new(resolved: &ResolvedProvider, settings: &MemorySettings) -> Self {
        let model_id = resolved
            .provider
            .as_ref()
            .map(|p| format!("{}/{}", p.provider_key(), p.model_name()))
            .unwrap_or_default();
        Self {
            provider: resolved.provider.clone(),
            kind: resolved.kind,
            model_id,
            estimator: settings.token_estimator(),
            batch_max_tokens: settings.batch_max_tokens.max(1),
            retry: RetryPolicy {
                attempts: settings.embed_retry_attempts.max(1),
                base_delay: Duration::from_millis(settings.embed_retry_backoff_ms),
            },
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.provider.is_some()
    }

    pub fn kind(&self) -> EmbeddingProviderKind {
        self.kind
    }

    /// Identity stored alongside every vector; empty when disabled.
    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn model_name(&self) -> Option<&str> {
        self.provider.as_ref().map(|p| p.model_name())
    }

    /// Embed `(content_hash, text)` pairs. Provider failures are recorded in
    /// the outcome; only store errors abort.
    pub async fn embed_chunks(
        &self,
        store: &dyn MemoryStore,
        items: &[(String, String)],
    ) -> Result<EmbedOutcome> {
        let mut outcome = EmbedOutcome {
            vectors: vec![None; items.len()],
            ..Default::default()
        };
        let Some(provider) = &self.provider else {
            return Ok(outcome);
        };
        if items.is_empty() {
            return Ok(outcome);
        }

        // Unique hashes in first-seen order.
        let mut unique: Vec<(&str, &str)> = Vec::new();
        let mut seen = HashSet::new();
        for (hash, text) in items {
            if seen.insert(hash.as_str()) {
                unique.push((hash.as_str(), text.as_str()));
            }
        }

        let hashes: Vec<String> = unique.iter().map(|(h, _)| (*h).to_string()).collect();
        let mut resolved = store.get_cached_embeddings(&self.model_id, &hashes).await?;
        outcome.cache_hits = resolved.len();

        let misses: Vec<(&str, &str)> = unique
            .iter()
            .copied()
            .filter(|(h, _)| !resolved.contains_key(*h))
            .collect();

        for batch in self.plan_batches(misses.iter().map(|(_, t)| *t)) {
            let batch = &misses[batch];
            let texts: Vec<String> = batch.iter().map(|(_, t)| (*t).to_string()).collect();
            outcome.requests += 1;
            match self.call_with_retry(provider.as_ref(), &texts).await {
                Ok(vectors) => {
                    let entries: Vec<(String, Vec<f32>)> = batch
                        .iter()
                        .zip(vectors)
                        .filter(|(_, v)| !v.is_empty())
                        .map(|((h, _), v)| ((*h).to_string(), v))
                        .collect();
                    let empty = batch.len() - entries.len();
                    if empty > 0 {
                        warn!(empty, texts = batch.len(), "provider returned empty embeddings");
                        outcome
                            .failures
                            .push(format!("provider returned {empty} empty embeddings"));
                    }
                    store.put_cached_embeddings(&self.model_id, &entries).await?;
                    resolved.extend(entries);
                },
                Err(message) => {
                    warn!(texts = texts.len(), error = %message, "embedding batch failed");
                    outcome.failures.push(message);
                },
            }
        }

        for (slot, (hash, _)) in outcome.vectors.iter_mut().zip(items) {
            *slot = resolved.get(hash).cloned();
        }
        debug!(
            inputs = items.len(),
            unique = unique.len(),
            cache_hits = outcome.cache_hits,
            requests = outcome.requests,
            "embedded chunks"
        );
        Ok(outcome)
    }

    /// Embed a search query with the same retry policy as chunk batches.
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let provider = self
            .provider
            .as_ref()
            .ok_or_else(|| MemoryError::capability("embedding provider", "disabled"))?;
        let mut vectors = self
            .call_with_retry(provider.as_ref(), &[text.to_string()])
            .await
            .map_err(MemoryError::EmbeddingProvider)?;
        vectors
            .pop()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| MemoryError::EmbeddingProvider("empty query embedding".into()))
    }

    /// Split texts into index ranges whose estimated tokens fit the batch
    /// budget. A single oversize text gets a batch of its own.
    pub(crate) fn plan_batches<'a>(
        &self,
        texts: impl Iterator<Item = &'a str>,
    ) -> Vec<std::ops::Range<usize>> {
        let mut batches = Vec::new();
        let mut start = 0;
        let mut tokens = 0;
        let mut end = 0;
        for text in texts {
            let cost = self.estimator.estimate(text);
            if end > start && tokens + cost > self.batch_max_tokens {
                batches.push(start..end);
                start = end;
                tokens = 0;
            }
            tokens += cost;
            end += 1;
        }
        if end > start {
            batches.push(start..end);
        }
        batches
    }

    async fn call_with_retry(
        &self,
        provider: &dyn EmbeddingProvider,
        texts: &[String],
    ) -> std::result::Result<Vec<Vec<f32>>, String> {
        let mut last_error = String::new();
        for attempt in 1..=self.retry.attempts {
            match provider.embed_batch(texts).await {
                Ok(vectors) if vectors.len() == texts.len() => return Ok(vectors),
                Ok(vectors) => {
                    last_error = format!(
                        "provider returned {} vectors for {} texts",
                        vectors.len(),
                        texts.len()
                    );
                },
                Err(e) => last_error = e.to_string(),
            }
            if attempt < self.retry.attempts {
                let delay = self.retry.delay(attempt);
                debug!(attempt, delay_ms = delay.as_millis() as u64, error = %last_error, "retrying embedding request");
                tokio::time::sleep(delay).await;
            }
        }
        Err(last_error)
    }
}
