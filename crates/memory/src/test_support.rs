//! Deterministic embedding providers for tests.

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

use {async_trait::async_trait, tokio::sync::Notify};

use crate::embeddings::EmbeddingProvider;

/// Words mapped onto shared axes so that related words embed close together.
const CONCEPTS: &[&[&str]] = &[
    &["cat", "cats", "kitten", "kittens", "feline", "purr", "whiskers", "pet", "pets"],
    &["rust", "cargo", "compiler", "borrow", "crate", "ownership", "lifetimes"],
    &["garden", "plant", "plants", "tomato", "tomatoes", "soil", "seeds"],
    &["travel", "flight", "hotel", "trip", "airport", "luggage"],
];

/// Number of axes reserved for concept words; remaining words hash into 4 more.
const CONCEPT_AXES: usize = 4;
pub const CONCEPT_DIMS: usize = 8;

/// Bag-of-concepts embedding of `text`, zero-padded to `dims` (at least 8).
pub fn concept_vector(text: &str, dims: usize) -> Vec<f32> {
    let mut v = vec![0.0f32; dims.max(CONCEPT_DIMS)];
    for word in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
    {
        let word = word.to_lowercase();
        match CONCEPTS.iter().position(|group| group.contains(&word.as_str())) {
            Some(axis) => v[axis] += 1.0,
            None => {
                let h = word.bytes().fold(7usize, |acc, b| acc.wrapping_mul(31).wrapping_add(b as usize));
                v[CONCEPT_AXES + h % (CONCEPT_DIMS - CONCEPT_AXES)] += 0.25;
            },
        }
    }
    v
}

/// Mock provider with call accounting, scripted failures and an optional gate
/// that holds calls until released.
pub struct MockProvider {
    model: String,
    key: String,
    dims: usize,
    calls: AtomicUsize,
    texts: Mutex<Vec<String>>,
    fail_next: AtomicUsize,
    gated: AtomicBool,
    entered: Notify,
    release: Notify,
}

impl MockProvider {
    pub fn new(model: &str, dims: usize) -> Arc<Self> {
        Arc::new(Self {
            model: model.into(),
            key: format!("mock-{model}"),
            dims,
            calls: AtomicUsize::new(0),
            texts: Mutex::new(Vec::new()),
            fail_next: AtomicUsize::new(0),
            gated: AtomicBool::new(false),
            entered: Notify::new(),
            release: Notify::new(),
        })
    }

    pub fn concept() -> Arc<Self> {
        Self::new("concept", CONCEPT_DIMS)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn texts_embedded(&self) -> Vec<String> {
        self.texts.lock().unwrap().clone()
    }

    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Make every subsequent call wait for [`MockProvider::release`].
    pub fn gate(&self) {
        self.gated.store(true, Ordering::SeqCst);
    }

    /// Resolves once a gated call is waiting.
    pub async fn wait_entered(&self) {
        self.entered.notified().await;
    }

    /// Open the gate for all current and future calls.
    pub fn release(&self) {
        self.gated.store(false, Ordering::SeqCst);
        self.release.notify_waiters();
    }
}

#[async_trait]
impl EmbeddingProvider for MockProvider {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        let mut out = self.embed_batch(&[text.to_string()]).await?;
        out.pop().ok_or_else(|| anyhow::anyhow!("empty"))
    }

    async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.gated.load(Ordering::SeqCst) {
            let released = self.release.notified();
            self.entered.notify_one();
            if self.gated.load(Ordering::SeqCst) {
                released.await;
            }
        }
        if self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            anyhow::bail!("scripted provider failure");
        }
        self.texts.lock().unwrap().extend(texts.iter().cloned());
        Ok(texts.iter().map(|t| concept_vector(t, self.dims)).collect())
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    fn provider_key(&self) -> &str {
        &self.key
    }
}
