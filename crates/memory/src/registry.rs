//! Bounded registry of live memory managers.
//!
//! Managers are keyed by `(agent id, canonical workspace root, settings
//! signature)`, so equivalent settings written differently share one
//! manager. The least recently used idle manager is closed and evicted when
//! the registry grows past capacity.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use {
    serde_json::Value,
    tokio::sync::Mutex,
    tracing::{debug, info, warn},
};

use crate::{
    config::MemorySettings,
    embeddings::{ResolvedProvider, resolve_provider},
    error::Result,
    manager::MemoryManager,
};

/// Builds the embedding provider for a manager about to be opened.
pub type ProviderFactory = Arc<dyn Fn(&MemorySettings) -> Result<ResolvedProvider> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RegistryKey {
    pub agent_id: String,
    pub workspace: PathBuf,
    pub signature: String,
}

struct Entry {
    manager: Arc<MemoryManager>,
    last_used: u64,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<RegistryKey, Entry>,
    tick: u64,
}

pub struct MemoryRegistry {
    capacity: usize,
    factory: ProviderFactory,
    inner: Mutex<Inner>,
}

impl MemoryRegistry {
    pub fn new(capacity: usize) -> Self {
        Self::with_provider_factory(capacity, Arc::new(resolve_provider))
    }

    /// Registry sized by the `registry_capacity` of `settings`.
    pub fn from_settings(settings: &Value) -> Result<Self> {
        Ok(Self::new(MemorySettings::from_value(settings)?.registry_capacity))
    }

    pub fn with_provider_factory(capacity: usize, factory: ProviderFactory) -> Self {
        Self {
            capacity: capacity.max(1),
            factory,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Return the manager for this agent, workspace and settings, opening it
    /// on first use. Settings are validated before any store is touched.
    pub async fn get(
        &self,
        agent_id: &str,
        workspace: &Path,
        settings: &Value,
    ) -> Result<Arc<MemoryManager>> {
        let settings = MemorySettings::from_value(settings)?;
        let key = RegistryKey {
            agent_id: agent_id.to_string(),
            workspace: std::fs::canonicalize(workspace)?,
            signature: settings.signature(),
        };

        let mut inner = self.inner.lock().await;
        inner.tick += 1;
        let tick = inner.tick;

        if let Some(entry) = inner.entries.get_mut(&key) {
            if !entry.manager.is_closed() {
                entry.last_used = tick;
                return Ok(Arc::clone(&entry.manager));
            }
            debug!(agent_id, "dropping closed manager from registry");
            inner.entries.remove(&key);
        }

        let provider = (self.factory)(&settings)?;
        let manager = MemoryManager::open(agent_id, &key.workspace, settings, provider).await?;
        inner.entries.insert(key.clone(), Entry {
            manager: Arc::clone(&manager),
            last_used: tick,
        });
        self.evict_over_capacity(&mut inner, &key).await;
        Ok(manager)
    }

    async fn evict_over_capacity(&self, inner: &mut Inner, keep: &RegistryKey) {
        while inner.entries.len() > self.capacity {
            let victim = inner
                .entries
                .iter()
                .filter(|(k, e)| *k != keep && !e.manager.is_busy())
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone());
            let Some(victim) = victim else {
                warn!(
                    entries = inner.entries.len(),
                    capacity = self.capacity,
                    "all memory managers busy, registry over capacity"
                );
                return;
            };
            if let Some(entry) = inner.entries.remove(&victim) {
                entry.manager.close().await;
                info!(agent_id = %victim.agent_id, "evicted memory manager");
            }
        }
    }

    /// Close `manager` and remove it. Returns whether it was registered.
    pub async fn close(&self, manager: &Arc<MemoryManager>) -> bool {
        let mut inner = self.inner.lock().await;
        let key = inner
            .entries
            .iter()
            .find(|(_, e)| Arc::ptr_eq(&e.manager, manager))
            .map(|(k, _)| k.clone());
        let removed = key.and_then(|k| inner.entries.remove(&k));
        drop(inner);
        match removed {
            Some(entry) => {
                entry.manager.close().await;
                true
            },
            None => false,
        }
    }

    pub async fn close_all(&self) {
        let entries: Vec<Entry> = {
            let mut inner = self.inner.lock().await;
            inner.entries.drain().map(|(_, e)| e).collect()
        };
        for entry in entries {
            entry.manager.close().await;
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
