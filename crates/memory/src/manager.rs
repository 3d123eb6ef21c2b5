//! Per-agent memory manager: owns the store, embedder, search engine and
//! sync coordinator for one workspace.
//!
//! Lifecycle is `Uninitialized -> Ready -> Closed`. `Closed` is terminal and
//! every data operation on a closed manager fails with [`MemoryError::Closed`].

use std::{
    path::{Path, PathBuf},
    sync::{
        Arc, PoisonError, RwLock, Weak,
        atomic::{AtomicBool, Ordering},
    },
};

use {
    async_trait::async_trait,
    serde::Serialize,
    tokio::io::AsyncWriteExt,
    tokio_util::sync::CancellationToken,
    tracing::{debug, info},
};

use crate::{
    config::MemorySettings,
    embedder::Embedder,
    embeddings::ResolvedProvider,
    error::{MemoryError, Result},
    paths::{WorkspacePaths, is_markdown},
    schema::ChunkRow,
    search::{HybridSearch, SearchDefaults, SearchOptions, SearchResponse},
    store::{Capabilities, MemoryStore},
    store_sqlite::SqliteMemoryStore,
    sync::{SyncContext, SyncCoordinator, SyncOptions, SyncReport},
    trigger::SyncTrigger,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ManagerState {
    Uninitialized,
    Ready,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Append,
    Replace,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoryStatus {
    pub agent_id: String,
    pub workspace: PathBuf,
    pub store_path: PathBuf,
    pub state: ManagerState,
    pub files: usize,
    pub chunks: usize,
    pub embedded_chunks: usize,
    pub cached_embeddings: usize,
    pub capabilities: Capabilities,
    pub provider: &'static str,
    pub model: Option<String>,
    /// Workspace changed through the manager since the last completed sync.
    pub dirty: bool,
    pub syncing: bool,
    pub watching: bool,
}

struct Watch {
    #[cfg(feature = "file-watcher")]
    watcher: crate::watcher::MemoryFileWatcher,
    cancel: CancellationToken,
}

pub struct MemoryManager {
    agent_id: String,
    store_path: PathBuf,
    paths: WorkspacePaths,
    settings: Arc<MemorySettings>,
    store: Arc<dyn MemoryStore>,
    embedder: Arc<Embedder>,
    search: HybridSearch,
    sync: Arc<SyncContext>,
    coordinator: SyncCoordinator,
    root: CancellationToken,
    state: RwLock<ManagerState>,
    watch: tokio::sync::Mutex<Option<Watch>>,
}

impl std::fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryManager")
            .field("agent_id", &self.agent_id)
            .field("workspace", &self.paths.root())
            .field("state", &self.state())
            .finish()
    }
}

impl MemoryManager {
    /// Validate settings, open the store and probe its capabilities.
    pub async fn open(
        agent_id: &str,
        workspace: &Path,
        settings: MemorySettings,
        provider: ResolvedProvider,
    ) -> Result<Arc<Self>> {
        settings.validate()?;
        let paths = WorkspacePaths::new(workspace, &settings.extra_paths)?;
        let store_path = settings.resolve_store_path(agent_id);
        if let Some(parent) = store_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let state = RwLock::new(ManagerState::Uninitialized);
        let store: Arc<dyn MemoryStore> = Arc::new(
            SqliteMemoryStore::open(&store_path, settings.vector_extension.as_deref()).await?,
        );
        let capabilities = store.capabilities();
        let settings = Arc::new(settings);
        let embedder = Arc::new(Embedder::new(&provider, &settings));
        let search = HybridSearch::new(
            Arc::clone(&store),
            Arc::clone(&embedder),
            capabilities,
            SearchDefaults {
                hybrid_weight: settings.hybrid_weight,
                candidate_multiplier: settings.candidate_multiplier,
                min_score: settings.min_score,
                max_fallback_scan_chunks: settings.max_fallback_scan_chunks,
            },
        );
        let sync = Arc::new(SyncContext {
            store: Arc::clone(&store),
            embedder: Arc::clone(&embedder),
            paths: paths.clone(),
            settings: Arc::clone(&settings),
            dirty: AtomicBool::new(true),
        });
        let root = CancellationToken::new();
        let coordinator = SyncCoordinator::new(Arc::clone(&sync), root.clone());
        *state.write().unwrap_or_else(PoisonError::into_inner) = ManagerState::Ready;

        info!(
            agent_id,
            workspace = %paths.root().display(),
            store = %store_path.display(),
            provider = embedder.kind().as_str(),
            keyword = capabilities.keyword,
            native_vector = capabilities.native_vector,
            "memory manager ready"
        );
        Ok(Arc::new(Self {
            agent_id: agent_id.to_string(),
            store_path,
            paths,
            settings,
            store,
            embedder,
            search,
            sync,
            coordinator,
            root,
            state,
            watch: tokio::sync::Mutex::new(None),
        }))
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn workspace(&self) -> &Path {
        self.paths.root()
    }

    pub fn settings(&self) -> &MemorySettings {
        &self.settings
    }

    pub fn state(&self) -> ManagerState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ManagerState::Closed
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state() {
            ManagerState::Ready => Ok(()),
            ManagerState::Uninitialized | ManagerState::Closed => Err(MemoryError::Closed),
        }
    }

    /// Run a sync pass, or join the one already running. A forced request
    /// made during a run is queued and runs after it.
    pub async fn sync(&self, opts: SyncOptions) -> Result<SyncReport> {
        self.ensure_open()?;
        self.coordinator
            .request(opts)
            .await
            .map_err(MemoryError::Shared)
    }

    /// Cancel the running sync pass, if any.
    pub fn cancel_sync(&self) -> bool {
        self.coordinator.cancel_current()
    }

    pub fn is_busy(&self) -> bool {
        self.coordinator.is_busy()
    }

    pub async fn search(&self, query: &str, opts: SearchOptions) -> Result<SearchResponse> {
        self.ensure_open()?;
        self.search.search(query, opts).await
    }

    pub async fn get(&self, id: &str) -> Result<ChunkRow> {
        self.ensure_open()?;
        self.store
            .get_chunk(id)
            .await?
            .ok_or_else(|| MemoryError::NotFound(format!("chunk {id}")))
    }

    /// Read `lines` lines of a memory source starting at 1-based `from`.
    pub async fn read_source(
        &self,
        path: &str,
        from: Option<usize>,
        lines: Option<usize>,
    ) -> Result<String> {
        self.ensure_open()?;
        let resolved = match self.paths.resolve(Path::new(path)) {
            Ok(p) => p,
            Err(MemoryError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(MemoryError::NotFound(path.to_string()));
            },
            Err(e) => return Err(e),
        };
        if !is_markdown(&resolved) {
            return Err(MemoryError::InvalidPath {
                path: resolved,
                reason: "not a markdown file",
            });
        }
        let content = tokio::fs::read_to_string(&resolved).await?;
        let start = from.unwrap_or(1).saturating_sub(1);
        let count = lines.unwrap_or(usize::MAX);
        Ok(content
            .lines()
            .skip(start)
            .take(count)
            .collect::<Vec<_>>()
            .join("\n"))
    }

    /// Write memory text to a workspace markdown file and mark the index
    /// dirty. Returns the root-relative path written.
    pub async fn append_or_update(&self, path: &str, text: &str, mode: WriteMode) -> Result<String> {
        self.ensure_open()?;
        let target = self.paths.resolve_for_write(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        match mode {
            WriteMode::Replace => tokio::fs::write(&target, text).await?,
            WriteMode::Append => {
                let needs_newline = match tokio::fs::read(&target).await {
                    Ok(existing) => existing.last().is_some_and(|b| *b != b'\n'),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
                    Err(e) => return Err(e.into()),
                };
                let mut file = tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&target)
                    .await?;
                if needs_newline {
                    file.write_all(b"\n").await?;
                }
                file.write_all(text.as_bytes()).await?;
                if !text.ends_with('\n') {
                    file.write_all(b"\n").await?;
                }
                file.flush().await?;
            },
        }
        self.sync.dirty.store(true, Ordering::SeqCst);
        #[cfg(feature = "file-watcher")]
        self.announce_write(&target).await;
        let rel = self
            .paths
            .relative(&target)
            .unwrap_or_else(|| path.to_string());
        debug!(path = %rel, ?mode, "memory written");
        Ok(rel)
    }

    pub fn is_dirty(&self) -> bool {
        self.sync.dirty.load(Ordering::SeqCst)
    }

    pub async fn status(&self) -> Result<MemoryStatus> {
        self.ensure_open()?;
        let counts = self.store.counts().await?;
        Ok(MemoryStatus {
            agent_id: self.agent_id.clone(),
            workspace: self.paths.root().to_path_buf(),
            store_path: self.store_path.clone(),
            state: self.state(),
            files: counts.files,
            chunks: counts.chunks,
            embedded_chunks: counts.embedded_chunks,
            cached_embeddings: counts.cached_embeddings,
            capabilities: self.store.capabilities(),
            provider: self.embedder.kind().as_str(),
            model: self.embedder.model_name().map(str::to_string),
            dirty: self.is_dirty(),
            syncing: self.is_busy(),
            watching: self.watch.lock().await.is_some(),
        })
    }

    /// Start watching memory files and syncing on change. Returns `false`
    /// when watching is disabled in settings or already running.
    #[cfg(feature = "file-watcher")]
    pub async fn start_watching(self: &Arc<Self>) -> Result<bool> {
        self.ensure_open()?;
        if !self.settings.watch_enabled {
            return Ok(false);
        }
        let mut watch = self.watch.lock().await;
        if watch.is_some() {
            return Ok(false);
        }
        let debounce = std::time::Duration::from_millis(self.settings.watch_debounce_ms);
        let (watcher, rx) =
            crate::watcher::MemoryFileWatcher::start(&self.paths.watch_targets(), debounce)?;
        let cancel = self.root.child_token();
        let target: Arc<dyn SyncTrigger> = Arc::new(ManagerTrigger(Arc::downgrade(self)));
        tokio::spawn(crate::trigger::run_sync_trigger(
            target,
            rx,
            debounce,
            cancel.clone(),
        ));
        *watch = Some(Watch {
            watcher,
            cancel,
        });
        Ok(true)
    }

    /// Pick up memory paths the write may have created and hand the write
    /// to the change trigger.
    #[cfg(feature = "file-watcher")]
    async fn announce_write(&self, written: &Path) {
        let mut watch = self.watch.lock().await;
        let Some(watch) = watch.as_mut() else {
            return;
        };
        if let Err(e) = watch.watcher.add_targets(&self.paths.watch_targets()) {
            tracing::warn!(error = %e, "failed to watch new memory path");
        }
        watch
            .watcher
            .notify(crate::watcher::WatchEvent::Modified(written.to_path_buf()));
    }

    #[cfg(not(feature = "file-watcher"))]
    pub async fn start_watching(self: &Arc<Self>) -> Result<bool> {
        self.ensure_open()?;
        Err(MemoryError::capability(
            "file watcher",
            "built without the file-watcher feature",
        ))
    }

    /// Stop watching, cancel syncs and close the store. Idempotent.
    pub async fn close(&self) {
        {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            if *state == ManagerState::Closed {
                return;
            }
            *state = ManagerState::Closed;
        }
        if let Some(watch) = self.watch.lock().await.take() {
            watch.cancel.cancel();
        }
        self.coordinator.shutdown().await;
        self.store.close().await;
        info!(agent_id = %self.agent_id, "memory manager closed");
    }
}

/// Sync target held by the watcher task; does not keep the manager alive.
struct ManagerTrigger(Weak<MemoryManager>);

#[async_trait]
impl SyncTrigger for ManagerTrigger {
    async fn trigger_sync(&self) -> Result<SyncReport> {
        let manager = self.0.upgrade().ok_or(MemoryError::Closed)?;
        manager.sync(SyncOptions::default()).await
    }
}
