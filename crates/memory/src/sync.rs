//! Incremental sync of workspace memory files into the store, and the
//! coordinator that coalesces concurrent sync requests.
//!
//! A source is re-chunked only when its content hash changed, the index
//! identity changed, or some of its chunks still lack a vector from the
//! active model. Each source is written in its own transaction.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Duration, Instant, UNIX_EPOCH},
};

use {
    futures::{
        FutureExt,
        future::{BoxFuture, Shared},
    },
    serde::{Serialize, Serializer},
    tokio::sync::oneshot,
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use crate::{
    chunker::{chunk_markdown, hash_text},
    config::MemorySettings,
    embedder::Embedder,
    error::{MemoryError, Result},
    now_ms,
    paths::{SourceFile, WorkspacePaths},
    schema::{ChunkRow, FileRow},
    store::MemoryStore,
    tokens::TokenEstimator,
};

/// Meta key holding the identity the index was built with.
pub const INDEX_IDENTITY_KEY: &str = "index_identity";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncOptions {
    /// Re-chunk and re-embed every source regardless of its hash.
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceFailure {
    pub path: String,
    pub kind: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Full reindex, requested or caused by an index identity change.
    pub forced: bool,
    pub scanned: usize,
    pub indexed: usize,
    pub unchanged: usize,
    pub removed: usize,
    pub chunks_written: usize,
    pub embedding_requests: usize,
    pub cache_hits: usize,
    pub embedding_failures: usize,
    pub failures: Vec<SourceFailure>,
    pub cancelled: bool,
    #[serde(rename = "elapsed_ms", serialize_with = "serialize_millis")]
    pub elapsed: Duration,
}

impl SyncReport {
    /// Sources whose stored state changed.
    pub fn writes(&self) -> usize {
        self.indexed + self.removed
    }
}

fn serialize_millis<S: Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

/// Everything one sync run needs, shared by all runs of a manager.
pub(crate) struct SyncContext {
    pub store: Arc<dyn MemoryStore>,
    pub embedder: Arc<Embedder>,
    pub paths: WorkspacePaths,
    pub settings: Arc<MemorySettings>,
    /// Set by writes through the manager; cleared when a run starts.
    pub dirty: AtomicBool,
}

impl SyncContext {
    fn estimator(&self) -> TokenEstimator {
        self.settings.token_estimator()
    }

    /// Parameters that invalidate every stored chunk or vector when changed.
    fn index_identity(&self) -> String {
        serde_json::json!({
            "provider": self.embedder.kind().as_str(),
            "model": self.embedder.model_id(),
            "chunk_tokens": self.settings.chunk_size_tokens,
            "overlap_tokens": self.settings.chunk_overlap_tokens,
            "chars_per_token": self.estimator().chars_per_token(),
        })
        .to_string()
    }
}

/// Stable chunk id from its position in the source, its line span and its
/// content. `ordinal` keeps segments of one over-long line apart.
pub fn chunk_id(
    source_path: &str,
    ordinal: usize,
    start_line: usize,
    end_line: usize,
    hash: &str,
) -> String {
    let digest = hash_text(&format!("{source_path}#{ordinal}:{start_line}:{end_line}:{hash}"));
    digest[..32].to_string()
}

/// Run one sync pass. Cancellation is honoured between sources; a source
/// that has started is always finished or rolled back.
pub(crate) async fn run_sync(
    ctx: &SyncContext,
    force: bool,
    cancel: &CancellationToken,
) -> Result<SyncReport> {
    let started = Instant::now();
    ctx.dirty.store(false, Ordering::SeqCst);
    let result = sync_sources(ctx, force, cancel).await;
    match result {
        Ok(mut report) => {
            if report.cancelled {
                ctx.dirty.store(true, Ordering::SeqCst);
            }
            report.elapsed = started.elapsed();
            info!(
                forced = report.forced,
                scanned = report.scanned,
                indexed = report.indexed,
                unchanged = report.unchanged,
                removed = report.removed,
                failures = report.failures.len(),
                cancelled = report.cancelled,
                elapsed_ms = report.elapsed.as_millis() as u64,
                "memory sync finished"
            );
            Ok(report)
        },
        Err(e) => {
            ctx.dirty.store(true, Ordering::SeqCst);
            warn!(error = %e, "memory sync failed");
            Err(e)
        },
    }
}

async fn sync_sources(
    ctx: &SyncContext,
    force: bool,
    cancel: &CancellationToken,
) -> Result<SyncReport> {
    let identity = ctx.index_identity();
    let stored_identity = ctx.store.get_meta(INDEX_IDENTITY_KEY).await?;
    let identity_changed = stored_identity.as_deref().is_some_and(|s| s != identity);
    if identity_changed {
        info!("memory index identity changed, reindexing all sources");
    }
    let mut report = SyncReport {
        forced: force || identity_changed,
        ..Default::default()
    };

    let discovery = ctx.paths.discover();
    for (path, e) in discovery.rejected {
        report.failures.push(SourceFailure {
            path: path.display().to_string(),
            kind: e.kind(),
            message: e.to_string(),
        });
    }

    let existing: HashMap<String, FileRow> = ctx
        .store
        .list_files()
        .await?
        .into_iter()
        .map(|f| (f.path.clone(), f))
        .collect();
    let discovered: HashSet<&str> = discovery
        .sources
        .iter()
        .map(|s| s.rel_path.as_str())
        .collect();

    for source in &discovery.sources {
        if cancel.is_cancelled() {
            report.cancelled = true;
            break;
        }
        report.scanned += 1;
        match index_source(ctx, source, existing.get(&source.rel_path), report.forced, &mut report)
            .await
        {
            Ok(true) => report.indexed += 1,
            Ok(false) => report.unchanged += 1,
            Err(e) if is_fatal(&e) => return Err(e),
            Err(e) => {
                warn!(path = %source.rel_path, error = %e, "failed to index memory source");
                report.failures.push(SourceFailure {
                    path: source.rel_path.clone(),
                    kind: e.kind(),
                    message: e.to_string(),
                });
            },
        }
    }

    if report.cancelled {
        debug!(scanned = report.scanned, "memory sync cancelled");
        return Ok(report);
    }

    for path in existing.keys().filter(|p| !discovered.contains(p.as_str())) {
        match ctx.store.delete_source(path).await {
            Ok(()) => {
                debug!(path = %path, "removed memory source");
                report.removed += 1;
            },
            Err(e) if is_fatal(&e) => return Err(e),
            Err(e) => {
                warn!(path = %path, error = %e, "failed to remove memory source");
                report.failures.push(SourceFailure {
                    path: path.clone(),
                    kind: e.kind(),
                    message: e.to_string(),
                });
            },
        }
    }

    // A source that failed to store may still hold chunks built under the old
    // identity; keep the old identity so the next pass rebuilds it.
    if report.failures.iter().any(|f| f.kind == "store") {
        ctx.dirty.store(true, Ordering::SeqCst);
    } else {
        ctx.store.set_meta(INDEX_IDENTITY_KEY, &identity).await?;
    }
    if let Some(keep) = ctx.settings.cache_max_entries {
        let evicted = ctx.store.evict_embedding_cache(keep).await?;
        if evicted > 0 {
            debug!(evicted, keep, "pruned embedding cache");
        }
    }
    Ok(report)
}

/// Errors that end the whole pass. Anything else only fails its source.
fn is_fatal(e: &MemoryError) -> bool {
    matches!(
        e,
        MemoryError::Closed | MemoryError::Store(sqlx::Error::PoolClosed)
    )
}

/// Returns whether the source was (re)written.
async fn index_source(
    ctx: &SyncContext,
    source: &SourceFile,
    existing: Option<&FileRow>,
    force: bool,
    report: &mut SyncReport,
) -> Result<bool> {
    let bytes = tokio::fs::read(&source.abs_path).await?;
    let content = String::from_utf8_lossy(&bytes);
    let hash = hash_text(&content);

    if !force && existing.is_some_and(|f| f.hash == hash) {
        let pending = if ctx.embedder.is_enabled() {
            ctx.store
                .count_pending_embeddings(&source.rel_path, ctx.embedder.model_id())
                .await?
        } else {
            0
        };
        if pending == 0 {
            return Ok(false);
        }
        debug!(path = %source.rel_path, pending, "re-embedding source with pending chunks");
    }

    let metadata = tokio::fs::metadata(&source.abs_path).await?;
    let mtime = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_millis() as i64);

    let chunks = chunk_markdown(
        &content,
        ctx.settings.chunk_size_tokens,
        ctx.settings.chunk_overlap_tokens,
        &ctx.estimator(),
    );
    let items: Vec<(String, String)> = chunks
        .iter()
        .map(|c| (c.hash.clone(), c.text.clone()))
        .collect();
    let outcome = ctx.embedder.embed_chunks(ctx.store.as_ref(), &items).await?;
    report.embedding_requests += outcome.requests;
    report.cache_hits += outcome.cache_hits;
    report.embedding_failures += outcome.failures.len();
    if let Some(first) = outcome.failures.first() {
        report.failures.push(SourceFailure {
            path: source.rel_path.clone(),
            kind: "embedding_provider",
            message: first.clone(),
        });
    }

    let now = now_ms();
    let model_id = ctx.embedder.model_id();
    let rows: Vec<ChunkRow> = chunks
        .into_iter()
        .zip(outcome.vectors)
        .enumerate()
        .map(|(ordinal, (chunk, embedding))| ChunkRow {
            id: chunk_id(
                &source.rel_path,
                ordinal,
                chunk.start_line,
                chunk.end_line,
                &chunk.hash,
            ),
            source_path: source.rel_path.clone(),
            content_hash: chunk.hash,
            start_line: chunk.start_line as i64,
            end_line: chunk.end_line as i64,
            text: chunk.text,
            token_count: chunk.token_count as i64,
            model_id: if embedding.is_some() {
                model_id.to_string()
            } else {
                String::new()
            },
            embedding,
            updated_at: now,
        })
        .collect();

    let file = FileRow {
        path: source.rel_path.clone(),
        hash,
        mtime,
        size: metadata.len() as i64,
        chunk_count: rows.len() as i64,
        indexed_at: now,
    };
    ctx.store.replace_source(&file, &rows).await?;
    report.chunks_written += rows.len();
    debug!(path = %source.rel_path, chunks = rows.len(), "indexed memory source");
    Ok(true)
}

// ── Coordination ─────────────────────────────────────────────────────────────

/// Outcome of a run, cloneable so every caller sharing it gets a copy.
pub type SharedSync = Shared<BoxFuture<'static, std::result::Result<SyncReport, Arc<MemoryError>>>>;

struct RunHandle {
    id: u64,
    future: SharedSync,
    cancel: CancellationToken,
}

enum CoordinatorState {
    Idle,
    Running {
        current: RunHandle,
        /// A forced run queued behind `current`. Never dropped once queued.
        pending_forced: Option<RunHandle>,
    },
}

/// Ensures at most one run executes at a time. Concurrent non-forced
/// requests share the running pass; a forced request during a run is
/// queued and starts as soon as the current pass ends.
pub(crate) struct SyncCoordinator {
    ctx: Arc<SyncContext>,
    root: CancellationToken,
    state: Arc<Mutex<CoordinatorState>>,
    next_id: AtomicU64,
}

/// Moves the coordinator to its next state when a run's task ends, even if
/// the run panicked.
struct Completion {
    state: Arc<Mutex<CoordinatorState>>,
    id: u64,
}

impl Drop for Completion {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let finished = match &mut *state {
            CoordinatorState::Running { current, .. } if current.id == self.id => true,
            CoordinatorState::Running { pending_forced, .. } => {
                // A queued run that ended before it was promoted (runtime shutdown).
                if pending_forced.as_ref().is_some_and(|p| p.id == self.id) {
                    *pending_forced = None;
                }
                false
            },
            CoordinatorState::Idle => false,
        };
        if !finished {
            return;
        }
        let prev = std::mem::replace(&mut *state, CoordinatorState::Idle);
        if let CoordinatorState::Running {
            pending_forced: Some(next),
            ..
        } = prev
        {
            *state = CoordinatorState::Running {
                current: next,
                pending_forced: None,
            };
        }
    }
}

impl SyncCoordinator {
    pub fn new(ctx: Arc<SyncContext>, root: CancellationToken) -> Self {
        Self {
            ctx,
            root,
            state: Arc::new(Mutex::new(CoordinatorState::Idle)),
            next_id: AtomicU64::new(1),
        }
    }

    /// Request a sync; returns the run that will satisfy the request.
    pub fn request(&self, opts: SyncOptions) -> SharedSync {
        let (future, task) = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            match &mut *state {
                CoordinatorState::Idle => {
                    let (run, task) = self.prepare(opts.force, None);
                    let future = run.future.clone();
                    *state = CoordinatorState::Running {
                        current: run,
                        pending_forced: None,
                    };
                    (future, Some(task))
                },
                CoordinatorState::Running { current, .. } if !opts.force => {
                    (current.future.clone(), None)
                },
                CoordinatorState::Running {
                    pending_forced: Some(pending),
                    ..
                } => (pending.future.clone(), None),
                CoordinatorState::Running {
                    current,
                    pending_forced,
                } => {
                    debug!("forced sync queued behind running sync");
                    let (run, task) = self.prepare(true, Some(current.future.clone()));
                    let future = run.future.clone();
                    *pending_forced = Some(run);
                    (future, Some(task))
                },
            }
        };
        // Spawned with the state lock released: a task dropped by a runtime
        // that is shutting down runs `Completion::drop`, which takes the lock.
        if let Some(task) = task {
            tokio::spawn(task);
        }
        future
    }

    /// Build a run and the task that drives it. The task is not started.
    fn prepare(&self, force: bool, after: Option<SharedSync>) -> (RunHandle, BoxFuture<'static, ()>) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let cancel = self.root.child_token();
        let ctx = Arc::clone(&self.ctx);
        let completion = Completion {
            state: Arc::clone(&self.state),
            id,
        };
        let token = cancel.clone();
        let (tx, rx) = oneshot::channel();
        let task = async move {
            if let Some(previous) = after {
                let _ = previous.await;
            }
            let result = run_sync(&ctx, force, &token).await.map_err(Arc::new);
            // State moves on before callers see the result.
            drop(completion);
            let _ = tx.send(result);
        }
        .boxed();
        let future = async move {
            rx.await.unwrap_or_else(|_| {
                Err(Arc::new(MemoryError::Task(
                    "sync task ended without a result".into(),
                )))
            })
        }
        .boxed()
        .shared();
        (RunHandle { id, future, cancel }, task)
    }

    /// Cancel the running pass. A queued forced pass still runs.
    pub fn cancel_current(&self) -> bool {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match &*state {
            CoordinatorState::Running { current, .. } => {
                current.cancel.cancel();
                true
            },
            CoordinatorState::Idle => false,
        }
    }

    pub fn is_busy(&self) -> bool {
        matches!(
            *self.state.lock().unwrap_or_else(PoisonError::into_inner),
            CoordinatorState::Running { .. }
        )
    }

    /// Cancel everything and wait for in-flight runs to stop.
    pub async fn shutdown(&self) {
        self.root.cancel();
        let futures: Vec<SharedSync> = {
            let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            match &*state {
                CoordinatorState::Idle => Vec::new(),
                CoordinatorState::Running {
                    current,
                    pending_forced,
                } => std::iter::once(current.future.clone())
                    .chain(pending_forced.iter().map(|p| p.future.clone()))
                    .collect(),
            }
        };
        for future in futures {
            let _ = future.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use {super::*, std::path::Path};

    use crate::{
        config::EmbeddingProviderKind,
        embeddings::ResolvedProvider,
        store::{Capabilities, Candidate, ScanBatch, StoreCounts},
        store_sqlite::SqliteMemoryStore,
        test_support::MockProvider,
    };

    /// Delegates to SQLite but fails `replace_source` for one path.
    struct FailingStore {
        inner: SqliteMemoryStore,
        fail_path: &'static str,
    }

    #[async_trait::async_trait]
    impl MemoryStore for FailingStore {
        fn capabilities(&self) -> Capabilities {
            self.inner.capabilities()
        }

        async fn get_file(&self, path: &str) -> Result<Option<FileRow>> {
            self.inner.get_file(path).await
        }

        async fn list_files(&self) -> Result<Vec<FileRow>> {
            self.inner.list_files().await
        }

        async fn replace_source(&self, file: &FileRow, chunks: &[ChunkRow]) -> Result<()> {
            if file.path == self.fail_path {
                return Err(MemoryError::Store(sqlx::Error::Protocol("disk full".into())));
            }
            self.inner.replace_source(file, chunks).await
        }

        async fn delete_source(&self, path: &str) -> Result<()> {
            self.inner.delete_source(path).await
        }

        async fn list_chunks(&self, offset: usize, limit: usize) -> Result<Vec<ChunkRow>> {
            self.inner.list_chunks(offset, limit).await
        }

        async fn get_chunk(&self, id: &str) -> Result<Option<ChunkRow>> {
            self.inner.get_chunk(id).await
        }

        async fn count_pending_embeddings(&self, path: &str, model_id: &str) -> Result<usize> {
            self.inner.count_pending_embeddings(path, model_id).await
        }

        async fn get_cached_embeddings(
            &self,
            model_id: &str,
            hashes: &[String],
        ) -> Result<HashMap<String, Vec<f32>>> {
            self.inner.get_cached_embeddings(model_id, hashes).await
        }

        async fn put_cached_embeddings(
            &self,
            model_id: &str,
            entries: &[(String, Vec<f32>)],
        ) -> Result<()> {
            self.inner.put_cached_embeddings(model_id, entries).await
        }

        async fn count_cached_embeddings(&self) -> Result<usize> {
            self.inner.count_cached_embeddings().await
        }

        async fn evict_embedding_cache(&self, keep: usize) -> Result<usize> {
            self.inner.evict_embedding_cache(keep).await
        }

        async fn keyword_search(&self, query: &str, limit: usize) -> Result<Vec<Candidate>> {
            self.inner.keyword_search(query, limit).await
        }

        async fn vector_search(
            &self,
            query: &[f32],
            model_id: &str,
            limit: usize,
        ) -> Result<Vec<Candidate>> {
            self.inner.vector_search(query, model_id, limit).await
        }

        async fn scan_embeddings(&self, model_id: &str, dims: usize, limit: usize) -> Result<ScanBatch> {
            self.inner.scan_embeddings(model_id, dims, limit).await
        }

        async fn count_stale_embeddings(&self, model_id: &str, dims: usize) -> Result<usize> {
            self.inner.count_stale_embeddings(model_id, dims).await
        }

        async fn get_meta(&self, key: &str) -> Result<Option<String>> {
            self.inner.get_meta(key).await
        }

        async fn set_meta(&self, key: &str, value: &str) -> Result<()> {
            self.inner.set_meta(key, value).await
        }

        async fn counts(&self) -> Result<StoreCounts> {
            self.inner.counts().await
        }

        async fn close(&self) {
            self.inner.close().await
        }
    }

    struct Fixture {
        _ws: tempfile::TempDir,
        root: std::path::PathBuf,
        store: Arc<SqliteMemoryStore>,
        ctx: Arc<SyncContext>,
    }

    async fn fixture(provider: Option<Arc<MockProvider>>, settings: MemorySettings) -> Fixture {
        let ws = tempfile::tempdir().unwrap();
        let root = ws.path().to_path_buf();
        let store = Arc::new(SqliteMemoryStore::in_memory().await.unwrap());
        let resolved = match provider {
            Some(p) => ResolvedProvider::new(EmbeddingProviderKind::Local, p),
            None => ResolvedProvider::disabled(),
        };
        let ctx = context(&root, store.clone(), &resolved, settings);
        Fixture {
            _ws: ws,
            root,
            store,
            ctx,
        }
    }

    fn context(
        root: &Path,
        store: Arc<dyn MemoryStore>,
        resolved: &ResolvedProvider,
        settings: MemorySettings,
    ) -> Arc<SyncContext> {
        Arc::new(SyncContext {
            store,
            embedder: Arc::new(Embedder::new(resolved, &settings)),
            paths: WorkspacePaths::new(root, &settings.extra_paths).unwrap(),
            settings: Arc::new(settings),
            dirty: AtomicBool::new(false),
        })
    }

    fn quick() -> MemorySettings {
        MemorySettings {
            embed_retry_backoff_ms: 1,
            chunk_size_tokens: 20,
            chunk_overlap_tokens: 0,
            ..Default::default()
        }
    }

    fn write(root: &Path, rel: &str, body: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, body).unwrap();
    }

    async fn sync(ctx: &SyncContext, force: bool) -> SyncReport {
        run_sync(ctx, force, &CancellationToken::new()).await.unwrap()
    }

    #[tokio::test]
    async fn second_sync_without_changes_is_a_no_op() {
        let mock = MockProvider::concept();
        let f = fixture(Some(mock.clone()), quick()).await;
        write(&f.root, "MEMORY.md", "# Pets\nThe cat likes to purr.\n");
        write(&f.root, "memory/rust.md", "Ownership and borrow rules.\nCargo builds crates.\n");

        let first = sync(&f.ctx, false).await;
        assert_eq!(first.indexed, 2);
        assert!(first.embedding_requests > 0);
        let calls = mock.calls();

        let second = sync(&f.ctx, false).await;
        assert_eq!(second.writes(), 0);
        assert_eq!(second.unchanged, 2);
        assert_eq!(second.embedding_requests, 0);
        assert_eq!(mock.calls(), calls);
        assert!(!second.forced);
    }

    #[tokio::test]
    async fn stored_chunks_match_current_content() {
        let f = fixture(Some(MockProvider::concept()), quick()).await;
        let long: String = (0..30).map(|i| format!("line number {i} about cats\n")).collect();
        write(&f.root, "memory/a.md", &long);
        sync(&f.ctx, false).await;

        let edited = long.replace("line number 7 ", "edited line 7 ");
        write(&f.root, "memory/a.md", &edited);
        let report = sync(&f.ctx, false).await;
        assert_eq!(report.indexed, 1);
        // Unchanged chunks come from the cache.
        assert!(report.cache_hits > 0);

        let expected: Vec<String> =
            chunk_markdown(&edited, 20, 0, &f.ctx.estimator()).into_iter().map(|c| c.hash).collect();
        let mut stored = f.store.list_chunks(0, 1000).await.unwrap();
        stored.sort_by_key(|c| c.start_line);
        let stored: Vec<String> = stored.into_iter().map(|c| c.content_hash).collect();
        assert_eq!(stored, expected);
    }

    #[tokio::test]
    async fn deleted_sources_are_removed() {
        let f = fixture(None, quick()).await;
        write(&f.root, "memory/a.md", "alpha");
        write(&f.root, "memory/b.md", "beta");
        sync(&f.ctx, false).await;

        std::fs::remove_file(f.root.join("memory/b.md")).unwrap();
        let report = sync(&f.ctx, false).await;
        assert_eq!(report.removed, 1);
        assert_eq!(report.unchanged, 1);
        let files = f.store.list_files().await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, "memory/a.md");
    }

    #[tokio::test]
    async fn identity_change_forces_reindex() {
        let f = fixture(None, quick()).await;
        write(&f.root, "memory/a.md", "alpha");
        sync(&f.ctx, false).await;

        let changed = context(
            &f.root,
            f.store.clone(),
            &ResolvedProvider::disabled(),
            MemorySettings {
                chunk_size_tokens: 50,
                ..quick()
            },
        );
        let report = sync(&changed, false).await;
        assert!(report.forced);
        assert_eq!(report.indexed, 1);
        assert!(!sync(&changed, false).await.forced);
    }

    #[tokio::test]
    async fn failed_embeddings_are_retried_on_next_sync() {
        let mock = MockProvider::concept();
        let f = fixture(Some(mock.clone()), quick()).await;
        write(&f.root, "memory/a.md", "kittens and cats");

        mock.fail_next(3);
        let first = sync(&f.ctx, false).await;
        assert_eq!(first.indexed, 1);
        assert_eq!(first.embedding_failures, 1);
        assert_eq!(first.failures[0].kind, "embedding_provider");
        assert_eq!(f.store.counts().await.unwrap().embedded_chunks, 0);

        let second = sync(&f.ctx, false).await;
        assert_eq!(second.indexed, 1);
        assert!(second.failures.is_empty());
        assert_eq!(f.store.counts().await.unwrap().embedded_chunks, 1);
    }

    #[tokio::test]
    async fn cancelled_before_start_indexes_nothing() {
        let f = fixture(None, quick()).await;
        write(&f.root, "memory/a.md", "alpha");
        let token = CancellationToken::new();
        token.cancel();
        let report = run_sync(&f.ctx, false, &token).await.unwrap();
        assert!(report.cancelled);
        assert_eq!(report.scanned, 0);
        assert_eq!(f.store.counts().await.unwrap().files, 0);
        assert!(f.ctx.dirty.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn forced_request_during_run_is_never_dropped() {
        let mock = MockProvider::concept();
        let f = fixture(Some(mock.clone()), quick()).await;
        write(&f.root, "memory/a.md", "cats purr");
        let coordinator = SyncCoordinator::new(f.ctx.clone(), CancellationToken::new());

        mock.gate();
        let first = coordinator.request(SyncOptions::default());
        mock.wait_entered().await;
        assert!(coordinator.is_busy());

        // Appears after the running pass already listed its sources.
        write(&f.root, "memory/b.md", "rust crate");
        let shared = coordinator.request(SyncOptions::default());
        let forced = coordinator.request(SyncOptions { force: true });
        let forced_again = coordinator.request(SyncOptions { force: true });
        mock.release();

        let first = first.await.unwrap();
        assert_eq!(first.scanned, 1);
        assert_eq!(shared.await.unwrap(), first);

        let forced = forced.await.unwrap();
        assert!(forced.forced);
        assert_eq!(forced.scanned, 2);
        assert_eq!(forced.indexed, 2);
        assert_eq!(forced_again.await.unwrap(), forced);
        assert!(
            f.store
                .get_file("memory/b.md")
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn cancel_stops_between_sources() {
        let mock = MockProvider::concept();
        let f = fixture(Some(mock.clone()), quick()).await;
        write(&f.root, "memory/a.md", "cats purr");
        write(&f.root, "memory/b.md", "rust crate");
        let coordinator = SyncCoordinator::new(f.ctx.clone(), CancellationToken::new());

        mock.gate();
        let run = coordinator.request(SyncOptions::default());
        mock.wait_entered().await;
        assert!(coordinator.cancel_current());
        mock.release();

        let report = run.await.unwrap();
        assert!(report.cancelled);
        assert_eq!(report.indexed, 1);
        assert_eq!(f.store.counts().await.unwrap().files, 1);

        // The completion hook returns the coordinator to idle.
        tokio::task::yield_now().await;
        assert!(!coordinator.is_busy());
    }

    #[tokio::test]
    async fn store_failure_only_fails_its_source() {
        let ws = tempfile::tempdir().unwrap();
        let store = Arc::new(FailingStore {
            inner: SqliteMemoryStore::in_memory().await.unwrap(),
            fail_path: "memory/a.md",
        });
        let ctx = context(ws.path(), store.clone(), &ResolvedProvider::disabled(), quick());
        write(ws.path(), "memory/a.md", "alpha notes");
        write(ws.path(), "memory/b.md", "beta notes");
        write(ws.path(), "memory/c.md", "gamma notes");

        let report = sync(&ctx, false).await;
        assert_eq!(report.indexed, 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].path, "memory/a.md");
        assert_eq!(report.failures[0].kind, "store");
        let mut paths: Vec<String> = store
            .list_files()
            .await
            .unwrap()
            .into_iter()
            .map(|f| f.path)
            .collect();
        paths.sort();
        assert_eq!(paths, vec!["memory/b.md", "memory/c.md"]);
        assert_eq!(store.get_meta(INDEX_IDENTITY_KEY).await.unwrap(), None);
        assert!(ctx.dirty.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn repeated_segments_of_a_long_line_get_distinct_ids() {
        let f = fixture(None, quick()).await;
        // 400 chars against an 80-char budget: five identical segments on line 1.
        write(&f.root, "memory/a.md", &"=".repeat(400));
        write(&f.root, "memory/b.md", "beta notes");

        let report = sync(&f.ctx, false).await;
        assert!(report.failures.is_empty(), "{:?}", report.failures);
        assert_eq!(report.indexed, 2);

        let chunks = f.store.list_chunks(0, 100).await.unwrap();
        let a: Vec<&ChunkRow> = chunks.iter().filter(|c| c.source_path == "memory/a.md").collect();
        assert_eq!(a.len(), 5);
        assert!(a.iter().all(|c| c.start_line == 1 && c.end_line == 1));
        let ids: HashSet<&str> = a.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids.len(), 5);
    }

    #[test]
    fn run_dropped_at_spawn_leaves_coordinator_idle() {
        let dead = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let dead_handle = dead.handle().clone();
        drop(dead);

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let f = fixture(None, quick()).await;
            let coordinator = SyncCoordinator::new(f.ctx.clone(), CancellationToken::new());
            let run = {
                // A shut-down runtime drops the task inside `spawn`.
                let _guard = dead_handle.enter();
                coordinator.request(SyncOptions::default())
            };
            assert!(!coordinator.is_busy());
            assert!(matches!(run.await, Err(e) if matches!(*e, MemoryError::Task(_))));

            let report = coordinator.request(SyncOptions::default()).await.unwrap();
            assert!(!report.cancelled);
        });
    }
}
