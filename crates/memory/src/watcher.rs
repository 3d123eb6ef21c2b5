/// Debounced file watching for memory sources using notify-debouncer-full.
use std::{path::PathBuf, time::Duration};

use {
    notify_debouncer_full::{
        DebounceEventResult, Debouncer, RecommendedCache, new_debouncer,
        notify::{EventKind, RecommendedWatcher, RecursiveMode},
    },
    tokio::sync::mpsc,
    tracing::{debug, info, warn},
};

use crate::{
    error::{MemoryError, Result},
    paths::is_markdown,
};

/// A change to a markdown file under a watched target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Created(PathBuf),
    Modified(PathBuf),
    Removed(PathBuf),
}

/// Keeps the OS watch alive; dropping it closes the event channel.
pub struct MemoryFileWatcher {
    debouncer: Debouncer<RecommendedWatcher, RecommendedCache>,
    watched: Vec<PathBuf>,
    tx: mpsc::UnboundedSender<WatchEvent>,
}

impl MemoryFileWatcher {
    /// Watch `targets` (directories recursively, files directly). Targets
    /// that do not exist yet are skipped; see [`MemoryFileWatcher::add_targets`].
    pub fn start(
        targets: &[PathBuf],
        debounce: Duration,
    ) -> Result<(Self, mpsc::UnboundedReceiver<WatchEvent>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let events = tx.clone();

        let debouncer = new_debouncer(debounce, None, move |result: DebounceEventResult| {
            match result {
                Ok(batch) => {
                    for event in batch {
                        for path in event.paths.iter().filter(|p| is_markdown(p)) {
                            let watch_event = match event.kind {
                                EventKind::Create(_) => WatchEvent::Created(path.clone()),
                                EventKind::Modify(_) => WatchEvent::Modified(path.clone()),
                                EventKind::Remove(_) => WatchEvent::Removed(path.clone()),
                                _ => continue,
                            };
                            debug!(path = %path.display(), "memory file event");
                            if events.send(watch_event).is_err() {
                                return;
                            }
                        }
                    }
                },
                Err(errors) => {
                    for e in errors {
                        warn!(error = %e, "memory file watcher error");
                    }
                },
            }
        })
        .map_err(|e| MemoryError::capability("file watcher", e.to_string()))?;

        let mut watcher = Self {
            debouncer,
            watched: Vec::new(),
            tx,
        };
        watcher.add_targets(targets)?;
        Ok((watcher, rx))
    }

    /// Start watching every existing target not watched yet. Returns how
    /// many were added.
    pub fn add_targets(&mut self, targets: &[PathBuf]) -> Result<usize> {
        let mut added = 0;
        for target in targets {
            if !target.exists() || self.watched.contains(target) {
                continue;
            }
            let mode = if target.is_dir() {
                RecursiveMode::Recursive
            } else {
                RecursiveMode::NonRecursive
            };
            self.debouncer
                .watch(target, mode)
                .map_err(|e| MemoryError::capability("file watcher", e.to_string()))?;
            info!(path = %target.display(), "watching memory path");
            self.watched.push(target.clone());
            added += 1;
        }
        Ok(added)
    }

    /// Feed an event in as if the OS had reported it.
    pub fn notify(&self, event: WatchEvent) {
        let _ = self.tx.send(event);
    }

    pub fn watched(&self) -> &[PathBuf] {
        &self.watched
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reports_markdown_changes_only() {
        let dir = tempfile::tempdir().unwrap();
        let root = std::fs::canonicalize(dir.path()).unwrap();
        let (watcher, mut rx) =
            MemoryFileWatcher::start(&[root.clone(), root.join("missing")], Duration::from_millis(50))
                .unwrap();
        assert_eq!(watcher.watched(), &[root.clone()]);

        std::fs::write(root.join("notes.txt"), "ignored").unwrap();
        std::fs::write(root.join("today.md"), "remember this").unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let path = match event {
            WatchEvent::Created(p) | WatchEvent::Modified(p) | WatchEvent::Removed(p) => p,
        };
        assert_eq!(path.file_name().unwrap(), "today.md");
    }

    #[tokio::test]
    async fn targets_created_later_can_be_added() {
        let dir = tempfile::tempdir().unwrap();
        let root = std::fs::canonicalize(dir.path()).unwrap();
        let memory = root.join("memory");
        let (mut watcher, mut rx) =
            MemoryFileWatcher::start(&[memory.clone()], Duration::from_millis(50)).unwrap();
        assert!(watcher.watched().is_empty());

        std::fs::create_dir(&memory).unwrap();
        assert_eq!(watcher.add_targets(&[memory.clone()]).unwrap(), 1);
        assert_eq!(watcher.add_targets(&[memory.clone()]).unwrap(), 0);

        std::fs::write(memory.join("later.md"), "new note").unwrap();
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let path = match event {
            WatchEvent::Created(p) | WatchEvent::Modified(p) | WatchEvent::Removed(p) => p,
        };
        assert_eq!(path.file_name().unwrap(), "later.md");

        watcher.notify(WatchEvent::Modified(memory.join("manual.md")));
        let mut saw_manual = false;
        while let Ok(Some(event)) = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
            if event == WatchEvent::Modified(memory.join("manual.md")) {
                saw_manual = true;
                break;
            }
        }
        assert!(saw_manual);
    }
}
