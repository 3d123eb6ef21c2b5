//! Workspace confinement and memory source discovery.
//!
//! Every path the index touches, whether found by walking the memory
//! directory or listed in `extra_paths`, is canonicalized (symlinks
//! followed) and must land under the canonical workspace root.

use std::{
    collections::BTreeMap,
    path::{Component, Path, PathBuf},
};

use {
    tracing::{debug, warn},
    walkdir::WalkDir,
};

use crate::error::{MemoryError, Result};

const ROOT_FILES: &[&str] = &["MEMORY.md", "memory.md"];
const MEMORY_DIR: &str = "memory";

pub fn is_markdown(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("md" | "markdown")
    )
}

/// A discovered memory document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    /// Root-relative, `/`-separated; the `source_path` of its chunks.
    pub rel_path: String,
    pub abs_path: PathBuf,
}

#[derive(Debug, Default)]
pub struct Discovery {
    /// Sorted by `rel_path`, deduplicated.
    pub sources: Vec<SourceFile>,
    pub rejected: Vec<(PathBuf, MemoryError)>,
}

#[derive(Debug, Clone)]
pub struct WorkspacePaths {
    root: PathBuf,
    extra: Vec<PathBuf>,
}

impl WorkspacePaths {
    pub fn new(root: &Path, extra_paths: &[PathBuf]) -> Result<Self> {
        let root = std::fs::canonicalize(root)?;
        Ok(Self {
            root,
            extra: extra_paths.to_vec(),
        })
    }

    /// Canonical workspace root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Canonicalize `path` (relative paths are taken from the root) and
    /// require the result under the root.
    pub fn resolve(&self, path: &Path) -> Result<PathBuf> {
        let joined = self.root.join(path);
        let canonical = std::fs::canonicalize(&joined)?;
        if !canonical.starts_with(&self.root) {
            return Err(MemoryError::PathSecurity {
                path: joined,
                root: self.root.clone(),
            });
        }
        Ok(canonical)
    }

    /// Root-relative `/`-separated form of a canonical path under the root.
    pub fn relative(&self, canonical: &Path) -> Option<String> {
        let rel = canonical.strip_prefix(&self.root).ok()?;
        let parts: Vec<String> = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        (!parts.is_empty()).then(|| parts.join("/"))
    }

    /// Directories and files a watcher should observe.
    pub fn watch_targets(&self) -> Vec<PathBuf> {
        let mut targets: Vec<PathBuf> = ROOT_FILES
            .iter()
            .map(|f| self.root.join(f))
            .chain(std::iter::once(self.root.join(MEMORY_DIR)))
            .filter(|p| p.exists())
            .collect();
        for extra in &self.extra {
            if let Ok(p) = self.resolve(extra)
                && !targets.contains(&p)
            {
                targets.push(p);
            }
        }
        targets
    }

    /// Find every markdown memory source. Paths escaping the root are
    /// collected in `rejected`, never indexed.
    pub fn discover(&self) -> Discovery {
        let mut found = BTreeMap::new();
        let mut rejected = Vec::new();

        for name in ROOT_FILES {
            let candidate = self.root.join(name);
            if candidate.exists() || candidate.is_symlink() {
                self.admit(&candidate, &mut found, &mut rejected);
            }
        }

        let memory_dir = self.root.join(MEMORY_DIR);
        if memory_dir.exists() || memory_dir.is_symlink() {
            self.walk(&memory_dir, &mut found, &mut rejected);
        }

        for extra in &self.extra {
            let candidate = self.root.join(extra);
            match self.resolve(extra) {
                Ok(canonical) if canonical.is_dir() => {
                    self.walk(&canonical, &mut found, &mut rejected)
                },
                Ok(_) if !is_markdown(&candidate) => {
                    debug!(path = %candidate.display(), "extra path is not markdown, skipped");
                },
                Ok(_) => self.admit(&candidate, &mut found, &mut rejected),
                Err(e) => {
                    warn!(path = %candidate.display(), error = %e, "rejected extra memory path");
                    rejected.push((candidate, e));
                },
            }
        }

        Discovery {
            sources: found.into_values().collect(),
            rejected,
        }
    }

    fn walk(
        &self,
        dir: &Path,
        found: &mut BTreeMap<String, SourceFile>,
        rejected: &mut Vec<(PathBuf, MemoryError)>,
    ) {
        for entry in WalkDir::new(dir).follow_links(false).sort_by_file_name() {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!(error = %e, "memory directory walk error");
                    continue;
                },
            };
            let ft = entry.file_type();
            if ft.is_dir() || !is_markdown(entry.path()) {
                continue;
            }
            self.admit(entry.path(), found, rejected);
        }
    }

    fn admit(
        &self,
        path: &Path,
        found: &mut BTreeMap<String, SourceFile>,
        rejected: &mut Vec<(PathBuf, MemoryError)>,
    ) {
        let canonical = match self.resolve(path) {
            Ok(c) => c,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "rejected memory path");
                rejected.push((path.to_path_buf(), e));
                return;
            },
        };
        if !canonical.is_file() {
            return;
        }
        if let Some(rel_path) = self.relative(&canonical) {
            found.entry(rel_path.clone()).or_insert(SourceFile {
                rel_path,
                abs_path: canonical,
            });
        }
    }

    /// Validate a write target: a markdown path whose resolved location,
    /// including any existing parent symlinks, stays under the root.
    pub fn resolve_for_write(&self, rel: &str) -> Result<PathBuf> {
        let requested = Path::new(rel);
        if !is_markdown(requested) {
            return Err(MemoryError::InvalidPath {
                path: requested.to_path_buf(),
                reason: "only markdown files can be written",
            });
        }
        if requested
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(MemoryError::PathSecurity {
                path: requested.to_path_buf(),
                root: self.root.clone(),
            });
        }

        let target = self.root.join(requested);
        if target.exists() || target.is_symlink() {
            let canonical = self.resolve(&target)?;
            if !canonical.is_file() {
                return Err(MemoryError::InvalidPath {
                    path: target,
                    reason: "not a regular file",
                });
            }
            return Ok(canonical);
        }

        // Nearest existing ancestor decides where the new file really lands.
        let mut ancestor = target.as_path();
        let mut rest = Vec::new();
        while !ancestor.exists() {
            let (Some(parent), Some(name)) = (ancestor.parent(), ancestor.file_name()) else {
                break;
            };
            rest.push(name.to_os_string());
            ancestor = parent;
        }
        let mut resolved = self.resolve(ancestor)?;
        for name in rest.into_iter().rev() {
            resolved.push(name);
        }
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(root: &Path, rel: &str, body: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, body).unwrap();
    }

    fn rels(d: &Discovery) -> Vec<&str> {
        d.sources.iter().map(|s| s.rel_path.as_str()).collect()
    }

    #[test]
    fn discovers_root_file_and_memory_tree() {
        let ws = tempfile::tempdir().unwrap();
        write(ws.path(), "MEMORY.md", "# root");
        write(ws.path(), "memory/2024/jan.md", "jan");
        write(ws.path(), "memory/notes.markdown", "notes");
        write(ws.path(), "memory/ignore.txt", "nope");
        write(ws.path(), "other/elsewhere.md", "not a memory dir");

        let paths = WorkspacePaths::new(ws.path(), &[]).unwrap();
        let d = paths.discover();
        assert_eq!(rels(&d), vec!["MEMORY.md", "memory/2024/jan.md", "memory/notes.markdown"]);
        assert!(d.rejected.is_empty());
    }

    #[test]
    fn extra_paths_inside_root_are_indexed() {
        let ws = tempfile::tempdir().unwrap();
        write(ws.path(), "docs/a.md", "a");
        write(ws.path(), "docs/deep/b.md", "b");
        write(ws.path(), "single.md", "s");

        let paths =
            WorkspacePaths::new(ws.path(), &["docs".into(), "single.md".into()]).unwrap();
        assert_eq!(rels(&paths.discover()), vec!["docs/a.md", "docs/deep/b.md", "single.md"]);
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_escaping_root_are_rejected() {
        use std::os::unix::fs::symlink;

        let ws = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        write(outside.path(), "secret.md", "secret");
        write(ws.path(), "memory/ok.md", "ok");
        symlink(outside.path().join("secret.md"), ws.path().join("memory/leak.md")).unwrap();
        symlink(outside.path(), ws.path().join("linked")).unwrap();

        let paths = WorkspacePaths::new(ws.path(), &["linked".into()]).unwrap();
        let d = paths.discover();
        assert_eq!(rels(&d), vec!["memory/ok.md"]);
        assert_eq!(d.rejected.len(), 2);
        assert!(
            d.rejected
                .iter()
                .all(|(_, e)| matches!(e, MemoryError::PathSecurity { .. }))
        );
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_inside_root_are_deduplicated() {
        use std::os::unix::fs::symlink;

        let ws = tempfile::tempdir().unwrap();
        write(ws.path(), "memory/real.md", "real");
        symlink(ws.path().join("memory/real.md"), ws.path().join("memory/alias.md")).unwrap();

        let paths = WorkspacePaths::new(ws.path(), &[]).unwrap();
        assert_eq!(rels(&paths.discover()), vec!["memory/real.md"]);
    }

    #[test]
    fn write_targets_are_confined() {
        let ws = tempfile::tempdir().unwrap();
        let paths = WorkspacePaths::new(ws.path(), &[]).unwrap();

        let ok = paths.resolve_for_write("memory/new/today.md").unwrap();
        assert!(ok.starts_with(paths.root()));
        assert!(ok.ends_with("memory/new/today.md"));

        assert!(matches!(
            paths.resolve_for_write("../escape.md"),
            Err(MemoryError::PathSecurity { .. })
        ));
        assert!(matches!(
            paths.resolve_for_write("memory/x.txt"),
            Err(MemoryError::InvalidPath { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn write_through_escaping_symlink_dir_is_rejected() {
        use std::os::unix::fs::symlink;

        let ws = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        symlink(outside.path(), ws.path().join("memory")).unwrap();

        let paths = WorkspacePaths::new(ws.path(), &[]).unwrap();
        assert!(matches!(
            paths.resolve_for_write("memory/new.md"),
            Err(MemoryError::PathSecurity { .. })
        ));
    }
}
