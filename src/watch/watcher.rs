// src/watch/watcher.rs

use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::Utc;
use notify::event::{EventKind, ModifyKind};
use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::WatchConfig;
use crate::types::{ChangeEvent, ChangeEventType, Metadata};
use crate::watch::hash::{hash_file, ContentCache};
use crate::watch::patterns::{relative_str, WatchRules};

/// Handle for the filesystem watcher.
///
/// This exists mainly so the underlying `RecommendedWatcher` is kept alive for
/// as long as needed. Dropping this handle will stop file watching.
pub struct WatcherHandle {
    _inner: RecommendedWatcher,
    root: PathBuf,
}

impl std::fmt::Debug for WatcherHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatcherHandle")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

/// Turns raw filesystem notifications into [`ChangeEvent`]s.
///
/// Paths outside the include/exclude rules are ignored, and so are events
/// that leave a file's contents unchanged.
#[derive(Debug)]
pub struct ChangeDetector {
    root: PathBuf,
    rules: WatchRules,
    cache: ContentCache,
}

impl ChangeDetector {
    pub fn new(root: impl Into<PathBuf>, rules: WatchRules) -> Self {
        Self {
            root: root.into(),
            rules,
            cache: ContentCache::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Build the change event for `path`, if it is relevant. Whether the
    /// file still exists decides between deletion and creation/modification.
    pub fn detect(&mut self, path: &Path, hint: Option<ChangeEventType>) -> Option<ChangeEvent> {
        let rel = relative_str(&self.root, path)?;
        if rel.is_empty() || !self.rules.filter.matches(&rel) {
            return None;
        }

        let (event_type, size, diff_hash) = if path.is_file() {
            let (hash, size) = match hash_file(path) {
                Ok(h) => h,
                Err(e) => {
                    warn!(path = %rel, error = %e, "could not hash changed file");
                    return None;
                }
            };
            if !self.cache.update(path, &hash) {
                return None;
            }
            let event_type = match hint {
                Some(ChangeEventType::Created) => ChangeEventType::Created,
                _ => ChangeEventType::Modified,
            };
            (event_type, size, hash)
        } else if path.exists() {
            // Directories are not ingested.
            return None;
        } else {
            self.cache.remove(path);
            (ChangeEventType::Deleted, 0, String::new())
        };

        let (namespace, module) = self.rules.resolver.resolve(&rel);
        Some(ChangeEvent {
            id: uuid::Uuid::new_v4().to_string(),
            namespace,
            module,
            file_path: rel,
            event_type,
            timestamp: Utc::now(),
            size,
            diff_hash,
            metadata: Metadata::new(),
        })
    }

    /// Change events for every matching file currently under the root, in
    /// path order. Used to ingest the initial state.
    pub fn scan(&mut self) -> Result<Vec<ChangeEvent>> {
        let mut files = Vec::new();
        let mut stack = vec![self.root.clone()];
        while let Some(dir) = stack.pop() {
            for entry in std::fs::read_dir(&dir)? {
                let path = entry?.path();
                if path.is_dir() {
                    stack.push(path);
                } else {
                    files.push(path);
                }
            }
        }
        files.sort();

        Ok(files
            .iter()
            .filter_map(|p| self.detect(p, Some(ChangeEventType::Created)))
            .collect())
    }
}

fn kind_hint(kind: &EventKind) -> Option<Option<ChangeEventType>> {
    match kind {
        EventKind::Create(_) => Some(Some(ChangeEventType::Created)),
        EventKind::Modify(ModifyKind::Metadata(_)) => None,
        EventKind::Modify(_) => Some(Some(ChangeEventType::Modified)),
        EventKind::Remove(_) => Some(Some(ChangeEventType::Deleted)),
        EventKind::Access(_) => None,
        EventKind::Any | EventKind::Other => Some(None),
    }
}

/// Spawn a filesystem watcher that observes `config.root` recursively and
/// sends a [`ChangeEvent`] for every relevant file change.
pub fn spawn_watcher(config: &WatchConfig, tx: mpsc::Sender<ChangeEvent>) -> Result<WatcherHandle> {
    let root = PathBuf::from(&config.root);
    // Canonicalize once so we have a stable base path.
    let root = root.canonicalize().unwrap_or(root);
    let rules = WatchRules::from_config(config)?;

    // Channel from the blocking notify callback into the async world.
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<Event>();

    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<Event>| match res {
            Ok(event) => {
                if let Err(err) = event_tx.send(event) {
                    // We can't log via tracing here easily, so fallback to stderr.
                    eprintln!("ingestflow: failed to forward notify event: {err}");
                }
            }
            Err(err) => {
                eprintln!("ingestflow: file watch error: {err}");
            }
        },
        Config::default(),
    )?;

    watcher.watch(&root, RecursiveMode::Recursive)?;
    info!(root = ?root, "file watcher started");

    let mut detector = ChangeDetector::new(root.clone(), rules);
    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            let Some(hint) = kind_hint(&event.kind) else {
                continue;
            };
            debug!(kind = ?event.kind, paths = ?event.paths, "received notify event");

            for path in &event.paths {
                let Some(change) = detector.detect(path, hint) else {
                    continue;
                };
                debug!(file = %change.file_path, event_type = ?change.event_type, "file change detected");
                if tx.send(change).await.is_err() {
                    debug!("change receiver dropped; stopping watcher loop");
                    return;
                }
            }
        }
        debug!("watcher event loop finished");
    });

    Ok(WatcherHandle {
        _inner: watcher,
        root,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WatchConfig;

    fn detector(root: &Path, include: &[&str]) -> ChangeDetector {
        let cfg = WatchConfig {
            root: root.to_string_lossy().into_owned(),
            include: include.iter().map(|s| s.to_string()).collect(),
            exclude: vec!["**/*.tmp".into()],
            module_pattern: None,
        };
        ChangeDetector::new(root, WatchRules::from_config(&cfg).unwrap())
    }

    #[test]
    fn detects_created_modified_and_deleted_files() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        std::fs::create_dir_all(root.join("acme/billing")).unwrap();
        let file = root.join("acme/billing/lib.rs");
        std::fs::write(&file, "fn a() {}").unwrap();

        let mut d = detector(&root, &["**/*.rs"]);
        let created = d.detect(&file, Some(ChangeEventType::Created)).unwrap();
        assert_eq!(created.event_type, ChangeEventType::Created);
        assert_eq!(created.file_path, "acme/billing/lib.rs");
        assert_eq!((created.namespace.as_str(), created.module.as_str()), ("acme", "billing"));
        assert_eq!(created.size, 9);

        // Same contents: dropped.
        assert!(d.detect(&file, Some(ChangeEventType::Modified)).is_none());

        std::fs::write(&file, "fn b() {}").unwrap();
        let modified = d.detect(&file, Some(ChangeEventType::Modified)).unwrap();
        assert_eq!(modified.event_type, ChangeEventType::Modified);
        assert_ne!(modified.diff_hash, created.diff_hash);

        std::fs::remove_file(&file).unwrap();
        let deleted = d.detect(&file, Some(ChangeEventType::Deleted)).unwrap();
        assert_eq!(deleted.event_type, ChangeEventType::Deleted);
        assert!(deleted.diff_hash.is_empty());
    }

    #[test]
    fn scan_skips_excluded_and_unmatched_files() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        std::fs::write(root.join("a.rs"), "a").unwrap();
        std::fs::write(root.join("b.tmp"), "b").unwrap();
        std::fs::write(root.join("c.md"), "c").unwrap();

        let mut d = detector(&root, &["**/*.rs", "**/*.tmp"]);
        let events = d.scan().unwrap();
        let paths: Vec<&str> = events.iter().map(|e| e.file_path.as_str()).collect();
        assert_eq!(paths, vec!["a.rs"]);
    }
}
