// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2025 Revolver Contributors

//! Filesystem watcher feeding [`ChangeHandler`]s.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use revolver_ecdysis::{ChangeEvent, ChangeHandler, ChangeKind};
use tracing::{debug, info};

/// Passes paths whose extension ends with one of the configured suffixes.
#[derive(Debug, Clone, Default)]
pub struct ExtensionFilter {
    suffixes: Vec<String>,
}

impl ExtensionFilter {
    pub fn new(suffixes: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            suffixes: suffixes.into_iter().map(Into::into).collect(),
        }
    }

    /// No suffixes means everything passes.
    pub fn matches(&self, path: &Path) -> bool {
        if self.suffixes.is_empty() {
            return true;
        }
        let ext = path
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        self.suffixes.iter().any(|suffix| ext.ends_with(suffix.as_str()))
    }
}

/// Recursive watch of a project root. Stops when dropped.
pub struct FileWatcher {
    _watcher: RecommendedWatcher,
    root: PathBuf,
}

impl FileWatcher {
    pub fn start(
        root: &Path,
        filter: ExtensionFilter,
        handlers: Vec<Arc<dyn ChangeHandler>>,
    ) -> notify::Result<Self> {
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                if let Some(change) = to_change(event, &filter) {
                    for handler in &handlers {
                        handler.handle(&change);
                    }
                }
            }
            Err(e) => {
                let message = e.to_string();
                for handler in &handlers {
                    handler.handle_error(&message);
                }
            }
        })?;
        watcher.watch(root, RecursiveMode::Recursive)?;
        info!(root = %root.display(), "Watching for changes");

        Ok(Self {
            _watcher: watcher,
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Keep create/modify/remove events for paths that pass the filter.
fn to_change(event: Event, filter: &ExtensionFilter) -> Option<ChangeEvent> {
    let kind = match event.kind {
        EventKind::Create(_) => ChangeKind::Created,
        EventKind::Modify(_) => ChangeKind::Modified,
        EventKind::Remove(_) => ChangeKind::Removed,
        _ => return None,
    };

    let paths: Vec<PathBuf> = event
        .paths
        .into_iter()
        .filter(|p| filter.matches(p))
        .collect();
    if paths.is_empty() {
        return None;
    }

    Some(ChangeEvent::new(kind, paths))
}

/// Logs every change that passes the filter.
pub struct ChangeLogger;

impl ChangeHandler for ChangeLogger {
    fn handle(&self, event: &ChangeEvent) {
        debug!(paths = ?event.paths, kind = ?event.kind, "File change");
    }
}
