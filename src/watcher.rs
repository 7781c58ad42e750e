//! File-watcher collaborator: wraps `notify` and debounces raw filesystem
//! events into a deduplicated set of changed workspace-relative paths,
//! adapted from the donor's `cli::watch` polling loop.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError};
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};

pub const MAX_PENDING_FILES: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    Changed(String),
    Removed(String),
}

pub struct FileWatcher {
    _watcher: RecommendedWatcher,
    rx: Receiver<notify::Result<notify::Event>>,
    root: PathBuf,
}

impl FileWatcher {
    pub fn new(root: &Path) -> notify::Result<FileWatcher> {
        let (tx, rx) = channel();
        let mut watcher = notify::recommended_watcher(move |res| {
            let _ = tx.send(res);
        })?;
        watcher.watch(root, RecursiveMode::Recursive)?;
        Ok(FileWatcher {
            _watcher: watcher,
            rx,
            root: root.to_path_buf(),
        })
    }

    /// Blocks up to `debounce` collecting events, then returns the
    /// deduplicated set of changed/removed paths seen so far (empty if
    /// nothing happened). Caps pending files at `MAX_PENDING_FILES` to
    /// avoid unbounded growth during something like a branch checkout.
    pub fn poll(&self, debounce: Duration) -> Vec<ChangeEvent> {
        let mut changed: HashSet<String> = HashSet::new();
        let mut removed: HashSet<String> = HashSet::new();
        let deadline = std::time::Instant::now() + debounce;

        loop {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            match self.rx.recv_timeout(remaining) {
                Ok(Ok(event)) => {
                    for path in event.paths {
                        let Ok(rel) = path.strip_prefix(&self.root) else { continue };
                        let rel_str = rel.to_string_lossy().replace('\\', "/");
                        if changed.len() + removed.len() >= MAX_PENDING_FILES {
                            continue;
                        }
                        use notify::EventKind::*;
                        match event.kind {
                            Remove(_) => {
                                changed.remove(&rel_str);
                                removed.insert(rel_str);
                            }
                            Create(_) | Modify(_) => {
                                removed.remove(&rel_str);
                                changed.insert(rel_str);
                            }
                            _ => {}
                        }
                    }
                }
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "file watcher error");
                }
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        changed
            .into_iter()
            .map(ChangeEvent::Changed)
            .chain(removed.into_iter().map(ChangeEvent::Removed))
            .collect()
    }
}
