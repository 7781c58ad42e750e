//! File discovery: walks the workspace respecting `.gitignore`, filters by
//! extension/filename allow-lists and exclude globs, and skips files over
//! `max_file_size`.

use std::path::Path;

use globset::{Glob, GlobSetBuilder};
use ignore::WalkBuilder;

use crate::config::IndexerConfig;

/// Returns workspace-relative paths (forward-slash separated) of files
/// eligible for indexing.
pub fn discover_files(root: &Path, cfg: &IndexerConfig) -> Vec<String> {
    let mut exclude_builder = GlobSetBuilder::new();
    for pattern in &cfg.exclude_globs {
        if let Ok(glob) = Glob::new(pattern) {
            exclude_builder.add(glob);
        } else {
            tracing::warn!(pattern = %pattern, "invalid exclude glob, ignoring");
        }
    }
    let excludes = match exclude_builder.build() {
        Ok(g) => g,
        Err(e) => {
            tracing::warn!(error = %e, "failed to build exclude globset, excluding nothing");
            GlobSetBuilder::new().build().unwrap()
        }
    };

    let walker = WalkBuilder::new(root)
        .git_ignore(true)
        .git_global(true)
        .git_exclude(true)
        .hidden(true)
        .follow_links(false)
        .build();

    let mut files = Vec::new();
    for entry in walker.filter_map(|e| e.ok()) {
        let Some(ft) = entry.file_type() else { continue };
        if !ft.is_file() {
            continue;
        }
        let path = entry.path();
        let rel = match path.strip_prefix(root) {
            Ok(r) => r,
            Err(_) => continue,
        };
        let rel_str = rel.to_string_lossy().replace('\\', "/");
        if excludes.is_match(&rel_str) {
            continue;
        }
        if !is_allowed(path, cfg) {
            continue;
        }
        let Ok(meta) = entry.metadata() else { continue };
        if meta.len() > cfg.max_file_size {
            continue;
        }
        files.push(rel_str);
    }
    files.sort();
    files
}

fn is_allowed(path: &Path, cfg: &IndexerConfig) -> bool {
    if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
        if cfg.allowed_filenames.iter().any(|f| f == name) {
            return true;
        }
    }
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => cfg.allowed_extensions.iter().any(|a| a == ext),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn cfg() -> IndexerConfig {
        IndexerConfig::default()
    }

    #[test]
    fn finds_allowed_extensions_only() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("main.rs"), "fn main() {}").unwrap();
        std::fs::write(dir.path().join("notes.bin"), [0u8, 1, 2]).unwrap();
        let files = discover_files(dir.path(), &cfg());
        assert_eq!(files, vec!["main.rs".to_string()]);
    }

    #[test]
    fn respects_exclude_globs() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("target")).unwrap();
        std::fs::write(dir.path().join("target/x.rs"), "fn x() {}").unwrap();
        std::fs::write(dir.path().join("main.rs"), "fn main() {}").unwrap();
        let files = discover_files(dir.path(), &cfg());
        assert_eq!(files, vec!["main.rs".to_string()]);
    }

    #[test]
    fn oversized_files_are_skipped() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("big.rs"), vec![b'a'; 100]).unwrap();
        let mut c = cfg();
        c.max_file_size = 10;
        let files = discover_files(dir.path(), &c);
        assert!(files.is_empty());
    }

    #[test]
    fn allowed_filenames_without_extension_are_found() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("Makefile"), "all:\n\techo hi\n").unwrap();
        let files = discover_files(dir.path(), &cfg());
        assert_eq!(files, vec!["Makefile".to_string()]);
    }
}
