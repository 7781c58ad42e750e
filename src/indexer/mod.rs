//! Incremental indexer: discovers files, chunks them, embeds new/changed
//! chunks, and writes the results into the cache (and, via the returned
//! mutation kinds, the ANN manager).
//!
//! Discovery and chunking are plain, synchronous, single-threaded passes —
//! per the concurrency model, parallelism lives in the embedding step, not
//! in file walking or line splitting.

pub mod chunker;
pub mod discovery;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::ann::AnnManager;
use crate::cache::{Cache, FileHashEntry};
use crate::callgraph::Extractor;
use crate::cli::signal::check_interrupted;
use crate::config::IndexerConfig;
use crate::embedder::Embedder;

pub use chunker::{chunk_lines, Chunk};
pub use discovery::discover_files;

#[derive(Debug, Default, Clone, Copy, serde::Serialize)]
pub struct IndexStats {
    pub files_scanned: usize,
    pub files_indexed: usize,
    pub files_unchanged: usize,
    pub files_removed: usize,
    pub chunks_added: usize,
    pub embed_failures: usize,
    pub interrupted: bool,
}

pub struct Indexer<'a> {
    root: PathBuf,
    cfg: IndexerConfig,
    cache: &'a Cache,
    ann: &'a mut AnnManager,
    embedder: &'a dyn Embedder,
    extractor: Extractor,
}

impl<'a> Indexer<'a> {
    pub fn new(
        root: PathBuf,
        cfg: IndexerConfig,
        cache: &'a Cache,
        ann: &'a mut AnnManager,
        embedder: &'a dyn Embedder,
    ) -> Self {
        Indexer {
            root,
            cfg,
            cache,
            ann,
            embedder,
            extractor: Extractor::default(),
        }
    }

    /// Run a full incremental pass: discover files, skip unchanged ones by
    /// content hash, chunk and embed the rest, remove chunks for files that
    /// disappeared, and checkpoint periodically.
    pub fn run(&mut self) -> IndexStats {
        let mut stats = IndexStats::default();
        let discovered = discover_files(&self.root, &self.cfg);
        stats.files_scanned = discovered.len();

        let discovered_set: HashSet<String> = discovered.iter().cloned().collect();
        let known_files: Vec<String> = self.cache.known_files();
        for file in known_files {
            if !discovered_set.contains(&file) {
                let kind = self.cache.remove_file_from_store(&file);
                self.ann.record_mutation(kind, None);
                stats.files_removed += 1;
            }
        }

        let mut last_checkpoint = Instant::now();
        for rel_path in discovered {
            if check_interrupted() {
                stats.interrupted = true;
                break;
            }

            let full_path = self.root.join(&rel_path);
            let content = match std::fs::read_to_string(&full_path) {
                Ok(c) => c,
                Err(_) => continue, // binary or unreadable; discovery already filters by extension
            };
            let hash = blake3::hash(content.as_bytes()).to_hex().to_string();

            if let Some(existing) = self.cache.get_file_hash(&rel_path) {
                if existing.hash == hash {
                    stats.files_unchanged += 1;
                    continue;
                }
            }

            let removal = self.cache.remove_file_from_store(&rel_path);
            self.ann.record_mutation(removal, None);

            let chunks = chunk_lines(&content, self.cfg.chunk_size, self.cfg.chunk_overlap);
            let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();

            match self.embedder.embed(&texts) {
                Ok(vectors) => {
                    for (chunk, vector) in chunks.iter().zip(vectors.into_iter()) {
                        let kind = self.cache.add_to_store(
                            rel_path.clone(),
                            chunk.start_line,
                            chunk.end_line,
                            chunk.content.clone(),
                            vector.clone(),
                        );
                        self.ann.record_mutation(kind, Some(&vector));
                        stats.chunks_added += 1;
                    }
                }
                Err(e) => {
                    tracing::warn!(file = %rel_path, error = %e, "embedding failed, skipping file");
                    stats.embed_failures += 1;
                    continue;
                }
            }

            let record = self.extractor.extract(&content);
            self.cache.set_call_data(rel_path.clone(), record);
            let mtime_ms = std::fs::metadata(&full_path)
                .and_then(|m| m.modified())
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as i64);
            self.cache.set_file_hash(
                rel_path.clone(),
                FileHashEntry {
                    hash,
                    mtime_ms,
                    size: Some(content.len() as u64),
                },
            );
            stats.files_indexed += 1;

            if last_checkpoint.elapsed() >= Duration::from_millis(self.cfg.checkpoint_interval_ms) {
                self.cache.save(false).ok();
                last_checkpoint = Instant::now();
            }
        }

        self.cache.save(false).ok();
        stats
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}
