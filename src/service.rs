//! The service: the explicit value that owns the cache, ANN manager, and
//! embedder together, and exposes `search`, `index`, `ann_config`,
//! `clear_cache`, and `find_similar` to both the CLI and the stdio
//! protocol adapter. One struct threading through everything that needs
//! it, instead of scattered global singletons.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::ann::AnnManager;
use crate::cache::{Cache, LoadOptions, LoadOutcome};
use crate::config::Config;
use crate::embedder::{Embedder, HashEmbedder};
use crate::error::{CoreError, CoreResult, ErrorKind};
use crate::indexer::{IndexStats, Indexer};
use crate::search::{HybridSearch, SearchResult};

pub struct Service {
    root: PathBuf,
    cache_dir: PathBuf,
    config: Config,
    cache: Cache,
    ann: Mutex<AnnManager>,
    embedder: Box<dyn Embedder>,
    init_errors: Mutex<Vec<String>>,
}

impl Service {
    pub fn open(root: &Path) -> CoreResult<Service> {
        let config = Config::load(root);
        let cache_dir = root.join(crate::CACHE_DIR);

        let embedder: Box<dyn Embedder> = Box::new(HashEmbedder::new(
            config.embedder.model_name.clone(),
            config.embedder.dimension,
            config.embedder.max_length,
        ));

        let mut init_errors = Vec::new();

        let (cache, outcome) = Cache::load(
            &cache_dir,
            LoadOptions {
                workspace: root.to_string_lossy().to_string(),
                embedding_model: embedder.model_name().to_string(),
                embedding_dimension: embedder.dimension(),
                vector_load_mode: config.cache.vector_load_mode,
                save_debounce_ms: config.cache.save_debounce_ms,
                reader_wait_timeout_ms: config.cache.reader_wait_timeout_ms,
                force_save_with_active_readers: config.cache.force_save_with_active_readers,
            },
        )
        .map_err(|e| CoreError::new(ErrorKind::Fatal, e.to_string()))?;

        if let LoadOutcome::NeedsReindex(reason) = outcome {
            init_errors.push(format!("cache needs reindex: {reason}"));
        }

        let mut ann = AnnManager::new(
            &cache_dir,
            config.ann.clone(),
            config.embedder.dimension,
            config.embedder.model_name.clone(),
        );
        if let Err(e) = ann.load(&cache) {
            init_errors.push(format!("ann index load failed: {e}"));
        }
        if let Err(e) = ann.ensure_ready(&cache) {
            init_errors.push(format!("ann index build failed: {e}"));
        }

        Ok(Service {
            root: root.to_path_buf(),
            cache_dir,
            config,
            cache,
            ann: Mutex::new(ann),
            embedder,
            init_errors: Mutex::new(init_errors),
        })
    }

    /// Drains and returns errors accumulated during `open` or subsequent
    /// operations that don't have another way to surface a partial
    /// failure (e.g. an ANN rebuild that failed but left search usable via
    /// the linear-scan fallback).
    pub fn take_init_errors(&self) -> Vec<String> {
        std::mem::replace(&mut *self.init_errors.lock().unwrap(), Vec::new())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn search(&self, query: &str, max_results: Option<usize>) -> CoreResult<Vec<SearchResult>> {
        let ann = self.ann.lock().unwrap();
        let search = HybridSearch::new(&self.cache, &ann, self.embedder.as_ref(), self.config.search.clone());
        Ok(search.search(query, max_results))
    }

    pub fn find_similar(&self, file: &str, max_results: Option<usize>) -> CoreResult<Vec<SearchResult>> {
        // Use the file's own first chunk as the query: it stands in for
        // "what this file is about" well enough to seed a similarity search.
        let content = (0..self.cache.len())
            .find(|i| self.cache.get_chunk_location(*i).map(|(f, _, _)| f).as_deref() == Some(file))
            .and_then(|i| self.cache.get_chunk_content(i))
            .ok_or_else(|| CoreError::new(ErrorKind::Fatal, format!("no indexed chunks for {file}")))?;

        let ann = self.ann.lock().unwrap();
        let search = HybridSearch::new(&self.cache, &ann, self.embedder.as_ref(), self.config.search.clone());
        Ok(search.search_near(&content, max_results, Some(file)))
    }

    pub fn index(&self) -> CoreResult<IndexStats> {
        let mut ann = self.ann.lock().unwrap();
        let mut indexer = Indexer::new(
            self.root.clone(),
            self.config.indexer.clone(),
            &self.cache,
            &mut ann,
            self.embedder.as_ref(),
        );
        let stats = indexer.run();
        if ann.needs_rebuild() {
            if let Err(e) = ann.ensure_ready(&self.cache) {
                self.init_errors
                    .lock()
                    .unwrap()
                    .push(format!("ann rebuild after index failed: {e}"));
            }
        }
        if let Err(e) = ann.persist() {
            self.init_errors
                .lock()
                .unwrap()
                .push(format!("ann persist failed: {e}"));
        }
        Ok(stats)
    }

    pub fn ann_config(&self) -> crate::config::AnnConfig {
        self.config.ann.clone()
    }

    /// Current ANN index stats: size, readiness, and the effective HNSW
    /// parameters (including any runtime `set_ef_search` override).
    pub fn ann_stats(&self) -> crate::ann::AnnStats {
        self.ann.lock().unwrap().stats()
    }

    /// Sets `ef_search` at runtime. Takes effect immediately for subsequent
    /// searches and is persisted on the next `persist()` (the next `index()`
    /// call, or immediately here if the index is already built).
    pub fn set_ann_ef_search(&self, ef_search: usize) -> CoreResult<()> {
        let mut ann = self.ann.lock().unwrap();
        ann.set_ef_search(ef_search);
        if ann.is_ready() {
            ann.persist()
                .map_err(|e| CoreError::new(ErrorKind::Fatal, e.to_string()))?;
        }
        Ok(())
    }

    /// Forces a full rebuild of the ANN index from the cache's current
    /// vectors on the next `ensure_ready`, then builds and persists it now.
    pub fn rebuild_ann(&self) -> CoreResult<crate::ann::AnnStats> {
        let mut ann = self.ann.lock().unwrap();
        ann.force_rebuild();
        ann.ensure_ready(&self.cache)
            .map_err(|e| CoreError::new(ErrorKind::Fatal, e.to_string()))?;
        ann.persist()
            .map_err(|e| CoreError::new(ErrorKind::Fatal, e.to_string()))?;
        Ok(ann.stats())
    }

    pub fn clear_cache(&self) -> CoreResult<()> {
        self.cache
            .clear()
            .map_err(|e| CoreError::new(ErrorKind::Fatal, e.to_string()))?;
        let mut ann = self.ann.lock().unwrap();
        *ann = AnnManager::new(
            &self.cache_dir,
            self.config.ann.clone(),
            self.config.embedder.dimension,
            self.config.embedder.model_name.clone(),
        );
        Ok(())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}
