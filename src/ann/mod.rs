//! Approximate nearest-neighbor index manager.
//!
//! Wraps an HNSW graph (`hnsw_rs`) keyed by the same positional integer
//! labels the cache assigns to chunks (a `Label` is just "the chunk's
//! logical index at build time"; no separate id-map indirection, unlike a
//! string-keyed index). Owns the build/rebuild/incremental-append state
//! machine:
//!
//! `Absent` → nothing built yet (below `min_chunks`, or never indexed).
//! `Ready(clean)` → built and persisted, matches the cache exactly.
//! `Ready(persist_dirty)` → built, has incremental appends not yet flushed
//! to disk.
//! `Dirty(needs_rebuild)` → a non-append mutation happened; the whole graph
//! must be rebuilt from the cache before it can serve queries again.

use std::path::Path;

use hnsw_rs::dist::DistCosine;
use hnsw_rs::hnsw::{Hnsw, Neighbour};
use hnsw_rs::hnswio::HnswIo;

use crate::cache::{Cache, MutationKind};
use crate::config::AnnConfig;

pub const GRAPH_BASENAME: &str = "ann-index";
pub const META_FILE: &str = "ann-meta.json";

#[derive(Debug, thiserror::Error)]
pub enum AnnError {
    #[error("ann index io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("ann index json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("ann build/load failed: {0}")]
    Backend(String),
    #[error("ann index checksum mismatch, treating as absent")]
    ChecksumMismatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Absent,
    ReadyClean,
    ReadyPersistDirty,
    DirtyNeedsRebuild,
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct AnnMeta {
    version: u32,
    embedding_model: String,
    metric: String,
    dim: usize,
    count: usize,
    max_elements: usize,
    m: usize,
    ef_construction: usize,
    ef_search: usize,
    checksum: String,
}

const ANN_META_VERSION: u32 = 1;
const METRIC: &str = "cosine";

/// Owns the HNSW graph and its backing storage. Vectors are boxed so their
/// heap address is stable even when `storage` itself reallocates on push;
/// `index` borrows them as `'static` under that invariant, which holds
/// because entries are only ever appended, never removed in place (a
/// removal always goes through a full rebuild, which drops and recreates
/// both `storage` and `index` together).
struct HnswBackend {
    dim: usize,
    /// Fixed `max_elements` the graph was constructed with; inserting a
    /// label at or beyond this always forces a rebuild.
    capacity: usize,
    storage: Vec<Box<[f32]>>,
    index: Hnsw<'static, f32, DistCosine>,
}

impl HnswBackend {
    fn new(dim: usize, capacity: usize, cfg: &AnnConfig) -> Self {
        HnswBackend {
            dim,
            capacity,
            storage: Vec::with_capacity(capacity),
            index: Hnsw::new(cfg.m, capacity, 16, cfg.ef_construction, DistCosine {}),
        }
    }

    fn add_point(&mut self, vector: &[f32], label: u32) {
        let boxed: Box<[f32]> = vector.into();
        self.storage.push(boxed);
        let stored: &[f32] = self.storage.last().unwrap();
        // SAFETY: `stored` points into a `Box<[f32]>` whose heap allocation
        // never moves or is freed while `self` (and thus `self.index`, which
        // we hand this reference to) is alive. We only ever push; we never
        // remove a single entry from `storage`.
        let data: &'static [f32] = unsafe { std::mem::transmute(stored) };
        self.index.insert((data, label as usize));
    }

    fn search(&self, query: &[f32], k: usize, ef_search: usize) -> Vec<Neighbour> {
        self.index.search(query, k, ef_search)
    }

    fn len(&self) -> usize {
        self.storage.len()
    }
}

/// Orchestrates the HNSW backend against the cache: decides when to build,
/// append, or rebuild, and persists/reloads the graph plus its checksum
/// sidecar.
pub struct AnnManager {
    dir: std::path::PathBuf,
    cfg: AnnConfig,
    state: State,
    backend: Option<HnswBackend>,
    dim: usize,
    embedding_model: String,
}

impl AnnManager {
    pub fn new(dir: &Path, cfg: AnnConfig, dim: usize, embedding_model: impl Into<String>) -> AnnManager {
        AnnManager {
            dir: dir.to_path_buf(),
            cfg,
            state: State::Absent,
            backend: None,
            dim,
            embedding_model: embedding_model.into(),
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.state, State::ReadyClean | State::ReadyPersistDirty)
    }

    /// Effective ef_search currently in use.
    pub fn ef_search(&self) -> usize {
        self.cfg.ef_search
    }

    /// Overrides `ef_search` for subsequent searches; persisted on the next
    /// `persist()` call and validated on the next `load()`.
    pub fn set_ef_search(&mut self, ef_search: usize) {
        self.cfg.ef_search = ef_search;
        if self.state == State::ReadyClean {
            self.state = State::ReadyPersistDirty;
        }
    }

    /// Forces a full rebuild on the next `ensure_ready` call, regardless of
    /// current state.
    pub fn force_rebuild(&mut self) {
        self.state = State::DirtyNeedsRebuild;
    }

    /// Stats describing the current index, for `ann_config stats`.
    pub fn stats(&self) -> AnnStats {
        AnnStats {
            ready: self.is_ready(),
            needs_rebuild: self.needs_rebuild(),
            count: self.backend.as_ref().map(HnswBackend::len).unwrap_or(0),
            dim: self.dim,
            m: self.cfg.m,
            ef_construction: self.cfg.ef_construction,
            ef_search: self.cfg.ef_search,
        }
    }

    /// Load a previously persisted graph, if present, not corrupt, and
    /// built with metadata matching the current configuration and cache.
    /// Leaves state `Absent` on any mismatch or failure (next
    /// `ensure_ready` rebuilds).
    pub fn load(&mut self, cache: &Cache) -> Result<(), AnnError> {
        let meta_path = self.dir.join(META_FILE);
        let meta: AnnMeta = match std::fs::read_to_string(&meta_path) {
            Ok(text) => serde_json::from_str(&text)?,
            Err(_) => return Ok(()),
        };
        if meta.version != ANN_META_VERSION
            || meta.embedding_model != self.embedding_model
            || meta.metric != METRIC
            || meta.dim != self.dim
            || meta.count != cache.len()
            || meta.m != self.cfg.m
            || meta.ef_construction != self.cfg.ef_construction
            || meta.max_elements < meta.count
        {
            tracing::warn!("ann index metadata mismatch, will rebuild");
            return Ok(());
        }
        let graph_path = self.dir.join(format!("{GRAPH_BASENAME}.hnsw.graph"));
        let data_path = self.dir.join(format!("{GRAPH_BASENAME}.hnsw.data"));
        if !graph_path.exists() || !data_path.exists() {
            return Ok(());
        }
        let checksum = checksum_files(&[&graph_path, &data_path])?;
        if checksum != meta.checksum {
            tracing::warn!("ann index checksum mismatch, will rebuild");
            return Ok(());
        }

        let mut io = HnswIo::new(&self.dir, GRAPH_BASENAME);
        match io.load_hnsw::<f32, DistCosine>() {
            Ok(loaded) => {
                let backend = HnswBackend {
                    dim: self.dim,
                    capacity: meta.max_elements,
                    storage: Vec::new(),
                    index: loaded,
                };
                self.cfg.ef_search = meta.ef_search;
                self.backend = Some(backend);
                self.state = State::ReadyClean;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to load ann index, will rebuild");
            }
        }
        Ok(())
    }

    /// Apply a cache mutation's effect on the ANN state. Call this right
    /// after the corresponding `Cache` mutation, passing the chunk's vector
    /// when `kind` is `Appended` (ignored otherwise).
    pub fn record_mutation(&mut self, kind: MutationKind, vector: Option<&[f32]>) {
        match kind {
            MutationKind::Invalidating => {
                self.state = State::DirtyNeedsRebuild;
            }
            MutationKind::Appended { label } => {
                if !self.is_ready() {
                    // No graph yet; `ensure_ready` will do a full build that
                    // picks this point up naturally.
                    return;
                }
                let Some(backend) = self.backend.as_mut() else {
                    self.state = State::DirtyNeedsRebuild;
                    return;
                };
                if (label as usize) >= backend.capacity {
                    self.state = State::DirtyNeedsRebuild;
                    return;
                }
                if let Some(vector) = vector {
                    backend.add_point(vector, label);
                    self.state = State::ReadyPersistDirty;
                } else {
                    self.state = State::DirtyNeedsRebuild;
                }
            }
        }
    }

    fn capacity_for(&self, n: usize) -> usize {
        ((n as f64 * self.cfg.max_elements_factor) as usize) + self.cfg.max_elements_extra
    }

    /// Samples `min(cfg.sample_size, n)` vectors, evenly spaced across the
    /// cache, and checks each has length `self.dim`. A single mismatched
    /// vector aborts the build before anything is written to `self.backend`
    /// or disk.
    fn check_vector_dimensions(&self, cache: &Cache, n: usize) -> Result<(), AnnError> {
        let sample = self.cfg.sample_size.min(n).max(1);
        let step = (n / sample).max(1);
        for i in (0..n).step_by(step) {
            if let Some(vector) = cache.get_chunk_vector(i) {
                if vector.len() != self.dim {
                    return Err(AnnError::Backend(format!(
                        "chunk {i} has vector length {} but index dimension is {}",
                        vector.len(),
                        self.dim
                    )));
                }
            }
        }
        Ok(())
    }

    /// Build (or rebuild) the graph from scratch using everything the cache
    /// currently holds, if there are at least `min_chunks` chunks and ANN is
    /// enabled. No-op if already `Ready(clean)`.
    pub fn ensure_ready(&mut self, cache: &Cache) -> Result<(), AnnError> {
        if !self.cfg.enabled {
            return Ok(());
        }
        if self.state == State::ReadyClean {
            return Ok(());
        }
        let n = cache.len();
        if n < self.cfg.min_chunks {
            self.state = State::Absent;
            self.backend = None;
            return Ok(());
        }

        self.check_vector_dimensions(cache, n)?;

        let capacity = self.capacity_for(n);
        let mut backend = HnswBackend::new(self.dim, capacity, &self.cfg);
        for i in 0..n {
            if let Some(vector) = cache.get_chunk_vector(i) {
                backend.add_point(&vector, i as u32);
            }
            if i % self.cfg.build_yield_every == 0 {
                std::thread::yield_now();
            }
        }
        self.backend = Some(backend);
        self.state = State::ReadyPersistDirty;
        Ok(())
    }

    /// Search for the `k` nearest neighbors of `query`. Returns
    /// `(label, distance)` pairs. Empty if the index isn't ready.
    pub fn search_knn(&self, query: &[f32], k: usize) -> Vec<(u32, f32)> {
        let Some(backend) = self.backend.as_ref() else {
            return Vec::new();
        };
        backend
            .search(query, k, self.cfg.ef_search)
            .into_iter()
            .map(|n| (n.d_id as u32, n.distance))
            .collect()
    }

    /// Persist the graph to disk if there is anything unpersisted.
    pub fn persist(&mut self) -> Result<(), AnnError> {
        if self.state != State::ReadyPersistDirty {
            return Ok(());
        }
        let Some(backend) = self.backend.as_ref() else {
            return Ok(());
        };
        std::fs::create_dir_all(&self.dir)?;
        backend
            .index
            .file_dump(&self.dir, GRAPH_BASENAME)
            .map_err(AnnError::Backend)?;

        let graph_path = self.dir.join(format!("{GRAPH_BASENAME}.hnsw.graph"));
        let data_path = self.dir.join(format!("{GRAPH_BASENAME}.hnsw.data"));
        let checksum = checksum_files(&[&graph_path, &data_path])?;
        let meta = AnnMeta {
            version: ANN_META_VERSION,
            embedding_model: self.embedding_model.clone(),
            metric: METRIC.to_string(),
            dim: self.dim,
            count: backend.len(),
            max_elements: backend.capacity,
            m: self.cfg.m,
            ef_construction: self.cfg.ef_construction,
            ef_search: self.cfg.ef_search,
            checksum,
        };
        std::fs::write(self.dir.join(META_FILE), serde_json::to_string_pretty(&meta)?)?;
        self.state = State::ReadyClean;
        Ok(())
    }

    pub fn needs_rebuild(&self) -> bool {
        self.state == State::DirtyNeedsRebuild
    }
}

/// Snapshot of the ANN index state, for the `ann_config stats` CLI action
/// and the JSON-RPC equivalent.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AnnStats {
    pub ready: bool,
    pub needs_rebuild: bool,
    pub count: usize,
    pub dim: usize,
    pub m: usize,
    pub ef_construction: usize,
    pub ef_search: usize,
}

fn checksum_files(paths: &[&Path]) -> Result<String, AnnError> {
    let mut hasher = blake3::Hasher::new();
    for p in paths {
        hasher.update(&std::fs::read(p)?);
    }
    Ok(hasher.finalize().to_hex().to_string())
}

/// Trait boundary for the ANN backend, kept separate from `AnnManager`'s
/// orchestration so an alternative backend (e.g. a different ANN library)
/// could be swapped in without touching the state machine above.
pub trait AnnBackend {
    fn add_point(&mut self, vector: &[f32], label: u32);
    fn search_knn(&self, query: &[f32], k: usize, ef_search: usize) -> Vec<(u32, f32)>;
    fn len(&self) -> usize;
}

impl AnnBackend for HnswBackend {
    fn add_point(&mut self, vector: &[f32], label: u32) {
        HnswBackend::add_point(self, vector, label)
    }

    fn search_knn(&self, query: &[f32], k: usize, ef_search: usize) -> Vec<(u32, f32)> {
        self.search(query, k, ef_search)
            .into_iter()
            .map(|n| (n.d_id as u32, n.distance))
            .collect()
    }

    fn len(&self) -> usize {
        HnswBackend::len(self)
    }
}
