//! The embedding cache: the single authoritative handle on the chunk store
//! plus the file-hash and call-graph maps. Arbitrates concurrent readers
//! against the writer and serializes/debounces saves.
//!
//! Chunks added since the last save live in an in-memory overlay; `save()`
//! folds that overlay and the on-disk store into one snapshot and rewrites
//! the store atomically (the chunk store itself has no incremental-write
//! primitive — only `Store::write_all` — so every save is a full rewrite;
//! what *is* incremental is the ANN index layered on top, per the `ann`
//! module).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant, SystemTime};

use serde::{Deserialize, Serialize};

use crate::config::VectorLoadMode;
use crate::store::{ChunkMeta, Store, StoreError, Telemetry};

pub const META_FILE: &str = "meta.json";
pub const FILE_HASHES_FILE: &str = "file-hashes.json";
pub const CALL_GRAPH_FILE: &str = "call-graph.json";

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("save is already in progress")]
    SaveInProgress,
    #[error("save failed: {0}")]
    SaveFailed(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheMeta {
    pub version: u32,
    pub embedding_model: String,
    pub embedding_dimension: usize,
    pub last_save_time: Option<String>,
    pub files_indexed: usize,
    pub chunks_stored: usize,
    pub workspace: String,
}

pub const CACHE_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FileHashEntry {
    pub hash: String,
    pub mtime_ms: Option<i64>,
    pub size: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CallGraphFileRecord {
    pub definitions: Vec<String>,
    pub calls: Vec<String>,
}

/// What a mutation implies for the ANN layer, decided by the `Cache` but
/// acted on by whoever orchestrates cache + ANN together (the `Service`);
/// the cache itself does not depend on the ANN manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    /// Appended at the new tail position; safe to `add_point` incrementally.
    Appended { label: u32 },
    /// Non-append mutation (removal, bulk swap); the ANN index must be
    /// invalidated and rebuilt on next use.
    Invalidating,
}

#[derive(Debug, Clone)]
struct PendingChunk {
    file: String,
    start_line: u32,
    end_line: u32,
    content: String,
    vector: Vec<f32>,
}

#[derive(Debug, Clone, Copy)]
enum LogicalRef {
    Store(usize),
    Pending(usize),
}

struct ReadState {
    active_reads: usize,
    save_in_progress: bool,
}

struct ReadGate {
    state: Mutex<ReadState>,
    cv: Condvar,
}

impl ReadGate {
    fn new() -> Self {
        ReadGate {
            state: Mutex::new(ReadState {
                active_reads: 0,
                save_in_progress: false,
            }),
            cv: Condvar::new(),
        }
    }

    fn start_read(&self) -> Result<(), CacheError> {
        let mut state = self.state.lock().unwrap();
        if state.save_in_progress {
            return Err(CacheError::SaveInProgress);
        }
        state.active_reads += 1;
        Ok(())
    }

    fn end_read(&self) {
        let mut state = self.state.lock().unwrap();
        state.active_reads = state.active_reads.saturating_sub(1);
        if state.active_reads == 0 {
            self.cv.notify_all();
        }
    }

    fn begin_write(&self) {
        let mut state = self.state.lock().unwrap();
        state.save_in_progress = true;
    }

    /// Waits for `active_reads` to drain. Returns `true` if it drained
    /// within `timeout`, `false` on timeout.
    fn wait_for_readers_with_timeout(&self, timeout: Duration) -> bool {
        let state = self.state.lock().unwrap();
        let (state, result) = self
            .cv
            .wait_timeout_while(state, timeout, |s| s.active_reads > 0)
            .unwrap();
        !result.timed_out() || state.active_reads == 0
    }

    fn end_write(&self) {
        let mut state = self.state.lock().unwrap();
        state.save_in_progress = false;
        self.cv.notify_all();
    }
}

struct SaveState {
    last_request_at: Option<Instant>,
    current_generation: u64,
    waiters: Vec<(u64, Sender<Result<(), String>>)>,
    stopped: bool,
}

struct Inner {
    store: Option<Store>,
    pending: Vec<PendingChunk>,
    live_order: Vec<LogicalRef>,
    file_hashes: HashMap<String, FileHashEntry>,
    call_data: HashMap<String, CallGraphFileRecord>,
    meta: CacheMeta,
}

impl Inner {
    fn file_of(&self, r: LogicalRef) -> String {
        match r {
            LogicalRef::Pending(i) => self.pending[i].file.clone(),
            LogicalRef::Store(i) => {
                let store = self.store.as_ref().expect("store loaded");
                let rec = store.get_record(i).expect("valid store index");
                store
                    .files()
                    .get(rec.file_id as usize)
                    .cloned()
                    .unwrap_or_default()
            }
        }
    }
}

/// Shared handle to the embedding cache. Cheaply cloneable; all clones see
/// the same underlying state and reader/writer gate.
#[derive(Clone)]
pub struct Cache {
    dir: PathBuf,
    vector_load_mode: VectorLoadMode,
    telemetry: Arc<Telemetry>,
    inner: Arc<Mutex<Inner>>,
    gate: Arc<ReadGate>,
    save_state: Arc<Mutex<SaveState>>,
    debounce_ms: u64,
    reader_wait_timeout_ms: u64,
    force_save_with_active_readers: bool,
    writer_started: Arc<std::sync::Once>,
}

pub struct LoadOptions {
    pub workspace: String,
    pub embedding_model: String,
    pub embedding_dimension: usize,
    pub vector_load_mode: VectorLoadMode,
    pub save_debounce_ms: u64,
    pub reader_wait_timeout_ms: u64,
    pub force_save_with_active_readers: bool,
}

pub enum LoadOutcome {
    Loaded,
    /// Meta was missing, or version/model/dimension mismatched; in-memory
    /// state was reset to empty and the caller should trigger a full
    /// reindex.
    NeedsReindex(String),
}

impl Cache {
    pub fn load(dir: &Path, options: LoadOptions) -> Result<(Cache, LoadOutcome), CacheError> {
        std::fs::create_dir_all(dir)?;
        let telemetry = Arc::new(Telemetry::default());

        let meta_path = dir.join(META_FILE);
        let on_disk_meta: Option<CacheMeta> = match std::fs::read_to_string(&meta_path) {
            Ok(text) => serde_json::from_str(&text).ok(),
            Err(_) => None,
        };

        let mut outcome = LoadOutcome::Loaded;
        let mut meta = CacheMeta {
            version: CACHE_VERSION,
            embedding_model: options.embedding_model.clone(),
            embedding_dimension: options.embedding_dimension,
            last_save_time: None,
            files_indexed: 0,
            chunks_stored: 0,
            workspace: options.workspace.clone(),
        };

        let mut store = None;
        match &on_disk_meta {
            None => {
                outcome = LoadOutcome::NeedsReindex("no cache meta found".to_string());
            }
            Some(m) if m.version != CACHE_VERSION => {
                outcome = LoadOutcome::NeedsReindex(format!(
                    "version mismatch: on-disk {} != {}",
                    m.version, CACHE_VERSION
                ));
            }
            Some(m) if m.embedding_model != options.embedding_model => {
                outcome = LoadOutcome::NeedsReindex(format!(
                    "embedding model mismatch: on-disk {:?} != {:?}",
                    m.embedding_model, options.embedding_model
                ));
            }
            Some(m) if m.embedding_dimension != options.embedding_dimension => {
                outcome = LoadOutcome::NeedsReindex(format!(
                    "embedding dimension mismatch: on-disk {} != {}",
                    m.embedding_dimension, options.embedding_dimension
                ));
            }
            Some(m) => {
                meta = m.clone();
                match Store::open(dir, options.vector_load_mode, Arc::clone(&telemetry)) {
                    Ok(s) => store = Some(s),
                    Err(StoreError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                        // Meta exists but no chunks were ever written — a
                        // fresh/empty cache, not a corruption.
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to open chunk store, triggering reindex");
                        outcome = LoadOutcome::NeedsReindex(e.to_string());
                    }
                }
            }
        }

        if matches!(outcome, LoadOutcome::NeedsReindex(_)) {
            store = None;
            meta = CacheMeta {
                version: CACHE_VERSION,
                embedding_model: options.embedding_model.clone(),
                embedding_dimension: options.embedding_dimension,
                last_save_time: None,
                files_indexed: 0,
                chunks_stored: 0,
                workspace: options.workspace.clone(),
            };
        }

        let live_order: Vec<LogicalRef> = (0..store.as_ref().map(|s| s.length()).unwrap_or(0))
            .map(|i| LogicalRef::Store(i as usize))
            .collect();

        let file_hashes: HashMap<String, FileHashEntry> = if matches!(outcome, LoadOutcome::Loaded)
        {
            read_json_or_default(&dir.join(FILE_HASHES_FILE))
        } else {
            HashMap::new()
        };
        let call_data: HashMap<String, CallGraphFileRecord> =
            if matches!(outcome, LoadOutcome::Loaded) {
                read_json_or_default(&dir.join(CALL_GRAPH_FILE))
            } else {
                HashMap::new()
            };

        let inner = Inner {
            store,
            pending: Vec::new(),
            live_order,
            file_hashes,
            call_data,
            meta,
        };

        let cache = Cache {
            dir: dir.to_path_buf(),
            vector_load_mode: options.vector_load_mode,
            telemetry,
            inner: Arc::new(Mutex::new(inner)),
            gate: Arc::new(ReadGate::new()),
            save_state: Arc::new(Mutex::new(SaveState {
                last_request_at: None,
                current_generation: 0,
                waiters: Vec::new(),
                stopped: false,
            })),
            debounce_ms: options.save_debounce_ms,
            reader_wait_timeout_ms: options.reader_wait_timeout_ms,
            force_save_with_active_readers: options.force_save_with_active_readers,
            writer_started: Arc::new(std::sync::Once::new()),
        };

        Ok((cache, outcome))
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().live_order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn start_read(&self) -> Result<(), CacheError> {
        self.gate.start_read()
    }

    pub fn end_read(&self) {
        self.gate.end_read()
    }

    /// Append a chunk to the in-memory overlay. Returns the `MutationKind`
    /// describing what happened to the position it was assigned, so the
    /// caller can decide whether to incrementally append to the ANN index.
    pub fn add_to_store(
        &self,
        file: impl Into<String>,
        start_line: u32,
        end_line: u32,
        content: impl Into<String>,
        vector: Vec<f32>,
    ) -> MutationKind {
        let mut inner = self.inner.lock().unwrap();
        inner.pending.push(PendingChunk {
            file: file.into(),
            start_line,
            end_line,
            content: content.into(),
            vector,
        });
        let pending_idx = inner.pending.len() - 1;
        inner.live_order.push(LogicalRef::Pending(pending_idx));
        let label = (inner.live_order.len() - 1) as u32;
        MutationKind::Appended { label }
    }

    /// Remove every chunk belonging to `file`. This always invalidates the
    /// ANN index: subsequent labels shift to fill the gap.
    pub fn remove_file_from_store(&self, file: &str) -> MutationKind {
        let mut inner = self.inner.lock().unwrap();
        let retained: Vec<LogicalRef> = inner
            .live_order
            .iter()
            .filter(|r| inner.file_of(**r) != file)
            .copied()
            .collect();
        inner.live_order = retained;
        MutationKind::Invalidating
    }

    pub fn set_file_hash(&self, file: impl Into<String>, hash: FileHashEntry) {
        let mut inner = self.inner.lock().unwrap();
        inner.file_hashes.insert(file.into(), hash);
    }

    pub fn get_file_hash(&self, file: &str) -> Option<FileHashEntry> {
        self.inner.lock().unwrap().file_hashes.get(file).cloned()
    }

    pub fn known_files(&self) -> Vec<String> {
        self.inner.lock().unwrap().file_hashes.keys().cloned().collect()
    }

    pub fn set_call_data(&self, file: impl Into<String>, record: CallGraphFileRecord) {
        let mut inner = self.inner.lock().unwrap();
        inner.call_data.insert(file.into(), record);
    }

    pub fn call_data_snapshot(&self) -> HashMap<String, CallGraphFileRecord> {
        self.inner.lock().unwrap().call_data.clone()
    }

    /// Route to the in-memory overlay or the backing store depending on
    /// where logical index `i` currently lives.
    pub fn get_chunk_content(&self, i: usize) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        match *inner.live_order.get(i)? {
            LogicalRef::Pending(p) => Some(inner.pending[p].content.clone()),
            LogicalRef::Store(s) => inner.store.as_ref()?.get_content(s).map(|c| c.to_string()),
        }
    }

    pub fn get_chunk_vector(&self, i: usize) -> Option<Vec<f32>> {
        let inner = self.inner.lock().unwrap();
        match *inner.live_order.get(i)? {
            LogicalRef::Pending(p) => Some(inner.pending[p].vector.clone()),
            LogicalRef::Store(s) => inner.store.as_ref()?.get_vector(s).map(|v| v.to_vec()),
        }
    }

    pub fn get_chunk_location(&self, i: usize) -> Option<(String, u32, u32)> {
        let inner = self.inner.lock().unwrap();
        let r = *inner.live_order.get(i)?;
        match r {
            LogicalRef::Pending(p) => {
                let c = &inner.pending[p];
                Some((c.file.clone(), c.start_line, c.end_line))
            }
            LogicalRef::Store(s) => {
                let store = inner.store.as_ref()?;
                let rec = store.get_record(s)?;
                let file = store.files().get(rec.file_id as usize)?.clone();
                Some((file, rec.start_line, rec.end_line))
            }
        }
    }

    fn ensure_writer_thread(&self) {
        self.writer_started.call_once(|| {
            let this = self.clone();
            std::thread::spawn(move || this.writer_loop());
        });
    }

    fn writer_loop(&self) {
        loop {
            std::thread::sleep(Duration::from_millis(20));
            let gen_to_write = {
                let mut state = self.save_state.lock().unwrap();
                if state.stopped {
                    return;
                }
                match state.last_request_at {
                    Some(t) if t.elapsed() >= Duration::from_millis(self.debounce_ms) => {
                        state.last_request_at = None;
                        state.current_generation
                    }
                    _ => continue,
                }
            };

            let result = self.perform_write();
            if let Err(e) = &result {
                tracing::warn!(error = %e, "debounced save failed");
            }

            let mut state = self.save_state.lock().unwrap();
            let stringified = result.as_ref().map(|_| ()).map_err(|e| e.to_string());
            let mut remaining = Vec::new();
            for (gen, tx) in state.waiters.drain(..) {
                if gen <= gen_to_write {
                    let _ = tx.send(stringified.clone());
                } else {
                    remaining.push((gen, tx));
                }
            }
            state.waiters = remaining;
        }
    }

    fn perform_write(&self) -> Result<(), CacheError> {
        self.gate.begin_write();
        let drained = self
            .gate
            .wait_for_readers_with_timeout(Duration::from_millis(self.reader_wait_timeout_ms));
        if !drained && !self.force_save_with_active_readers {
            tracing::warn!("timed out waiting for readers to drain; deferring save");
            self.gate.end_write();
            // Re-arm the debounce so the next tick retries.
            let mut state = self.save_state.lock().unwrap();
            state.last_request_at = Some(Instant::now());
            return Ok(());
        }

        let result = self.write_snapshot();
        self.gate.end_write();
        result
    }

    fn write_snapshot(&self) -> Result<(), CacheError> {
        let mut inner = self.inner.lock().unwrap();

        // Materialize every live chunk's metadata, content, and vector,
        // then rebuild the file table from scratch in first-seen order.
        let mut file_table: Vec<String> = Vec::new();
        let mut file_ids: HashMap<String, u32> = HashMap::new();
        let mut metas = Vec::with_capacity(inner.live_order.len());
        let mut contents = Vec::with_capacity(inner.live_order.len());
        let mut vectors = Vec::with_capacity(inner.live_order.len());

        let refs: Vec<LogicalRef> = inner.live_order.clone();
        for r in &refs {
            let file = inner.file_of(*r);
            let file_id = *file_ids.entry(file.clone()).or_insert_with(|| {
                file_table.push(file.clone());
                (file_table.len() - 1) as u32
            });
            let (start_line, end_line, content, vector) = match r {
                LogicalRef::Pending(p) => {
                    let c = &inner.pending[*p];
                    (c.start_line, c.end_line, c.content.clone(), c.vector.clone())
                }
                LogicalRef::Store(s) => {
                    let store = inner.store.as_ref().expect("store present");
                    let rec = store.get_record(*s).expect("valid index");
                    (
                        rec.start_line,
                        rec.end_line,
                        store.get_content(*s).map(|c| c.to_string()).unwrap_or_default(),
                        store.get_vector(*s).map(|v| v.to_vec()).unwrap_or_default(),
                    )
                }
            };
            metas.push(ChunkMeta {
                file_id,
                start_line,
                end_line,
            });
            contents.push(content);
            vectors.push(vector);
        }

        let dim = inner.meta.embedding_dimension;
        // Drop our handle to the outgoing generation (which may hold an
        // mmap) before the rename barrier, matching the store's own
        // `pre_rename` contract.
        let old_store = inner.store.take();
        let new_store = Store::write_all(
            &self.dir,
            &metas,
            dim,
            &file_table,
            |i| contents[i].clone(),
            |i| vectors[i].clone(),
            self.vector_load_mode,
            move || drop(old_store),
            Arc::clone(&self.telemetry),
        )?;

        inner.meta.chunks_stored = metas.len();
        inner.meta.files_indexed = file_table.len();
        inner.meta.last_save_time = Some(format!(
            "{}",
            SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs()
        ));

        std::fs::write(
            self.dir.join(META_FILE),
            serde_json::to_string_pretty(&inner.meta)?,
        )?;
        std::fs::write(
            self.dir.join(FILE_HASHES_FILE),
            serde_json::to_string_pretty(&inner.file_hashes)?,
        )?;
        std::fs::write(
            self.dir.join(CALL_GRAPH_FILE),
            serde_json::to_string_pretty(&inner.call_data)?,
        )?;

        inner.store = Some(new_store);
        inner.pending.clear();
        inner.live_order = (0..metas.len()).map(LogicalRef::Store).collect();

        Ok(())
    }

    /// Request a save. Debounced: overlapping requests within
    /// `save_debounce_ms` coalesce into a single write. When
    /// `throw_on_error` is set, blocks until that write (or a later one
    /// covering it) completes, and surfaces its result; otherwise returns
    /// immediately and failures are only logged.
    pub fn save(&self, throw_on_error: bool) -> Result<(), CacheError> {
        self.ensure_writer_thread();
        let mut state = self.save_state.lock().unwrap();
        state.current_generation += 1;
        let gen = state.current_generation;
        state.last_request_at = Some(Instant::now());

        if !throw_on_error {
            return Ok(());
        }

        let (tx, rx) = mpsc::channel();
        state.waiters.push((gen, tx));
        drop(state);

        match rx.recv() {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(CacheError::SaveFailed(e)),
            Err(_) => Err(CacheError::SaveFailed("writer thread stopped".to_string())),
        }
    }

    /// Force an immediate, synchronous save bypassing the debounce window.
    /// Used by `clear`-adjacent shutdown paths and tests.
    pub fn save_now(&self) -> Result<(), CacheError> {
        self.perform_write()
    }

    /// Remove the entire cache directory, including the chunk store.
    pub fn clear(&self) -> Result<(), CacheError> {
        {
            let mut state = self.save_state.lock().unwrap();
            state.stopped = true;
        }
        Store::clear(&self.dir)?;
        let mut inner = self.inner.lock().unwrap();
        inner.store = None;
        inner.pending.clear();
        inner.live_order.clear();
        inner.file_hashes.clear();
        inner.call_data.clear();
        Ok(())
    }
}

fn read_json_or_default<T: for<'de> Deserialize<'de> + Default>(path: &Path) -> T {
    match std::fs::read_to_string(path) {
        Ok(text) => serde_json::from_str(&text).unwrap_or_default(),
        Err(_) => T::default(),
    }
}
