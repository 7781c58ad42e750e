//! Configuration loading.
//!
//! Follows the donor's two-tier merge: a user-level file under the OS config
//! directory, overridden field-by-field by a project-level file at the
//! workspace root. Unlike the donor, unknown keys are rejected rather than
//! silently ignored: every field is explicit and typed, with its own
//! default.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VectorLoadMode {
    Memory,
    Disk,
}

impl Default for VectorLoadMode {
    fn default() -> Self {
        VectorLoadMode::Memory
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct IndexerConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub max_file_size: u64,
    pub batch_size: usize,
    pub checkpoint_interval_ms: u64,
    pub allowed_extensions: Vec<String>,
    pub allowed_filenames: Vec<String>,
    pub exclude_globs: Vec<String>,
    pub allow_single_thread_fallback: bool,
    pub worker_failure_cooldown_ms: u64,
    pub worker_batch_timeout_ms: u64,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            chunk_size: 400,
            chunk_overlap: 40,
            max_file_size: 2 * 1024 * 1024,
            batch_size: 32,
            checkpoint_interval_ms: 5_000,
            allowed_extensions: DEFAULT_EXTENSIONS.iter().map(|s| s.to_string()).collect(),
            allowed_filenames: vec!["Makefile".to_string(), "Dockerfile".to_string()],
            exclude_globs: vec![
                "**/.git/**".to_string(),
                "**/target/**".to_string(),
                "**/node_modules/**".to_string(),
                "**/.hmcache/**".to_string(),
            ],
            allow_single_thread_fallback: true,
            worker_failure_cooldown_ms: 30_000,
            worker_batch_timeout_ms: 30_000,
        }
    }
}

const DEFAULT_EXTENSIONS: &[&str] = &[
    "rs", "py", "ts", "tsx", "js", "jsx", "go", "c", "h", "cpp", "hpp", "cc", "java", "cs", "rb",
    "sh", "md",
];

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    pub save_debounce_ms: u64,
    pub vector_load_mode: VectorLoadMode,
    pub reader_wait_timeout_ms: u64,
    pub force_save_with_active_readers: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            save_debounce_ms: 500,
            vector_load_mode: VectorLoadMode::Memory,
            reader_wait_timeout_ms: 2_000,
            force_save_with_active_readers: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct AnnConfig {
    pub enabled: bool,
    pub min_chunks: usize,
    pub m: usize,
    pub ef_construction: usize,
    pub ef_search: usize,
    pub max_elements_factor: f64,
    pub max_elements_extra: usize,
    pub build_yield_every: usize,
    pub sample_size: usize,
}

impl Default for AnnConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_chunks: 64,
            m: 16,
            ef_construction: 200,
            ef_search: 64,
            max_elements_factor: 1.2,
            max_elements_extra: 128,
            build_yield_every: 2_000,
            sample_size: 32,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct SearchConfig {
    pub max_results: usize,
    pub semantic_weight: f32,
    pub exact_match_boost: f32,
    pub recency_boost: f32,
    pub recency_decay_days: f32,
    pub call_graph_boost: f32,
    pub call_graph_max_hops: usize,
    pub ann_candidate_multiplier: usize,
    pub ann_min_candidates: usize,
    pub ann_max_candidates: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            max_results: 10,
            semantic_weight: 0.65,
            exact_match_boost: 0.15,
            recency_boost: 0.05,
            recency_decay_days: 30.0,
            call_graph_boost: 0.1,
            call_graph_max_hops: 2,
            ann_candidate_multiplier: 4,
            ann_min_candidates: 50,
            ann_max_candidates: 500,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct EmbedderConfig {
    pub model_name: String,
    pub dimension: usize,
    pub max_length: usize,
}

impl Default for EmbedderConfig {
    fn default() -> Self {
        Self {
            model_name: "hmcache-local-hash-v1".to_string(),
            dimension: 384,
            max_length: 256,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub quiet: bool,
    #[serde(default = "default_true")]
    pub verbose_default: bool,
    #[serde(default)]
    pub indexer: IndexerConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub ann: AnnConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub embedder: EmbedderConfig,
}

impl Config {
    /// Load the user-level config, then the project-level config, merging
    /// the latter over the former field by field. Missing files are not an
    /// error; a malformed file logs a warning and is skipped.
    ///
    /// The merge operates on the raw TOML tables rather than on two
    /// deserialized `Config` values: every field here has a concrete,
    /// non-`Option` default, so a project file that sets only one field
    /// would otherwise deserialize with every other field filled in from
    /// `Default`, indistinguishable from the user having set them to that
    /// same value. Merging the tables keeps only the keys each file
    /// actually wrote, so an unset project field falls through to whatever
    /// the user config (or the compiled-in default) had.
    pub fn load(project_root: &Path) -> Config {
        let user_path = dirs::config_dir().map(|d| d.join("hmcache").join("config.toml"));
        let user = user_path.as_deref().and_then(load_raw_table);
        let project = load_raw_table(&project_root.join(".hmcache.toml"));

        let merged_table = match (user, project) {
            (Some(u), Some(p)) => merge_tables(u, p),
            (Some(u), None) => u,
            (None, Some(p)) => p,
            (None, None) => toml::value::Table::new(),
        };

        let merged = toml::to_string(&toml::Value::Table(merged_table))
            .ok()
            .and_then(|text| toml::from_str::<Config>(&text).ok())
            .unwrap_or_else(|| {
                tracing::warn!("merged configuration invalid, falling back to defaults");
                Config::default()
            });

        tracing::debug!(?merged, "loaded configuration");
        merged
    }
}

/// Reads and validates a config file (unknown keys rejected, via the same
/// typed `Config` deserialization `load_file` uses), then returns it as a
/// raw table so only the keys it actually set can be merged in.
fn load_raw_table(path: &Path) -> Option<toml::value::Table> {
    load_file(path)?;
    let text = std::fs::read_to_string(path).ok()?;
    match toml::from_str(&text) {
        Ok(toml::Value::Table(t)) => Some(t),
        _ => None,
    }
}

/// Recursively merges `overlay` into `base`: a key present in `overlay`
/// replaces the corresponding key in `base` (recursing into nested tables),
/// and a key only in `base` is left untouched.
fn merge_tables(mut base: toml::value::Table, overlay: toml::value::Table) -> toml::value::Table {
    for (key, overlay_value) in overlay {
        let merged_value = match (base.remove(&key), overlay_value) {
            (Some(toml::Value::Table(base_t)), toml::Value::Table(overlay_t)) => {
                toml::Value::Table(merge_tables(base_t, overlay_t))
            }
            (_, overlay_value) => overlay_value,
        };
        base.insert(key, merged_value);
    }
    base
}

fn load_file(path: &Path) -> Option<Config> {
    let text = match std::fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to read config file");
            return None;
        }
    };
    match toml::from_str(&text) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to parse config file, ignoring");
            None
        }
    }
}

/// Find the project root by walking up from the current directory looking
/// for `.git` or an existing `.hmcache` directory; falls back to cwd.
pub fn find_project_root() -> PathBuf {
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let mut dir = cwd.as_path();
    loop {
        if dir.join(".git").exists() || dir.join(".hmcache").exists() {
            return dunce::canonicalize(dir).unwrap_or_else(|_| dir.to_path_buf());
        }
        match dir.parent() {
            Some(parent) => dir = parent,
            None => return cwd,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_self_consistent() {
        let cfg = Config::default();
        assert!(cfg.indexer.chunk_overlap < cfg.indexer.chunk_size);
        assert!(cfg.search.semantic_weight >= 0.0 && cfg.search.semantic_weight <= 1.0);
        assert!(cfg.ann.ef_search > 0);
    }

    #[test]
    fn missing_file_returns_none() {
        assert!(load_file(Path::new("/nonexistent/hmcache-test.toml")).is_none());
    }

    #[test]
    fn malformed_toml_returns_none_not_panic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "this is not [ valid toml").unwrap();
        assert!(load_file(&path).is_none());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg.toml");
        std::fs::write(&path, "nonexistent_top_level_key = 1\n").unwrap();
        assert!(load_file(&path).is_none());
    }

    #[test]
    fn merge_tables_overlay_field_wins_others_kept() {
        let mut base = toml::value::Table::new();
        base.insert("a".to_string(), toml::Value::Integer(1));
        base.insert("b".to_string(), toml::Value::Integer(2));
        let mut overlay = toml::value::Table::new();
        overlay.insert("a".to_string(), toml::Value::Integer(99));
        let merged = merge_tables(base, overlay);
        assert_eq!(merged.get("a"), Some(&toml::Value::Integer(99)));
        assert_eq!(merged.get("b"), Some(&toml::Value::Integer(2)));
    }

    #[test]
    fn project_config_overrides_only_fields_it_sets() {
        let dir = tempfile::tempdir().unwrap();
        let user_path = dir.path().join("user.toml");
        std::fs::write(
            &user_path,
            "[search]\nmax_results = 20\nsemantic_weight = 0.8\n",
        )
        .unwrap();
        let project_path = dir.path().join("project.toml");
        std::fs::write(&project_path, "[search]\nmax_results = 99\n").unwrap();

        let user = load_raw_table(&user_path).unwrap();
        let project = load_raw_table(&project_path).unwrap();
        let merged_table = merge_tables(user, project);
        let merged: Config = toml::from_str(&toml::to_string(&toml::Value::Table(merged_table)).unwrap()).unwrap();

        assert_eq!(merged.search.max_results, 99);
        assert_eq!(merged.search.semantic_weight, 0.8);
    }
}
