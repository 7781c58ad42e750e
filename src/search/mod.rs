//! Hybrid search: fuses semantic similarity, lexical token overlap, recency,
//! an optional call-graph relatedness boost, and an exact-match bonus into a
//! single ranked list.
//!
//! Candidate generation prefers the ANN index when it's ready; below
//! `ann.min_chunks` (or while the index is dirty) it falls back to a linear
//! scan over every chunk, which is exact and simply slower — acceptable at
//! the scale where the ANN index wouldn't have paid for itself anyway.

pub mod lexical;

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::ann::AnnManager;
use crate::cache::{Cache, CallGraphFileRecord};
use crate::callgraph::{extract_query_symbols, CallGraph};
use crate::config::SearchConfig;
use crate::embedder::Embedder;

#[derive(Debug, Clone, serde::Serialize)]
pub struct SearchResult {
    pub file: String,
    pub start_line: u32,
    pub end_line: u32,
    pub content: String,
    pub score: f32,
    pub semantic: f32,
    pub lexical: f32,
}

pub struct HybridSearch<'a> {
    cache: &'a Cache,
    ann: &'a AnnManager,
    embedder: &'a dyn Embedder,
    cfg: SearchConfig,
}

impl<'a> HybridSearch<'a> {
    pub fn new(cache: &'a Cache, ann: &'a AnnManager, embedder: &'a dyn Embedder, cfg: SearchConfig) -> Self {
        HybridSearch {
            cache,
            ann,
            embedder,
            cfg,
        }
    }

    pub fn search(&self, query: &str, max_results: Option<usize>) -> Vec<SearchResult> {
        self.search_near(query, max_results, None)
    }

    /// Same as `search`, but when `anchor_file` is given, candidates within
    /// `call_graph_max_hops` of it in the call graph receive
    /// `call_graph_boost` instead of the default symbols-in-the-query boost.
    /// Used by `find_similar`.
    pub fn search_near(
        &self,
        query: &str,
        max_results: Option<usize>,
        anchor_file: Option<&str>,
    ) -> Vec<SearchResult> {
        if query.trim().is_empty() {
            return Vec::new();
        }

        let max_results = max_results.unwrap_or(self.cfg.max_results);
        let query_vec = match self.embedder.embed(&[query.to_string()]) {
            Ok(mut v) => v.remove(0),
            Err(e) => {
                tracing::warn!(error = %e, "query embedding failed");
                return Vec::new();
            }
        };

        let candidates = self.candidate_labels(&query_vec, max_results);
        if candidates.is_empty() {
            return Vec::new();
        }

        let query_tokens: std::collections::HashSet<String> =
            lexical::tokenize(query).into_iter().collect();

        let call_data: HashMap<String, CallGraphFileRecord> = self.cache.call_data_snapshot();
        let graph = CallGraph::build(&call_data);
        let query_symbols = extract_query_symbols(query);

        let now_days = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f32()
            / 86_400.0;

        let mut results: Vec<SearchResult> = Vec::new();
        for label in candidates {
            let Some(vector) = self.cache.get_chunk_vector(label) else { continue };
            let Some((file, start_line, end_line)) = self.cache.get_chunk_location(label) else {
                continue;
            };
            let Some(content) = self.cache.get_chunk_content(label) else { continue };

            let semantic = cosine_similarity(&query_vec, &vector);
            let lexical = lexical::overlap_score(&query_tokens, &content);

            let recency = self
                .cache
                .get_file_hash(&file)
                .and_then(|h| h.mtime_ms)
                .map(|mtime_ms| {
                    let age_days = (now_days - (mtime_ms as f32 / 86_400_000.0)).max(0.0);
                    self.cfg.recency_boost
                        * (1.0 - age_days / self.cfg.recency_decay_days).max(0.0)
                })
                .unwrap_or(0.0);

            let call_graph_boost = match anchor_file {
                Some(anchor) => graph.boost(anchor, &file, self.cfg.call_graph_max_hops, &call_data),
                None => graph.boost_for_symbols(&query_symbols, &file, self.cfg.call_graph_max_hops, &call_data),
            } * self.cfg.call_graph_boost;

            let exact_bonus = if lexical::is_exact_match(query, &content) {
                self.cfg.exact_match_boost
            } else {
                0.0
            };

            let score = self.cfg.semantic_weight * semantic
                + (1.0 - self.cfg.semantic_weight) * lexical
                + recency
                + call_graph_boost
                + exact_bonus;

            results.push(SearchResult {
                file,
                start_line,
                end_line,
                content,
                score,
                semantic,
                lexical,
            });
        }

        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.semantic.partial_cmp(&a.semantic).unwrap_or(std::cmp::Ordering::Equal))
                .then_with(|| a.file.cmp(&b.file))
        });
        results.truncate(max_results);
        results
    }

    fn candidate_labels(&self, query_vec: &[f32], max_results: usize) -> Vec<usize> {
        if self.ann.is_ready() {
            let k_ann = ((max_results * self.cfg.ann_candidate_multiplier)
                .max(self.cfg.ann_min_candidates))
            .min(self.cfg.ann_max_candidates);
            self.ann
                .search_knn(query_vec, k_ann)
                .into_iter()
                .map(|(label, _distance)| label as usize)
                .collect()
        } else {
            (0..self.cache.len()).collect()
        }
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ann::AnnManager;
    use crate::cache::LoadOptions;
    use crate::config::VectorLoadMode;
    use crate::embedder::HashEmbedder;
    use tempfile::tempdir;

    #[test]
    fn cosine_similarity_identical_vectors_is_one() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_similarity_orthogonal_is_zero() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
    }

    #[test]
    fn search_ranks_relevant_chunk_first() {
        let dir = tempdir().unwrap();
        let (cache, _) = Cache::load(
            dir.path(),
            LoadOptions {
                workspace: "ws".to_string(),
                embedding_model: "test".to_string(),
                embedding_dimension: 32,
                vector_load_mode: VectorLoadMode::Memory,
                save_debounce_ms: 10,
                reader_wait_timeout_ms: 200,
                force_save_with_active_readers: false,
            },
        )
        .unwrap();

        let embedder = HashEmbedder::new("test", 32, 64);
        let v1 = embedder.embed(&["fn parse_config_file() {}".to_string()]).unwrap().remove(0);
        let v2 = embedder.embed(&["fn unrelated_zebra_thing() {}".to_string()]).unwrap().remove(0);
        cache.add_to_store("a.rs", 1, 1, "fn parse_config_file() {}", v1);
        cache.add_to_store("b.rs", 1, 1, "fn unrelated_zebra_thing() {}", v2);

        let ann = AnnManager::new(dir.path(), crate::config::AnnConfig::default(), 32, "test");
        let search = HybridSearch::new(&cache, &ann, &embedder, SearchConfig::default());
        let results = search.search("parse config file", Some(5));
        assert!(!results.is_empty());
        assert_eq!(results[0].file, "a.rs");
    }

    #[test]
    fn empty_query_returns_no_results() {
        let dir = tempdir().unwrap();
        let (cache, _) = Cache::load(
            dir.path(),
            LoadOptions {
                workspace: "ws".to_string(),
                embedding_model: "test".to_string(),
                embedding_dimension: 32,
                vector_load_mode: VectorLoadMode::Memory,
                save_debounce_ms: 10,
                reader_wait_timeout_ms: 200,
                force_save_with_active_readers: false,
            },
        )
        .unwrap();

        let embedder = HashEmbedder::new("test", 32, 64);
        let v = embedder.embed(&["fn parse_config_file() {}".to_string()]).unwrap().remove(0);
        cache.add_to_store("a.rs", 1, 1, "fn parse_config_file() {}", v);

        let ann = AnnManager::new(dir.path(), crate::config::AnnConfig::default(), 32, "test");
        let search = HybridSearch::new(&cache, &ann, &embedder, SearchConfig::default());
        assert!(search.search("", Some(5)).is_empty());
        assert!(search.search("   ", Some(5)).is_empty());
    }

    #[test]
    fn query_mentioning_a_symbol_boosts_its_callers() {
        let dir = tempdir().unwrap();
        let (cache, _) = Cache::load(
            dir.path(),
            LoadOptions {
                workspace: "ws".to_string(),
                embedding_model: "test".to_string(),
                embedding_dimension: 32,
                vector_load_mode: VectorLoadMode::Memory,
                save_debounce_ms: 10,
                reader_wait_timeout_ms: 200,
                force_save_with_active_readers: false,
            },
        )
        .unwrap();

        let embedder = HashEmbedder::new("test", 32, 64);
        let v1 = embedder.embed(&["fn do_work() {}".to_string()]).unwrap().remove(0);
        let v2 = embedder.embed(&["fn unrelated_zebra_thing() {}".to_string()]).unwrap().remove(0);
        cache.add_to_store("callee.rs", 1, 1, "fn do_work() {}", v1);
        cache.add_to_store("unrelated.rs", 1, 1, "fn unrelated_zebra_thing() {}", v2);
        cache.set_call_data(
            "caller.rs".to_string(),
            CallGraphFileRecord {
                definitions: vec![],
                calls: vec!["do_work".to_string()],
            },
        );
        cache.set_call_data(
            "callee.rs".to_string(),
            CallGraphFileRecord {
                definitions: vec!["do_work".to_string()],
                calls: vec![],
            },
        );

        let ann = AnnManager::new(dir.path(), crate::config::AnnConfig::default(), 32, "test");
        let mut cfg = SearchConfig::default();
        cfg.call_graph_boost = 10.0;
        let search = HybridSearch::new(&cache, &ann, &embedder, cfg);
        let results = search.search("do_work", Some(5));
        assert_eq!(results[0].file, "callee.rs");
    }
}
