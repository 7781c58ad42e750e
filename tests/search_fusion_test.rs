//! Property tests for the hybrid search fusion formula: with the
//! configured weights each bounded in `[0, 1]` and summing with no more
//! than 1.0 of headroom above semantic+lexical, results stay sorted and
//! scores stay finite. Mirrors the donor's `rrf_fuse` proptests
//! (`tests/search_test.rs`), adapted to this crate's additive fusion
//! instead of reciprocal-rank fusion.

use hmcache::ann::AnnManager;
use hmcache::cache::{Cache, LoadOptions};
use hmcache::config::{AnnConfig, SearchConfig, VectorLoadMode};
use hmcache::embedder::{Embedder, HashEmbedder};
use hmcache::search::HybridSearch;
use proptest::prelude::*;
use tempfile::tempdir;

fn build_cache(entries: &[(&str, &str)], embedder: &HashEmbedder) -> Cache {
    let dir = tempdir().unwrap();
    let (cache, _) = Cache::load(
        dir.path(),
        LoadOptions {
            workspace: "ws".to_string(),
            embedding_model: "test".to_string(),
            embedding_dimension: embedder.dimension(),
            vector_load_mode: VectorLoadMode::Memory,
            save_debounce_ms: 10,
            reader_wait_timeout_ms: 200,
            force_save_with_active_readers: false,
        },
    )
    .unwrap();
    for (file, content) in entries {
        let vector = embedder.embed(&[content.to_string()]).unwrap().remove(0);
        cache.add_to_store(*file, 1, 1, *content, vector);
    }
    // Chunks live in the in-memory overlay only (never saved), so the
    // backing directory doesn't need to outlive this function.
    drop(dir);
    cache
}

proptest! {
    #[test]
    fn scores_are_finite_and_sorted_descending(
        queries in prop::collection::vec("[a-z_]{3,12}", 1..6),
    ) {
        let embedder = HashEmbedder::new("test", 32, 64);
        let entries = [
            ("a.rs", "fn parse_config_file() {}"),
            ("b.rs", "fn unrelated_zebra_thing() {}"),
            ("c.rs", "fn handle_request_payload() {}"),
        ];
        let cache = build_cache(&entries, &embedder);
        let ann = AnnManager::new(std::path::Path::new("."), AnnConfig::default(), 32, "test");
        let search = HybridSearch::new(&cache, &ann, &embedder, SearchConfig::default());

        for query in &queries {
            let results = search.search(query, Some(10));
            for r in &results {
                prop_assert!(r.score.is_finite());
                prop_assert!(r.semantic.is_finite());
                prop_assert!(r.lexical >= 0.0 && r.lexical <= 1.0);
            }
            for pair in results.windows(2) {
                prop_assert!(pair[0].score >= pair[1].score);
            }
        }
    }
}
