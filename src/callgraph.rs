//! The call graph: a set of pure functions over the cache's per-file
//! `{definitions, calls}` records. Unlike the donor's bidirectional graph
//! tables persisted in the store itself, this module owns no state of its
//! own — it derives `defines`/`called_by` maps from whatever the cache
//! currently holds and recomputes them on demand, rather than keeping a
//! second bidirectional table in sync with the cache.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::OnceLock;

use crate::cache::CallGraphFileRecord;

/// Derived, read-only view: which file(s) define a symbol, and which
/// file(s) call it.
pub struct CallGraph {
    defines: HashMap<String, Vec<String>>,
    called_by: HashMap<String, Vec<String>>,
}

impl CallGraph {
    pub fn build(call_data: &HashMap<String, CallGraphFileRecord>) -> CallGraph {
        let mut defines: HashMap<String, Vec<String>> = HashMap::new();
        let mut called_by: HashMap<String, Vec<String>> = HashMap::new();

        for (file, record) in call_data {
            for symbol in &record.definitions {
                defines.entry(symbol.clone()).or_default().push(file.clone());
            }
            for symbol in &record.calls {
                called_by.entry(symbol.clone()).or_default().push(file.clone());
            }
        }

        CallGraph { defines, called_by }
    }

    pub fn files_defining(&self, symbol: &str) -> &[String] {
        self.defines.get(symbol).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn files_calling(&self, symbol: &str) -> &[String] {
        self.called_by.get(symbol).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Files within `max_hops` of `file` in the call graph: a file one hop
    /// away either calls something `file` defines, or defines something
    /// `file` calls. Used by hybrid search's `call_graph_boost` and by
    /// `find_similar`.
    pub fn related_files(&self, file: &str, max_hops: usize, call_data: &HashMap<String, CallGraphFileRecord>) -> HashSet<String> {
        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(file.to_string());
        let mut frontier: VecDeque<(String, usize)> = VecDeque::new();
        frontier.push_back((file.to_string(), 0));

        while let Some((current, hops)) = frontier.pop_front() {
            if hops >= max_hops {
                continue;
            }
            for neighbor in self.neighbors_of(&current, call_data) {
                if visited.insert(neighbor.clone()) {
                    frontier.push_back((neighbor, hops + 1));
                }
            }
        }

        visited.remove(file);
        visited
    }

    fn neighbors_of(&self, file: &str, call_data: &HashMap<String, CallGraphFileRecord>) -> Vec<String> {
        let mut neighbors = Vec::new();
        if let Some(record) = call_data.get(file) {
            for symbol in &record.calls {
                neighbors.extend(self.files_defining(symbol).iter().cloned());
            }
            for symbol in &record.definitions {
                neighbors.extend(self.files_calling(symbol).iter().cloned());
            }
        }
        neighbors
    }

    /// A plain boost signal for hybrid search: 1 if `candidate` is within
    /// `max_hops` of `anchor`, 0 otherwise. Symmetric by construction since
    /// `related_files` already considers both call and definition edges.
    pub fn boost(&self, anchor: &str, candidate: &str, max_hops: usize, call_data: &HashMap<String, CallGraphFileRecord>) -> f32 {
        if anchor == candidate {
            return 0.0;
        }
        if self.related_files(anchor, max_hops, call_data).contains(candidate) {
            1.0
        } else {
            0.0
        }
    }

    /// Files that define or call any of `symbols`, plus everything within
    /// `max_hops` of those files. Used to boost search results by the
    /// symbols mentioned in the query itself, as opposed to `related_files`
    /// which anchors on a single known file.
    pub fn related_to_symbols(
        &self,
        symbols: &[String],
        max_hops: usize,
        call_data: &HashMap<String, CallGraphFileRecord>,
    ) -> HashSet<String> {
        let mut related = HashSet::new();
        for symbol in symbols {
            for seed in self.files_defining(symbol).iter().chain(self.files_calling(symbol)) {
                if related.insert(seed.clone()) {
                    related.extend(self.related_files(seed, max_hops, call_data));
                }
            }
        }
        related
    }

    /// A plain boost signal keyed off query symbols rather than a single
    /// anchor file: 1 if `candidate` is within `max_hops` of any file that
    /// defines or calls one of `symbols`, 0 otherwise.
    pub fn boost_for_symbols(
        &self,
        symbols: &[String],
        candidate: &str,
        max_hops: usize,
        call_data: &HashMap<String, CallGraphFileRecord>,
    ) -> f32 {
        if symbols.is_empty() {
            return 0.0;
        }
        if self.related_to_symbols(symbols, max_hops, call_data).contains(candidate) {
            1.0
        } else {
            0.0
        }
    }
}

fn query_symbol_re() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"[A-Za-z_][A-Za-z0-9_]*").expect("static regex"))
}

/// Pulls identifier-shaped words out of a query string, the same boundary
/// rules `Extractor` uses for source identifiers (so a query symbol can
/// line up with a symbol in `defines`/`called_by` without needing the
/// snake_case/camelCase splitting the lexical tokenizer does).
pub fn extract_query_symbols(query: &str) -> Vec<String> {
    query_symbol_re().find_iter(query).map(|m| m.as_str().to_string()).collect()
}

/// Extracts `{definitions, calls}` for a single file's content using plain
/// regexes rather than a per-language AST grammar: a coarse pass over common
/// definition/call shapes is enough signal for the call-graph boost, which
/// only needs "roughly related," not exact resolution.
pub struct Extractor {
    definition_re: regex::Regex,
    call_re: regex::Regex,
}

impl Default for Extractor {
    fn default() -> Self {
        Extractor {
            // fn/def/function/class/struct/impl-style declarations across
            // the languages in `allowed_extensions`.
            definition_re: regex::Regex::new(
                r"(?m)^\s*(?:pub(?:\([^)]*\))?\s+)?(?:async\s+)?(?:fn|def|function|class|struct|interface|impl|type)\s+([A-Za-z_][A-Za-z0-9_]*)",
            )
            .expect("static regex"),
            // `name(` call shape, excluding the definition keywords above.
            call_re: regex::Regex::new(r"\b([A-Za-z_][A-Za-z0-9_]*)\s*\(").expect("static regex"),
        }
    }
}

const DEFINITION_KEYWORDS: &[&str] = &[
    "fn", "def", "function", "class", "struct", "interface", "impl", "type", "if", "for", "while",
    "match", "switch", "return", "catch",
];

impl Extractor {
    pub fn extract(&self, content: &str) -> CallGraphFileRecord {
        let mut definitions = Vec::new();
        for cap in self.definition_re.captures_iter(content) {
            definitions.push(cap[1].to_string());
        }

        let mut calls = Vec::new();
        for cap in self.call_re.captures_iter(content) {
            let name = &cap[1];
            if DEFINITION_KEYWORDS.contains(&name) || definitions.iter().any(|d| d == name) {
                continue;
            }
            calls.push(name.to_string());
        }
        calls.sort();
        calls.dedup();

        CallGraphFileRecord { definitions, calls }
    }
}
