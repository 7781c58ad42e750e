//! Lexical scoring: token-overlap between a query and a chunk's content,
//! plus an exact-substring boost. Tokenization splits on non-alphanumeric
//! boundaries and camelCase/snake_case boundaries, the same shape as the
//! donor's `nl::tokenize_identifier` (retired along with the FTS5-backed
//! store it served, but the identifier-splitting logic is still exactly
//! what a lexical overlap score needs).

use std::collections::HashSet;

pub fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    for word in text.split(|c: char| !c.is_alphanumeric() && c != '_') {
        if word.is_empty() {
            continue;
        }
        for part in split_identifier(word) {
            if !part.is_empty() {
                tokens.push(part.to_lowercase());
            }
        }
    }
    tokens
}

fn split_identifier(word: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut prev_lower = false;
    for c in word.chars() {
        if c == '_' || c == '-' {
            if !current.is_empty() {
                parts.push(std::mem::take(&mut current));
            }
            prev_lower = false;
            continue;
        }
        if c.is_uppercase() && prev_lower && !current.is_empty() {
            parts.push(std::mem::take(&mut current));
        }
        prev_lower = c.is_lowercase();
        current.push(c);
    }
    if !current.is_empty() {
        parts.push(current);
    }
    parts
}

/// Jaccard-style overlap between query tokens and chunk tokens, in `[0, 1]`.
pub fn overlap_score(query_tokens: &HashSet<String>, content: &str) -> f32 {
    if query_tokens.is_empty() {
        return 0.0;
    }
    let content_tokens: HashSet<String> = tokenize(content).into_iter().collect();
    if content_tokens.is_empty() {
        return 0.0;
    }
    let shared = query_tokens.intersection(&content_tokens).count();
    shared as f32 / query_tokens.len() as f32
}

/// Whether `content` contains `query` verbatim (case-insensitive), used for
/// `exact_match_boost`.
pub fn is_exact_match(query: &str, content: &str) -> bool {
    !query.is_empty() && content.to_lowercase().contains(&query.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_snake_and_camel_case() {
        assert_eq!(tokenize("parse_config_file"), vec!["parse", "config", "file"]);
        assert_eq!(tokenize("parseConfigFile"), vec!["parse", "config", "file"]);
    }

    #[test]
    fn overlap_score_counts_shared_tokens() {
        let query: HashSet<String> = tokenize("parse config").into_iter().collect();
        let full = overlap_score(&query, "fn parse_config() {}");
        let none = overlap_score(&query, "fn unrelated_thing() {}");
        assert!(full > none);
        assert!(full <= 1.0);
    }

    #[test]
    fn exact_match_is_case_insensitive() {
        assert!(is_exact_match("ParseConfig", "fn parseconfig() {}"));
        assert!(!is_exact_match("missing", "fn parseconfig() {}"));
    }
}
