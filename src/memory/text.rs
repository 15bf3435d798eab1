//! Tokenization and lexical similarity
//!
//! Shared by retrieval (fallback scoring), consolidation (near-duplicate
//! detection) and the capability checker (keyword tables).

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;

static NON_WORD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[^\w\s\u{4e00}-\u{9fa5}]").expect("Valid non-word regex")
});

/// Lowercase, strip punctuation, split on whitespace, keep tokens longer than one char
pub fn tokenize(text: &str) -> Vec<String> {
    let lowered = text.to_lowercase();
    NON_WORD
        .replace_all(&lowered, " ")
        .split_whitespace()
        .filter(|token| token.chars().count() > 1)
        .map(str::to_string)
        .collect()
}

/// Distinct tokens of a text
pub fn token_set(text: &str) -> HashSet<String> {
    tokenize(text).into_iter().collect()
}

/// Jaccard similarity of two token sets; 0.0 when both are empty
pub fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f32 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.len() + b.len() - intersection;
    intersection as f32 / union as f32
}

/// Jaccard similarity of two texts
pub fn text_similarity(a: &str, b: &str) -> f32 {
    jaccard(&token_set(a), &token_set(b))
}
