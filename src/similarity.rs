//!
//! src/similarity.rs
//!
//! Textual agreement scoring between two candidate lyric bodies.
//! The contract is load-bearing for the corroboration threshold:
//! deterministic, symmetric, bounded to [0,1].
//!

use std::collections::HashSet;

use strsim::normalized_levenshtein;

/// Case-folded, punctuation-stripped word set.
fn token_set(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect()
}

/// Jaccard index over word sets.
pub fn jaccard(a: &str, b: &str) -> f64 {
    let tokens_a = token_set(a);
    let tokens_b = token_set(b);

    if tokens_a.is_empty() && tokens_b.is_empty() {
        return 1.0;
    }
    if tokens_a.is_empty() || tokens_b.is_empty() {
        return 0.0;
    }

    let intersection = tokens_a.intersection(&tokens_b).count();
    let union = tokens_a.union(&tokens_b).count();
    intersection as f64 / union as f64
}

/// Combined agreement score: mean of token-set Jaccard and normalized
/// Levenshtein similarity over the case-folded bodies.
pub fn combined_score(a: &str, b: &str) -> f64 {
    let j = jaccard(a, b);
    let l = normalized_levenshtein(&a.to_lowercase(), &b.to_lowercase());
    ((j + l) / 2.0).clamp(0.0, 1.0)
}

/// Inclusive boundary: a score exactly at the threshold corroborates.
pub fn is_corroborated(score: f64, threshold: f64) -> bool {
    score >= threshold
}
